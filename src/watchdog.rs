use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::platform::Connector;

pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Retries the platform connection on a fixed interval while disconnected.
///
/// At most one tick is ever pending: arming replaces the previous deadline.
#[derive(Debug)]
pub struct ConnectionWatchdog {
    state: ConnectionState,
    interval: Duration,
    deadline: Option<Instant>,
    attempts: u64,
}

impl ConnectionWatchdog {
    pub fn new(interval: Duration) -> Self {
        ConnectionWatchdog {
            state: ConnectionState::Disconnected,
            interval,
            deadline: None,
            attempts: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn start(&mut self) {
        if self.state != ConnectionState::Connected {
            self.arm();
        }
    }

    fn arm(&mut self) {
        self.deadline = Some(Instant::now() + self.interval);
    }

    /// Resolves when the next tick is due; never resolves while disarmed.
    pub fn tick(&self) -> impl Future<Output = ()> + Send + 'static {
        let deadline = self.deadline;
        async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        }
    }

    /// Runs one due tick: a single connect attempt unless already connected.
    pub async fn on_tick(&mut self, connector: &dyn Connector) -> ConnectionState {
        self.deadline = None;
        if self.state == ConnectionState::Connected {
            debug!("platform already connected");
            return self.state;
        }

        self.state = ConnectionState::Connecting;
        self.attempts += 1;
        info!(attempt = self.attempts, "platform not connected, trying to connect");
        match connector.connect().await {
            Ok(()) => self.on_connect_succeeded(),
            Err(e) => {
                warn!(
                    attempt = self.attempts,
                    retry_in = ?self.interval,
                    "platform connect failed: {e}"
                );
                self.state = ConnectionState::Disconnected;
                self.arm();
            }
        }
        self.state
    }

    pub fn on_connect_succeeded(&mut self) {
        info!(attempts = self.attempts, "platform connected");
        self.state = ConnectionState::Connected;
        self.deadline = None;
    }

    pub fn on_disconnected(&mut self) {
        if self.state == ConnectionState::Connected {
            info!("platform disconnected");
        }
        self.state = ConnectionState::Disconnected;
        self.arm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::fake::RecordingPlatform;
    use tokio::time::{sleep, sleep_until, timeout};

    async fn run_until(watchdog: &mut ConnectionWatchdog, connector: &dyn Connector, end: Instant) {
        loop {
            tokio::select! {
                _ = watchdog.tick() => {
                    watchdog.on_tick(connector).await;
                }
                _ = sleep_until(end) => return,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_attempt_waits_one_interval() {
        let (platform, _events) = RecordingPlatform::new();
        let mut watchdog = ConnectionWatchdog::new(RECONNECT_INTERVAL);
        watchdog.start();
        let start = Instant::now();

        run_until(&mut watchdog, platform.as_ref(), start + Duration::from_millis(9_999)).await;
        assert_eq!(platform.connect_attempts(), 0);

        run_until(&mut watchdog, platform.as_ref(), start + Duration::from_millis(10_001)).await;
        assert_eq!(platform.connect_attempts(), 1);
        assert_eq!(watchdog.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn one_attempt_per_tick_until_connected() {
        let (platform, _events) = RecordingPlatform::new();
        platform.fail_next_connects(3);
        let mut watchdog = ConnectionWatchdog::new(RECONNECT_INTERVAL);
        watchdog.start();
        let start = Instant::now();

        run_until(&mut watchdog, platform.as_ref(), start + Duration::from_secs(35)).await;
        assert_eq!(platform.connect_attempts(), 3);
        assert_eq!(watchdog.attempts(), 3);
        assert_eq!(watchdog.state(), ConnectionState::Disconnected);
        assert!(watchdog.is_armed());

        run_until(&mut watchdog, platform.as_ref(), start + Duration::from_secs(300)).await;
        assert_eq!(platform.connect_attempts(), 4);
        assert_eq!(watchdog.state(), ConnectionState::Connected);
        assert!(!watchdog.is_armed());
        assert!(timeout(Duration::from_secs(3600), watchdog.tick()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_disconnects_arm_a_single_tick() {
        let (platform, _events) = RecordingPlatform::new();
        let mut watchdog = ConnectionWatchdog::new(Duration::from_secs(1));
        watchdog.on_connect_succeeded();
        assert_eq!(watchdog.on_tick(platform.as_ref()).await, ConnectionState::Connected);
        assert_eq!(platform.connect_attempts(), 0);

        watchdog.on_disconnected();
        watchdog.on_disconnected();
        assert!(watchdog.is_armed());
        let start = Instant::now();
        run_until(&mut watchdog, platform.as_ref(), start + Duration::from_millis(1500)).await;
        assert_eq!(platform.connect_attempts(), 1);

        sleep(Duration::from_secs(5)).await;
        assert_eq!(platform.connect_attempts(), 1);
    }
}
