use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::platform::{
    ConfigurationEvent, Entity, NodeSpec, PlatformEvent, PlatformFacade, ThingSpec,
};
use crate::scheduler::{Metric, Period, PublishScheduler};
use crate::sensor::{SensorSource, StopOnDrop};
use crate::watchdog::{ConnectionState, ConnectionWatchdog};

const SHUTDOWN_REASON: &str = "application shutdown";

/// Process-wide context: owns the connection watchdog, the publish streams
/// and the handles to the sensor and the platform.
pub struct App<P> {
    platform: Arc<P>,
    sensor: Arc<dyn SensorSource>,
    events: mpsc::UnboundedReceiver<PlatformEvent>,
    watchdog: ConnectionWatchdog,
    scheduler: PublishScheduler,
    node: NodeSpec,
    things: Vec<ThingSpec>,
}

impl<P: PlatformFacade + 'static> App<P> {
    pub fn new(
        config: &Config,
        platform: Arc<P>,
        sensor: Arc<dyn SensorSource>,
        events: mpsc::UnboundedReceiver<PlatformEvent>,
    ) -> Self {
        let ids = &config.platform;
        let things = vec![
            ThingSpec::float(&ids.temperature_thing, "BME Temperature Sensor", "Bosch"),
            ThingSpec::float(&ids.pressure_thing, "BME Pressure Sensor", "Bosch"),
        ];
        let mut scheduler = PublishScheduler::new(sensor.clone(), platform.clone());
        scheduler.add_stream(&ids.temperature_thing, Metric::Temperature);
        scheduler.add_stream(&ids.pressure_thing, Metric::Pressure);

        App {
            platform,
            sensor,
            events,
            watchdog: ConnectionWatchdog::new(config.watchdog.reconnect_interval()),
            scheduler,
            node: NodeSpec::generic(&ids.node_id),
            things,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.watchdog.state()
    }

    pub fn watchdog(&self) -> &ConnectionWatchdog {
        &self.watchdog
    }

    pub fn scheduler(&self) -> &PublishScheduler {
        &self.scheduler
    }

    /// Runs until `shutdown` resolves, then takes everything offline.
    pub async fn run<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        self.watchdog.start();
        info!(node = %self.node.id, "waiting for platform connection");

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = self.watchdog.tick() => self.on_tick().await,
                Some(event) = self.events.recv() => self.on_event(event).await,
            }
        }

        self.shutdown().await;
    }

    async fn on_tick(&mut self) {
        if self.watchdog.on_tick(self.platform.as_ref()).await == ConnectionState::Connected {
            self.bring_online().await;
        }
    }

    async fn on_event(&mut self, event: PlatformEvent) {
        match event {
            PlatformEvent::Disconnected { reason } => {
                warn!("platform connection lost: {reason}");
                self.scheduler.stop_all();
                self.watchdog.on_disconnected();
            }
            PlatformEvent::Configuration(config) => self.on_configuration(config),
        }
    }

    fn on_configuration(&mut self, config: ConfigurationEvent) {
        if self.watchdog.state() != ConnectionState::Connected {
            debug!(thing = %config.thing_id, "configuration while offline, applied on reconnect");
            return;
        }
        if config.frequency == 0 {
            debug!(thing = %config.thing_id, "unset reading frequency, using default");
        }
        let period = Period::from_millis(config.frequency);
        info!(
            thing = %config.thing_id,
            frequency = config.frequency,
            %period,
            "configuration received"
        );
        self.scheduler.reconfigure(&config.thing_id, period);
    }

    /// Registers the node and things, marks them online and starts publishing.
    async fn bring_online(&mut self) {
        self.sensor.start();

        let node_online = match self.platform.register_node(&self.node).await {
            Ok(()) => {
                self.set_online(Entity::Node(self.node.id.clone()), true, "").await;
                true
            }
            Err(e) => {
                warn!(node = %self.node.id, "node registration failed: {e}");
                false
            }
        };

        if node_online {
            for thing in &self.things {
                match self.platform.register_thing(&self.node.id, thing).await {
                    Ok(()) => {
                        let entity = Entity::Thing {
                            node_id: self.node.id.clone(),
                            thing_id: thing.id.clone(),
                        };
                        self.set_online(entity, true, "").await;
                    }
                    Err(e) => warn!(thing = %thing.id, "thing registration failed: {e}"),
                }
            }
        }

        let platform = self.platform.clone();
        self.scheduler
            .start_all(|thing_id| platform.stored_frequency(thing_id));
    }

    async fn set_online(&self, entity: Entity, online: bool, reason: &str) {
        match self.platform.set_connection_state(&entity, online, reason).await {
            Ok(()) => debug!(%entity, online, "connection state updated"),
            Err(e) => warn!(%entity, online, "connection state update failed: {e}"),
        }
    }

    /// Stops publishing, marks node and things offline and stops the sensor.
    /// The sensor is stopped however the offline marking goes.
    pub async fn shutdown(&mut self) {
        let _sensor = StopOnDrop(self.sensor.clone());
        info!("shutting down");
        self.scheduler.stop_all();

        self.set_online(Entity::Node(self.node.id.clone()), false, SHUTDOWN_REASON)
            .await;
        for thing in &self.things {
            let entity = Entity::Thing {
                node_id: self.node.id.clone(),
                thing_id: thing.id.clone(),
            };
            self.set_online(entity, false, SHUTDOWN_REASON).await;
        }
    }
}
