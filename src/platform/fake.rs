use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{
    ConfigurationEvent, Connector, DataSink, Entity, NodeSpec, PlatformError, PlatformEvent,
    Reading, Registry, ThingSpec,
};

#[derive(Default)]
struct Recorded {
    connect_script: VecDeque<bool>,
    connect_attempts: usize,
    connected: bool,
    nodes: HashSet<String>,
    things: Vec<String>,
    online: HashMap<Entity, bool>,
    fail_state_updates: bool,
    stored: HashMap<String, u64>,
    pushes: Vec<(Instant, Reading)>,
    push_attempts: HashMap<String, usize>,
    push_delay: Duration,
    in_flight: HashMap<String, usize>,
    max_in_flight: HashMap<String, usize>,
}

/// In-memory platform that records every call, for driving the daemon in tests.
pub struct RecordingPlatform {
    recorded: Mutex<Recorded>,
    events: mpsc::UnboundedSender<PlatformEvent>,
}

impl RecordingPlatform {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<PlatformEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let platform = RecordingPlatform {
            recorded: Mutex::new(Recorded::default()),
            events,
        };
        (Arc::new(platform), rx)
    }

    fn lock(&self) -> MutexGuard<'_, Recorded> {
        self.recorded.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fails the next `count` connect attempts; later attempts succeed.
    pub fn fail_next_connects(&self, count: usize) {
        self.lock().connect_script.extend(std::iter::repeat(false).take(count));
    }

    pub fn fail_state_updates(&self, fail: bool) {
        self.lock().fail_state_updates = fail;
    }

    pub fn set_push_delay(&self, delay: Duration) {
        self.lock().push_delay = delay;
    }

    pub fn set_stored_frequency(&self, thing_id: &str, frequency: u64) {
        self.lock().stored.insert(thing_id.to_string(), frequency);
    }

    /// Stores the frequency and notifies, as a configuration push would.
    pub fn push_configuration(&self, thing_id: &str, frequency: u64) {
        self.set_stored_frequency(thing_id, frequency);
        let _ = self.events.send(PlatformEvent::Configuration(ConfigurationEvent {
            thing_id: thing_id.to_string(),
            frequency,
        }));
    }

    pub fn drop_connection(&self, reason: &str) {
        self.lock().connected = false;
        let _ = self.events.send(PlatformEvent::Disconnected {
            reason: reason.to_string(),
        });
    }

    pub fn connect_attempts(&self) -> usize {
        self.lock().connect_attempts
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    pub fn registered_things(&self) -> Vec<String> {
        self.lock().things.clone()
    }

    pub fn is_online(&self, entity: &Entity) -> bool {
        self.lock().online.get(entity).copied().unwrap_or(false)
    }

    /// Push times and first values for one thing, oldest first.
    pub fn pushes_for(&self, thing_id: &str) -> Vec<(Instant, f32)> {
        self.lock()
            .pushes
            .iter()
            .filter(|(_, reading)| reading.thing_id == thing_id)
            .map(|(at, reading)| (*at, reading.values.first().copied().unwrap_or_default()))
            .collect()
    }

    /// Every push call for a thing, including ones refused while offline.
    pub fn push_attempts(&self, thing_id: &str) -> usize {
        self.lock().push_attempts.get(thing_id).copied().unwrap_or(0)
    }

    pub fn max_in_flight(&self, thing_id: &str) -> usize {
        self.lock().max_in_flight.get(thing_id).copied().unwrap_or(0)
    }
}

struct InFlight<'a> {
    platform: &'a RecordingPlatform,
    thing_id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(count) = self.platform.lock().in_flight.get_mut(&self.thing_id) {
            *count -= 1;
        }
    }
}

#[async_trait]
impl Connector for RecordingPlatform {
    async fn connect(&self) -> Result<(), PlatformError> {
        let mut recorded = self.lock();
        recorded.connect_attempts += 1;
        if recorded.connect_script.pop_front().unwrap_or(true) {
            recorded.connected = true;
            Ok(())
        } else {
            Err(PlatformError::Connect("scripted refusal".to_string()))
        }
    }
}

#[async_trait]
impl Registry for RecordingPlatform {
    async fn register_node(&self, node: &NodeSpec) -> Result<(), PlatformError> {
        let mut recorded = self.lock();
        if !recorded.connected {
            return Err(PlatformError::NotConnected);
        }
        recorded.nodes.insert(node.id.clone());
        Ok(())
    }

    async fn register_thing(&self, node_id: &str, thing: &ThingSpec) -> Result<(), PlatformError> {
        let mut recorded = self.lock();
        if !recorded.connected || !recorded.nodes.contains(node_id) {
            return Err(PlatformError::NotConnected);
        }
        if !recorded.things.contains(&thing.id) {
            recorded.things.push(thing.id.clone());
        }
        Ok(())
    }

    async fn set_connection_state(
        &self,
        entity: &Entity,
        online: bool,
        _reason: &str,
    ) -> Result<(), PlatformError> {
        let mut recorded = self.lock();
        if recorded.fail_state_updates {
            return Err(PlatformError::Request("scripted state failure".to_string()));
        }
        recorded.online.insert(entity.clone(), online);
        Ok(())
    }

    fn stored_frequency(&self, thing_id: &str) -> Option<u64> {
        self.lock().stored.get(thing_id).copied()
    }
}

#[async_trait]
impl DataSink for RecordingPlatform {
    async fn push_data(&self, reading: &Reading) -> Result<(), PlatformError> {
        let delay = {
            let mut recorded = self.lock();
            *recorded.push_attempts.entry(reading.thing_id.clone()).or_default() += 1;
            if !recorded.connected {
                return Err(PlatformError::NotConnected);
            }
            let count = recorded.in_flight.entry(reading.thing_id.clone()).or_default();
            *count += 1;
            let current = *count;
            let max = recorded.max_in_flight.entry(reading.thing_id.clone()).or_default();
            *max = (*max).max(current);
            recorded.push_delay
        };
        let _in_flight = InFlight {
            platform: self,
            thing_id: reading.thing_id.clone(),
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.lock().pushes.push((Instant::now(), reading.clone()));
        Ok(())
    }
}
