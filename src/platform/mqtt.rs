//! Platform facade over an MQTT broker.
//!
//! Layout under `<prefix>/<node>`:
//!
//! - `status`, `meta` for the node, and `<thing>/{status,meta,data,config}`
//!   for each thing;
//! - `meta` and `status` are retained, so late subscribers see current state;
//! - `config` is written by the management side and subscribed to when the
//!   thing is registered; a retained value arrives right after and retunes
//!   the stream.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use serde_derive::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    ConfigurationEvent, Connector, DataSink, Entity, NodeSpec, PlatformError, PlatformEvent,
    Reading, Registry, ThingSpec,
};

const REQUEST_CAPACITY: usize = 32;

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub topic_prefix: String,
}

#[derive(Serialize)]
struct StatusPayload<'a> {
    online: bool,
    reason: &'a str,
}

#[derive(Default)]
struct Shared {
    client: Option<AsyncClient>,
    driver: Option<JoinHandle<()>>,
    /// topic segment -> thing id
    things: HashMap<String, String>,
    stored: HashMap<String, u64>,
}

pub struct MqttPlatform {
    settings: MqttSettings,
    node_id: String,
    root: String,
    shared: Arc<Mutex<Shared>>,
    events: mpsc::UnboundedSender<PlatformEvent>,
}

/// Turns a display name into a single topic level.
pub fn topic_segment(name: &str) -> Result<String, PlatformError> {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed.contains(['+', '#', '/']) {
        return Err(PlatformError::InvalidName(name.to_string()));
    }
    Ok(trimmed.replace(char::is_whitespace, "_"))
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MqttPlatform {
    pub fn new(
        settings: MqttSettings,
        node_id: &str,
        events: mpsc::UnboundedSender<PlatformEvent>,
    ) -> Result<Self, PlatformError> {
        let prefix = topic_segment(&settings.topic_prefix)?;
        let root = format!("{prefix}/{}", topic_segment(node_id)?);
        Ok(MqttPlatform {
            settings,
            node_id: node_id.to_string(),
            root,
            shared: Arc::new(Mutex::new(Shared::default())),
            events,
        })
    }

    fn node_topic(&self, leaf: &str) -> String {
        format!("{}/{leaf}", self.root)
    }

    fn thing_topic(&self, thing_id: &str, leaf: &str) -> Result<String, PlatformError> {
        Ok(format!("{}/{}/{leaf}", self.root, topic_segment(thing_id)?))
    }

    fn client(&self) -> Result<AsyncClient, PlatformError> {
        lock(&self.shared).client.clone().ok_or(PlatformError::NotConnected)
    }

    fn publish(&self, topic: String, retain: bool, payload: Vec<u8>) -> Result<(), PlatformError> {
        self.client()?
            .try_publish(topic, QoS::AtLeastOnce, retain, payload)
            .map_err(|e| PlatformError::Request(e.to_string()))
    }

    fn options(&self) -> Result<MqttOptions, PlatformError> {
        let mut options = MqttOptions::new(
            self.settings.client_id.clone(),
            self.settings.host.clone(),
            self.settings.port,
        );
        options.set_keep_alive(self.settings.keep_alive);
        let offline = serde_json::to_vec(&StatusPayload {
            online: false,
            reason: "connection lost",
        })?;
        options.set_last_will(LastWill::new(
            self.node_topic("status"),
            offline,
            QoS::AtLeastOnce,
            true,
        ));
        if let Some(username) = &self.settings.username {
            options.set_credentials(
                username.clone(),
                self.settings.password.clone().unwrap_or_default(),
            );
        }
        Ok(options)
    }
}

async fn await_connack(eventloop: &mut EventLoop) -> Result<(), PlatformError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                debug!(code = ?ack.code, "connack received");
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => return Err(PlatformError::Connect(e.to_string())),
        }
    }
}

/// Resolves a publish on `<root>/<segment>/config` to a configuration event
/// for the registered thing behind `segment`.
fn config_event(
    root: &str,
    topic: &str,
    payload: &[u8],
    things: &HashMap<String, String>,
) -> Option<ConfigurationEvent> {
    let Some(segment) = topic
        .strip_prefix(root)
        .and_then(|rest| rest.strip_prefix('/'))
        .and_then(|rest| rest.strip_suffix("/config"))
    else {
        debug!(%topic, "ignoring publish");
        return None;
    };
    let Some(thing_id) = things.get(segment) else {
        warn!(%topic, "configuration for unregistered thing ignored");
        return None;
    };
    match ConfigurationEvent::parse(thing_id.as_str(), payload) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(%topic, "malformed configuration: {e}");
            None
        }
    }
}

/// Records the frequency carried by a config publish and returns the event.
fn accept_config(
    shared: &Mutex<Shared>,
    root: &str,
    topic: &str,
    payload: &[u8],
) -> Option<ConfigurationEvent> {
    let mut state = lock(shared);
    let event = config_event(root, topic, payload, &state.things)?;
    state.stored.insert(event.thing_id.clone(), event.frequency);
    Some(event)
}

/// Polls the connection until it fails, translating inbound config publishes.
async fn drive(
    mut eventloop: EventLoop,
    root: String,
    shared: Arc<Mutex<Shared>>,
    events: mpsc::UnboundedSender<PlatformEvent>,
) {
    let reason = loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let accepted = accept_config(&shared, &root, &publish.topic, &publish.payload);
                if let Some(event) = accepted {
                    let _ = events.send(PlatformEvent::Configuration(event));
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => break "broker sent disconnect".to_string(),
            Ok(_) => {}
            Err(e) => break e.to_string(),
        }
    };

    warn!("mqtt connection lost: {reason}");
    let mut state = lock(&shared);
    state.client = None;
    state.driver = None;
    drop(state);
    let _ = events.send(PlatformEvent::Disconnected { reason });
}

#[async_trait]
impl Connector for MqttPlatform {
    async fn connect(&self) -> Result<(), PlatformError> {
        let (client, mut eventloop) = AsyncClient::new(self.options()?, REQUEST_CAPACITY);
        let timeout = self.settings.connect_timeout;
        tokio::time::timeout(timeout, await_connack(&mut eventloop))
            .await
            .map_err(|_| PlatformError::Timeout(timeout))??;

        info!(host = %self.settings.host, port = self.settings.port, "mqtt connected");

        let driver = tokio::spawn(drive(
            eventloop,
            self.root.clone(),
            self.shared.clone(),
            self.events.clone(),
        ));
        let mut state = lock(&self.shared);
        if let Some(previous) = state.driver.replace(driver) {
            previous.abort();
        }
        state.client = Some(client);
        Ok(())
    }
}

#[async_trait]
impl Registry for MqttPlatform {
    async fn register_node(&self, node: &NodeSpec) -> Result<(), PlatformError> {
        let payload = serde_json::to_vec(node)?;
        self.publish(self.node_topic("meta"), true, payload)
    }

    async fn register_thing(&self, node_id: &str, thing: &ThingSpec) -> Result<(), PlatformError> {
        if node_id != self.node_id {
            return Err(PlatformError::InvalidName(node_id.to_string()));
        }
        let topic = self.thing_topic(&thing.id, "meta")?;
        let payload = serde_json::to_vec(thing)?;
        self.publish(topic, true, payload)?;
        lock(&self.shared)
            .things
            .insert(topic_segment(&thing.id)?, thing.id.clone());

        // config publishes are only routed once the thing is known
        self.client()?
            .try_subscribe(self.thing_topic(&thing.id, "config")?, QoS::AtLeastOnce)
            .map_err(|e| PlatformError::Request(e.to_string()))
    }

    async fn set_connection_state(
        &self,
        entity: &Entity,
        online: bool,
        reason: &str,
    ) -> Result<(), PlatformError> {
        let topic = match entity {
            Entity::Node(_) => self.node_topic("status"),
            Entity::Thing { thing_id, .. } => self.thing_topic(thing_id, "status")?,
        };
        let payload = serde_json::to_vec(&StatusPayload { online, reason })?;
        self.publish(topic, true, payload)
    }

    fn stored_frequency(&self, thing_id: &str) -> Option<u64> {
        lock(&self.shared).stored.get(thing_id).copied()
    }
}

#[async_trait]
impl DataSink for MqttPlatform {
    async fn push_data(&self, reading: &Reading) -> Result<(), PlatformError> {
        let topic = self.thing_topic(&reading.thing_id, "data")?;
        let payload = serde_json::to_vec(reading)?;
        self.publish(topic, false, payload)
    }
}
