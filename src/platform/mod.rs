//! Capabilities the daemon needs from the IoT management platform.
//!
//! Connection, registration and data push are separate traits so each
//! component is handed only what it uses. Asynchronous notifications
//! (disconnects, configuration pushes) arrive as [`PlatformEvent`]s on a
//! channel given to the implementation at construction.

use std::time::Duration;

use async_trait::async_trait;
use serde_derive::{Deserialize, Serialize};

pub mod fake;
pub mod mqtt;

#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("not connected to the platform")]
    NotConnected,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("connection timed out after {0:?}")]
    Timeout(Duration),
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid name {0:?}")]
    InvalidName(String),
    #[error("invalid payload: {0}")]
    Payload(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataType {
    Float,
}

/// The logical device grouping the published things.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeSpec {
    pub id: String,
    pub kind: String,
}

impl NodeSpec {
    pub fn generic(id: impl Into<String>) -> Self {
        NodeSpec {
            id: id.into(),
            kind: "GENERIC".to_string(),
        }
    }
}

/// One published data stream registered under a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThingSpec {
    pub id: String,
    pub type_name: String,
    pub vendor: String,
    pub data_type: DataType,
}

impl ThingSpec {
    pub fn float(
        id: impl Into<String>,
        type_name: impl Into<String>,
        vendor: impl Into<String>,
    ) -> Self {
        ThingSpec {
            id: id.into(),
            type_name: type_name.into(),
            vendor: vendor.into(),
            data_type: DataType::Float,
        }
    }
}

/// Something whose online state the platform tracks.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Entity {
    Node(String),
    Thing { node_id: String, thing_id: String },
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Entity::Node(id) => write!(f, "node {id:?}"),
            Entity::Thing { node_id, thing_id } => write!(f, "thing {thing_id:?} of {node_id:?}"),
        }
    }
}

/// A batch of values published to one thing.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    pub thing_id: String,
    pub values: Vec<f32>,
}

impl Reading {
    pub fn single(thing_id: impl Into<String>, value: f32) -> Self {
        Reading {
            thing_id: thing_id.into(),
            values: vec![value],
        }
    }
}

/// Remote configuration pushed for one thing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationEvent {
    pub thing_id: String,
    /// Milliseconds between readings; 0 means "not set".
    pub frequency: u64,
}

#[derive(Debug, Deserialize)]
struct ThingConfiguration {
    #[serde(rename = "dataReadingFrequency", default)]
    data_reading_frequency: u64,
}

impl ConfigurationEvent {
    pub fn parse(thing_id: impl Into<String>, payload: &[u8]) -> Result<Self, PlatformError> {
        let config: ThingConfiguration = serde_json::from_slice(payload)?;
        Ok(ConfigurationEvent {
            thing_id: thing_id.into(),
            frequency: config.data_reading_frequency,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
    Disconnected { reason: String },
    Configuration(ConfigurationEvent),
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<(), PlatformError>;
}

#[async_trait]
pub trait Registry: Send + Sync {
    /// Registers the node; succeeds without side effects if it already is.
    async fn register_node(&self, node: &NodeSpec) -> Result<(), PlatformError>;

    async fn register_thing(&self, node_id: &str, thing: &ThingSpec) -> Result<(), PlatformError>;

    async fn set_connection_state(
        &self,
        entity: &Entity,
        online: bool,
        reason: &str,
    ) -> Result<(), PlatformError>;

    /// The last reading frequency the platform holds for a thing, if any.
    fn stored_frequency(&self, thing_id: &str) -> Option<u64>;
}

#[async_trait]
pub trait DataSink: Send + Sync {
    async fn push_data(&self, reading: &Reading) -> Result<(), PlatformError>;
}

pub trait PlatformFacade: Connector + Registry + DataSink {}

impl<T: Connector + Registry + DataSink> PlatformFacade for T {}
