//! Audio graph model and the graph collaborator interface
//!
//! This module defines the platform-agnostic view of the audio graph (nodes,
//! ports and links) and the [`GraphBackend`] trait through which the engine
//! observes and mutates it. Implementations for concrete session managers
//! live in the `infra` crate.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

/// Errors reported by a graph collaborator
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    /// A query or mutation did not complete within its time budget
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// The collaborator rejected or failed the request
    #[error("Backend error: {0}")]
    Backend(String),

    /// The port vanished between lookup and mutation
    #[error("Port no longer exists: {0}")]
    PortGone(PortId),

    /// Stream notifications could not be (re)established
    #[error("Subscription error: {0}")]
    Subscription(String),

    /// The collaborator returned data we could not understand
    #[error("Parse error: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, GraphError>;

/// Run a collaborator call under a time budget
///
/// Expiry is reported as [`GraphError::Timeout`] naming the operation.
pub async fn bounded<T, F>(operation: &str, limit: Duration, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(GraphError::Timeout(format!(
            "{operation} exceeded {}ms",
            limit.as_millis()
        ))),
    }
}

macro_rules! object_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(u32);

        impl $name {
            pub fn new(id: u32) -> Self {
                Self(id)
            }

            pub fn get(&self) -> u32 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

object_id!(
    /// Graph-wide identifier of a node
    NodeId
);
object_id!(
    /// Graph-wide identifier of a port
    PortId
);
object_id!(
    /// Graph-wide identifier of a link
    LinkId
);

/// What a node represents in the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    /// Hardware sink receiving audio
    Device,
    /// Application output stream
    Stream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortDirection {
    Input,
    Output,
}

/// A port owned by exactly one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub id: PortId,
    pub node: NodeId,
    pub name: String,
    pub direction: PortDirection,
    /// 0-based channel index, when the collaborator reports one
    pub channel: Option<u32>,
}

/// A device or stream node together with its ports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub kind: NodeKind,
    pub channel_count: u32,
    pub ports: Vec<Port>,
    /// Active device profile, if known
    pub profile: Option<String>,
}

impl Node {
    /// Exact, case-sensitive lookup of a port by name
    pub fn port_by_name(&self, name: &str) -> Option<&Port> {
        self.ports.iter().find(|p| p.name == name)
    }

    /// Output ports ordered by channel index (falling back to declaration order)
    pub fn output_ports(&self) -> Vec<&Port> {
        let mut ports: Vec<&Port> = self
            .ports
            .iter()
            .filter(|p| p.direction == PortDirection::Output)
            .collect();
        ports.sort_by_key(|p| p.channel.unwrap_or(u32::MAX));
        ports
    }
}

/// Identity of a link: at most one link exists per pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PortPair {
    pub source: PortId,
    pub destination: PortId,
}

impl PortPair {
    pub fn new(source: PortId, destination: PortId) -> Self {
        Self {
            source,
            destination,
        }
    }
}

impl fmt::Display for PortPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source, self.destination)
    }
}

/// A directed connection from a stream port to a device port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Link {
    pub id: LinkId,
    pub source: PortId,
    pub destination: PortId,
}

impl Link {
    pub fn pair(&self) -> PortPair {
        PortPair::new(self.source, self.destination)
    }
}

/// Selection passed to [`GraphBackend::get_objects`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectFilter {
    All,
    Named(String),
    Kind(NodeKind),
}

impl ObjectFilter {
    pub fn matches(&self, node: &Node) -> bool {
        match self {
            ObjectFilter::All => true,
            ObjectFilter::Named(name) => node.name == *name,
            ObjectFilter::Kind(kind) => node.kind == *kind,
        }
    }
}

/// Payload of a stream-appeared notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub node: NodeId,
    pub name: String,
    pub channel_count: u32,
    /// Whether the stream had any active link when it was announced
    pub linked: bool,
}

/// Lifecycle and stream notifications emitted by the collaborator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphEvent {
    DeviceReady { name: String },
    DeviceRemoved { name: String },
    DeviceProfileChanged { name: String },
    StreamAppeared(StreamInfo),
}

/// Handle identifying one stream subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub u64);

/// Live stream-appearance subscription
#[derive(Debug)]
pub struct StreamSubscription {
    pub handle: SubscriptionHandle,
    pub events: mpsc::UnboundedReceiver<StreamInfo>,
}

/// Outbound interface to the graph collaborator
///
/// The engine only observes and issues mutation requests through this trait;
/// it never owns devices, streams or links.
#[async_trait::async_trait]
pub trait GraphBackend: Send + Sync {
    /// List nodes matching the filter
    async fn get_objects(&self, filter: &ObjectFilter) -> Result<Vec<Node>>;

    /// Find a port on a node by exact name
    async fn port_by_name(&self, node: NodeId, name: &str) -> Result<Option<Port>>;

    /// List every link in the graph
    async fn links(&self) -> Result<Vec<Link>>;

    /// Every node and link, read together
    ///
    /// Backends that can read the whole graph at once should override this so
    /// nodes and links come from the same instant.
    async fn snapshot(&self) -> Result<(Vec<Node>, Vec<Link>)> {
        let nodes = self.get_objects(&ObjectFilter::All).await?;
        let links = self.links().await?;
        Ok((nodes, links))
    }

    /// Find the link for a (source, destination) pair
    async fn find_link(&self, source: PortId, destination: PortId) -> Result<Option<Link>>;

    /// Create a link between two ports
    async fn create_link(&self, source: PortId, destination: PortId) -> Result<Link>;

    /// Destroy an existing link
    async fn destroy_link(&self, link: &Link) -> Result<()>;

    /// Receive device lifecycle notifications
    ///
    /// Failure here is an unrecoverable startup error.
    async fn subscribe_lifecycle(&self) -> Result<broadcast::Receiver<GraphEvent>>;

    /// Start receiving stream-appeared notifications
    async fn subscribe_streams(&self) -> Result<StreamSubscription>;

    /// Stop a subscription previously returned by [`GraphBackend::subscribe_streams`]
    async fn unsubscribe_streams(&self, handle: SubscriptionHandle) -> Result<()>;
}
