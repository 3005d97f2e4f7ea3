//! Domain entities and routing rules

pub mod config;
pub mod graph;
pub mod policy;
pub mod reconciler;
pub mod resolver;
pub mod snapshot;
pub mod watcher;

// Re-export specific items to avoid ambiguous glob imports
pub use config::{ConfigError, ConfigManager, EngineConfig, PatchbayConfig, RoutingConfig};
pub use graph::{
    GraphBackend, GraphError, GraphEvent, Link, LinkId, Node, NodeId, NodeKind, ObjectFilter,
    Port, PortDirection, PortId, PortPair, StreamInfo, StreamSubscription, SubscriptionHandle,
};
pub use policy::{Decision, PolicyOutcome, RoutingPolicy, StreamDescriptor};
pub use reconciler::{CreateOutcome, DeviceLocks, ReconcileResult, Reconciler, RemoveOutcome};
pub use resolver::{DevicePorts, PortResolver, PortRole, Resolution, RoleTable};
pub use snapshot::GraphSnapshot;
pub use watcher::{EventWatcher, PassReport, WatcherState, WatcherStats};
