//! Routing policy
//!
//! Pure decision function from a stream, the resolved device ports and the
//! routing configuration to the set of links to create and remove. No I/O
//! happens here; the reconciler applies the decision against the live graph.

use crate::domain::config::RoutingConfig;
use crate::domain::graph::{NodeId, PortId, PortPair};
use crate::domain::resolver::{DevicePorts, PortRole};
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, info, warn};

/// Policy view of a freshly announced stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescriptor {
    pub node: NodeId,
    pub name: String,
    pub channel_count: u32,
    /// Linked state as announced; a linked stream is never re-routed
    pub linked: bool,
    /// Output ports ordered by channel index
    pub ports: Vec<PortId>,
    /// Links already leaving this stream's ports
    pub existing_links: BTreeSet<PortPair>,
}

/// Which branch of the policy produced a decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyOutcome {
    /// Not a two-channel stream, left to default behaviour
    NotStereo,
    /// Stream already connected to something
    AlreadyLinked,
    /// Target device absent from the graph
    DeviceNotReady,
    /// Device present but its active profile lacks the main ports
    TargetPortsUnavailable { missing: Vec<PortRole> },
    /// Links planned; `duplicated` when monitor copies were added
    Route { duplicated: bool },
}

impl fmt::Display for PolicyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyOutcome::NotStereo => f.write_str("not stereo"),
            PolicyOutcome::AlreadyLinked => f.write_str("already linked"),
            PolicyOutcome::DeviceNotReady => f.write_str("device not ready"),
            PolicyOutcome::TargetPortsUnavailable { missing } => {
                let roles: Vec<&str> = missing.iter().map(PortRole::as_str).collect();
                write!(f, "target ports unavailable: {}", roles.join(", "))
            }
            PolicyOutcome::Route { duplicated: true } => f.write_str("route with monitor copy"),
            PolicyOutcome::Route { duplicated: false } => f.write_str("route"),
        }
    }
}

/// Desired link changes for one stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub device: String,
    pub stream: NodeId,
    pub links_to_create: BTreeSet<PortPair>,
    pub links_to_remove: BTreeSet<PortPair>,
    pub outcome: PolicyOutcome,
}

impl Decision {
    fn untouched(stream: &StreamDescriptor, ports: &DevicePorts, outcome: PolicyOutcome) -> Self {
        Self {
            device: ports.device.clone(),
            stream: stream.node,
            links_to_create: BTreeSet::new(),
            links_to_remove: BTreeSet::new(),
            outcome,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.links_to_create.is_empty() && self.links_to_remove.is_empty()
    }
}

pub struct RoutingPolicy;

impl RoutingPolicy {
    /// Compute the link changes for a stream
    pub fn decide(
        stream: &StreamDescriptor,
        ports: &DevicePorts,
        config: &RoutingConfig,
    ) -> Decision {
        if stream.channel_count != 2 || stream.ports.len() < 2 {
            debug!(
                stream = %stream.name,
                channels = stream.channel_count,
                ports = stream.ports.len(),
                "Ignoring non-stereo stream"
            );
            return Decision::untouched(stream, ports, PolicyOutcome::NotStereo);
        }

        if stream.linked {
            debug!(stream = %stream.name, "Stream already linked, leaving it alone");
            return Decision::untouched(stream, ports, PolicyOutcome::AlreadyLinked);
        }

        if !ports.device_present {
            debug!(stream = %stream.name, device = %ports.device, "Target device not ready");
            return Decision::untouched(stream, ports, PolicyOutcome::DeviceNotReady);
        }

        let Some(main) = ports.pair(PortRole::MAIN) else {
            let missing = ports.missing(&PortRole::MAIN);
            warn!(
                stream = %stream.name,
                device = %ports.device,
                missing = ?missing,
                "Target ports unavailable, deferring until the device exposes them"
            );
            return Decision::untouched(
                stream,
                ports,
                PolicyOutcome::TargetPortsUnavailable { missing },
            );
        };

        let mut decision = Decision::untouched(stream, ports, PolicyOutcome::Route { duplicated: false });

        if !config.duplicate_to_monitor {
            for role in PortRole::MONITOR {
                let Some(monitor) = ports.get(role) else {
                    continue;
                };
                let pair = PortPair::new(stream.ports[role.channel_index()], monitor);
                if stream.existing_links.contains(&pair) {
                    info!(stream = %stream.name, role = %role, link = %pair, "Removing monitor link");
                    decision.links_to_remove.insert(pair);
                }
            }
        }

        for (role, port) in PortRole::MAIN.into_iter().zip(main) {
            let pair = PortPair::new(stream.ports[role.channel_index()], port);
            info!(stream = %stream.name, role = %role, link = %pair, "Linking to main port");
            decision.links_to_create.insert(pair);
        }

        if config.duplicate_to_monitor {
            match ports.pair(PortRole::MONITOR) {
                Some(monitor) => {
                    for (role, port) in PortRole::MONITOR.into_iter().zip(monitor) {
                        let pair = PortPair::new(stream.ports[role.channel_index()], port);
                        decision.links_to_create.insert(pair);
                    }
                    info!(stream = %stream.name, "Duplicating to monitor ports");
                    decision.outcome = PolicyOutcome::Route { duplicated: true };
                }
                None => {
                    warn!(
                        stream = %stream.name,
                        missing = ?ports.missing(&PortRole::MONITOR),
                        "Monitor ports unavailable, routing main only"
                    );
                }
            }
        }

        decision
    }
}
