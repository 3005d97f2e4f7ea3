//! Port role resolution
//!
//! Maps the logical roles of the target device (main/monitor, left/right)
//! to concrete ports in a snapshot. Roles are a configuration-level lookup
//! table; resolution is exact-name and case-sensitive.

use crate::domain::config::RoutingConfig;
use crate::domain::graph::PortId;
use crate::domain::snapshot::GraphSnapshot;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::trace;

/// Logical role of a device port
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PortRole {
    MainLeft,
    MainRight,
    MonitorLeft,
    MonitorRight,
}

impl PortRole {
    pub const MAIN: [PortRole; 2] = [PortRole::MainLeft, PortRole::MainRight];
    pub const MONITOR: [PortRole; 2] = [PortRole::MonitorLeft, PortRole::MonitorRight];
    pub const ALL: [PortRole; 4] = [
        PortRole::MainLeft,
        PortRole::MainRight,
        PortRole::MonitorLeft,
        PortRole::MonitorRight,
    ];

    /// Stream channel feeding this role (0 = left, 1 = right)
    pub fn channel_index(&self) -> usize {
        match self {
            PortRole::MainLeft | PortRole::MonitorLeft => 0,
            PortRole::MainRight | PortRole::MonitorRight => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PortRole::MainLeft => "main-left",
            PortRole::MainRight => "main-right",
            PortRole::MonitorLeft => "monitor-left",
            PortRole::MonitorRight => "monitor-right",
        }
    }
}

impl fmt::Display for PortRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Role to port-name mapping for one device/profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleTable {
    names: BTreeMap<PortRole, String>,
}

impl RoleTable {
    pub fn new(names: BTreeMap<PortRole, String>) -> Self {
        Self { names }
    }

    pub fn port_name(&self, role: PortRole) -> Option<&str> {
        self.names.get(&role).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (PortRole, &str)> {
        self.names.iter().map(|(role, name)| (*role, name.as_str()))
    }
}

impl From<&RoutingConfig> for RoleTable {
    fn from(config: &RoutingConfig) -> Self {
        let (main_l, main_r) = &config.main_port_names;
        let (mon_l, mon_r) = &config.monitor_port_names;

        let names = [
            (PortRole::MainLeft, main_l),
            (PortRole::MainRight, main_r),
            (PortRole::MonitorLeft, mon_l),
            (PortRole::MonitorRight, mon_r),
        ]
        .into_iter()
        .map(|(role, name)| (role, name.clone()))
        .collect();

        Self::new(names)
    }
}

/// Outcome of looking up one port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Resolved(PortId),
    NotFound,
}

impl Resolution {
    pub fn port(&self) -> Option<PortId> {
        match self {
            Resolution::Resolved(id) => Some(*id),
            Resolution::NotFound => None,
        }
    }
}

/// Resolved role set of the target device
///
/// This is the only shape the routing policy sees of the live graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePorts {
    pub device: String,
    pub device_present: bool,
    pub ports: BTreeMap<PortRole, Resolution>,
}

impl DevicePorts {
    /// Device not found in the snapshot
    pub fn absent(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            device_present: false,
            ports: PortRole::ALL
                .into_iter()
                .map(|role| (role, Resolution::NotFound))
                .collect(),
        }
    }

    pub fn get(&self, role: PortRole) -> Option<PortId> {
        self.ports.get(&role).and_then(Resolution::port)
    }

    /// Both ports of a left/right pair, or `None` if either is missing
    pub fn pair(&self, roles: [PortRole; 2]) -> Option<[PortId; 2]> {
        Some([self.get(roles[0])?, self.get(roles[1])?])
    }

    pub fn missing(&self, roles: &[PortRole]) -> Vec<PortRole> {
        roles
            .iter()
            .copied()
            .filter(|role| self.get(*role).is_none())
            .collect()
    }
}

pub struct PortResolver;

impl PortResolver {
    /// Look up `port_name` on the device called `device_name`
    ///
    /// An absent device is not an error: it is an expected transient state
    /// and resolves to [`Resolution::NotFound`] like a missing port.
    pub fn resolve(snapshot: &GraphSnapshot, device_name: &str, port_name: &str) -> Resolution {
        let Some(device) = snapshot.node_by_name(device_name) else {
            trace!(device = device_name, "Device not in snapshot");
            return Resolution::NotFound;
        };

        match device.port_by_name(port_name) {
            Some(port) => Resolution::Resolved(port.id),
            None => {
                trace!(device = device_name, port = port_name, "Port not exposed by active profile");
                Resolution::NotFound
            }
        }
    }

    /// Resolve every role in `table` against the device
    pub fn resolve_roles(
        snapshot: &GraphSnapshot,
        device_name: &str,
        table: &RoleTable,
    ) -> DevicePorts {
        if snapshot.node_by_name(device_name).is_none() {
            return DevicePorts::absent(device_name);
        }

        let ports = table
            .iter()
            .map(|(role, name)| (role, Self::resolve(snapshot, device_name, name)))
            .collect();

        DevicePorts {
            device: device_name.to_string(),
            device_present: true,
            ports,
        }
    }
}
