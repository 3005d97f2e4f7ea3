//! In-memory graph collaborator
//!
//! Holds nodes, ports and links in process and emits the same notifications
//! a session manager would. Used for simulation and for exercising the
//! engine end to end without an audio server.

use super::hub::EventHub;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, info};
use patchbay_core::domain::graph::{
    GraphBackend, GraphError, GraphEvent, Link, LinkId, Node, NodeId, NodeKind, ObjectFilter, Port,
    PortDirection, PortId, PortPair, Result, StreamInfo, StreamSubscription, SubscriptionHandle,
};

/// Conventional output port names of a stream, by channel count
fn stream_port_names(channels: u32) -> Vec<String> {
    match channels {
        1 => vec!["output_MONO".to_string()],
        2 => vec!["output_FL".to_string(), "output_FR".to_string()],
        n => (0..n).map(|i| format!("output_AUX{i}")).collect(),
    }
}

#[derive(Default)]
struct GraphState {
    nodes: BTreeMap<NodeId, Node>,
    links: BTreeMap<LinkId, Link>,
    next_id: u32,
    rejected_destinations: HashSet<PortId>,
    reject_destroy: bool,
}

impl GraphState {
    fn allocate(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn port(&self, id: PortId) -> Option<&Port> {
        self.nodes
            .values()
            .flat_map(|n| n.ports.iter())
            .find(|p| p.id == id)
    }

    fn device_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.nodes
            .values_mut()
            .find(|n| n.kind == NodeKind::Device && n.name == name)
    }

    fn drop_links_touching(&mut self, ports: &HashSet<PortId>) {
        self.links
            .retain(|_, l| !ports.contains(&l.source) && !ports.contains(&l.destination));
    }
}

pub struct MemoryGraph {
    state: Mutex<GraphState>,
    hub: EventHub,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GraphState::default()),
            hub: EventHub::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GraphState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a sink exposing the given input ports, without announcing it
    pub fn add_device(&self, name: &str, port_names: &[&str]) -> NodeId {
        let mut state = self.lock();
        let id = NodeId::new(state.allocate());
        let ports = port_names
            .iter()
            .enumerate()
            .map(|(i, port_name)| Port {
                id: PortId::new(state.allocate()),
                node: id,
                name: port_name.to_string(),
                direction: PortDirection::Input,
                channel: Some(i as u32),
            })
            .collect();

        state.nodes.insert(
            id,
            Node {
                id,
                name: name.to_string(),
                kind: NodeKind::Device,
                channel_count: port_names.len() as u32,
                ports,
                profile: None,
            },
        );
        debug!(device = name, node = %id, "Device added");
        id
    }

    /// Announce that a device is ready for routing
    pub fn device_ready(&self, name: &str) {
        self.hub.publish(GraphEvent::DeviceReady {
            name: name.to_string(),
        });
    }

    /// Add a device and announce it
    pub fn plug_device(&self, name: &str, port_names: &[&str]) -> NodeId {
        let id = self.add_device(name, port_names);
        self.device_ready(name);
        id
    }

    /// Remove a device and every link touching it
    pub fn remove_device(&self, name: &str) -> bool {
        let removed = {
            let mut state = self.lock();
            let id = state
                .nodes
                .values()
                .find(|n| n.kind == NodeKind::Device && n.name == name)
                .map(|n| n.id);
            match id.and_then(|id| state.nodes.remove(&id)) {
                Some(node) => {
                    let ports: HashSet<PortId> = node.ports.iter().map(|p| p.id).collect();
                    state.drop_links_touching(&ports);
                    true
                }
                None => false,
            }
        };

        if removed {
            info!(device = name, "Device removed");
            self.hub.publish(GraphEvent::DeviceRemoved {
                name: name.to_string(),
            });
        }
        removed
    }

    /// Switch a device to a profile exposing a different port set
    pub fn change_profile(&self, name: &str, profile: &str, port_names: &[&str]) -> bool {
        let changed = {
            let mut state = self.lock();
            let mut new_ports = Vec::with_capacity(port_names.len());
            for _ in port_names {
                new_ports.push(PortId::new(state.allocate()));
            }

            match state.device_mut(name) {
                Some(device) => {
                    let old: HashSet<PortId> = device.ports.iter().map(|p| p.id).collect();
                    let node = device.id;
                    device.ports = port_names
                        .iter()
                        .zip(new_ports)
                        .enumerate()
                        .map(|(i, (port_name, id))| Port {
                            id,
                            node,
                            name: port_name.to_string(),
                            direction: PortDirection::Input,
                            channel: Some(i as u32),
                        })
                        .collect();
                    device.channel_count = port_names.len() as u32;
                    device.profile = Some(profile.to_string());
                    state.drop_links_touching(&old);
                    true
                }
                None => false,
            }
        };

        if changed {
            self.hub.publish(GraphEvent::DeviceProfileChanged {
                name: name.to_string(),
            });
        }
        changed
    }

    /// Add an application stream without announcing it
    pub fn add_stream(&self, name: &str, channels: u32) -> NodeId {
        let mut state = self.lock();
        let id = NodeId::new(state.allocate());
        let ports = stream_port_names(channels)
            .into_iter()
            .enumerate()
            .map(|(i, port_name)| Port {
                id: PortId::new(state.allocate()),
                node: id,
                name: port_name,
                direction: PortDirection::Output,
                channel: Some(i as u32),
            })
            .collect();

        state.nodes.insert(
            id,
            Node {
                id,
                name: name.to_string(),
                kind: NodeKind::Stream,
                channel_count: channels,
                ports,
                profile: None,
            },
        );
        id
    }

    /// Announce a stream to current subscribers; returns how many received it
    pub fn announce_stream(&self, node: NodeId) -> usize {
        let info = {
            let state = self.lock();
            let Some(stream) = state.nodes.get(&node) else {
                return 0;
            };
            let ports: HashSet<PortId> = stream.ports.iter().map(|p| p.id).collect();
            StreamInfo {
                node,
                name: stream.name.clone(),
                channel_count: stream.channel_count,
                linked: state
                    .links
                    .values()
                    .any(|l| ports.contains(&l.source) || ports.contains(&l.destination)),
            }
        };
        self.hub.announce(info)
    }

    /// Add a stream and announce it
    pub fn spawn_stream(&self, name: &str, channels: u32) -> NodeId {
        let id = self.add_stream(name, channels);
        self.announce_stream(id);
        id
    }

    /// Destroy a stream and its links
    pub fn end_stream(&self, node: NodeId) -> bool {
        let mut state = self.lock();
        match state.nodes.remove(&node) {
            Some(stream) => {
                let ports: HashSet<PortId> = stream.ports.iter().map(|p| p.id).collect();
                state.drop_links_touching(&ports);
                true
            }
            None => false,
        }
    }

    /// Create a link out of band, the way a session manager's default policy would
    pub fn connect(&self, source: PortId, destination: PortId) -> Result<Link> {
        let mut state = self.lock();
        Self::insert_link(&mut state, source, destination)
    }

    fn insert_link(state: &mut GraphState, source: PortId, destination: PortId) -> Result<Link> {
        if state.port(source).is_none() {
            return Err(GraphError::PortGone(source));
        }
        if state.port(destination).is_none() {
            return Err(GraphError::PortGone(destination));
        }
        if let Some(existing) = state
            .links
            .values()
            .find(|l| l.source == source && l.destination == destination)
        {
            return Err(GraphError::Backend(format!(
                "link {} already connects {} -> {}",
                existing.id, source, destination
            )));
        }

        let link = Link {
            id: LinkId::new(state.allocate()),
            source,
            destination,
        };
        state.links.insert(link.id, link);
        Ok(link)
    }

    /// Make every creation towards `port` fail
    pub fn reject_links_to(&self, port: PortId) {
        self.lock().rejected_destinations.insert(port);
    }

    /// Make every link destruction fail
    pub fn reject_destroy(&self, reject: bool) {
        self.lock().reject_destroy = reject;
    }

    pub fn port_id(&self, node: NodeId, name: &str) -> Option<PortId> {
        self.lock()
            .nodes
            .get(&node)
            .and_then(|n| n.port_by_name(name))
            .map(|p| p.id)
    }

    /// Output port of a stream for a channel index
    pub fn stream_port(&self, node: NodeId, channel: u32) -> Option<PortId> {
        self.lock()
            .nodes
            .get(&node)
            .and_then(|n| n.ports.iter().find(|p| p.channel == Some(channel)))
            .map(|p| p.id)
    }

    pub fn link_pairs(&self) -> BTreeSet<PortPair> {
        self.lock().links.values().map(Link::pair).collect()
    }

    pub fn link_count(&self) -> usize {
        self.lock().links.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.hub.subscriber_count()
    }

    pub fn lifecycle(&self) -> broadcast::Receiver<GraphEvent> {
        self.hub.lifecycle()
    }
}

impl Default for MemoryGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl GraphBackend for MemoryGraph {
    async fn get_objects(&self, filter: &ObjectFilter) -> Result<Vec<Node>> {
        Ok(self
            .lock()
            .nodes
            .values()
            .filter(|n| filter.matches(n))
            .cloned()
            .collect())
    }

    async fn port_by_name(&self, node: NodeId, name: &str) -> Result<Option<Port>> {
        Ok(self
            .lock()
            .nodes
            .get(&node)
            .and_then(|n| n.port_by_name(name))
            .cloned())
    }

    async fn links(&self) -> Result<Vec<Link>> {
        Ok(self.lock().links.values().copied().collect())
    }

    async fn snapshot(&self) -> Result<(Vec<Node>, Vec<Link>)> {
        let state = self.lock();
        Ok((
            state.nodes.values().cloned().collect(),
            state.links.values().copied().collect(),
        ))
    }

    async fn find_link(&self, source: PortId, destination: PortId) -> Result<Option<Link>> {
        Ok(self
            .lock()
            .links
            .values()
            .find(|l| l.source == source && l.destination == destination)
            .copied())
    }

    async fn create_link(&self, source: PortId, destination: PortId) -> Result<Link> {
        let mut state = self.lock();
        if state.rejected_destinations.contains(&destination) {
            return Err(GraphError::Backend(format!(
                "link to port {destination} refused"
            )));
        }
        Self::insert_link(&mut state, source, destination)
    }

    async fn destroy_link(&self, link: &Link) -> Result<()> {
        let mut state = self.lock();
        if state.reject_destroy {
            return Err(GraphError::Backend(format!("link {} is locked", link.id)));
        }
        match state.links.remove(&link.id) {
            Some(_) => Ok(()),
            None => Err(GraphError::Backend(format!("no link {}", link.id))),
        }
    }

    async fn subscribe_lifecycle(&self) -> Result<broadcast::Receiver<GraphEvent>> {
        Ok(self.hub.lifecycle())
    }

    async fn subscribe_streams(&self) -> Result<StreamSubscription> {
        Ok(self.hub.subscribe())
    }

    async fn unsubscribe_streams(&self, handle: SubscriptionHandle) -> Result<()> {
        self.hub.unsubscribe(handle)
    }
}
