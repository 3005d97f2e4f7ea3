//! Point-in-time view of the audio graph
//!
//! A [`GraphSnapshot`] is captured at the start of every reconciliation pass
//! and is never reused to decide a second mutation.

use crate::domain::graph::{
    bounded, GraphBackend, Link, Node, NodeId, NodeKind, Port, PortId, PortPair, Result, StreamInfo,
};
use crate::domain::policy::StreamDescriptor;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Immutable copy of the nodes, ports and links visible at capture time
#[derive(Debug, Clone, Default)]
pub struct GraphSnapshot {
    nodes: HashMap<NodeId, Node>,
    links: Vec<Link>,
}

impl GraphSnapshot {
    /// Query the collaborator for every node and link in one read
    ///
    /// The read is bounded by `limit`; a slow collaborator yields
    /// [`GraphError::Timeout`](crate::domain::graph::GraphError::Timeout).
    #[instrument(skip(backend))]
    pub async fn capture(backend: &dyn GraphBackend, limit: Duration) -> Result<Self> {
        let (nodes, links) = bounded("snapshot", limit, backend.snapshot()).await?;

        debug!(nodes = nodes.len(), links = links.len(), "Captured graph snapshot");
        Ok(Self::from_parts(nodes, links))
    }

    pub fn from_parts(nodes: Vec<Node>, links: Vec<Link>) -> Self {
        Self {
            nodes: nodes.into_iter().map(|n| (n.id, n)).collect(),
            links,
        }
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    /// Device node carrying exactly this name
    ///
    /// Should several devices share the name, the one with the lowest id wins.
    pub fn node_by_name(&self, name: &str) -> Option<&Node> {
        let mut matches = self
            .nodes
            .values()
            .filter(|n| n.kind == NodeKind::Device && n.name == name);
        let first = matches.next()?;
        let mut chosen = first;
        let mut duplicates = 0;
        for node in matches {
            duplicates += 1;
            if node.id < chosen.id {
                chosen = node;
            }
        }
        if duplicates > 0 {
            warn!(device = name, node = %chosen.id, duplicates, "Several devices share this name, using the lowest id");
        }
        Some(chosen)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn port_by_name(&self, node: NodeId, name: &str) -> Option<&Port> {
        self.nodes.get(&node).and_then(|n| n.port_by_name(name))
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn find_link(&self, pair: PortPair) -> Option<&Link> {
        self.links.iter().find(|l| l.pair() == pair)
    }

    pub fn links_from(&self, port: PortId) -> impl Iterator<Item = &Link> {
        self.links.iter().filter(move |l| l.source == port)
    }

    /// Build the policy's view of a stream announced by `info`
    ///
    /// Ports come from the snapshot when the node is present; the announced
    /// channel count and linked state are kept as reported.
    pub fn stream_descriptor(&self, info: &StreamInfo) -> StreamDescriptor {
        let ports: Vec<PortId> = self
            .node(info.node)
            .map(|n| n.output_ports().iter().map(|p| p.id).collect())
            .unwrap_or_default();

        let existing_links: BTreeSet<PortPair> = ports
            .iter()
            .flat_map(|port| self.links_from(*port).map(Link::pair))
            .collect();

        StreamDescriptor {
            node: info.node,
            name: info.name.clone(),
            channel_count: info.channel_count,
            linked: info.linked,
            ports,
            existing_links,
        }
    }
}
