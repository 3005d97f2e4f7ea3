//! PipeWire backend driven through the stock command line tools
//!
//! `pw-dump` provides the graph as JSON, `pw-link` creates and destroys
//! links. PipeWire pushes no notifications through these tools, so stream
//! and device events come from a [`GraphPoller`](super::GraphPoller)
//! publishing into this backend's [`EventHub`].

use super::hub::EventHub;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::broadcast;
use tracing::{debug, instrument, trace};
use patchbay_core::domain::graph::{
    GraphBackend, GraphError, GraphEvent, Link, LinkId, Node, NodeId, NodeKind, ObjectFilter, Port,
    PortDirection, PortId, Result, StreamSubscription, SubscriptionHandle,
};

const NODE_TYPE: &str = "PipeWire:Interface:Node";
const PORT_TYPE: &str = "PipeWire:Interface:Port";
const LINK_TYPE: &str = "PipeWire:Interface:Link";

/// Failures of the PipeWire command line tools
#[derive(Debug, Error)]
pub enum PwToolError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    Exit {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("invalid pw-dump output: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<PwToolError> for GraphError {
    fn from(err: PwToolError) -> Self {
        match err {
            PwToolError::Json(e) => GraphError::Parse(e.to_string()),
            other => GraphError::Backend(other.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PwObject {
    id: u32,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    info: Option<PwInfo>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct PwInfo {
    #[serde(default)]
    props: Map<String, Value>,
    direction: Option<String>,
    output_port_id: Option<u32>,
    input_port_id: Option<u32>,
}

fn prop_str<'a>(props: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    props.get(key).and_then(Value::as_str)
}

/// PipeWire writes numeric props either as numbers or as strings
fn prop_u32(props: &Map<String, Value>, key: &str) -> Option<u32> {
    match props.get(key)? {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn node_kind(media_class: &str) -> Option<NodeKind> {
    match media_class {
        "Audio/Sink" => Some(NodeKind::Device),
        "Stream/Output/Audio" => Some(NodeKind::Stream),
        _ => None,
    }
}

/// Convert a `pw-dump` document into nodes and links
///
/// Only audio sinks and audio output streams are kept; links are kept when
/// both port ids are present.
pub fn parse_dump(json: &str) -> std::result::Result<(Vec<Node>, Vec<Link>), PwToolError> {
    let objects: Vec<PwObject> = serde_json::from_str(json)?;

    let mut nodes: HashMap<u32, Node> = HashMap::new();
    for object in objects.iter().filter(|o| o.kind == NODE_TYPE) {
        let Some(info) = &object.info else { continue };
        let Some(kind) = prop_str(&info.props, "media.class").and_then(node_kind) else {
            continue;
        };
        let name = prop_str(&info.props, "node.name")
            .unwrap_or_default()
            .to_string();

        nodes.insert(
            object.id,
            Node {
                id: NodeId::new(object.id),
                name,
                kind,
                channel_count: prop_u32(&info.props, "audio.channels").unwrap_or(0),
                ports: Vec::new(),
                profile: prop_str(&info.props, "device.profile.name").map(str::to_string),
            },
        );
    }

    for object in objects.iter().filter(|o| o.kind == PORT_TYPE) {
        let Some(info) = &object.info else { continue };
        let Some(owner) = prop_u32(&info.props, "node.id") else {
            continue;
        };
        let Some(node) = nodes.get_mut(&owner) else {
            continue;
        };
        let direction = match info.direction.as_deref() {
            Some("input") => PortDirection::Input,
            Some("output") => PortDirection::Output,
            _ => continue,
        };

        node.ports.push(Port {
            id: PortId::new(object.id),
            node: node.id,
            name: prop_str(&info.props, "port.name")
                .unwrap_or_default()
                .to_string(),
            direction,
            channel: prop_u32(&info.props, "port.id"),
        });
    }

    for node in nodes.values_mut() {
        if node.channel_count == 0 {
            let direction = match node.kind {
                NodeKind::Device => PortDirection::Input,
                NodeKind::Stream => PortDirection::Output,
            };
            node.channel_count = node.ports.iter().filter(|p| p.direction == direction).count() as u32;
        }
        node.ports.sort_by_key(|p| p.id);
    }

    let links = objects
        .iter()
        .filter(|o| o.kind == LINK_TYPE)
        .filter_map(|o| {
            let info = o.info.as_ref()?;
            Some(Link {
                id: LinkId::new(o.id),
                source: PortId::new(info.output_port_id?),
                destination: PortId::new(info.input_port_id?),
            })
        })
        .collect();

    let mut nodes: Vec<Node> = nodes.into_values().collect();
    nodes.sort_by_key(|n| n.id);
    Ok((nodes, links))
}

pub struct PwDumpGraph {
    hub: Arc<EventHub>,
    pw_dump: String,
    pw_link: String,
}

impl PwDumpGraph {
    pub fn new(hub: Arc<EventHub>) -> Self {
        Self::with_programs(hub, "pw-dump", "pw-link")
    }

    /// Use alternative tool binaries (e.g. absolute paths)
    pub fn with_programs(hub: Arc<EventHub>, pw_dump: &str, pw_link: &str) -> Self {
        Self {
            hub,
            pw_dump: pw_dump.to_string(),
            pw_link: pw_link.to_string(),
        }
    }

    async fn run(&self, program: &str, args: &[String]) -> std::result::Result<String, PwToolError> {
        trace!(program, ?args, "Running PipeWire tool");
        let output = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| PwToolError::Spawn {
                program: program.to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(PwToolError::Exit {
                program: program.to_string(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn dump(&self) -> Result<(Vec<Node>, Vec<Link>)> {
        let json = self.run(&self.pw_dump, &[]).await?;
        Ok(parse_dump(&json)?)
    }
}

#[async_trait::async_trait]
impl GraphBackend for PwDumpGraph {
    #[instrument(skip(self))]
    async fn get_objects(&self, filter: &ObjectFilter) -> Result<Vec<Node>> {
        let (nodes, _) = self.dump().await?;
        Ok(nodes.into_iter().filter(|n| filter.matches(n)).collect())
    }

    async fn port_by_name(&self, node: NodeId, name: &str) -> Result<Option<Port>> {
        let (nodes, _) = self.dump().await?;
        Ok(nodes
            .into_iter()
            .find(|n| n.id == node)
            .and_then(|n| n.port_by_name(name).cloned()))
    }

    async fn links(&self) -> Result<Vec<Link>> {
        let (_, links) = self.dump().await?;
        Ok(links)
    }

    /// Nodes and links from a single `pw-dump` run
    #[instrument(skip(self))]
    async fn snapshot(&self) -> Result<(Vec<Node>, Vec<Link>)> {
        self.dump().await
    }

    async fn find_link(&self, source: PortId, destination: PortId) -> Result<Option<Link>> {
        Ok(self
            .links()
            .await?
            .into_iter()
            .find(|l| l.source == source && l.destination == destination))
    }

    #[instrument(skip(self))]
    async fn create_link(&self, source: PortId, destination: PortId) -> Result<Link> {
        self.run(&self.pw_link, &[source.to_string(), destination.to_string()])
            .await?;

        // pw-link does not print the new id
        let link = self
            .find_link(source, destination)
            .await?
            .ok_or_else(|| GraphError::Backend(format!("link {source} -> {destination} not visible after creation")))?;
        debug!(id = %link.id, "Link created through pw-link");
        Ok(link)
    }

    #[instrument(skip(self))]
    async fn destroy_link(&self, link: &Link) -> Result<()> {
        self.run(&self.pw_link, &["-d".to_string(), link.id.to_string()])
            .await?;
        Ok(())
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
