//! Polling event source
//!
//! Turns successive graph snapshots into lifecycle and stream events for
//! backends that cannot push notifications themselves. Ready devices are
//! announced again on every poll while no stream subscription is live.

use super::hub::EventHub;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use patchbay_core::domain::config::EngineConfig;
use patchbay_core::domain::graph::{GraphBackend, GraphEvent, NodeId, NodeKind, Result, StreamInfo};
use patchbay_core::domain::snapshot::GraphSnapshot;

/// What a device looked like last time we saw it
#[derive(Debug, Clone, PartialEq, Eq)]
struct DeviceSignature {
    profile: Option<String>,
    ports: BTreeSet<String>,
}

#[derive(Debug)]
struct SeenDevice {
    first_seen: Instant,
    ready: bool,
    signature: DeviceSignature,
}

pub struct GraphPoller {
    backend: Arc<dyn GraphBackend>,
    hub: Arc<EventHub>,
    interval: Duration,
    debounce: Duration,
    timeout: Duration,
    devices: HashMap<String, SeenDevice>,
    streams: HashSet<NodeId>,
    primed: bool,
}

impl GraphPoller {
    pub fn new(backend: Arc<dyn GraphBackend>, hub: Arc<EventHub>, engine: &EngineConfig) -> Self {
        Self {
            backend,
            hub,
            interval: engine.poll_interval(),
            debounce: engine.rediscovery_debounce(),
            timeout: engine.operation_timeout(),
            devices: HashMap::new(),
            streams: HashSet::new(),
            primed: false,
        }
    }

    /// Capture the graph once and publish what changed since the last poll
    pub async fn poll_once(&mut self) -> Result<Vec<GraphEvent>> {
        self.poll_at(Instant::now()).await
    }

    async fn poll_at(&mut self, now: Instant) -> Result<Vec<GraphEvent>> {
        let snapshot = GraphSnapshot::capture(self.backend.as_ref(), self.timeout).await?;
        let mut lifecycle = Vec::new();
        // Nobody armed: keep signalling readiness so a failed or dropped
        // subscription gets another attempt
        let listening = self.hub.subscriber_count() > 0;

        let mut present = HashSet::new();
        for node in snapshot.nodes().filter(|n| n.kind == NodeKind::Device) {
            present.insert(node.name.clone());
            let signature = DeviceSignature {
                profile: node.profile.clone(),
                ports: node.ports.iter().map(|p| p.name.clone()).collect(),
            };

            match self.devices.get_mut(&node.name) {
                None => {
                    self.devices.insert(
                        node.name.clone(),
                        SeenDevice {
                            first_seen: now,
                            ready: false,
                            signature,
                        },
                    );
                }
                Some(seen) => {
                    if seen.ready && seen.signature != signature {
                        lifecycle.push(GraphEvent::DeviceProfileChanged {
                            name: node.name.clone(),
                        });
                    }
                    seen.signature = signature;
                }
            }

            if let Some(seen) = self.devices.get_mut(&node.name) {
                if !seen.ready {
                    if now.duration_since(seen.first_seen) >= self.debounce {
                        seen.ready = true;
                        lifecycle.push(GraphEvent::DeviceReady {
                            name: node.name.clone(),
                        });
                    }
                } else if !listening {
                    trace!(device = %node.name, "No stream subscribers, re-announcing readiness");
                    lifecycle.push(GraphEvent::DeviceReady {
                        name: node.name.clone(),
                    });
                }
            }
        }

        let gone: Vec<String> = self
            .devices
            .keys()
            .filter(|name| !present.contains(*name))
            .cloned()
            .collect();
        for name in gone {
            if let Some(seen) = self.devices.remove(&name) {
                if seen.ready {
                    lifecycle.push(GraphEvent::DeviceRemoved { name });
                }
            }
        }

        let mut appeared = Vec::new();
        let mut current = HashSet::new();
        for node in snapshot.nodes().filter(|n| n.kind == NodeKind::Stream) {
            current.insert(node.id);
            if self.streams.contains(&node.id) || !self.primed {
                continue;
            }
            let linked = node.ports.iter().any(|p| {
                snapshot
                    .links()
                    .iter()
                    .any(|l| l.source == p.id || l.destination == p.id)
            });
            appeared.push(StreamInfo {
                node: node.id,
                name: node.name.clone(),
                channel_count: node.channel_count,
                linked,
            });
        }
        self.streams = current;
        self.primed = true;

        for event in &lifecycle {
            debug!(?event, "Graph change detected");
            self.hub.publish(event.clone());
        }
        for stream in &appeared {
            debug!(stream = %stream.name, node = %stream.node, "Stream appeared");
            self.hub.announce(stream.clone());
        }

        lifecycle.extend(appeared.into_iter().map(GraphEvent::StreamAppeared));
        Ok(lifecycle)
    }

    /// Poll until `shutdown` resolves
    ///
    /// A failed poll is logged and retried on the next tick.
    pub async fn run<F>(mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_ms = self.interval.as_millis() as u64, "Graph poller running");

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        warn!(error = %e, "Graph poll failed");
                    }
                }
            }
        }
    }
}
