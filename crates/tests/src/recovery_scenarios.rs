//! Recovery from a misbehaving collaborator
//!
//! The graph lives in a `MemoryGraph`; subscriptions go through an
//! `EventHub` fed by a `GraphPoller`, the same wiring the daemon uses.

use patchbay_core::domain::config::{EngineConfig, RoutingConfig};
use patchbay_core::domain::graph::{
    GraphBackend, GraphError, GraphEvent, Link, Node, NodeId, ObjectFilter, Port, PortId, Result,
    StreamInfo, StreamSubscription, SubscriptionHandle,
};
use patchbay_core::domain::watcher::{EventWatcher, WatcherState};
use patchbay_infra::graph::{EventHub, GraphPoller, MemoryGraph};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

const DEVICE: &str = "alsa_output.usb-multichannel";
const ALL_PORTS: [&str; 4] = ["Playback_1", "Playback_2", "Playback_3", "Playback_4"];

/// Collaborator that can refuse subscriptions and stall link lookups
struct Unreliable {
    graph: Arc<MemoryGraph>,
    hub: Arc<EventHub>,
    refusals: AtomicU32,
    stall_lookups: AtomicBool,
    lookups: AtomicUsize,
}

impl Unreliable {
    fn new(graph: Arc<MemoryGraph>, hub: Arc<EventHub>, refusals: u32) -> Self {
        Self {
            graph,
            hub,
            refusals: AtomicU32::new(refusals),
            stall_lookups: AtomicBool::new(false),
            lookups: AtomicUsize::new(0),
        }
    }
}

#[async_trait::async_trait]
impl GraphBackend for Unreliable {
    async fn get_objects(&self, filter: &ObjectFilter) -> Result<Vec<Node>> {
        self.graph.get_objects(filter).await
    }

    async fn port_by_name(&self, node: NodeId, name: &str) -> Result<Option<Port>> {
        self.graph.port_by_name(node, name).await
    }

    async fn links(&self) -> Result<Vec<Link>> {
        self.graph.links().await
    }

    async fn snapshot(&self) -> Result<(Vec<Node>, Vec<Link>)> {
        self.graph.snapshot().await
    }

    async fn find_link(&self, source: PortId, destination: PortId) -> Result<Option<Link>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.stall_lookups.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.graph.find_link(source, destination).await
    }

    async fn create_link(&self, source: PortId, destination: PortId) -> Result<Link> {
        self.graph.create_link(source, destination).await
    }

    async fn destroy_link(&self, link: &Link) -> Result<()> {
        self.graph.destroy_link(link).await
    }

    async fn subscribe_lifecycle(&self) -> Result<broadcast::Receiver<GraphEvent>> {
        Ok(self.hub.lifecycle())
    }

    async fn subscribe_streams(&self) -> Result<StreamSubscription> {
        let refused = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(GraphError::Subscription("registry busy".to_string()));
        }
        Ok(self.hub.subscribe())
    }

    async fn unsubscribe_streams(&self, handle: SubscriptionHandle) -> Result<()> {
        self.hub.unsubscribe(handle)
    }
}

struct Rig {
    graph: Arc<MemoryGraph>,
    hub: Arc<EventHub>,
    backend: Arc<Unreliable>,
    poller: GraphPoller,
    watcher: EventWatcher,
}

fn rig(refusals: u32, operation_timeout_ms: u64) -> Rig {
    let graph = Arc::new(MemoryGraph::new());
    let hub = Arc::new(EventHub::new());
    let backend = Arc::new(Unreliable::new(graph.clone(), hub.clone(), refusals));
    let engine = EngineConfig {
        operation_timeout_ms,
        rediscovery_debounce_ms: 0,
        ..EngineConfig::default()
    };
    let poller = GraphPoller::new(backend.clone(), hub.clone(), &engine);
    let watcher = EventWatcher::new(backend.clone(), RoutingConfig::default(), &engine);
    Rig {
        graph,
        hub,
        backend,
        poller,
        watcher,
    }
}

impl Rig {
    /// One poller tick, with every resulting event handed to the watcher
    async fn tick(&mut self) -> Vec<GraphEvent> {
        let events = self.poller.poll_once().await.unwrap();
        for event in events.iter().cloned() {
            self.watcher.handle(event).await;
        }
        events
    }
}

fn stereo(node: NodeId) -> StreamInfo {
    StreamInfo {
        node,
        name: "player".to_string(),
        channel_count: 2,
        linked: false,
    }
}

#[tokio::test]
async fn test_refused_subscription_recovers_on_next_poll() {
    let mut rig = rig(1, 2000);
    rig.graph.add_device(DEVICE, &ALL_PORTS);

    rig.tick().await;
    assert_eq!(rig.watcher.state(), WatcherState::Idle);
    assert_eq!(rig.hub.subscriber_count(), 0);

    let events = rig.tick().await;
    assert!(events.contains(&GraphEvent::DeviceReady {
        name: DEVICE.to_string()
    }));
    assert_eq!(rig.watcher.state(), WatcherState::Armed);
    assert_eq!(rig.hub.subscriber_count(), 1);

    let events = rig.tick().await;
    assert!(events.is_empty(), "armed watcher, readiness not repeated");

    rig.graph.add_stream("player", 2);
    rig.tick().await;

    assert_eq!(rig.graph.link_count(), 2);
    assert_eq!(rig.watcher.stats().passes, 1);
    assert_eq!(rig.watcher.stats().links_created, 2);
}

#[tokio::test]
async fn test_repeated_refusals_keep_retrying() {
    let mut rig = rig(3, 2000);
    rig.graph.add_device(DEVICE, &ALL_PORTS);

    for _ in 0..3 {
        rig.tick().await;
        assert_eq!(rig.watcher.state(), WatcherState::Idle);
    }

    rig.tick().await;
    assert_eq!(rig.watcher.state(), WatcherState::Armed);
}

#[tokio::test]
async fn test_timeout_abandons_pass_then_next_stream_routes() {
    let mut rig = rig(0, 100);
    rig.graph.add_device(DEVICE, &ALL_PORTS);
    rig.watcher.on_device_ready(DEVICE).await;

    rig.backend.stall_lookups.store(true, Ordering::SeqCst);
    let node = rig.graph.add_stream("player", 2);

    let started = Instant::now();
    assert!(rig.watcher.on_stream_appeared(stereo(node)).await.is_none());

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(rig.backend.lookups.load(Ordering::SeqCst), 1);
    assert_eq!(rig.graph.link_count(), 0);
    assert_eq!(rig.watcher.stats().passes, 1);
    assert_eq!(rig.watcher.stats().failures, 1);
    assert_eq!(rig.watcher.state(), WatcherState::Armed);

    rig.backend.stall_lookups.store(false, Ordering::SeqCst);
    let report = rig.watcher.on_stream_appeared(stereo(node)).await.unwrap();

    assert_eq!(report.result.created_count(), 2);
    assert_eq!(rig.graph.link_count(), 2);
}
