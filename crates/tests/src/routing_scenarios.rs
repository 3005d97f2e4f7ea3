//! Integration tests for the routing engine
//!
//! These drive the event watcher, policy and reconciler together against an
//! in-memory graph, from device readiness to the links left behind.

use patchbay_core::domain::config::{EngineConfig, RoutingConfig};
use patchbay_core::domain::graph::{GraphBackend, NodeId, PortId, PortPair, StreamInfo};
use patchbay_core::domain::policy::{PolicyOutcome, RoutingPolicy};
use patchbay_core::domain::reconciler::{CreateOutcome, Reconciler, RemoveOutcome};
use patchbay_core::domain::resolver::{PortResolver, PortRole, RoleTable};
use patchbay_core::domain::snapshot::GraphSnapshot;
use patchbay_core::domain::watcher::{EventWatcher, WatcherState};
use patchbay_infra::graph::MemoryGraph;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

const DEVICE: &str = "alsa_output.usb-multichannel";
const ALL_PORTS: [&str; 4] = ["Playback_1", "Playback_2", "Playback_3", "Playback_4"];

fn routing(duplicate: bool) -> RoutingConfig {
    RoutingConfig {
        duplicate_to_monitor: duplicate,
        ..RoutingConfig::default()
    }
}

fn watcher(graph: &Arc<MemoryGraph>, config: RoutingConfig) -> EventWatcher {
    EventWatcher::new(graph.clone(), config, &EngineConfig::default())
}

fn stereo(node: NodeId, name: &str) -> StreamInfo {
    StreamInfo {
        node,
        name: name.to_string(),
        channel_count: 2,
        linked: false,
    }
}

fn pair(source: Option<PortId>, destination: Option<PortId>) -> PortPair {
    PortPair::new(source.unwrap(), destination.unwrap())
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

// ============================================================================
// SCENARIOS
// ============================================================================

#[tokio::test]
async fn test_device_absent_creates_nothing() {
    let graph = Arc::new(MemoryGraph::new());
    graph.add_device(DEVICE, &ALL_PORTS);

    let mut watcher = watcher(&graph, routing(false));
    watcher.on_device_ready(DEVICE).await;
    assert_eq!(watcher.state(), WatcherState::Armed);

    // Gone from the graph before the watcher hears about it
    graph.remove_device(DEVICE);

    let node = graph.add_stream("player", 2);
    let report = watcher.on_stream_appeared(stereo(node, "player")).await.unwrap();

    assert_eq!(report.decision.outcome, PolicyOutcome::DeviceNotReady);
    assert!(report.result.created.is_empty());
    assert_eq!(graph.link_count(), 0);
    assert_eq!(watcher.stats().deferred, 1);
}

#[tokio::test]
async fn test_main_ports_only() {
    let graph = Arc::new(MemoryGraph::new());
    let device = graph.add_device(DEVICE, &["Playback_3", "Playback_4"]);

    let mut watcher = watcher(&graph, routing(false));
    watcher.on_device_ready(DEVICE).await;

    let node = graph.add_stream("player", 2);
    let report = watcher.on_stream_appeared(stereo(node, "player")).await.unwrap();

    assert_eq!(report.decision.outcome, PolicyOutcome::Route { duplicated: false });
    assert_eq!(report.result.created_count(), 2);

    let expected: BTreeSet<PortPair> = [
        pair(graph.stream_port(node, 0), graph.port_id(device, "Playback_3")),
        pair(graph.stream_port(node, 1), graph.port_id(device, "Playback_4")),
    ]
    .into_iter()
    .collect();
    assert_eq!(graph.link_pairs(), expected);
}

#[tokio::test]
async fn test_duplicate_to_monitor() {
    let graph = Arc::new(MemoryGraph::new());
    let device = graph.add_device(DEVICE, &ALL_PORTS);

    let mut watcher = watcher(&graph, routing(true));
    watcher.on_device_ready(DEVICE).await;

    let node = graph.add_stream("player", 2);
    let report = watcher.on_stream_appeared(stereo(node, "player")).await.unwrap();

    assert_eq!(report.decision.outcome, PolicyOutcome::Route { duplicated: true });
    assert_eq!(graph.link_count(), 4);

    let links = graph.link_pairs();
    for (channel, port) in [(0, "Playback_1"), (1, "Playback_2"), (0, "Playback_3"), (1, "Playback_4")] {
        assert!(
            links.contains(&pair(graph.stream_port(node, channel), graph.port_id(device, port))),
            "missing link from channel {channel} to {port}"
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_device_flap_between_streams() {
    let graph = Arc::new(MemoryGraph::new());
    let lifecycle = graph.lifecycle();
    let mut watcher = watcher(&graph, routing(false));

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        watcher
            .run(lifecycle, async {
                let _ = stop_rx.await;
            })
            .await;
        watcher
    });

    graph.plug_device(DEVICE, &ALL_PORTS);
    wait_until("first subscription", || graph.subscriber_count() == 1).await;

    let first = graph.spawn_stream("first", 2);
    wait_until("first stream routed", || graph.link_count() == 2).await;

    graph.remove_device(DEVICE);
    wait_until("unsubscribe on removal", || graph.subscriber_count() == 0).await;
    assert_eq!(graph.link_count(), 0);

    graph.plug_device(DEVICE, &ALL_PORTS);
    wait_until("second subscription", || graph.subscriber_count() == 1).await;

    let second = graph.spawn_stream("second", 2);
    wait_until("second stream routed", || graph.link_count() == 2).await;

    stop_tx.send(()).unwrap();
    let watcher = task.await.unwrap();

    assert_eq!(watcher.stats().passes, 2, "one pass per stream while armed");
    assert_eq!(watcher.stats().links_created, 4);
    assert_eq!(watcher.state(), WatcherState::Idle);
    assert_eq!(graph.subscriber_count(), 0);

    let sources: BTreeSet<PortId> = graph.link_pairs().iter().map(|p| p.source).collect();
    assert!(sources.contains(&graph.stream_port(second, 0).unwrap()));
    assert!(!sources.contains(&graph.stream_port(first, 0).unwrap()));
}

// ============================================================================
// RECONCILIATION BEHAVIOUR
// ============================================================================

#[tokio::test]
async fn test_second_pass_is_noop() {
    let graph = Arc::new(MemoryGraph::new());
    graph.add_device(DEVICE, &ALL_PORTS);

    let mut watcher = watcher(&graph, routing(true));
    watcher.on_device_ready(DEVICE).await;

    let node = graph.add_stream("player", 2);
    let first = watcher.on_stream_appeared(stereo(node, "player")).await.unwrap();
    let links_after_first = graph.link_pairs();

    let second = watcher.on_stream_appeared(stereo(node, "player")).await.unwrap();

    assert_eq!(first.result.created_count(), 4);
    assert_eq!(second.result.created_count(), 0);
    assert!(second
        .result
        .created
        .iter()
        .all(|(_, o)| matches!(o, CreateOutcome::AlreadyExisted(_))));
    assert_eq!(graph.link_pairs(), links_after_first);
}

#[tokio::test]
async fn test_default_monitor_links_moved_to_main() {
    let graph = Arc::new(MemoryGraph::new());
    let device = graph.add_device(DEVICE, &ALL_PORTS);

    let mut watcher = watcher(&graph, routing(false));
    watcher.on_device_ready(DEVICE).await;

    // Links a session manager would have made on its own
    let node = graph.add_stream("player", 2);
    for (channel, port) in [(0, "Playback_1"), (1, "Playback_2")] {
        graph
            .connect(
                graph.stream_port(node, channel).unwrap(),
                graph.port_id(device, port).unwrap(),
            )
            .unwrap();
    }

    let report = watcher.on_stream_appeared(stereo(node, "player")).await.unwrap();

    assert_eq!(report.result.removed_count(), 2);
    assert_eq!(report.result.created_count(), 2);

    let expected: BTreeSet<PortPair> = [
        pair(graph.stream_port(node, 0), graph.port_id(device, "Playback_3")),
        pair(graph.stream_port(node, 1), graph.port_id(device, "Playback_4")),
    ]
    .into_iter()
    .collect();
    assert_eq!(graph.link_pairs(), expected);
    assert_eq!(watcher.stats().links_removed, 2);
}

#[tokio::test]
async fn test_failed_creation_does_not_stop_pass() {
    let graph = Arc::new(MemoryGraph::new());
    let device = graph.add_device(DEVICE, &ALL_PORTS);
    graph.reject_links_to(graph.port_id(device, "Playback_4").unwrap());

    let mut watcher = watcher(&graph, routing(false));
    watcher.on_device_ready(DEVICE).await;

    let node = graph.add_stream("player", 2);
    let report = watcher.on_stream_appeared(stereo(node, "player")).await.unwrap();

    assert_eq!(report.result.created_count(), 1);
    assert_eq!(report.result.failures().len(), 1);
    assert_eq!(graph.link_count(), 1);
    assert_eq!(watcher.stats().failures, 1);
    assert_eq!(watcher.state(), WatcherState::Armed, "a failed link does not disarm");
}

#[tokio::test]
async fn test_failed_removal_still_routes_main() {
    let graph = Arc::new(MemoryGraph::new());
    let device = graph.add_device(DEVICE, &ALL_PORTS);

    let mut watcher = watcher(&graph, routing(false));
    watcher.on_device_ready(DEVICE).await;

    let node = graph.add_stream("player", 2);
    graph
        .connect(
            graph.stream_port(node, 0).unwrap(),
            graph.port_id(device, "Playback_1").unwrap(),
        )
        .unwrap();
    graph.reject_destroy(true);

    let report = watcher.on_stream_appeared(stereo(node, "player")).await.unwrap();

    assert!(matches!(report.result.removed[..], [(_, RemoveOutcome::Failed(_))]));
    assert_eq!(report.result.created_count(), 2);
    assert_eq!(graph.link_count(), 3);
}

#[tokio::test]
async fn test_profile_without_main_ports_defers() {
    let graph = Arc::new(MemoryGraph::new());
    graph.add_device(DEVICE, &ALL_PORTS);

    let mut watcher = watcher(&graph, routing(false));
    watcher.on_device_ready(DEVICE).await;

    graph.change_profile(DEVICE, "analog-stereo", &["playback_FL", "playback_FR"]);
    let ports = watcher.on_device_profile_changed(DEVICE).await.unwrap();
    assert!(ports.device_present);
    assert_eq!(ports.missing(&PortRole::MAIN).len(), 2);

    let node = graph.add_stream("player", 2);
    let report = watcher.on_stream_appeared(stereo(node, "player")).await.unwrap();

    assert!(matches!(
        report.decision.outcome,
        PolicyOutcome::TargetPortsUnavailable { .. }
    ));
    assert_eq!(graph.link_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_passes_create_each_link_once() {
    let graph = Arc::new(MemoryGraph::new());
    graph.add_device(DEVICE, &ALL_PORTS);
    let node = graph.add_stream("player", 2);

    let config = routing(false);
    let snapshot = GraphSnapshot::capture(graph.as_ref(), Duration::from_secs(1))
        .await
        .unwrap();
    let ports = PortResolver::resolve_roles(&snapshot, DEVICE, &RoleTable::from(&config));
    let decision = RoutingPolicy::decide(&snapshot.stream_descriptor(&stereo(node, "player")), &ports, &config);

    let backend: Arc<dyn GraphBackend> = graph.clone();
    let reconciler = Reconciler::new(backend, Duration::from_secs(1));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let reconciler = reconciler.clone();
        let decision = decision.clone();
        tasks.push(tokio::spawn(async move { reconciler.apply(&decision).await }));
    }

    let mut created = 0;
    for task in tasks {
        let result = task.await.unwrap().unwrap();
        assert!(result.is_clean());
        created += result.created_count();
    }

    assert_eq!(created, 2);
    assert_eq!(graph.link_count(), 2);
}

#[tokio::test]
async fn test_other_device_streams_untouched() {
    let graph = Arc::new(MemoryGraph::new());
    graph.add_device("alsa_output.pci-analog", &["playback_FL", "playback_FR"]);

    let mut watcher = watcher(&graph, routing(false));
    watcher.on_device_ready("alsa_output.pci-analog").await;
    assert_eq!(watcher.state(), WatcherState::Idle);

    let node = graph.add_stream("player", 2);
    assert!(watcher.on_stream_appeared(stereo(node, "player")).await.is_none());
    assert_eq!(graph.subscriber_count(), 0);
}
