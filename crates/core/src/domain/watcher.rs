//! Event watcher: the engine's steady-state loop
//!
//! State machine:
//! ```text
//! Idle --device ready--> Armed --device removed--> Idle
//!                          |
//!                          +-- stream appeared: snapshot -> resolve -> decide -> apply
//! ```
//! Streams that appear while the device is absent are never routed
//! retroactively.

use crate::domain::config::{EngineConfig, RoutingConfig};
use crate::domain::graph::{
    bounded, GraphBackend, GraphError, GraphEvent, StreamInfo, StreamSubscription,
};
use crate::domain::policy::{Decision, PolicyOutcome, RoutingPolicy};
use crate::domain::reconciler::{ReconcileResult, Reconciler};
use crate::domain::resolver::{DevicePorts, PortResolver, PortRole, RoleTable};
use crate::domain::snapshot::GraphSnapshot;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    /// Target device not ready
    Idle,
    /// Device ready, listening for new streams
    Armed,
}

/// Counters of what the watcher has done so far
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatcherStats {
    /// Full reconciliation passes started
    pub passes: u64,
    pub links_created: u64,
    pub links_removed: u64,
    /// Failed link operations and abandoned passes
    pub failures: u64,
    /// Passes that ended without touching the graph (device or ports unavailable)
    pub deferred: u64,
}

/// Decision and outcome of one reconciliation pass
#[derive(Debug, Clone)]
pub struct PassReport {
    pub decision: Decision,
    pub result: ReconcileResult,
}

pub struct EventWatcher {
    backend: Arc<dyn GraphBackend>,
    config: RoutingConfig,
    roles: RoleTable,
    reconciler: Reconciler,
    operation_timeout: Duration,
    state: WatcherState,
    subscription: Option<StreamSubscription>,
    stats: WatcherStats,
}

impl EventWatcher {
    pub fn new(backend: Arc<dyn GraphBackend>, config: RoutingConfig, engine: &EngineConfig) -> Self {
        let reconciler = Reconciler::new(backend.clone(), engine.operation_timeout());
        Self::with_reconciler(backend, config, engine, reconciler)
    }

    /// Share a reconciler (and its per-device locks) with other watchers
    pub fn with_reconciler(
        backend: Arc<dyn GraphBackend>,
        config: RoutingConfig,
        engine: &EngineConfig,
        reconciler: Reconciler,
    ) -> Self {
        Self {
            roles: RoleTable::from(&config),
            backend,
            config,
            reconciler,
            operation_timeout: engine.operation_timeout(),
            state: WatcherState::Idle,
            subscription: None,
            stats: WatcherStats::default(),
        }
    }

    pub fn state(&self) -> WatcherState {
        self.state
    }

    pub fn stats(&self) -> &WatcherStats {
        &self.stats
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_some()
    }

    fn is_target(&self, name: &str) -> bool {
        name == self.config.target_device_name
    }

    /// Dispatch one collaborator notification
    pub async fn handle(&mut self, event: GraphEvent) {
        match event {
            GraphEvent::DeviceReady { name } => self.on_device_ready(&name).await,
            GraphEvent::DeviceRemoved { name } => self.on_device_removed(&name).await,
            GraphEvent::DeviceProfileChanged { name } => {
                self.on_device_profile_changed(&name).await;
            }
            GraphEvent::StreamAppeared(stream) => {
                self.on_stream_appeared(stream).await;
            }
        }
    }

    /// Arm on the target device; repeated readiness while armed is a no-op
    #[instrument(skip(self))]
    pub async fn on_device_ready(&mut self, name: &str) {
        if !self.is_target(name) {
            debug!("Ignoring readiness of non-target device");
            return;
        }

        if self.subscription.is_some() {
            debug!("Already armed, ignoring repeated readiness");
            return;
        }

        match bounded("subscribe_streams", self.operation_timeout, self.backend.subscribe_streams()).await {
            Ok(subscription) => {
                info!(handle = subscription.handle.0, "Target device ready, watching for streams");
                self.subscription = Some(subscription);
                self.state = WatcherState::Armed;
            }
            Err(e) => {
                error!(error = %e, "Failed to subscribe to stream events, idle until the next readiness signal");
                self.state = WatcherState::Idle;
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn on_device_removed(&mut self, name: &str) {
        if !self.is_target(name) {
            return;
        }
        if self.state == WatcherState::Idle {
            debug!("Removal of a device we were not armed on");
            return;
        }

        info!("Target device removed, going idle");
        self.disarm().await;
    }

    /// Re-resolve the role table after the device changed its profile
    ///
    /// Only logs what the new profile exposes; streams already present are
    /// not re-routed.
    #[instrument(skip(self))]
    pub async fn on_device_profile_changed(&mut self, name: &str) -> Option<DevicePorts> {
        if !self.is_target(name) || self.state == WatcherState::Idle {
            return None;
        }

        let snapshot = match GraphSnapshot::capture(self.backend.as_ref(), self.operation_timeout).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "Could not capture graph after profile change");
                return None;
            }
        };

        let ports = PortResolver::resolve_roles(&snapshot, name, &self.roles);
        for role in PortRole::ALL {
            match ports.get(role) {
                Some(port) => debug!(role = %role, port = %port, "Role resolved"),
                None => debug!(role = %role, "Role not exposed"),
            }
        }

        let missing = ports.missing(&PortRole::MAIN);
        if missing.is_empty() {
            info!("Profile changed, main ports available");
        } else {
            warn!(missing = ?missing, "Profile changed, target ports unavailable");
        }

        Some(ports)
    }

    /// Route a freshly announced stream
    ///
    /// Runs one full pass when armed and the stream is stereo and unlinked.
    /// A pass that times out is abandoned and counted as a failure; the next
    /// stream event starts afresh.
    #[instrument(skip(self, stream), fields(stream = %stream.name, node = %stream.node))]
    pub async fn on_stream_appeared(&mut self, stream: StreamInfo) -> Option<PassReport> {
        if self.state != WatcherState::Armed {
            debug!("Device not ready, ignoring stream");
            return None;
        }
        if stream.channel_count != 2 || stream.linked {
            debug!(
                channels = stream.channel_count,
                linked = stream.linked,
                "Stream not eligible for routing"
            );
            return None;
        }

        self.stats.passes += 1;
        match self.run_pass(&stream).await {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(error = %e, "Reconciliation pass abandoned");
                self.stats.failures += 1;
                None
            }
        }
    }

    async fn run_pass(&mut self, stream: &StreamInfo) -> Result<PassReport, GraphError> {
        let snapshot = GraphSnapshot::capture(self.backend.as_ref(), self.operation_timeout).await?;
        let descriptor = snapshot.stream_descriptor(stream);
        let ports = PortResolver::resolve_roles(&snapshot, &self.config.target_device_name, &self.roles);

        let decision = RoutingPolicy::decide(&descriptor, &ports, &self.config);
        if matches!(
            decision.outcome,
            PolicyOutcome::DeviceNotReady | PolicyOutcome::TargetPortsUnavailable { .. }
        ) {
            self.stats.deferred += 1;
        }

        let result = self.reconciler.apply(&decision).await?;
        self.stats.links_created += result.created_count() as u64;
        self.stats.links_removed += result.removed_count() as u64;
        self.stats.failures += result.failures().len() as u64;

        Ok(PassReport { decision, result })
    }

    /// Drop the stream subscription and go idle
    async fn disarm(&mut self) {
        self.state = WatcherState::Idle;
        let Some(subscription) = self.subscription.take() else {
            return;
        };

        let handle = subscription.handle;
        drop(subscription);
        if let Err(e) = bounded(
            "unsubscribe_streams",
            self.operation_timeout,
            self.backend.unsubscribe_streams(handle),
        )
        .await
        {
            warn!(handle = handle.0, error = %e, "Failed to unsubscribe from stream events");
        }
    }

    /// Process lifecycle and stream events until `shutdown` resolves
    /// or the lifecycle channel closes
    pub async fn run<F>(&mut self, mut lifecycle: broadcast::Receiver<GraphEvent>, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(device = %self.config.target_device_name, "Event watcher running");

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                event = lifecycle.recv() => match event {
                    Ok(event) => self.handle(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Lifecycle events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Lifecycle channel closed");
                        break;
                    }
                },
                stream = next_stream(&mut self.subscription) => match stream {
                    Some(stream) => {
                        self.on_stream_appeared(stream).await;
                    }
                    None => {
                        error!("Stream subscription closed by collaborator, going idle");
                        self.disarm().await;
                    }
                },
            }
        }

        self.disarm().await;
    }
}

async fn next_stream(subscription: &mut Option<StreamSubscription>) -> Option<StreamInfo> {
    match subscription {
        Some(subscription) => subscription.events.recv().await,
        None => std::future::pending().await,
    }
}
