//! Link reconciliation
//!
//! Applies a [`Decision`] against the live graph. Every operation re-checks
//! the graph first, so applying the same decision twice is a no-op the
//! second time. Passes targeting the same device are serialized, and a
//! collaborator timeout ends the pass.

use crate::domain::graph::{bounded, GraphBackend, GraphError, LinkId, PortPair, Result};
use crate::domain::policy::Decision;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, instrument, warn};

/// Result of one link creation request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(LinkId),
    AlreadyExisted(LinkId),
    Failed(String),
}

/// Result of one link removal request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    NotFound,
    Failed(String),
}

/// Per-link record of a reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileResult {
    pub created: Vec<(PortPair, CreateOutcome)>,
    pub removed: Vec<(PortPair, RemoveOutcome)>,
}

impl ReconcileResult {
    /// Links newly created by this pass
    pub fn created_count(&self) -> usize {
        self.created
            .iter()
            .filter(|(_, o)| matches!(o, CreateOutcome::Created(_)))
            .count()
    }

    /// Links actually destroyed by this pass
    pub fn removed_count(&self) -> usize {
        self.removed
            .iter()
            .filter(|(_, o)| matches!(o, RemoveOutcome::Removed))
            .count()
    }

    /// Every failed operation with its reason
    pub fn failures(&self) -> Vec<(PortPair, &str)> {
        let created = self.created.iter().filter_map(|(pair, o)| match o {
            CreateOutcome::Failed(reason) => Some((*pair, reason.as_str())),
            _ => None,
        });
        let removed = self.removed.iter().filter_map(|(pair, o)| match o {
            RemoveOutcome::Failed(reason) => Some((*pair, reason.as_str())),
            _ => None,
        });
        removed.chain(created).collect()
    }

    pub fn is_clean(&self) -> bool {
        self.failures().is_empty()
    }
}

/// Per-device mutual exclusion for graph mutations
#[derive(Debug, Default)]
pub struct DeviceLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl DeviceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `device`
    pub async fn lock(&self, device: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks
                .entry(device.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// Applies routing decisions to the graph collaborator
#[derive(Clone)]
pub struct Reconciler {
    backend: Arc<dyn GraphBackend>,
    operation_timeout: Duration,
    locks: Arc<DeviceLocks>,
}

impl Reconciler {
    pub fn new(backend: Arc<dyn GraphBackend>, operation_timeout: Duration) -> Self {
        Self {
            backend,
            operation_timeout,
            locks: Arc::new(DeviceLocks::new()),
        }
    }

    /// Make the graph match `decision`
    ///
    /// Removals run first, then creations. A rejected operation is recorded
    /// as failed and the pass continues. A timed-out operation abandons the
    /// pass: the timeout is returned and the remaining links are not tried.
    #[instrument(skip(self, decision), fields(device = %decision.device, stream = %decision.stream))]
    pub async fn apply(&self, decision: &Decision) -> Result<ReconcileResult> {
        let mut result = ReconcileResult::default();
        if decision.is_empty() {
            return Ok(result);
        }

        let _guard = self.locks.lock(&decision.device).await;

        for pair in &decision.links_to_remove {
            match self.remove(*pair).await {
                Ok(outcome) => result.removed.push((*pair, outcome)),
                Err(e) => return Err(abandon(e, &result)),
            }
        }

        for pair in &decision.links_to_create {
            match self.create(*pair).await {
                Ok(outcome) => result.created.push((*pair, outcome)),
                Err(e) => return Err(abandon(e, &result)),
            }
        }

        debug!(
            created = result.created_count(),
            removed = result.removed_count(),
            failed = result.failures().len(),
            "Reconciliation pass finished"
        );
        Ok(result)
    }

    async fn create(&self, pair: PortPair) -> Result<CreateOutcome> {
        let limit = self.operation_timeout;

        let existing = match bounded("find_link", limit, self.backend.find_link(pair.source, pair.destination)).await {
            Ok(existing) => existing,
            Err(e @ GraphError::Timeout(_)) => return Err(e),
            Err(e) => {
                warn!(link = %pair, error = %e, "Link lookup failed");
                return Ok(CreateOutcome::Failed(e.to_string()));
            }
        };

        if let Some(link) = existing {
            debug!(link = %pair, id = %link.id, "Link already exists");
            return Ok(CreateOutcome::AlreadyExisted(link.id));
        }

        match bounded("create_link", limit, self.backend.create_link(pair.source, pair.destination)).await {
            Ok(link) => {
                info!(link = %pair, id = %link.id, "Link created");
                Ok(CreateOutcome::Created(link.id))
            }
            Err(e @ GraphError::Timeout(_)) => Err(e),
            Err(e) => {
                warn!(link = %pair, error = %e, "Link creation failed");
                Ok(CreateOutcome::Failed(e.to_string()))
            }
        }
    }

    async fn remove(&self, pair: PortPair) -> Result<RemoveOutcome> {
        let limit = self.operation_timeout;

        let link = match bounded("find_link", limit, self.backend.find_link(pair.source, pair.destination)).await {
            Ok(Some(link)) => link,
            Ok(None) => {
                debug!(link = %pair, "Link already gone");
                return Ok(RemoveOutcome::NotFound);
            }
            Err(e @ GraphError::Timeout(_)) => return Err(e),
            Err(e) => {
                warn!(link = %pair, error = %e, "Link lookup failed");
                return Ok(RemoveOutcome::Failed(e.to_string()));
            }
        };

        match bounded("destroy_link", limit, self.backend.destroy_link(&link)).await {
            Ok(()) => {
                info!(link = %pair, id = %link.id, "Link removed");
                Ok(RemoveOutcome::Removed)
            }
            Err(e @ GraphError::Timeout(_)) => Err(e),
            Err(e) => {
                warn!(link = %pair, error = %e, "Link removal failed");
                Ok(RemoveOutcome::Failed(e.to_string()))
            }
        }
    }
}

fn abandon(error: GraphError, done: &ReconcileResult) -> GraphError {
    warn!(
        error = %error,
        created = done.created_count(),
        removed = done.removed_count(),
        "Collaborator timed out, abandoning pass"
    );
    error
}
