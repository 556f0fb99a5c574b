//! Fan-out over many units
//!
//! Every request becomes one spawned unit. A semaphore bounds how many run at
//! once; the coordinator waits for all of them and returns one outcome per
//! request, in request order.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::cluster::ClusterClient;
use crate::config::ProvisionerConfig;
use crate::models::{BatchSummary, Outcome, OutcomeStatus, ProvisioningRequest};
use crate::progress::Progress;
use crate::provisioner::{Mode, UnitProvisioner};

pub struct FanOutCoordinator {
    provisioner: UnitProvisioner,
    max_concurrency: usize,
    active: Arc<RwLock<HashMap<usize, String>>>,
}

/// Removes a unit from the active set when dropped, even on panic
struct ActiveGuard {
    active: Arc<RwLock<HashMap<usize, String>>>,
    index: usize,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.write().remove(&self.index);
    }
}

impl FanOutCoordinator {
    pub fn new(client: Arc<dyn ClusterClient>, config: ProvisionerConfig) -> Self {
        Self::from_provisioner(UnitProvisioner::new(client, config))
    }

    pub fn from_provisioner(provisioner: UnitProvisioner) -> Self {
        let max_concurrency = provisioner.config().max_concurrency.max(1);
        Self {
            provisioner,
            max_concurrency,
            active: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn with_progress(mut self, progress: Progress) -> Self {
        self.provisioner = self.provisioner.with_progress(progress);
        self
    }

    /// Create every request. Returns exactly one outcome per request.
    pub async fn provision_many(&self, requests: &[ProvisioningRequest], cancel: &CancellationToken) -> Vec<Outcome> {
        self.run(Mode::Provision, requests, cancel).await
    }

    /// Remove every request. Returns exactly one outcome per request.
    pub async fn deprovision_many(&self, requests: &[ProvisioningRequest], cancel: &CancellationToken) -> Vec<Outcome> {
        self.run(Mode::Deprovision, requests, cancel).await
    }

    /// Labels of units currently holding a permit
    pub fn active_units(&self) -> Vec<String> {
        let mut units: Vec<_> = self.active.read().iter().map(|(i, l)| (*i, l.clone())).collect();
        units.sort();
        units.into_iter().map(|(_, label)| label).collect()
    }

    pub fn active_count(&self) -> usize {
        self.active.read().len()
    }

    async fn run(&self, mode: Mode, requests: &[ProvisioningRequest], cancel: &CancellationToken) -> Vec<Outcome> {
        let progress = self.provisioner.progress().clone();
        progress.start(requests.len());
        tracing::info!(mode = %mode, units = requests.len(), max_concurrency = self.max_concurrency, "Starting run");

        let pool = Arc::new(Semaphore::new(self.max_concurrency));
        let mut handles = Vec::with_capacity(requests.len());

        for (index, request) in requests.iter().cloned().enumerate() {
            let sem = pool.clone();
            let provisioner = self.provisioner.clone();
            let cancel = cancel.clone();
            let active = self.active.clone();

            handles.push(tokio::spawn(async move {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = sem.acquire_owned() => permit.ok(),
                };
                let Some(_permit) = permit else {
                    return provisioner.skipped(index, &request);
                };

                active.write().insert(index, request.display_name());
                let _guard = ActiveGuard { active, index };

                match mode {
                    Mode::Provision => provisioner.provision(index, &request, &cancel).await,
                    Mode::Deprovision => provisioner.deprovision(index, &request, &cancel).await,
                }
            }));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (index, handle) in handles.into_iter().enumerate() {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    let unit = requests[index].display_name();
                    tracing::error!(unit = %unit, error = %e, "Unit task aborted");
                    outcomes.push(Outcome::failure(
                        index,
                        unit,
                        OutcomeStatus::Failed,
                        format!("Unit task aborted: {e}"),
                        Vec::new(),
                    ));
                }
            }
        }

        progress.stop();
        let summary = BatchSummary::from_outcomes(&outcomes);
        tracing::info!(
            mode = %mode,
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            timed_out = summary.timed_out,
            cancelled = summary.cancelled,
            "Run finished"
        );
        outcomes
    }
}
