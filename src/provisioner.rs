//! Per-request provisioning unit
//!
//! A unit turns one [`ProvisioningRequest`] into an ordered [`Plan`] of cluster
//! mutations and runs it to a single [`Outcome`]:
//!
//! ```text
//! creation:  Pending -> CreatingPrimary -> AwaitingPrimaryReady -> CreatingDependents -> Done
//! deletion:  Pending -> Deleting -> AwaitingGone -> Done
//! ```
//!
//! Any error ends the unit in `Failed` and no later step runs. With
//! [`RollbackPolicy::BestEffort`] a failed creation unit passes through
//! `RollingBack` first and deletes what it created, newest first.

use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::cluster::ClusterClient;
use crate::config::{PollPolicy, ProvisionerConfig, RollbackPolicy};
use crate::definitions;
use crate::models::*;
use crate::poller::ReadinessCheck;
use crate::progress::{Progress, UnitId};
use crate::tenant;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Provision,
    Deprovision,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Provision => write!(f, "provision"),
            Mode::Deprovision => write!(f, "deprovision"),
        }
    }
}

/// One entry of a plan
#[derive(Debug, Clone)]
enum Task {
    /// Read an object that must already exist, changing nothing
    Require(ResourceRef),
    /// Create an object, optionally waiting for it to reach a phase
    Create {
        resource: Resource,
        ready: Option<(Phase, PollPolicy)>,
    },
    Grant {
        tenant: String,
        target: String,
        kind: TargetKind,
    },
    /// Delete every tenant-target namespace granted on the tenant's record
    DeleteTargets {
        tenant: String,
    },
    Delete(ResourceRef),
    AwaitGone(ResourceRef),
    Revoke {
        tenant: String,
        target: String,
    },
}

impl Task {
    fn resource(&self) -> ResourceRef {
        match self {
            Task::Create { resource, .. } => resource.reference(),
            Task::Grant { tenant, .. } | Task::Revoke { tenant, .. } | Task::DeleteTargets { tenant } => {
                tenant::identity_ref(tenant)
            }
            Task::Require(target) | Task::Delete(target) | Task::AwaitGone(target) => target.clone(),
        }
    }

    fn step(&self) -> Option<Step> {
        let action = match self {
            Task::Create { .. } => StepAction::Create,
            Task::Grant { .. } | Task::Revoke { .. } => StepAction::Update,
            Task::Delete(_) => StepAction::Delete,
            Task::Require(_) | Task::DeleteTargets { .. } | Task::AwaitGone(_) => return None,
        };
        Some(Step::new(action, self.resource()))
    }
}

/// Ordered work for one unit. Built entirely before the first cluster call,
/// so every builder error surfaces as a validation failure.
#[derive(Debug, Clone)]
pub struct Plan {
    mode: Mode,
    tasks: Vec<Task>,
}

impl Plan {
    pub fn for_creation(request: &ProvisioningRequest, config: &ProvisionerConfig) -> Result<Self> {
        request.validate()?;

        let ns = request.namespace_name();
        let params = &request.params;
        let create = |resource: Resource| Task::Create { resource, ready: None };
        let active = Some((Phase::Active, config.namespace_poll));

        let tasks = match request.kind {
            RequestKind::TenantTarget => {
                let tenant = request.parent.clone().unwrap_or_default();
                let limits = params.limits.parse()?;
                vec![
                    Task::Require(tenant::identity_ref(&tenant)),
                    Task::Create {
                        resource: definitions::new_tenant_namespace(&tenant, &request.name, params.target_kind),
                        ready: active,
                    },
                    create(definitions::new_resource_quota(&ns, &limits)?),
                    create(definitions::new_role(&ns)),
                    create(definitions::new_limit_range(&ns, &limits)?),
                    create(definitions::new_network_policy(&ns, &tenant)),
                    create(definitions::new_tenant_role_binding(&ns, &tenant)),
                    Task::Grant {
                        tenant,
                        target: request.name.clone(),
                        kind: params.target_kind,
                    },
                ]
            }
            RequestKind::Namespace => {
                let limits = params.limits.parse()?;
                let mut tasks = vec![
                    Task::Create {
                        resource: definitions::new_namespace(&ns),
                        ready: active,
                    },
                    create(definitions::new_resource_quota(&ns, &limits)?),
                    create(definitions::new_role(&ns)),
                ];
                for user in &params.users {
                    tasks.push(create(definitions::new_service_account(user, &ns)));
                    tasks.push(create(definitions::new_user_role_binding(user, &ns)));
                }
                tasks
            }
            RequestKind::Pod => {
                let limits = params.limits.parse()?;
                vec![Task::Create {
                    resource: definitions::new_pod(&request.name, &ns, params, &limits)?,
                    ready: Some((Phase::Running, config.pod_poll)),
                }]
            }
            RequestKind::Secret => {
                let secret = match (&params.docker_config, &params.secret_data) {
                    (Some(docker), _) => definitions::new_deployment_secret(&ns, &request.name, docker)?,
                    (None, Some(data)) => definitions::new_secret(&ns, &request.name, data),
                    (None, None) => {
                        return Err(Error::validation(format!("secret {} has no data", request.name)))
                    }
                };
                vec![create(secret)]
            }
            RequestKind::User => vec![
                create(definitions::new_service_account(&request.name, &ns)),
                create(definitions::new_user_role_binding(&request.name, &ns)),
            ],
            RequestKind::Tenant => vec![
                create(definitions::new_tenant_user(&request.name)),
                create(definitions::new_tenant_default_role(&request.name)),
                create(definitions::new_tenant_default_role_binding(&request.name)),
            ],
        };

        Ok(Self {
            mode: Mode::Provision,
            tasks,
        })
    }

    pub fn for_deletion(request: &ProvisioningRequest) -> Result<Self> {
        request.validate_reference()?;

        let ns = request.namespace_name();
        let name = request.name.as_str();
        let primary = match request.kind {
            RequestKind::TenantTarget | RequestKind::Namespace => ResourceRef::cluster(ResourceKind::Namespace, &ns),
            RequestKind::Pod => ResourceRef::namespaced(ResourceKind::Pod, &ns, name),
            RequestKind::Secret => ResourceRef::namespaced(ResourceKind::Secret, &ns, name),
            RequestKind::User => ResourceRef::namespaced(ResourceKind::ServiceAccount, &ns, name),
            RequestKind::Tenant => tenant::identity_ref(name),
        };

        let mut tasks = Vec::new();
        if request.kind == RequestKind::Tenant {
            tasks.push(Task::DeleteTargets { tenant: name.to_string() });
        }
        tasks.push(Task::Delete(primary.clone()));
        match request.kind {
            RequestKind::User => tasks.push(Task::Delete(ResourceRef::namespaced(
                ResourceKind::RoleBinding,
                &ns,
                definitions::user_role_binding_name(name, &ns),
            ))),
            RequestKind::Tenant => {
                tasks.push(Task::Delete(definitions::new_tenant_default_role(name).reference()));
                tasks.push(Task::Delete(definitions::new_tenant_default_role_binding(name).reference()));
            }
            _ => {}
        }
        tasks.push(Task::AwaitGone(primary));

        if request.kind == RequestKind::TenantTarget {
            tasks.push(Task::Revoke {
                tenant: request.parent.clone().unwrap_or_default(),
                target: name.to_string(),
            });
        }

        Ok(Self {
            mode: Mode::Deprovision,
            tasks,
        })
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Mutations this plan will issue, in order. A tenant deletion also
    /// removes the tenant-target namespaces found on its record at run time.
    pub fn steps(&self) -> Vec<Step> {
        self.tasks.iter().filter_map(Task::step).collect()
    }
}

/// How to undo a completed creation step
#[derive(Debug, Clone)]
enum Undo {
    Delete(ResourceRef),
    Revoke {
        tenant: String,
        target: String,
    },
}

/// Mutable state of one running unit
struct Unit<'a> {
    id: UnitId,
    index: usize,
    state: UnitState,
    total_steps: usize,
    completed: Vec<Step>,
    undo: Vec<Undo>,
    progress: &'a Progress,
}

impl<'a> Unit<'a> {
    fn new(index: usize, label: String, progress: &'a Progress) -> Self {
        Self {
            id: UnitId::new(label),
            index,
            state: UnitState::Pending,
            total_steps: 0,
            completed: Vec::new(),
            undo: Vec::new(),
            progress,
        }
    }

    fn enter(&mut self, next: UnitState) {
        debug_assert!(!self.state.is_terminal(), "unit {} already finished", self.id);
        if self.state != next {
            tracing::debug!(unit = %self.id, from = %self.state, to = %next, "State change");
            self.state = next;
        }
    }

    fn complete(&mut self, step: Step, undo: Option<Undo>) {
        tracing::debug!(unit = %self.id, step = %step, "Step completed");
        self.completed.push(step);
        self.undo.extend(undo);
        self.progress.advance(&self.id, self.completed.len(), self.total_steps);
    }

    fn finish(mut self, result: Result<()>, rolled_back: Vec<ResourceRef>) -> Outcome {
        let label = self.id.label.clone();
        match result {
            Ok(()) => {
                self.enter(UnitState::Done);
                tracing::info!(unit = %self.id, steps = self.completed.len(), "Unit done");
                self.progress.done(&self.id);
                Outcome::success(self.index, label, self.completed)
            }
            Err(e) => {
                self.enter(UnitState::Failed);
                let status = match &e {
                    Error::ReadinessTimeout { .. } => OutcomeStatus::TimedOut,
                    Error::Cancelled(_) => OutcomeStatus::Cancelled,
                    _ => OutcomeStatus::Failed,
                };
                tracing::error!(unit = %self.id, status = %status, error = %e, "Unit failed");
                let message = e.to_string();
                self.progress.fail(&self.id, &message);
                let mut outcome = Outcome::failure(self.index, label, status, message, self.completed);
                outcome.rolled_back = rolled_back;
                outcome
            }
        }
    }
}

/// Runs single units against a cluster
#[derive(Clone)]
pub struct UnitProvisioner {
    client: Arc<dyn ClusterClient>,
    config: Arc<ProvisionerConfig>,
    progress: Progress,
}

impl UnitProvisioner {
    pub fn new(client: Arc<dyn ClusterClient>, config: ProvisionerConfig) -> Self {
        Self {
            client,
            config: Arc::new(config),
            progress: Progress::noop(),
        }
    }

    pub fn with_progress(mut self, progress: Progress) -> Self {
        self.progress = progress;
        self
    }

    pub fn config(&self) -> &ProvisionerConfig {
        &self.config
    }

    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    /// Create everything `request` describes
    pub async fn provision(&self, index: usize, request: &ProvisioningRequest, cancel: &CancellationToken) -> Outcome {
        let plan = Plan::for_creation(request, &self.config);
        self.execute(index, request, plan, cancel).await
    }

    /// Remove everything `request` describes and wait until it is gone
    pub async fn deprovision(&self, index: usize, request: &ProvisioningRequest, cancel: &CancellationToken) -> Outcome {
        let plan = Plan::for_deletion(request);
        self.execute(index, request, plan, cancel).await
    }

    /// Outcome for a unit that never started because the run was cancelled
    pub fn skipped(&self, index: usize, request: &ProvisioningRequest) -> Outcome {
        let unit = UnitId::new(request.display_name());
        tracing::info!(unit = %unit, "Unit cancelled before start");
        self.progress.fail(&unit, "cancelled before start");
        Outcome::failure(
            index,
            unit.label,
            OutcomeStatus::Cancelled,
            "Cancelled before start",
            Vec::new(),
        )
    }

    async fn execute(
        &self,
        index: usize,
        request: &ProvisioningRequest,
        plan: Result<Plan>,
        cancel: &CancellationToken,
    ) -> Outcome {
        let mut unit = Unit::new(index, request.display_name(), &self.progress);

        let plan = match plan {
            Ok(plan) => plan,
            Err(e) => {
                self.progress.advance(&unit.id, 0, 0);
                return unit.finish(Err(e), Vec::new());
            }
        };

        let mode = plan.mode;
        unit.total_steps = plan.steps().len();
        self.progress.advance(&unit.id, 0, unit.total_steps);
        tracing::info!(unit = %unit.id, id = %unit.id.id, mode = %mode, steps = unit.total_steps, "Unit started");

        let result = self.run(&mut unit, plan, cancel).await;

        let rolled_back = match (&result, mode, self.config.rollback) {
            (Err(_), Mode::Provision, RollbackPolicy::BestEffort) if !unit.undo.is_empty() => {
                self.roll_back(&mut unit, cancel).await
            }
            _ => Vec::new(),
        };
        unit.finish(result, rolled_back)
    }

    async fn run(&self, unit: &mut Unit<'_>, plan: Plan, cancel: &CancellationToken) -> Result<()> {
        let client = self.client.as_ref();
        let retries = self.config.conflict_retries;

        for task in plan.tasks {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled(task.resource()));
            }

            match task {
                Task::Require(target) => {
                    tracing::debug!(unit = %unit.id, resource = %target, "Checking prerequisite");
                    client.get(&target).await?;
                }
                Task::Create { resource, ready } => {
                    unit.enter(if unit.completed.is_empty() {
                        UnitState::CreatingPrimary
                    } else {
                        UnitState::CreatingDependents
                    });
                    let target = resource.reference();
                    tracing::debug!(unit = %unit.id, resource = %target, "Creating");
                    client.create(resource).await?;
                    unit.complete(Step::new(StepAction::Create, target.clone()), Some(Undo::Delete(target.clone())));

                    if let Some((phase, policy)) = ready {
                        unit.enter(UnitState::AwaitingPrimaryReady);
                        ReadinessCheck::phase(target, phase, policy).wait(client, cancel).await?;
                    }
                }
                Task::Grant { tenant, target, kind } => {
                    unit.enter(UnitState::CreatingDependents);
                    let record = tenant::grant_target(client, &tenant, &target, kind, retries, cancel).await?;
                    unit.complete(
                        Step::new(StepAction::Update, record.reference()),
                        Some(Undo::Revoke { tenant, target }),
                    );
                }
                Task::DeleteTargets { tenant } => {
                    unit.enter(UnitState::Deleting);
                    self.delete_targets(unit, &tenant, cancel).await?;
                }
                Task::Delete(target) => {
                    unit.enter(UnitState::Deleting);
                    match client.delete(&target).await {
                        Ok(()) => unit.complete(Step::new(StepAction::Delete, target), None),
                        Err(e) if e.is_not_found() => {
                            tracing::debug!(unit = %unit.id, resource = %target, "Already absent");
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                Task::AwaitGone(target) => {
                    unit.enter(UnitState::AwaitingGone);
                    ReadinessCheck::gone(target, self.config.deletion_poll)
                        .wait(client, cancel)
                        .await?;
                }
                Task::Revoke { tenant, target } => {
                    unit.enter(UnitState::Deleting);
                    match tenant::revoke_target(client, &tenant, &target, retries, cancel).await {
                        Ok(record) => unit.complete(Step::new(StepAction::Update, record.reference()), None),
                        Err(Error::Cluster(e)) if e.is_not_found() => {
                            tracing::debug!(unit = %unit.id, tenant = %tenant, "Tenant record already gone");
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        Ok(())
    }

    /// Delete all of `tenant`'s tenant-target namespaces at once and wait until
    /// each is gone. Every deletion runs to the end; the first failure is returned.
    async fn delete_targets(&self, unit: &mut Unit<'_>, tenant: &str, cancel: &CancellationToken) -> Result<()> {
        let client = self.client.as_ref();
        let record = match client.get(&tenant::identity_ref(tenant)).await {
            Ok(record) => record,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let namespaces: Vec<ResourceRef> = tenant::granted_targets(&record)
            .into_iter()
            .map(|(target, _)| {
                ResourceRef::cluster(ResourceKind::Namespace, definitions::tenant_namespace_name(tenant, &target))
            })
            .collect();
        if namespaces.is_empty() {
            return Ok(());
        }
        unit.total_steps += namespaces.len();
        tracing::info!(unit = %unit.id, tenant, targets = namespaces.len(), "Deleting tenant targets");

        let policy = self.config.deletion_poll;
        let deletions: Vec<_> = namespaces
            .into_iter()
            .map(|namespace| async move {
                let deleted = match client.delete(&namespace).await {
                    Ok(()) => true,
                    Err(e) if e.is_not_found() => false,
                    Err(e) => return (namespace, Err(Error::from(e))),
                };
                let gone = ReadinessCheck::gone(namespace.clone(), policy).wait(client, cancel).await;
                (namespace, gone.map(|_| deleted))
            })
            .collect();

        let mut first_error = None;
        for (namespace, result) in futures::future::join_all(deletions).await {
            match result {
                Ok(true) => unit.complete(Step::new(StepAction::Delete, namespace), None),
                Ok(false) => tracing::debug!(unit = %unit.id, resource = %namespace, "Already absent"),
                Err(e) => {
                    tracing::warn!(unit = %unit.id, resource = %namespace, error = %e, "Tenant target deletion failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Undo completed creation steps, newest first. Errors are logged and skipped.
    async fn roll_back(&self, unit: &mut Unit<'_>, cancel: &CancellationToken) -> Vec<ResourceRef> {
        unit.enter(UnitState::RollingBack);
        let client = self.client.as_ref();
        let mut rolled_back = Vec::new();

        for undo in std::mem::take(&mut unit.undo).into_iter().rev() {
            match undo {
                Undo::Delete(target) => match client.delete(&target).await {
                    Ok(()) => rolled_back.push(target),
                    Err(e) if e.is_not_found() => {}
                    Err(e) => {
                        tracing::warn!(unit = %unit.id, resource = %target, error = %e, "Rollback delete failed")
                    }
                },
                Undo::Revoke { tenant, target } => {
                    match tenant::revoke_target(client, &tenant, &target, self.config.conflict_retries, cancel).await {
                        Ok(record) => rolled_back.push(record.reference()),
                        Err(e) => {
                            tracing::warn!(unit = %unit.id, tenant = %tenant, error = %e, "Rollback revoke failed")
                        }
                    }
                }
            }
        }
        rolled_back
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory::Op;
    use crate::cluster::{InMemoryCluster, MockClusterClient};
    use crate::error::ClusterError;
    use crate::progress::RecordingReporter;
    use std::time::Duration;

    fn fast_config() -> ProvisionerConfig {
        ProvisionerConfig::new()
            .namespace_poll(PollPolicy::fixed(Duration::from_millis(10), 5))
            .pod_poll(PollPolicy::fixed(Duration::from_millis(10), 5))
            .deletion_poll(PollPolicy::fixed(Duration::from_millis(10), 5))
    }

    fn tenant_cluster(tenant: &str) -> Arc<InMemoryCluster> {
        let cluster = InMemoryCluster::new().with_activation_gets(1);
        cluster.insert(definitions::new_namespace(definitions::TENANT_HOME_NAMESPACE));
        cluster.insert(definitions::new_tenant_user(tenant));
        Arc::new(cluster)
    }

    fn names(steps: &[Step]) -> Vec<&str> {
        steps.iter().map(|s| s.name.as_str()).collect()
    }

    #[test]
    fn test_tenant_target_plan_order() {
        let req = ProvisioningRequest::tenant_target("acme", "west");
        let plan = Plan::for_creation(&req, &ProvisionerConfig::default()).unwrap();
        assert_eq!(
            names(&plan.steps()),
            vec![
                "create namespace/acme-west",
                "create resourcequota/acme-west/acme-west-limits",
                "create role/acme-west/acme-west-role",
                "create limitrange/acme-west/acme-west-limitrange",
                "create networkpolicy/acme-west/acme-west-networkpolicy",
                "create rolebinding/acme-west/acme-west-acme-binding",
                "update serviceaccount/default/acme-user",
            ]
        );
    }

    #[test]
    fn test_user_deletion_plan() {
        let req = ProvisioningRequest::user("team", "alice");
        let plan = Plan::for_deletion(&req).unwrap();
        assert_eq!(plan.mode(), Mode::Deprovision);
        assert_eq!(
            names(&plan.steps()),
            vec![
                "delete serviceaccount/team/alice",
                "delete rolebinding/team/alice-team-role-binding",
            ]
        );
    }

    #[test]
    fn test_bad_registry_credentials_fail_planning() {
        let mut req = ProvisioningRequest::secret("team", "registry", "x");
        req.params.secret_data = None;
        req.params.docker_config = Some("not base64!".into());
        let err = Plan::for_creation(&req, &ProvisionerConfig::default()).unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tenant_target_success() {
        let cluster = tenant_cluster("acme");
        let provisioner = UnitProvisioner::new(cluster.clone(), fast_config());
        let req = ProvisioningRequest::tenant_target("acme", "west");

        let outcome = provisioner.provision(3, &req, &CancellationToken::new()).await;

        assert_eq!(outcome.status, OutcomeStatus::Success, "{:?}", outcome.error);
        assert_eq!(outcome.request_index, 3);
        assert_eq!(outcome.steps(StepAction::Create).count(), 6);
        let record = cluster.peek(&tenant::identity_ref("acme")).unwrap();
        assert_eq!(tenant::default_target(&record), Some("west"));
    }

    #[tokio::test]
    async fn test_tenant_target_for_missing_tenant_creates_nothing() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.insert(definitions::new_namespace(definitions::TENANT_HOME_NAMESPACE));
        let provisioner = UnitProvisioner::new(cluster.clone(), fast_config());
        let req = ProvisioningRequest::tenant_target("ghost", "west");

        let outcome = provisioner.provision(0, &req, &CancellationToken::new()).await;

        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert!(outcome.completed_steps.is_empty());
        assert!(outcome.error.unwrap().contains("ghost-user"));
        let calls = cluster.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].op, Op::Get);
        assert_eq!(calls[0].resource, tenant::identity_ref("ghost"));
        assert_eq!(cluster.len(), 1);
    }

    #[tokio::test]
    async fn test_primary_failure_runs_nothing_else() {
        let mut mock = MockClusterClient::new();
        mock.expect_create()
            .times(1)
            .returning(|_| Err(ClusterError::Api("quota exceeded".into())));
        mock.expect_get().never();

        let provisioner = UnitProvisioner::new(Arc::new(mock), fast_config());
        let req = ProvisioningRequest::namespace("team");
        let outcome = provisioner.provision(0, &req, &CancellationToken::new()).await;

        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert!(outcome.completed_steps.is_empty());
        assert!(outcome.error.unwrap().contains("quota exceeded"));
    }

    #[tokio::test]
    async fn test_secret_needs_no_readiness_wait() {
        let mut mock = MockClusterClient::new();
        mock.expect_create().times(1).returning(Ok);
        mock.expect_get().never();

        let provisioner = UnitProvisioner::new(Arc::new(mock), fast_config());
        let req = ProvisioningRequest::secret("team", "token", "hunter2");
        let outcome = provisioner.provision(0, &req, &CancellationToken::new()).await;

        assert!(outcome.is_success());
        assert_eq!(names(&outcome.completed_steps), vec!["create secret/team/token"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dependent_failure_is_fail_fast() {
        let cluster = tenant_cluster("acme");
        let role = ResourceRef::namespaced(ResourceKind::Role, "acme-west", "acme-west-role");
        cluster.fail(Op::Create, role, ClusterError::Api("forbidden".into()));

        let provisioner = UnitProvisioner::new(cluster.clone(), fast_config());
        let req = ProvisioningRequest::tenant_target("acme", "west");
        let outcome = provisioner.provision(0, &req, &CancellationToken::new()).await;

        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert_eq!(
            names(&outcome.completed_steps),
            vec!["create namespace/acme-west", "create resourcequota/acme-west/acme-west-limits"]
        );
        assert!(outcome.rolled_back.is_empty());
        let limit_range = ResourceRef::namespaced(ResourceKind::LimitRange, "acme-west", "acme-west-limitrange");
        assert!(cluster.calls_for(&limit_range).is_empty());
        // left in place for inspection
        assert!(cluster.contains(&ResourceRef::cluster(ResourceKind::Namespace, "acme-west")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_best_effort_rollback() {
        let cluster = tenant_cluster("acme");
        let binding = ResourceRef::namespaced(ResourceKind::RoleBinding, "acme-west", "acme-west-acme-binding");
        cluster.fail(Op::Create, binding, ClusterError::Api("forbidden".into()));

        let config = fast_config().rollback(RollbackPolicy::BestEffort);
        let provisioner = UnitProvisioner::new(cluster.clone(), config);
        let req = ProvisioningRequest::tenant_target("acme", "west");
        let outcome = provisioner.provision(0, &req, &CancellationToken::new()).await;

        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert_eq!(outcome.completed_steps.len(), 5);
        assert_eq!(outcome.rolled_back.len(), 5);
        assert_eq!(outcome.rolled_back.last().unwrap().kind, ResourceKind::Namespace);
        assert!(!cluster.contains(&ResourceRef::cluster(ResourceKind::Namespace, "acme-west")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollback_revokes_grant() {
        let cluster = tenant_cluster("acme");
        let identity = tenant::identity_ref("acme");
        let provisioner = UnitProvisioner::new(cluster.clone(), fast_config().rollback(RollbackPolicy::BestEffort));

        // the grant is the last step, so its undo is driven directly
        let req = ProvisioningRequest::tenant_target("acme", "west");
        let outcome = provisioner.provision(0, &req, &CancellationToken::new()).await;
        assert!(outcome.is_success());

        let mut unit = Unit::new(0, "manual".into(), &provisioner.progress);
        unit.undo.push(Undo::Revoke {
            tenant: "acme".into(),
            target: "west".into(),
        });
        let rolled_back = provisioner.roll_back(&mut unit, &CancellationToken::new()).await;
        assert_eq!(rolled_back, vec![identity.clone()]);
        assert_eq!(tenant::default_target(&cluster.peek(&identity).unwrap()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pod_timeout() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.insert(definitions::new_namespace("team"));
        let pod = ResourceRef::namespaced(ResourceKind::Pod, "team", "web");
        cluster.never_ready(pod.clone());

        let provisioner = UnitProvisioner::new(cluster.clone(), fast_config());
        let req = ProvisioningRequest::pod("team", "web", "nginx:1.27");
        let outcome = provisioner.provision(0, &req, &CancellationToken::new()).await;

        assert_eq!(outcome.status, OutcomeStatus::TimedOut);
        assert_eq!(cluster.calls_for(&pod), vec![Op::Create, Op::Get, Op::Get, Op::Get, Op::Get, Op::Get]);
    }

    #[tokio::test]
    async fn test_invalid_quantity_makes_no_calls() {
        let cluster = Arc::new(InMemoryCluster::new());
        let provisioner = UnitProvisioner::new(cluster.clone(), fast_config());
        let limits = ResourceLimits {
            cpu: "xyz".into(),
            ..Default::default()
        };
        let req = ProvisioningRequest::tenant_target("acme", "west").with_limits(limits);
        let outcome = provisioner.provision(0, &req, &CancellationToken::new()).await;

        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert!(outcome.error.unwrap().contains("xyz"));
        assert!(cluster.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_gone_on_first_poll() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.insert(definitions::new_namespace("team"));
        let provisioner = UnitProvisioner::new(cluster.clone(), fast_config());

        let start = tokio::time::Instant::now();
        let outcome = provisioner
            .deprovision(0, &ProvisioningRequest::namespace("team"), &CancellationToken::new())
            .await;

        assert!(outcome.is_success());
        assert_eq!(start.elapsed(), Duration::ZERO);
        let ns = ResourceRef::cluster(ResourceKind::Namespace, "team");
        assert_eq!(cluster.calls_for(&ns), vec![Op::Delete, Op::Get]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tenant_target_deletion_revokes_access() {
        let cluster = Arc::new(InMemoryCluster::new().with_termination_gets(2));
        cluster.insert(definitions::new_namespace(definitions::TENANT_HOME_NAMESPACE));
        cluster.insert(definitions::new_tenant_user("acme"));
        let provisioner = UnitProvisioner::new(cluster.clone(), fast_config());
        let req = ProvisioningRequest::tenant_target("acme", "west");

        assert!(provisioner.provision(0, &req, &CancellationToken::new()).await.is_success());
        let outcome = provisioner.deprovision(0, &req, &CancellationToken::new()).await;

        assert!(outcome.is_success(), "{:?}", outcome.error);
        assert_eq!(
            names(&outcome.completed_steps),
            vec!["delete namespace/acme-west", "update serviceaccount/default/acme-user"]
        );
        let record = cluster.peek(&tenant::identity_ref("acme")).unwrap();
        assert!(tenant::granted_targets(&record).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_target_deletion_revokes_without_kind() {
        let cluster = tenant_cluster("acme");
        let provisioner = UnitProvisioner::new(cluster.clone(), fast_config());
        let created = ProvisioningRequest::tenant_target("acme", "gpu").with_target_kind(TargetKind::Group);
        assert!(provisioner.provision(0, &created, &CancellationToken::new()).await.is_success());

        let outcome = provisioner
            .deprovision(0, &ProvisioningRequest::tenant_target("acme", "gpu"), &CancellationToken::new())
            .await;

        assert!(outcome.is_success(), "{:?}", outcome.error);
        let record = cluster.peek(&tenant::identity_ref("acme")).unwrap();
        assert!(tenant::granted_targets(&record).is_empty());
        assert_eq!(tenant::default_target(&record), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tenant_deletion_removes_its_targets_first() {
        let cluster = tenant_cluster("acme");
        let provisioner = UnitProvisioner::new(cluster.clone(), fast_config());
        for req in [
            ProvisioningRequest::tenant_target("acme", "west"),
            ProvisioningRequest::tenant_target("acme", "gpu").with_target_kind(TargetKind::Group),
        ] {
            assert!(provisioner.provision(0, &req, &CancellationToken::new()).await.is_success());
        }

        let outcome = provisioner
            .deprovision(0, &ProvisioningRequest::tenant("acme"), &CancellationToken::new())
            .await;

        assert!(outcome.is_success(), "{:?}", outcome.error);
        assert_eq!(
            names(&outcome.completed_steps[..3]),
            vec![
                "delete namespace/acme-gpu",
                "delete namespace/acme-west",
                "delete serviceaccount/default/acme-user",
            ]
        );
        assert!(!cluster.contains(&ResourceRef::cluster(ResourceKind::Namespace, "acme-west")));
        assert!(!cluster.contains(&ResourceRef::cluster(ResourceKind::Namespace, "acme-gpu")));
        assert!(!cluster.contains(&tenant::identity_ref("acme")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_target_deletion_keeps_tenant() {
        let cluster = tenant_cluster("acme");
        let provisioner = UnitProvisioner::new(cluster.clone(), fast_config());
        for target in ["east", "west"] {
            let req = ProvisioningRequest::tenant_target("acme", target);
            assert!(provisioner.provision(0, &req, &CancellationToken::new()).await.is_success());
        }
        let west = ResourceRef::cluster(ResourceKind::Namespace, "acme-west");
        cluster.fail(Op::Delete, west.clone(), ClusterError::Api("finalizer stuck".into()));

        let outcome = provisioner
            .deprovision(0, &ProvisioningRequest::tenant("acme"), &CancellationToken::new())
            .await;

        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert!(outcome.error.unwrap().contains("finalizer stuck"));
        assert_eq!(names(&outcome.completed_steps), vec!["delete namespace/acme-east"]);
        assert!(cluster.contains(&west));
        assert!(cluster.contains(&tenant::identity_ref("acme")));
        assert!(!cluster.calls_for(&tenant::identity_ref("acme")).contains(&Op::Delete));
    }

    #[tokio::test]
    async fn test_delete_of_absent_object_succeeds() {
        let cluster = Arc::new(InMemoryCluster::new());
        let provisioner = UnitProvisioner::new(cluster.clone(), fast_config());
        let outcome = provisioner
            .deprovision(0, &ProvisioningRequest::secret("team", "token", "x"), &CancellationToken::new())
            .await;
        assert!(outcome.is_success());
        assert!(outcome.completed_steps.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_unit_issues_no_calls() {
        let cluster = Arc::new(InMemoryCluster::new());
        let provisioner = UnitProvisioner::new(cluster.clone(), fast_config());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = provisioner.provision(0, &ProvisioningRequest::namespace("team"), &cancel).await;
        assert_eq!(outcome.status, OutcomeStatus::Cancelled);
        assert!(cluster.calls().is_empty());
    }

    #[tokio::test]
    async fn test_reporter_events() {
        let recorder = Arc::new(RecordingReporter::new());
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.insert(definitions::new_namespace("team"));
        let provisioner =
            UnitProvisioner::new(cluster, fast_config()).with_progress(Progress::new(recorder.clone()));

        provisioner
            .provision(0, &ProvisioningRequest::user("team", "alice"), &CancellationToken::new())
            .await;

        assert_eq!(
            recorder.events(),
            vec![
                "advance user team/alice 0/2",
                "advance user team/alice 1/2",
                "advance user team/alice 2/2",
                "done user team/alice",
            ]
        );
    }

    #[tokio::test]
    async fn test_failing_reporter_does_not_abort() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.insert(definitions::new_namespace("team"));
        let provisioner = UnitProvisioner::new(cluster, fast_config())
            .with_progress(Progress::new(Arc::new(RecordingReporter::failing())));

        let outcome = provisioner
            .provision(0, &ProvisioningRequest::user("team", "alice"), &CancellationToken::new())
            .await;
        assert!(outcome.is_success());
    }
}
