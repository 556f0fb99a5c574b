//! In-process cluster store
//!
//! Behaves like an eventually consistent control plane: namespaces and pods
//! activate only after a number of reads, deleted objects linger in
//! `Terminating` before they disappear, and updates carrying a stale
//! `resource_version` are rejected. Used as the dry-run backend of the CLI and
//! as the cluster in tests.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::cluster::ClusterClient;
use crate::error::ClusterError;
use crate::models::{Phase, Resource, ResourceKind, ResourceRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Create,
    Get,
    Update,
    Delete,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Create => write!(f, "create"),
            Op::Get => write!(f, "get"),
            Op::Update => write!(f, "update"),
            Op::Delete => write!(f, "delete"),
        }
    }
}

/// One recorded client call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: Op,
    pub resource: ResourceRef,
}

struct Entry {
    resource: Resource,
    /// Reads left that still observe the pre-activation phase
    pending_gets: u32,
    /// Reads left before a terminating object vanishes
    terminating_gets: Option<u32>,
}

struct Fault {
    op: Op,
    target: ResourceRef,
    error: ClusterError,
    remaining: Option<u32>,
}

#[derive(Default)]
struct State {
    objects: HashMap<ResourceRef, Entry>,
    next_version: u64,
    faults: Vec<Fault>,
    /// Phase reached instead of the normal ready phase
    settle_overrides: HashMap<ResourceRef, Phase>,
    calls: Vec<Call>,
}

impl State {
    fn bump_version(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }

    fn take_fault(&mut self, op: Op, target: &ResourceRef) -> Option<ClusterError> {
        let idx = self
            .faults
            .iter()
            .position(|f| f.op == op && &f.target == target)?;
        let fault = &mut self.faults[idx];
        let error = fault.error.clone();
        if let Some(remaining) = fault.remaining.as_mut() {
            *remaining -= 1;
            if *remaining == 0 {
                self.faults.remove(idx);
            }
        }
        Some(error)
    }

    fn namespace_usable(&self, namespace: &str) -> bool {
        let ns = ResourceRef::cluster(ResourceKind::Namespace, namespace);
        self.objects
            .get(&ns)
            .map(|e| e.terminating_gets.is_none())
            .unwrap_or(false)
    }

    fn remove(&mut self, target: &ResourceRef) {
        self.objects.remove(target);
        if target.kind == ResourceKind::Namespace {
            self.objects
                .retain(|r, _| r.namespace.as_deref() != Some(target.name.as_str()));
        }
    }
}

/// Readiness phase for kinds that activate asynchronously
fn ready_phase(kind: ResourceKind) -> Option<Phase> {
    match kind {
        ResourceKind::Namespace => Some(Phase::Active),
        ResourceKind::Pod => Some(Phase::Running),
        _ => None,
    }
}

pub struct InMemoryCluster {
    state: Mutex<State>,
    activation_gets: u32,
    termination_gets: u32,
    latency: Option<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCluster {
    /// Store where everything activates and disappears immediately
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            activation_gets: 0,
            termination_gets: 0,
            latency: None,
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Namespaces and pods report `Pending` for this many reads after creation
    pub fn with_activation_gets(mut self, n: u32) -> Self {
        self.activation_gets = n;
        self
    }

    /// Deleted objects report `Terminating` for this many reads
    pub fn with_termination_gets(mut self, n: u32) -> Self {
        self.termination_gets = n;
        self
    }

    /// Every call takes this long
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Store an object directly, already settled. Does not record a call.
    pub fn insert(&self, mut resource: Resource) -> Resource {
        let mut state = self.state.lock();
        resource.meta.resource_version = Some(state.bump_version());
        if let Some(phase) = ready_phase(resource.kind()) {
            resource.status.phase = Some(phase);
        }
        state.objects.insert(
            resource.reference(),
            Entry {
                resource: resource.clone(),
                pending_gets: 0,
                terminating_gets: None,
            },
        );
        resource
    }

    /// Fail every `op` on `target` with `error`
    pub fn fail(&self, op: Op, target: ResourceRef, error: ClusterError) {
        self.state.lock().faults.push(Fault {
            op,
            target,
            error,
            remaining: None,
        });
    }

    /// Fail the next `times` calls of `op` on `target`
    pub fn fail_times(&self, op: Op, target: ResourceRef, error: ClusterError, times: u32) {
        if times == 0 {
            return;
        }
        self.state.lock().faults.push(Fault {
            op,
            target,
            error,
            remaining: Some(times),
        });
    }

    /// Keep `target` in `Pending` forever once created
    pub fn never_ready(&self, target: ResourceRef) {
        self.settle_as(target, Phase::Pending);
    }

    /// Make `target` settle in `phase` instead of its ready phase
    pub fn settle_as(&self, target: ResourceRef, phase: Phase) {
        self.state.lock().settle_overrides.insert(target, phase);
    }

    /// Current stored object without recording a call
    pub fn peek(&self, target: &ResourceRef) -> Option<Resource> {
        self.state
            .lock()
            .objects
            .get(target)
            .map(|e| e.resource.clone())
    }

    /// Refs of every stored object, sorted
    pub fn refs(&self) -> Vec<ResourceRef> {
        let mut refs: Vec<_> = self.state.lock().objects.keys().cloned().collect();
        refs.sort();
        refs
    }

    pub fn contains(&self, target: &ResourceRef) -> bool {
        self.state.lock().objects.contains_key(target)
    }

    pub fn len(&self) -> usize {
        self.state.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn calls_for(&self, target: &ResourceRef) -> Vec<Op> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| &c.resource == target)
            .map(|c| c.op)
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Highest number of calls that were in progress at the same time
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self, op: Op, target: &ResourceRef) -> Option<ClusterError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        let fault = {
            let mut state = self.state.lock();
            state.calls.push(Call {
                op,
                resource: target.clone(),
            });
            state.take_fault(op, target)
        };

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        fault
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn create_now(&self, mut resource: Resource) -> Result<Resource, ClusterError> {
        let target = resource.reference();
        let mut state = self.state.lock();

        if let Some(ns) = target.namespace.as_deref() {
            if !state.namespace_usable(ns) {
                return Err(ClusterError::NotFound(ResourceRef::cluster(
                    ResourceKind::Namespace,
                    ns,
                )));
            }
        }
        if state.objects.contains_key(&target) {
            return Err(ClusterError::AlreadyExists(target));
        }

        let ready = ready_phase(target.kind);
        let pending_gets = if ready.is_some() { self.activation_gets } else { 0 };
        resource.meta.resource_version = Some(state.bump_version());
        resource.status.phase = match ready {
            Some(_) if pending_gets > 0 || state.settle_overrides.contains_key(&target) => {
                Some(Phase::Pending)
            }
            other => other,
        };

        state.objects.insert(
            target,
            Entry {
                resource: resource.clone(),
                pending_gets,
                terminating_gets: None,
            },
        );
        Ok(resource)
    }

    fn get_now(&self, target: &ResourceRef) -> Result<Resource, ClusterError> {
        let mut state = self.state.lock();
        let settle = state.settle_overrides.get(target).copied();

        let Some(entry) = state.objects.get_mut(target) else {
            return Err(ClusterError::NotFound(target.clone()));
        };

        if let Some(left) = entry.terminating_gets {
            if left == 0 {
                state.remove(target);
                return Err(ClusterError::NotFound(target.clone()));
            }
            entry.terminating_gets = Some(left - 1);
            return Ok(entry.resource.clone());
        }

        if entry.pending_gets > 0 {
            entry.pending_gets -= 1;
        } else if let Some(ready) = ready_phase(target.kind) {
            entry.resource.status.phase = Some(settle.unwrap_or(ready));
        }
        Ok(entry.resource.clone())
    }

    fn update_now(&self, resource: Resource) -> Result<Resource, ClusterError> {
        let target = resource.reference();
        let mut state = self.state.lock();
        let version = state.bump_version();

        let Some(entry) = state.objects.get_mut(&target) else {
            return Err(ClusterError::NotFound(target));
        };
        let current = entry.resource.meta.resource_version.unwrap_or_default();
        if let Some(expected) = resource.meta.resource_version {
            if expected != current {
                return Err(ClusterError::Conflict {
                    resource: target,
                    expected,
                    actual: current,
                });
            }
        }

        entry.resource.meta.labels = resource.meta.labels;
        entry.resource.meta.annotations = resource.meta.annotations;
        entry.resource.spec = resource.spec;
        entry.resource.meta.resource_version = Some(version);
        Ok(entry.resource.clone())
    }

    fn delete_now(&self, target: &ResourceRef) -> Result<(), ClusterError> {
        let mut state = self.state.lock();
        let Some(entry) = state.objects.get_mut(target) else {
            return Err(ClusterError::NotFound(target.clone()));
        };
        if entry.terminating_gets.is_some() {
            return Ok(());
        }

        if self.termination_gets == 0 {
            state.remove(target);
        } else {
            entry.terminating_gets = Some(self.termination_gets);
            entry.resource.status.phase = Some(Phase::Terminating);
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterClient for InMemoryCluster {
    async fn create(&self, resource: Resource) -> Result<Resource, ClusterError> {
        let target = resource.reference();
        let result = match self.enter(Op::Create, &target).await {
            Some(err) => Err(err),
            None => self.create_now(resource),
        };
        self.leave();
        result
    }

    async fn get(&self, target: &ResourceRef) -> Result<Resource, ClusterError> {
        let result = match self.enter(Op::Get, target).await {
            Some(err) => Err(err),
            None => self.get_now(target),
        };
        self.leave();
        result
    }

    async fn update(&self, resource: Resource) -> Result<Resource, ClusterError> {
        let target = resource.reference();
        let result = match self.enter(Op::Update, &target).await {
            Some(err) => Err(err),
            None => self.update_now(resource),
        };
        self.leave();
        result
    }

    async fn delete(&self, target: &ResourceRef) -> Result<(), ClusterError> {
        let result = match self.enter(Op::Delete, target).await {
            Some(err) => Err(err),
            None => self.delete_now(target),
        };
        self.leave();
        result
    }
}
