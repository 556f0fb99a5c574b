//! Bounded readiness polling
//!
//! Waits for an object to reach a phase, or to disappear after deletion, by
//! re-reading it on a fixed (optionally growing) interval. Polling only ever
//! issues reads.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::cluster::ClusterClient;
use crate::config::PollPolicy;
use crate::models::{Phase, Resource, ResourceRef};
use crate::{Error, Result};

/// Why a poll loop stopped without reaching its goal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollError<E> {
    TimedOut { attempts: u32 },
    Cancelled,
    Failed(E),
}

/// Call `fetch` until it yields `Some`, fails, runs out of attempts or is
/// cancelled.
///
/// The first fetch happens immediately; later fetches are separated by at
/// least `policy.interval()`. `policy.max_attempts == 0` polls without bound,
/// leaving cancellation as the only exit besides success or failure.
pub async fn poll_until<T, E, F, Fut>(
    policy: &PollPolicy,
    cancel: &CancellationToken,
    mut fetch: F,
) -> std::result::Result<T, PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<Option<T>, E>>,
{
    let mut attempt = 0u32;
    let mut delay = policy.interval();

    loop {
        if cancel.is_cancelled() {
            return Err(PollError::Cancelled);
        }

        attempt += 1;
        match fetch().await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => tracing::trace!(attempt, "Condition not met yet"),
            Err(e) => return Err(PollError::Failed(e)),
        }

        if policy.is_bounded() && attempt >= policy.max_attempts {
            return Err(PollError::TimedOut { attempts: attempt });
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(PollError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        delay = policy.next_delay(delay);
    }
}

/// What a readiness check waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    /// The object reports this phase
    Phase(Phase),
    /// A read reports not-found
    Gone,
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Phase(phase) => write!(f, "{phase}"),
            Condition::Gone => write!(f, "gone"),
        }
    }
}

/// Phases an object never leaves once it reaches them
fn is_dead_end(wanted: Phase, observed: Phase) -> bool {
    match wanted {
        Phase::Running => matches!(observed, Phase::Failed | Phase::Succeeded | Phase::Terminating),
        Phase::Active => observed == Phase::Terminating,
        _ => false,
    }
}

#[derive(Debug, Clone)]
pub struct ReadinessCheck {
    pub resource: ResourceRef,
    pub condition: Condition,
    pub policy: PollPolicy,
}

impl ReadinessCheck {
    pub fn phase(resource: ResourceRef, phase: Phase, policy: PollPolicy) -> Self {
        Self {
            resource,
            condition: Condition::Phase(phase),
            policy,
        }
    }

    pub fn gone(resource: ResourceRef, policy: PollPolicy) -> Self {
        Self {
            resource,
            condition: Condition::Gone,
            policy,
        }
    }

    /// Poll until the condition holds.
    ///
    /// Returns the ready object for phase conditions and `None` for `Gone`.
    /// A not-found read keeps a phase wait going (the object may not be
    /// visible yet) and completes a `Gone` wait.
    pub async fn wait(
        &self,
        client: &dyn ClusterClient,
        cancel: &CancellationToken,
    ) -> Result<Option<Resource>> {
        let target = &self.resource;
        let condition = self.condition;

        let result = poll_until(&self.policy, cancel, || async move {
            match (condition, client.get(target).await) {
                (Condition::Gone, Err(e)) if e.is_not_found() => Ok(Some(None)),
                (Condition::Gone, Ok(_)) => Ok(None),
                (Condition::Phase(_), Err(e)) if e.is_not_found() => Ok(None),
                (Condition::Phase(wanted), Ok(resource)) => match resource.phase() {
                    Some(phase) if phase == wanted => Ok(Some(Some(resource))),
                    Some(phase) if is_dead_end(wanted, phase) => Err(Error::Unready {
                        resource: target.clone(),
                        phase: phase.to_string(),
                    }),
                    _ => Ok(None),
                },
                (_, Err(e)) => Err(Error::Cluster(e)),
            }
        })
        .await;

        result.map_err(|e| match e {
            PollError::TimedOut { attempts } => Error::ReadinessTimeout {
                resource: target.clone(),
                condition: condition.to_string(),
                attempts,
            },
            PollError::Cancelled => Error::Cancelled(target.clone()),
            PollError::Failed(e) => e,
        })
    }

    /// Upper bound on the time a bounded wait can take, ignoring call latency
    pub fn worst_case(&self) -> Option<Duration> {
        if !self.policy.is_bounded() {
            return None;
        }
        let mut total = Duration::ZERO;
        let mut delay = self.policy.interval();
        for _ in 1..self.policy.max_attempts {
            total += delay;
            delay = self.policy.next_delay(delay);
        }
        Some(total)
    }
}
