//! Steps, unit states and outcomes

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::models::ResourceRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepAction {
    Create,
    Update,
    Delete,
}

impl fmt::Display for StepAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepAction::Create => write!(f, "create"),
            StepAction::Update => write!(f, "update"),
            StepAction::Delete => write!(f, "delete"),
        }
    }
}

/// One cluster mutation within a unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub action: StepAction,
    pub resource: ResourceRef,
}

impl Step {
    pub fn new(action: StepAction, resource: ResourceRef) -> Self {
        Self {
            name: format!("{} {}", action, resource),
            action,
            resource,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// State of a provisioning unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitState {
    Pending,
    CreatingPrimary,
    AwaitingPrimaryReady,
    CreatingDependents,
    Deleting,
    AwaitingGone,
    RollingBack,
    Done,
    Failed,
}

impl UnitState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UnitState::Done | UnitState::Failed)
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitState::Pending => write!(f, "Pending"),
            UnitState::CreatingPrimary => write!(f, "CreatingPrimary"),
            UnitState::AwaitingPrimaryReady => write!(f, "AwaitingPrimaryReady"),
            UnitState::CreatingDependents => write!(f, "CreatingDependents"),
            UnitState::Deleting => write!(f, "Deleting"),
            UnitState::AwaitingGone => write!(f, "AwaitingGone"),
            UnitState::RollingBack => write!(f, "RollingBack"),
            UnitState::Done => write!(f, "Done"),
            UnitState::Failed => write!(f, "Failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeStatus {
    Success,
    Failed,
    TimedOut,
    Cancelled,
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutcomeStatus::Success => write!(f, "Success"),
            OutcomeStatus::Failed => write!(f, "Failed"),
            OutcomeStatus::TimedOut => write!(f, "TimedOut"),
            OutcomeStatus::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Terminal result of one unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub request_index: usize,
    pub unit: String,
    pub status: OutcomeStatus,
    pub error: Option<String>,
    pub completed_steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rolled_back: Vec<ResourceRef>,
}

impl Outcome {
    pub fn success(request_index: usize, unit: impl Into<String>, completed_steps: Vec<Step>) -> Self {
        Self {
            request_index,
            unit: unit.into(),
            status: OutcomeStatus::Success,
            error: None,
            completed_steps,
            rolled_back: Vec::new(),
        }
    }

    pub fn failure(
        request_index: usize,
        unit: impl Into<String>,
        status: OutcomeStatus,
        error: impl Into<String>,
        completed_steps: Vec<Step>,
    ) -> Self {
        Self {
            request_index,
            unit: unit.into(),
            status,
            error: Some(error.into()),
            completed_steps,
            rolled_back: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }

    /// Steps with the given action, in execution order
    pub fn steps(&self, action: StepAction) -> impl Iterator<Item = &Step> {
        self.completed_steps.iter().filter(move |s| s.action == action)
    }
}

/// Summary over a batch of outcomes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub cancelled: usize,
}

impl BatchSummary {
    pub fn from_outcomes(outcomes: &[Outcome]) -> Self {
        outcomes.iter().fold(
            BatchSummary {
                total: outcomes.len(),
                ..Default::default()
            },
            |mut acc, o| {
                match o.status {
                    OutcomeStatus::Success => acc.succeeded += 1,
                    OutcomeStatus::Failed => acc.failed += 1,
                    OutcomeStatus::TimedOut => acc.timed_out += 1,
                    OutcomeStatus::Cancelled => acc.cancelled += 1,
                }
                acc
            },
        )
    }

    pub fn all_succeeded(&self) -> bool {
        self.succeeded == self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ResourceKind;

    #[test]
    fn test_step_name() {
        let step = Step::new(StepAction::Create, ResourceRef::cluster(ResourceKind::Namespace, "acme-west"));
        assert_eq!(step.name, "create namespace/acme-west");
    }

    #[test]
    fn test_batch_summary() {
        let outcomes = vec![
            Outcome::success(0, "a", vec![]),
            Outcome::failure(1, "b", OutcomeStatus::Failed, "boom", vec![]),
            Outcome::failure(2, "c", OutcomeStatus::TimedOut, "slow", vec![]),
        ];
        let summary = BatchSummary::from_outcomes(&outcomes);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.timed_out, 1);
        assert!(!summary.all_succeeded());
    }
}
