//! kufast provisioning pipeline
//!
//! Creates and removes sets of interdependent cluster objects (a tenant's
//! isolation namespace with its quota, role, limit range, network policy and
//! role binding, or a pod, a secret, a user) for many independently named
//! requests at once.
//!
//! # Key Features
//!
//! - **Ordered units** - each request runs as a fail-fast state machine
//! - **Bounded fan-out** - a semaphore caps how many units run concurrently
//! - **Bounded polling** - readiness and deletion waits always have an attempt budget
//! - **Safe shared edits** - tenant records are updated with versioned retries
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use kufast::{FanOutCoordinator, InMemoryCluster, ProvisionerConfig, ProvisioningRequest};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() {
//! let cluster = Arc::new(InMemoryCluster::new());
//! let coordinator = FanOutCoordinator::new(cluster, ProvisionerConfig::default());
//!
//! let requests = vec![
//!     ProvisioningRequest::tenant_target("acme", "west"),
//!     ProvisioningRequest::tenant_target("acme", "east"),
//! ];
//! let outcomes = coordinator.provision_many(&requests, &CancellationToken::new()).await;
//!
//! for outcome in &outcomes {
//!     println!("{}: {}", outcome.unit, outcome.status);
//! }
//! # }
//! ```

pub mod cluster;
pub mod config;
pub mod coordinator;
pub mod definitions;
pub mod error;
pub mod models;
pub mod poller;
pub mod progress;
pub mod provisioner;
pub mod quantity;
pub mod tenant;

pub use cluster::{ClusterClient, InMemoryCluster};
pub use config::{PollPolicy, ProvisionerConfig, RollbackPolicy};
pub use coordinator::FanOutCoordinator;
pub use error::{ClusterError, Error, Result};
pub use models::{Outcome, OutcomeStatus, ProvisioningRequest, RequestKind};
pub use progress::{Progress, ProgressReporter};
pub use provisioner::UnitProvisioner;
