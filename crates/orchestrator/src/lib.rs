//! Lifecycle orchestration for consortium ledger networks.
//!
//! [`NetworkOrchestrator`] creates networks, converges them to a desired
//! size, replaces unhealthy nodes, and recovers them from retained ledgers.
//! Compute and load balancers come from pluggable [`NodeProvider`] and
//! [`LoadBalancerProvider`] implementations; governance goes through the
//! cluster's signed proposal API.
//!
//! Building blocks that are useful on their own are exported as plain
//! functions:
//! - [`select_nodes_to_remove`]: consensus-aware choice of nodes to drop when shrinking
//! - [`select_recovery_root`]: choice of the ledger to recover from
//! - [`host_data_from_join_policy`]: host data allowed by a join policy
//!
//! # Example
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use consortium_orchestrator::{NetworkOrchestrator, NetworkRequest, LoadBalancerProvider, NodeProvider, init_logging};
//! # use consortium_types::config::OrchestratorConfig;
//! # async fn example(nodes: Arc<dyn NodeProvider>, lb: Arc<dyn LoadBalancerProvider>) -> Result<(), Box<dyn std::error::Error>> {
//! let config = OrchestratorConfig::load(Some("orchestrator.toml"))?;
//! init_logging(&config.logging)?;
//!
//! let orchestrator = NetworkOrchestrator::builder().node_provider(nodes).load_balancer(lb).config(config).build();
//! let request = NetworkRequest::builder().network_name("contoso").node_count(5).build();
//! let network = orchestrator.update_network(&request).await?;
//! println!("{} runs {} nodes", network.name, network.node_count);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod governance;
mod logging;
mod network;
mod provider;
mod readiness;
mod reconciler;
mod recovery;
mod removal;

pub use error::{OrchestratorError, ProviderError, Result};
pub use governance::host_data_from_join_policy;
pub use logging::init_logging;
pub use network::{NetworkOrchestrator, NetworkRequest};
pub use provider::{
    JoinTarget, LoadBalancerProvider, NetworkScope, NodeProvider, NodeSpec, ProviderResult, RecoveryAgent,
};
pub use readiness::JoinPhase;
pub use reconciler::ReconcileOutcome;
pub use recovery::{END_OF_RECOVERY, RECOVERY_KEY_SUBMITTED, select_recovery_root};
pub use removal::select_nodes_to_remove;
