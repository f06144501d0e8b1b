//! Error types for network lifecycle orchestration.
//!
//! [`OrchestratorError`] wraps [`ClientError`] (cluster calls, polls) and
//! [`ProviderError`] (infrastructure calls) and adds the workflow-level
//! failures: a shifted primary, a proposal that did not auto-accept, a
//! recovery that did not complete in one step, and broken invariants.

#![allow(missing_docs)]

use consortium_client::ClientError;
use snafu::{Location, Snafu};

/// Result type alias for orchestrator operations.
pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;

// ============================================================================
// Provider Errors
// ============================================================================

/// Error reported by a node, load balancer, or recovery agent provider.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ProviderError {
    /// The requested resource does not exist.
    #[snafu(display("{resource} not found"))]
    NotFound { resource: String },

    /// The provider call failed.
    #[snafu(display("{operation} failed: {message}"))]
    Failed { operation: String, message: String },
}

impl ProviderError {
    /// Creates a [`ProviderError::Failed`].
    pub fn failed(operation: impl Into<String>, message: impl std::fmt::Display) -> Self {
        ProviderError::Failed { operation: operation.into(), message: message.to_string() }
    }
}

// ============================================================================
// Orchestrator Errors
// ============================================================================

/// Errors surfaced by top-level orchestrator operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum OrchestratorError {
    /// Cluster call or poll failed.
    #[snafu(context(false), display("{source}"))]
    Client {
        source: ClientError,
        #[snafu(implicit)]
        location: Location,
    },

    /// Infrastructure provider call failed.
    #[snafu(context(false), display("Provider error at {location}: {source}"))]
    Provider {
        source: ProviderError,
        #[snafu(implicit)]
        location: Location,
    },

    /// The consensus primary differs from the one the workflow assumed.
    #[snafu(display("Primary shifted: expected {expected}, observed {actual}"))]
    PrimaryShifted { expected: String, actual: String },

    /// A proposal expected to auto-accept did not.
    #[snafu(display("Proposal {proposal_id} was not accepted, state is {state}"))]
    ProposalNotAccepted { proposal_id: String, state: String },

    /// A structurally impossible state was observed.
    #[snafu(display("Invariant violated: {message}"))]
    InvariantViolation { message: String },

    /// The operation submits proposals but no signing identity is configured.
    #[snafu(display("Signing identity is not configured"))]
    SigningNotConfigured,

    /// The operation needs an optional collaborator that was not supplied.
    #[snafu(display("No {capability} is configured"))]
    CapabilityNotConfigured { capability: &'static str },

    /// The caller supplied an unusable argument.
    #[snafu(display("Invalid argument: {message}"))]
    InvalidArgument { message: String },

    /// The recovery share response did not confirm the end of recovery.
    #[snafu(display("Recovery did not complete in one step: {message}"))]
    RecoveryIncomplete { message: String },
}

impl OrchestratorError {
    /// Returns `true` if a poll ran out of time.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Client { source, .. } if source.is_timeout())
    }

    /// Returns `true` if a node failed its health check mid-wait.
    #[must_use]
    pub fn is_node_unhealthy(&self) -> bool {
        matches!(self, Self::Client { source, .. } if source.is_node_unhealthy())
    }

    /// Returns `true` if re-invoking the top-level operation may succeed
    /// without operator action.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Client { source, .. } => source.is_retryable(),
            Self::PrimaryShifted { .. } => true,
            Self::Provider { .. } => false,
            Self::ProposalNotAccepted { .. } => false,
            Self::InvariantViolation { .. } => false,
            Self::SigningNotConfigured => false,
            Self::CapabilityNotConfigured { .. } => false,
            Self::InvalidArgument { .. } => false,
            Self::RecoveryIncomplete { .. } => false,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_client_errors_convert_with_question_mark() {
        fn fails() -> Result<()> {
            Err(ClientError::Timeout {
                what: "net-1".to_owned(),
                elapsed: Duration::from_secs(60),
                last_state: "Pending".to_owned(),
            })?;
            Ok(())
        }
        let err = fails().unwrap_err();
        assert!(err.is_timeout());
        assert!(!err.is_node_unhealthy());
        assert!(err.to_string().contains("Pending"));
    }

    #[test]
    fn test_node_unhealthy_classification() {
        let err: OrchestratorError =
            ClientError::NodeUnhealthy { node: "net-2".to_owned(), detail: "exited".to_owned() }.into();
        assert!(err.is_node_unhealthy());
        assert!(!err.is_timeout());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_provider_error_converts() {
        fn fails() -> Result<()> {
            Err(ProviderError::failed("create_join_node", "quota exceeded"))?;
            Ok(())
        }
        let msg = fails().unwrap_err().to_string();
        assert!(msg.contains("create_join_node failed: quota exceeded"), "{msg}");
    }

    #[test]
    fn test_primary_shift_is_retryable() {
        let err = OrchestratorError::PrimaryShifted { expected: "a".to_owned(), actual: "b".to_owned() };
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "Primary shifted: expected a, observed b");
    }
}
