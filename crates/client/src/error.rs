//! Client error types with diagnostic context.
//!
//! Provides a two-tier error model:
//! - **Transport errors**: unreachable endpoints, non-success HTTP statuses, undecodable bodies
//! - **Wait errors**: poll deadlines and health checks failing mid-wait
//!
//! Errors carry enough detail (last observed state, status code, response
//! body) for an operator to tell a booting node from a crashed one.

use std::time::Duration;

use snafu::{Location, Snafu};

/// Result type alias for client operations.
pub type Result<T, E = ClientError> = std::result::Result<T, E>;

/// Client error types with context-rich error messages.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ClientError {
    /// A poll exceeded its deadline.
    #[snafu(display(
        "Timed out after {}s waiting for {what}; last observed state: {last_state}",
        elapsed.as_secs()
    ))]
    Timeout {
        /// What the poll was waiting for.
        what: String,
        /// Time spent waiting.
        elapsed: Duration,
        /// Last state observed by the probe.
        last_state: String,
    },

    /// A provider health check failed while waiting on a node.
    #[snafu(display("Node {node} is unhealthy: {detail}"))]
    NodeUnhealthy {
        /// Node name.
        node: String,
        /// Health reasons reported by the provider.
        detail: String,
    },

    /// Cluster returned a non-success status.
    #[snafu(display("Request {method} {path} failed with status {status}: {body}"))]
    RemoteCall {
        /// HTTP method.
        method: String,
        /// Request path.
        path: String,
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// Request could not be delivered.
    #[snafu(display("Transport error at {location} for {url}: {source}"))]
    Transport {
        /// Target URL.
        url: String,
        /// Underlying HTTP error.
        source: reqwest::Error,
        /// Source location.
        #[snafu(implicit)]
        location: Location,
    },

    /// A request or response body did not match the expected shape.
    #[snafu(display("Invalid JSON for {path}: {source}"))]
    Json {
        /// Request path.
        path: String,
        /// JSON error.
        source: serde_json::Error,
        /// Source location.
        #[snafu(implicit)]
        location: Location,
    },

    /// A governance transaction ended in a state other than committed.
    #[snafu(display("Transaction {transaction_id} ended as {status}"))]
    TransactionNotCommitted {
        /// Transaction id.
        transaction_id: String,
        /// Final status.
        status: String,
    },

    /// The signing collaborator could not sign a governance message.
    #[snafu(display("Signing failed: {message}"))]
    Signing {
        /// Error description.
        message: String,
    },

    /// Attestation evidence could not be verified or parsed.
    #[snafu(display("Attestation for node {node_id} rejected: {message}"))]
    Attestation {
        /// Node whose evidence was checked.
        node_id: String,
        /// Error description.
        message: String,
    },

    /// Endpoint URL or trust anchor is unusable.
    #[snafu(display("Invalid endpoint '{url}': {message}"))]
    InvalidEndpoint {
        /// The invalid URL.
        url: String,
        /// Error description.
        message: String,
    },
}

impl ClientError {
    /// Returns `true` for poll deadline errors.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns `true` for failed health checks.
    #[must_use]
    pub fn is_node_unhealthy(&self) -> bool {
        matches!(self, Self::NodeUnhealthy { .. })
    }

    /// Returns true if a read-only caller may try again.
    ///
    /// Governance submissions are never retried regardless of this value:
    /// a retried proposal may be recorded twice.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Timeout { .. } => true,
            Self::RemoteCall { status, .. } => matches!(status, 429 | 502 | 503 | 504),
            Self::NodeUnhealthy { .. } => false,
            Self::Json { .. } => false,
            Self::TransactionNotCommitted { .. } => false,
            Self::Signing { .. } => false,
            Self::Attestation { .. } => false,
            Self::InvalidEndpoint { .. } => false,
        }
    }

    /// Returns the HTTP status if the cluster answered with an error.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::RemoteCall { status, .. } => Some(*status),
            _ => None,
        }
    }
}
