//! Client for the HTTP surface of a consortium ledger cluster.
//!
//! This crate provides:
//! - [`poll_until`] and [`poll_until_healthy`]: fixed-interval waits with a deadline and an
//!   optional fail-fast health check
//! - [`ClusterTransport`]: the byte-level seam, with [`HttpTransport`] as the reqwest-backed
//!   implementation
//! - [`ClusterClient`]: typed node and governance reads against one endpoint
//! - [`GovernanceClient`]: signed proposal, ballot, and recovery share submission with commit
//!   confirmation
//! - [`GovernanceSigner`], [`RecoveryShareDecryptor`], [`AttestationVerifier`]: capabilities
//!   supplied by the embedding application
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use consortium_client::{ClusterClient, ClusterEndpoint, HttpTransport};
//!
//! # async fn example() -> consortium_client::Result<()> {
//! let transport = Arc::new(HttpTransport::new());
//! let client = ClusterClient::new(
//!     transport,
//!     ClusterEndpoint::insecure("net-0", "https://net-0.example:8080"),
//!     "2024-07-01",
//! );
//! let info = client.network_info().await?;
//! println!("service status: {:?}", info.service_status);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod attestation;
mod cluster;
mod error;
mod governance;
mod poll;
mod signing;
mod transport;

pub use attestation::{AttestationVerifier, INSECURE_VIRTUAL_FORMAT, node_report};
pub use cluster::ClusterClient;
pub use error::{ClientError, Result};
pub use governance::{GovernanceClient, SIGNED_CONTENT_TYPE};
pub use poll::{PollPolicy, PollState, poll_until, poll_until_healthy};
pub use signing::{GovMessageType, GovernanceSigner, RecoveryShareDecryptor, SigningRequest};
pub use transport::{
    ClusterEndpoint, ClusterRequest, ClusterTransport, HttpTransport, Method, RawResponse,
    TRANSACTION_ID_HEADER, TrustAnchor,
};
