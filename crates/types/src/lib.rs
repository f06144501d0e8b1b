//! Core types and configuration for the consortium network orchestrator.
//!
//! This crate provides the foundational types shared by the client and
//! orchestrator crates:
//! - Network, node, and load balancer descriptors reported by providers
//! - Membership, node state, and consensus views reported by the cluster
//! - Governance proposals, ballots, and transaction status
//! - Node naming and ordinal allocation
//! - Validated configuration with TOML and environment loading

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod governance;
pub mod node_name;
pub mod types;

pub use config::ConfigError;
pub use governance::*;
pub use types::*;
