//! Test doubles for the consortium orchestrator.
//!
//! - [`FakeConsortium`]: one in-memory network serving the node provider, load balancer, recovery
//!   agent, and cluster HTTP seams from shared state
//! - [`FakeSigner`], [`FakeDecryptor`]: governance signing and share decryption stand-ins

#![deny(unsafe_code)]

mod consortium;
mod signing;

pub use consortium::{COMPLETE_AGENT_RESPONSE, COMPLETE_SHARE_RESPONSE, Event, FakeConsortium, MEMBER_ID};
pub use signing::{FakeDecryptor, FakeSigner};
