//! Governance message signing and recovery share decryption.
//!
//! The orchestrator never holds member keys. Signing envelopes and
//! unwrapping encrypted recovery shares are delegated to these traits.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;

/// Governance message kinds a member can sign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GovMessageType {
    /// New proposal.
    Proposal,
    /// Acknowledgement of a state digest.
    Ack,
    /// Request for the member state digest.
    StateDigest,
    /// Ballot on an open proposal.
    Ballot,
    /// Recovery share submission.
    RecoveryShare,
    /// Proposal withdrawal.
    Withdrawal,
}

impl GovMessageType {
    /// Wire name placed in the signed envelope header.
    pub fn as_str(self) -> &'static str {
        match self {
            GovMessageType::Proposal => "proposal",
            GovMessageType::Ack => "ack",
            GovMessageType::StateDigest => "state_digest",
            GovMessageType::Ballot => "ballot",
            GovMessageType::RecoveryShare => "recovery_share",
            GovMessageType::Withdrawal => "withdrawal",
        }
    }
}

impl fmt::Display for GovMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload to be wrapped in a signed envelope.
#[derive(Debug, Clone, Copy)]
pub struct SigningRequest<'a> {
    /// Message kind.
    pub message_type: GovMessageType,
    /// Serialized message body.
    pub payload: &'a [u8],
    /// Proposal the message refers to, for ballots and withdrawals.
    pub proposal_id: Option<&'a str>,
    /// Creation time placed in the envelope header.
    pub created_at: DateTime<Utc>,
}

/// Member identity able to sign governance messages.
#[async_trait]
pub trait GovernanceSigner: Send + Sync {
    /// Member id of the signing identity.
    fn member_id(&self) -> &str;

    /// Wraps the payload in a signed envelope.
    async fn sign(&self, request: SigningRequest<'_>) -> Result<Vec<u8>>;
}

/// Unwraps a recovery share encrypted to the member encryption key.
#[async_trait]
pub trait RecoveryShareDecryptor: Send + Sync {
    /// Returns the base64-encoded plain share.
    async fn decrypt_share(&self, encrypted_share: &str) -> Result<String>;
}
