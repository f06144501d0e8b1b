//! Governance proposal, ballot, and transaction types.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Single action inside a proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalAction {
    /// Action name registered in the constitution, e.g. `remove_node`.
    pub name: String,
    /// Action arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<serde_json::Value>,
}

/// Batch of actions submitted as one proposal.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Proposal {
    /// Actions applied atomically when the proposal is accepted.
    pub actions: Vec<ProposalAction>,
}

impl Proposal {
    /// Creates a proposal holding a single action.
    pub fn single(name: impl Into<String>, args: Option<serde_json::Value>) -> Self {
        Self { actions: vec![ProposalAction { name: name.into(), args }] }
    }

    /// Names of the actions in submission order.
    pub fn action_names(&self) -> Vec<&str> {
        self.actions.iter().map(|a| a.name.as_str()).collect()
    }
}

/// Lifecycle state of a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProposalState {
    /// Awaiting ballots.
    Open,
    /// Accepted and applied.
    Accepted,
    /// Rejected by ballots.
    Rejected,
    /// Withdrawn by its proposer.
    Withdrawn,
    /// Resolution raised an error.
    Failed,
    /// Dropped by a constitution change.
    Dropped,
}

impl fmt::Display for ProposalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Proposal as returned by the governance API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalInfo {
    /// Proposal id.
    pub proposal_id: String,
    /// Current state.
    pub proposal_state: ProposalState,
    /// Remaining response fields.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Ballot script cast on a proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ballot {
    /// JavaScript ballot evaluated by the constitution.
    pub ballot: String,
}

impl Ballot {
    /// Ballot voting in favour unconditionally.
    pub fn accept() -> Self {
        Self { ballot: "export function vote (proposal, proposerId) { return true }".to_string() }
    }
}

/// Commit status of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionStatus {
    /// Node has no record of the transaction yet.
    Unknown,
    /// Transaction is replicated but not committed.
    Pending,
    /// Transaction is committed.
    Committed,
    /// Transaction was rolled back.
    Invalid,
}

impl TransactionStatus {
    /// Returns `true` while the status can still change.
    pub fn is_in_flight(self) -> bool {
        matches!(self, TransactionStatus::Unknown | TransactionStatus::Pending)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Response of the transaction status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionInfo {
    /// Transaction id, `{view}.{seqno}`.
    pub transaction_id: String,
    /// Commit status.
    pub status: TransactionStatus,
}

/// Encrypted recovery share published for a member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedShare {
    /// Base64-encoded share wrapped with the member encryption key.
    pub encrypted_share: String,
}

/// Recovery member generated by a confidential recovery service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryMember {
    /// PEM signing certificate of the member.
    pub signing_cert: String,
    /// PEM encryption public key of the member.
    pub encryption_public_key: String,
    /// Attestation data describing the recovery service.
    #[serde(default)]
    pub recovery_service: serde_json::Value,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_proposal_serializes_without_empty_args() {
        let proposal = Proposal::single("trigger_snapshot", None);
        let json = serde_json::to_value(&proposal).unwrap();
        assert_eq!(json, serde_json::json!({ "actions": [{ "name": "trigger_snapshot" }] }));
    }

    #[test]
    fn test_proposal_info_keeps_extra_fields() {
        let info: ProposalInfo = serde_json::from_str(
            r#"{ "proposalId": "abc", "proposalState": "Accepted", "ballotCount": 1 }"#,
        )
        .unwrap();
        assert_eq!(info.proposal_id, "abc");
        assert_eq!(info.proposal_state, ProposalState::Accepted);
        assert_eq!(info.extra["ballotCount"], 1);
    }

    #[test]
    fn test_transaction_status_in_flight() {
        assert!(TransactionStatus::Unknown.is_in_flight());
        assert!(TransactionStatus::Pending.is_in_flight());
        assert!(!TransactionStatus::Committed.is_in_flight());
        assert!(!TransactionStatus::Invalid.is_in_flight());
    }
}
