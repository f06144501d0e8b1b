//! Governance proposal protocol client.
//!
//! Each submission follows the same sequence:
//!
//! 1. Serialize the message body and have the [`GovernanceSigner`] wrap it in a signed envelope.
//! 2. `POST` the envelope. A non-success status fails with the response body as detail.
//! 3. If the response names a transaction, poll its status until `Committed`. `Invalid` or a
//!    deadline fails the call.
//! 4. Decode and return the response body.
//!
//! Submissions are never retried: a retried proposal can be recorded twice.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use consortium_types::{Ballot, Proposal, ProposalInfo, TransactionStatus};
use serde::Serialize;
use snafu::ResultExt;
use tracing::{debug, info};

use crate::{
    cluster::ClusterClient,
    error::{ClientError, JsonSnafu, Result, TransactionNotCommittedSnafu},
    poll::{PollPolicy, PollState, poll_until},
    signing::{GovMessageType, GovernanceSigner, SigningRequest},
    transport::RawResponse,
};

/// Content type of signed governance envelopes.
pub const SIGNED_CONTENT_TYPE: &str = "application/cose";

/// Submits signed governance messages and waits for them to commit.
#[derive(Clone)]
pub struct GovernanceClient {
    cluster: ClusterClient,
    signer: Arc<dyn GovernanceSigner>,
    commit: PollPolicy,
}

impl std::fmt::Debug for GovernanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GovernanceClient")
            .field("cluster", &self.cluster)
            .field("member_id", &self.signer.member_id())
            .field("commit", &self.commit)
            .finish()
    }
}

impl GovernanceClient {
    /// Creates a client submitting through `cluster` as the signer's member.
    pub fn new(cluster: ClusterClient, signer: Arc<dyn GovernanceSigner>, commit: PollPolicy) -> Self {
        Self { cluster, signer, commit }
    }

    /// Member id of the signing identity.
    pub fn member_id(&self) -> &str {
        self.signer.member_id()
    }

    /// Underlying cluster client.
    pub fn cluster(&self) -> &ClusterClient {
        &self.cluster
    }

    /// Submits a proposal and waits for it to commit.
    ///
    /// # Errors
    ///
    /// Returns a signing, transport, status, commit, or decode error.
    pub async fn create_proposal(&self, proposal: &Proposal) -> Result<ProposalInfo> {
        self.create_proposal_with_commit(proposal, self.commit).await
    }

    /// Submits a proposal and waits for it to commit within `commit`.
    ///
    /// # Errors
    ///
    /// Returns a signing, transport, status, commit, or decode error.
    pub async fn create_proposal_with_commit(
        &self,
        proposal: &Proposal,
        commit: PollPolicy,
    ) -> Result<ProposalInfo> {
        let path = self.cluster.gov_path("gov/members/proposals:create");
        let response = self.submit(&path, GovMessageType::Proposal, proposal, None, commit).await?;
        let info: ProposalInfo = response.json(&path)?;
        info!(
            proposal_id = %info.proposal_id,
            state = %info.proposal_state,
            actions = ?proposal.action_names(),
            "Proposal submitted"
        );
        Ok(info)
    }

    /// Casts a ballot on a proposal.
    ///
    /// # Errors
    ///
    /// Returns a signing, transport, status, commit, or decode error.
    pub async fn vote(&self, proposal_id: &str, ballot: &Ballot) -> Result<serde_json::Value> {
        let path = self.cluster.gov_path(&format!(
            "gov/members/proposals/{proposal_id}/ballots/{}:submit",
            self.member_id()
        ));
        let response =
            self.submit(&path, GovMessageType::Ballot, ballot, Some(proposal_id), self.commit).await?;
        info!(proposal_id, member_id = self.member_id(), "Ballot submitted");
        decode_value(&response, &path)
    }

    /// Submits a decrypted recovery share on behalf of `member_id`.
    ///
    /// # Errors
    ///
    /// Returns a signing, transport, status, commit, or decode error.
    pub async fn submit_recovery_share(&self, member_id: &str, share: &str) -> Result<serde_json::Value> {
        let path = self.cluster.gov_path(&format!("gov/recovery/members/{member_id}:recover"));
        let body = serde_json::json!({ "share": share });
        let response =
            self.submit(&path, GovMessageType::RecoveryShare, &body, None, self.commit).await?;
        info!(member_id, "Recovery share submitted");
        decode_value(&response, &path)
    }

    /// Polls a transaction until it commits.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::TransactionNotCommitted`](crate::ClientError::TransactionNotCommitted)
    /// if the transaction becomes invalid, or a timeout.
    pub async fn wait_for_commit(&self, transaction_id: &str, commit: PollPolicy) -> Result<()> {
        let what = format!("transaction {transaction_id} to commit");
        let cluster = &self.cluster;
        let status = poll_until::<_, ClientError, _, _>(&what, commit, || async move {
            let info = cluster.transaction_status(transaction_id).await?;
            if info.status.is_in_flight() {
                Ok(PollState::pending(info.status))
            } else {
                Ok(PollState::Ready(info.status))
            }
        })
        .await?;

        if status != TransactionStatus::Committed {
            return TransactionNotCommittedSnafu { transaction_id, status: status.to_string() }.fail();
        }
        debug!(transaction_id, "Transaction committed");
        Ok(())
    }

    async fn submit<B: Serialize + ?Sized>(
        &self,
        path: &str,
        message_type: GovMessageType,
        body: &B,
        proposal_id: Option<&str>,
        commit: PollPolicy,
    ) -> Result<RawResponse> {
        let payload = serde_json::to_vec(body).context(JsonSnafu { path })?;
        let envelope = self
            .signer
            .sign(SigningRequest { message_type, payload: &payload, proposal_id, created_at: Utc::now() })
            .await?;

        let response = self.cluster.post(path, Bytes::from(envelope), SIGNED_CONTENT_TYPE).await?;
        if let Some(transaction_id) = response.transaction_id.as_deref() {
            self.wait_for_commit(transaction_id, commit).await?;
        }
        Ok(response)
    }
}

/// Decodes a body as JSON, treating an empty body as `null`.
fn decode_value(response: &RawResponse, path: &str) -> Result<serde_json::Value> {
    if response.body.is_empty() {
        return Ok(serde_json::Value::Null);
    }
    response.json(path)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::{collections::VecDeque, time::Duration};

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::transport::{ClusterEndpoint, ClusterRequest, ClusterTransport};

    /// Transport replaying scripted responses and recording requests.
    #[derive(Default)]
    struct Scripted {
        responses: Mutex<VecDeque<RawResponse>>,
        seen: Mutex<Vec<ClusterRequest>>,
    }

    impl Scripted {
        fn push(&self, status: u16, tx: Option<&str>, body: &str) {
            self.responses.lock().push_back(RawResponse {
                status,
                transaction_id: tx.map(str::to_owned),
                body: Bytes::from(body.to_owned()),
            });
        }
    }

    #[async_trait]
    impl ClusterTransport for Scripted {
        async fn send(&self, _endpoint: &ClusterEndpoint, request: ClusterRequest) -> Result<RawResponse> {
            self.seen.lock().push(request);
            Ok(self.responses.lock().pop_front().unwrap_or_else(|| RawResponse::new(500, "unscripted")))
        }
    }

    struct PlainSigner;

    #[async_trait]
    impl GovernanceSigner for PlainSigner {
        fn member_id(&self) -> &str {
            "m0"
        }

        async fn sign(&self, request: SigningRequest<'_>) -> Result<Vec<u8>> {
            let mut out = request.message_type.as_str().as_bytes().to_vec();
            out.push(b'|');
            out.extend_from_slice(request.payload);
            Ok(out)
        }
    }

    fn governance(transport: &Arc<Scripted>) -> GovernanceClient {
        let cluster = ClusterClient::new(
            Arc::clone(transport) as Arc<dyn ClusterTransport>,
            ClusterEndpoint::insecure("lb", "https://lb"),
            "2024-07-01",
        );
        GovernanceClient::new(
            cluster,
            Arc::new(PlainSigner),
            PollPolicy::new(Duration::from_secs(2), Duration::from_millis(10)),
        )
    }

    const ACCEPTED: &str = r#"{"proposalId":"p1","proposalState":"Accepted"}"#;

    #[tokio::test]
    async fn test_proposal_waits_for_commit() {
        let transport = Arc::new(Scripted::default());
        transport.push(200, Some("2.10"), ACCEPTED);
        transport.push(200, None, r#"{"transactionId":"2.10","status":"Pending"}"#);
        transport.push(200, None, r#"{"transactionId":"2.10","status":"Committed"}"#);

        let info = governance(&transport)
            .create_proposal(&Proposal::single("trigger_snapshot", None))
            .await
            .unwrap();
        assert_eq!(info.proposal_id, "p1");

        let seen = transport.seen.lock();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].path, "gov/members/proposals:create?api-version=2024-07-01");
        assert_eq!(seen[0].content_type, Some(SIGNED_CONTENT_TYPE));
        let body = seen[0].body.clone().unwrap();
        assert!(body.starts_with(b"proposal|"));
        assert_eq!(seen[1].path, "gov/tx?transaction_id=2.10&api-version=2024-07-01");
    }

    #[tokio::test]
    async fn test_invalid_transaction_fails() {
        let transport = Arc::new(Scripted::default());
        transport.push(200, Some("2.11"), ACCEPTED);
        transport.push(200, None, r#"{"transactionId":"2.11","status":"Invalid"}"#);

        let err = governance(&transport)
            .create_proposal(&Proposal::single("trigger_snapshot", None))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::TransactionNotCommitted { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn test_rejected_submission_surfaces_body_and_is_not_retried() {
        let transport = Arc::new(Scripted::default());
        transport.push(400, None, "ProposalFailedToValidate: bad args");

        let err = governance(&transport)
            .create_proposal(&Proposal::single("remove_node", None))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(400));
        assert!(err.to_string().contains("bad args"));
        assert_eq!(transport.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_no_transaction_header_skips_commit_wait() {
        let transport = Arc::new(Scripted::default());
        transport.push(200, None, ACCEPTED);

        governance(&transport).create_proposal(&Proposal::single("trigger_snapshot", None)).await.unwrap();
        assert_eq!(transport.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_vote_targets_member_ballot_path() {
        let transport = Arc::new(Scripted::default());
        transport.push(200, None, "");

        let result = governance(&transport).vote("p1", &Ballot::accept()).await.unwrap();
        assert!(result.is_null());
        let seen = transport.seen.lock();
        assert_eq!(seen[0].path, "gov/members/proposals/p1/ballots/m0:submit?api-version=2024-07-01");
        assert!(seen[0].body.clone().unwrap().starts_with(b"ballot|"));
    }

    #[tokio::test]
    async fn test_recovery_share_returns_message() {
        let transport = Arc::new(Scripted::default());
        transport.push(200, None, r#"{"message":"1/1 recovery shares successfully submitted. End of recovery procedure initiated."}"#);

        let result = governance(&transport).submit_recovery_share("m0", "c2hhcmU=").await.unwrap();
        assert!(result["message"].as_str().unwrap().contains("End of recovery procedure initiated"));
        let seen = transport.seen.lock();
        assert_eq!(seen[0].path, "gov/recovery/members/m0:recover?api-version=2024-07-01");
        assert!(seen[0].body.clone().unwrap().starts_with(b"recovery_share|"));
    }
}
