//! Single-proposal governance operations, join policies, and attestation
//! reports.
//!
//! Everything here talks to the network through its load balancer and
//! trusts the service certificate the load balancer serves.

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use consortium_client::{AttestationVerifier, ClientError, node_report};
use consortium_types::{
    Ballot, NodeReport, PolicyCreationOption, Proposal, ProposalInfo, ProposalState, RecoveryServiceEndpoint,
};
use serde_json::{Value, json};
use snafu::OptionExt;
use tracing::info;

use crate::{
    error::{CapabilityNotConfiguredSnafu, InvalidArgumentSnafu, ProposalNotAcceptedSnafu, Result},
    network::NetworkOrchestrator,
    provider::NetworkScope,
};

/// Reads the host data entries of a join policy.
///
/// The policy lists accepted SNP host data as the keys of `snp.hostData`.
/// Anything else yields an empty list.
pub fn host_data_from_join_policy(join_policy: &Value) -> Vec<String> {
    join_policy
        .pointer("/snp/hostData")
        .and_then(Value::as_object)
        .map(|host_data| host_data.keys().cloned().collect())
        .unwrap_or_default()
}

/// Verifier used when none is configured; rejects every hardware quote.
struct Unverifiable;

#[async_trait]
impl AttestationVerifier for Unverifiable {
    async fn verify_snp_attestation(&self, _evidence: &str, _endorsements: &str) -> consortium_client::Result<String> {
        Err(ClientError::Attestation {
            node_id: String::new(),
            message: "no attestation verifier is configured".to_owned(),
        })
    }
}

impl NetworkOrchestrator {
    /// Submits a single-action proposal through the load balancer and waits
    /// for it to commit.
    async fn propose(&self, scope: NetworkScope<'_>, action: &str, args: Option<Value>) -> Result<ProposalInfo> {
        let (client, _) = self.load_balancer_client(scope).await?;
        let info = self.governance(client)?.create_proposal(&Proposal::single(action, args)).await?;
        info!(network = scope.name, action, proposal_id = %info.proposal_id, state = %info.proposal_state, "Proposal committed");
        Ok(info)
    }

    /// Asks the service to produce a snapshot.
    ///
    /// # Errors
    ///
    /// Returns a signing, provider, or cluster error.
    pub async fn trigger_snapshot(&self, scope: NetworkScope<'_>) -> Result<ProposalInfo> {
        self.propose(scope, "trigger_snapshot", None).await
    }

    /// Opens a recovered service.
    ///
    /// The next service identity is the certificate the load balancer
    /// currently serves; `previous_service_certificate` is the identity of
    /// the network before recovery, if known.
    ///
    /// # Errors
    ///
    /// Returns a signing, provider, or cluster error.
    pub async fn transition_service_to_open(
        &self,
        scope: NetworkScope<'_>,
        previous_service_certificate: Option<&str>,
    ) -> Result<ProposalInfo> {
        let (client, next_service_identity) = self.load_balancer_client(scope).await?;
        let mut args = json!({ "next_service_identity": next_service_identity });
        if let Some(previous) = previous_service_certificate {
            args["previous_service_identity"] = json!(previous);
        }
        let info = self
            .governance(client)?
            .create_proposal(&Proposal::single("transition_service_to_open", Some(args)))
            .await?;
        info!(network = scope.name, proposal_id = %info.proposal_id, "Service transition to open committed");
        Ok(info)
    }

    /// Admits nodes reporting `host_data`.
    ///
    /// `security_policy` is the base64-encoded policy the host data digests;
    /// without it an empty policy is recorded.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::InvalidArgument`](crate::OrchestratorError::InvalidArgument)
    /// if the policy is not valid base64 UTF-8, or a signing, provider, or
    /// cluster error.
    pub async fn add_snp_host_data(
        &self,
        scope: NetworkScope<'_>,
        host_data: &str,
        security_policy: Option<&str>,
    ) -> Result<ProposalInfo> {
        let security_policy = match security_policy {
            Some(encoded) => decode_policy(encoded)?,
            None => String::new(),
        };
        self.propose(
            scope,
            "add_snp_host_data",
            Some(json!({ "host_data": host_data, "security_policy": security_policy })),
        )
        .await
    }

    /// Stops admitting nodes reporting `host_data`.
    ///
    /// # Errors
    ///
    /// Returns a signing, provider, or cluster error.
    pub async fn remove_snp_host_data(&self, scope: NetworkScope<'_>, host_data: &str) -> Result<ProposalInfo> {
        self.propose(scope, "remove_snp_host_data", Some(json!({ "host_data": host_data }))).await
    }

    /// Sets how many recovery shares are needed to recover the service.
    ///
    /// # Errors
    ///
    /// Returns a signing, provider, or cluster error.
    pub async fn set_recovery_threshold(&self, scope: NetworkScope<'_>, threshold: u32) -> Result<ProposalInfo> {
        self.propose(scope, "set_recovery_threshold", Some(json!({ "recovery_threshold": threshold }))).await
    }

    // =========================================================================
    // Policies
    // =========================================================================

    /// Reads the join policy of a running network.
    ///
    /// # Errors
    ///
    /// Returns a provider or cluster error.
    pub async fn join_policy(&self, scope: NetworkScope<'_>) -> Result<Value> {
        let (client, _) = self.load_balancer_client(scope).await?;
        Ok(client.join_policy().await?)
    }

    /// Builds the join policy a recovery service needs to admit the nodes
    /// of a running network: `{"snp": {"hostData": [...]}}`.
    ///
    /// # Errors
    ///
    /// Returns a provider or cluster error.
    pub async fn generate_join_policy_for_network(&self, scope: NetworkScope<'_>) -> Result<Value> {
        let policy = self.join_policy(scope).await?;
        Ok(json!({ "snp": { "hostData": host_data_from_join_policy(&policy) } }))
    }

    /// Pushes the join policy of a running network to a recovery service.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::CapabilityNotConfigured`](crate::OrchestratorError::CapabilityNotConfigured)
    /// without a recovery agent, or a provider or cluster error.
    pub async fn set_recovery_service_join_policy(
        &self,
        scope: NetworkScope<'_>,
        service: &RecoveryServiceEndpoint,
    ) -> Result<()> {
        let agent = self.require_recovery_agent()?;
        let policy = self.generate_join_policy_for_network(scope).await?;
        agent.set_network_join_policy(scope, service, &policy).await?;
        Ok(())
    }

    /// Produces a join policy for new networks.
    ///
    /// # Errors
    ///
    /// Returns a provider error.
    pub async fn generate_join_policy(&self, option: PolicyCreationOption) -> Result<Value> {
        Ok(self.node_provider.generate_join_policy(option).await?)
    }

    /// Produces the enforcement policy for new nodes.
    ///
    /// # Errors
    ///
    /// Returns a provider error.
    pub async fn generate_security_policy(&self, option: PolicyCreationOption) -> Result<Value> {
        Ok(self.node_provider.generate_security_policy(option).await?)
    }

    // =========================================================================
    // Attestation
    // =========================================================================

    /// Reports the host data of every node's attestation quote.
    ///
    /// Placeholder quotes are read without a verifier; hardware quotes need
    /// one.
    ///
    /// # Errors
    ///
    /// Returns a provider or cluster error, or an attestation error for a
    /// quote that cannot be verified.
    pub async fn get_reports(&self, scope: NetworkScope<'_>) -> Result<Vec<NodeReport>> {
        let (client, _) = self.load_balancer_client(scope).await?;
        let quotes = client.quotes().await?;
        let verifier: &dyn AttestationVerifier = match &self.attestation_verifier {
            Some(verifier) => verifier.as_ref(),
            None => &Unverifiable,
        };
        let mut reports = Vec::with_capacity(quotes.len());
        for quote in &quotes {
            reports.push(node_report(quote, verifier).await?);
        }
        Ok(reports)
    }

    // =========================================================================
    // Recovery members
    // =========================================================================

    /// Submits the recovery share of the signing member.
    ///
    /// Without `share`, the member's encrypted share is fetched and
    /// unwrapped with the configured decryptor. Returns the submission
    /// response.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::SigningNotConfigured`](crate::OrchestratorError::SigningNotConfigured),
    /// [`OrchestratorError::CapabilityNotConfigured`](crate::OrchestratorError::CapabilityNotConfigured)
    /// if a share must be decrypted without a decryptor, or a provider or
    /// cluster error.
    pub async fn submit_recovery_share(&self, scope: NetworkScope<'_>, share: Option<&str>) -> Result<Value> {
        let (client, _) = self.load_balancer_client(scope).await?;
        let governance = self.governance(client)?;
        let member_id = governance.member_id().to_owned();

        let share = match share {
            Some(share) => share.to_owned(),
            None => {
                let decryptor = self
                    .share_decryptor
                    .as_ref()
                    .context(CapabilityNotConfiguredSnafu { capability: "recovery share decryptor" })?;
                let encrypted = governance.cluster().encrypted_share(&member_id).await?;
                decryptor.decrypt_share(&encrypted).await?
            },
        };
        Ok(governance.submit_recovery_share(&member_id, &share).await?)
    }

    /// Registers a confidential recovery service as a recovery member and
    /// activates it.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::ProposalNotAccepted`](crate::OrchestratorError::ProposalNotAccepted)
    /// if the membership proposal is not accepted after voting,
    /// [`OrchestratorError::CapabilityNotConfigured`](crate::OrchestratorError::CapabilityNotConfigured)
    /// without a recovery agent, or a signing, provider, or cluster error.
    pub async fn configure_confidential_recovery(
        &self,
        scope: NetworkScope<'_>,
        member_name: &str,
        service: &RecoveryServiceEndpoint,
    ) -> Result<()> {
        let agent = self.require_recovery_agent()?;
        let member = agent.generate_recovery_member(scope, member_name, service).await?;
        info!(network = scope.name, member = member_name, "Recovery member generated");

        let proposal = Proposal::single(
            "set_member",
            Some(json!({
                "cert": member.signing_cert,
                "encryption_pub_key": member.encryption_public_key,
                "recovery_role": "Owner",
                "member_data": {
                    "identifier": member_name,
                    "isRecoveryOperator": true,
                    "recoveryService": member.recovery_service,
                },
            })),
        );
        let (client, _) = self.load_balancer_client(scope).await?;
        let governance = self.governance(client)?;
        let mut info = governance.create_proposal(&proposal).await?;
        if info.proposal_state == ProposalState::Open {
            let response = governance.vote(&info.proposal_id, &Ballot::accept()).await?;
            info = serde_json::from_value(response).map_err(|source| ClientError::Json {
                path: format!("ballot on {}", info.proposal_id),
                source,
                location: snafu::location!(),
            })?;
        }
        snafu::ensure!(
            info.proposal_state == ProposalState::Accepted,
            ProposalNotAcceptedSnafu { proposal_id: info.proposal_id.as_str(), state: info.proposal_state.to_string() }
        );

        agent.activate_recovery_member(scope, member_name, service).await?;
        info!(network = scope.name, member = member_name, "Recovery member activated");
        Ok(())
    }
}

fn decode_policy(encoded: &str) -> Result<String> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| InvalidArgumentSnafu { message: format!("security policy is not base64: {e}") }.build())?;
    String::from_utf8(bytes)
        .map_err(|e| InvalidArgumentSnafu { message: format!("security policy is not UTF-8: {e}") }.build())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::OrchestratorError;

    #[test]
    fn test_host_data_from_join_policy() {
        let policy = json!({
            "snp": { "hostData": { "aa11": "policy-a", "bb22": "" }, "measurements": [] },
            "sgx": {},
        });
        assert_eq!(host_data_from_join_policy(&policy), vec!["aa11".to_owned(), "bb22".to_owned()]);
    }

    #[test]
    fn test_host_data_missing_is_empty() {
        assert!(host_data_from_join_policy(&json!({ "sgx": {} })).is_empty());
        assert!(host_data_from_join_policy(&json!({ "snp": { "hostData": [] } })).is_empty());
    }

    #[test]
    fn test_decode_policy() {
        assert_eq!(decode_policy(&STANDARD.encode("package policy")).unwrap(), "package policy");
        assert!(matches!(decode_policy("not base64!"), Err(OrchestratorError::InvalidArgument { .. })));
    }
}
