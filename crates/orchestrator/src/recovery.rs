//! Disaster recovery from retained ledgers.
//!
//! Recovery is a fixed sequence with no rollback:
//!
//! 1. Delete the network while keeping its storage.
//! 2. Start one recover node per candidate ledger and let each replay the public ledger.
//! 3. Keep the node that got furthest (highest signed sequence number) and delete the others.
//! 4. Join fresh nodes to it and put a load balancer in front.
//! 5. Open the service under its new identity.
//! 6. Submit a recovery share, which must finish the recovery in one step.
//! 7. Wait for the recovered node to rejoin as a full member, then drop retired membership records.
//!
//! A failure at any step leaves the network where that step stopped.

use consortium_types::{
    DeleteOption, Network, NodeEndpoint, NodeState, RecoveryCandidate, RecoveryServiceEndpoint,
    node_name::load_balancer_name,
};
use futures::future::join_all;
use serde_json::Value;
use snafu::{OptionExt, ensure};
use tracing::info;

use crate::{
    error::{InvalidArgumentSnafu, RecoveryIncompleteSnafu, Result},
    network::{NetworkOrchestrator, NetworkRequest},
    provider::{NetworkScope, NodeTemplate},
};

/// Phrase confirming that a recovery service submitted the full recovery key.
pub const RECOVERY_KEY_SUBMITTED: &str = "Full recovery key successfully submitted";

/// Phrase confirming that the final recovery share was accepted.
pub const END_OF_RECOVERY: &str = "End of recovery procedure initiated";

/// Index of the candidate whose ledger progressed furthest.
///
/// Among equal sequence numbers the earliest candidate wins. Returns `None`
/// for an empty slice.
pub fn select_recovery_root(candidates: &[RecoveryCandidate]) -> Option<usize> {
    candidates
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, u64)>, (index, candidate)| match best {
            Some((_, seqno)) if seqno >= candidate.last_signed_seqno => best,
            _ => Some((index, candidate.last_signed_seqno)),
        })
        .map(|(index, _)| index)
}

fn response_message(response: &Value) -> &str {
    response.get("message").and_then(Value::as_str).unwrap_or_default()
}

/// Public network rebuilt from the best retained ledger.
struct PublicNetwork {
    network: Network,
    root: NodeEndpoint,
}

impl NetworkOrchestrator {
    /// Rebuilds the public part of a network from the retained ledgers of
    /// `network_to_recover`.
    ///
    /// Every candidate ledger gets a recover node; the one with the highest
    /// signed sequence number becomes the root and the others are deleted.
    /// The remaining `node_count - 1` nodes join the root and a load
    /// balancer is created over all of them.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::InvalidArgument`](crate::OrchestratorError::InvalidArgument)
    /// for a zero node count or when no candidate ledger exists, or a
    /// provider, cluster, or timeout error.
    pub async fn recover_public_network(
        &self,
        request: &NetworkRequest,
        network_to_recover: &str,
        previous_service_certificate: &str,
    ) -> Result<Network> {
        Ok(self.rebuild_public_network(request, network_to_recover, previous_service_certificate).await?.network)
    }

    async fn rebuild_public_network(
        &self,
        request: &NetworkRequest,
        network_to_recover: &str,
        previous_service_certificate: &str,
    ) -> Result<PublicNetwork> {
        ensure!(
            request.node_count >= 1,
            InvalidArgumentSnafu { message: "node count cannot be less than 1" }
        );
        let scope = request.scope();
        let template = self.node_template(request);

        let names = self
            .node_provider
            .candidate_recovery_nodes(NetworkScope::new(network_to_recover, request.provider_config.as_ref()))
            .await?;
        ensure!(
            !names.is_empty(),
            InvalidArgumentSnafu { message: format!("network {network_to_recover} has no retained ledgers") }
        );
        info!(network = scope.name, network_to_recover, candidates = ?names, "Starting recover nodes");

        let recoveries = names
            .iter()
            .map(|name| self.start_recover_node(&template, name, network_to_recover, previous_service_certificate));
        let mut candidates = join_all(recoveries).await.into_iter().collect::<Result<Vec<_>>>()?;

        let root_index = select_recovery_root(&candidates)
            .context(InvalidArgumentSnafu { message: "no recover node reached the public network" })?;
        let root = candidates.swap_remove(root_index);
        info!(
            network = scope.name,
            node = %root.endpoint.node_name,
            last_signed_seqno = root.last_signed_seqno,
            "Selected recovery root"
        );

        let deletions = candidates.iter().map(|c| {
            info!(node = %c.endpoint.node_name, last_signed_seqno = c.last_signed_seqno, "Deleting recovery candidate");
            self.node_provider.delete_node(scope, &c.endpoint.node_name, &c.node.node_data)
        });
        for result in join_all(deletions).await {
            result?;
        }

        let ordinal = self.next_ordinal(scope).await?;
        let joined = self
            .create_join_nodes(
                &template,
                request.node_count - 1,
                ordinal,
                &root.endpoint,
                &root.service_certificate,
                NodeState::PartOfPublicNetwork,
            )
            .await?;

        let servers: Vec<String> = std::iter::once(root.endpoint.client_rpc_address.clone())
            .chain(joined.into_iter().map(|n| n.client_rpc_address))
            .collect();
        let lb_name = load_balancer_name(&request.network_name);
        let lb = self.load_balancer.create(&lb_name, scope, &servers).await?;
        self.wait_for_load_balancer_ready(&lb, &root.service_certificate).await?;

        info!(network = scope.name, endpoint = %lb.endpoint, "Public network recovered");
        Ok(PublicNetwork {
            network: Network {
                name: request.network_name.clone(),
                infra_type: self.node_provider.infra_type(),
                node_count: servers.len(),
                endpoint: lb.endpoint,
                nodes: servers,
            },
            root: root.endpoint,
        })
    }

    /// Creates a recover node and waits until it has replayed the public
    /// ledger.
    async fn start_recover_node(
        &self,
        template: &NodeTemplate,
        name: &str,
        network_to_recover: &str,
        previous_service_certificate: &str,
    ) -> Result<RecoveryCandidate> {
        let endpoint = self
            .node_provider
            .create_recover_node(&template.spec(name), network_to_recover, previous_service_certificate)
            .await?;
        let service_certificate = self
            .service_certificate(&endpoint.node_name, &endpoint.client_rpc_address, Some((template.scope(), name)))
            .await?;
        let (node, last_signed_seqno) = self
            .wait_for_recover_node_ready(
                &endpoint,
                &service_certificate,
                NodeState::PartOfPublicNetwork,
                self.timeouts().recovery_readiness,
            )
            .await?;
        info!(node = name, node_id = %node.node_id, last_signed_seqno, "Recover node replayed public ledger");
        Ok(RecoveryCandidate { endpoint, node, last_signed_seqno, service_certificate })
    }

    /// Recovers a network with a recovery share held by the signing member.
    ///
    /// `share` is the plain base64 share; without it the member's encrypted
    /// share is unwrapped with the configured decryptor.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::SigningNotConfigured`](crate::OrchestratorError::SigningNotConfigured),
    /// [`OrchestratorError::RecoveryIncomplete`](crate::OrchestratorError::RecoveryIncomplete)
    /// if one share did not finish the recovery, or a provider, cluster, or
    /// timeout error.
    pub async fn recover_network(
        &self,
        request: &NetworkRequest,
        previous_service_certificate: &str,
        share: Option<&str>,
    ) -> Result<Network> {
        let public = self.open_recovered_service(request, previous_service_certificate).await?;

        let response = self.submit_recovery_share(request.scope(), share).await?;
        let message = response_message(&response);
        ensure!(message.contains(END_OF_RECOVERY), RecoveryIncompleteSnafu { message });

        self.finish_recovery(request, public).await
    }

    /// Recovers a network whose recovery share is held by a confidential
    /// recovery service.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::CapabilityNotConfigured`](crate::OrchestratorError::CapabilityNotConfigured)
    /// without a recovery agent, [`OrchestratorError::RecoveryIncomplete`](crate::OrchestratorError::RecoveryIncomplete)
    /// if the service did not finish the recovery, or the errors of
    /// [`Self::recover_network`].
    pub async fn recover_confidential_network(
        &self,
        request: &NetworkRequest,
        previous_service_certificate: &str,
        member_name: &str,
        service: &RecoveryServiceEndpoint,
    ) -> Result<Network> {
        let agent = self.require_recovery_agent()?;
        let public = self.open_recovered_service(request, previous_service_certificate).await?;

        let response = agent.submit_recovery_share(request.scope(), member_name, service).await?;
        let message = response_message(&response);
        ensure!(
            message.contains(RECOVERY_KEY_SUBMITTED) && message.contains(END_OF_RECOVERY),
            RecoveryIncompleteSnafu { message }
        );

        self.finish_recovery(request, public).await
    }

    /// Steps shared by both recovery flows up to the share submission.
    async fn open_recovered_service(
        &self,
        request: &NetworkRequest,
        previous_service_certificate: &str,
    ) -> Result<PublicNetwork> {
        self.require_signer()?;
        let scope = request.scope();

        info!(network = scope.name, "Deleting network, retaining storage");
        self.delete_network(scope, DeleteOption::RetainStorage).await?;

        let public =
            self.rebuild_public_network(request, &request.network_name, previous_service_certificate).await?;
        self.transition_service_to_open(scope, Some(previous_service_certificate)).await?;
        Ok(public)
    }

    /// Waits for the recovery root to become a full member and drops the
    /// records of nodes retired by the recovery.
    async fn finish_recovery(&self, request: &NetworkRequest, public: PublicNetwork) -> Result<Network> {
        let scope = request.scope();
        let root = &public.root;
        let service_certificate = self
            .service_certificate(&root.node_name, &root.client_rpc_address, Some((scope, root.node_name.as_str())))
            .await?;
        self.wait_for_recover_node_ready(root, &service_certificate, NodeState::PartOfNetwork, self.timeouts().node_state)
            .await?;

        let client = self.service_client(&root.node_name, &root.client_rpc_address, &service_certificate);
        self.cleanup_retired_nodes_post_recovery(&client).await?;

        info!(network = scope.name, endpoint = %public.network.endpoint, "Network recovered");
        Ok(public.network)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use consortium_types::{MembershipStatus, NetworkNode, NodeData};

    use super::*;

    fn candidate(name: &str, seqno: u64) -> RecoveryCandidate {
        RecoveryCandidate {
            endpoint: NodeEndpoint {
                node_name: name.to_owned(),
                client_rpc_address: format!("https://{name}:8080"),
                node_endorsed_rpc_address: String::new(),
            },
            node: NetworkNode {
                node_id: format!("id-{name}"),
                status: MembershipStatus::Trusted,
                primary: false,
                node_data: NodeData { id: name.to_owned(), name: name.to_owned(), infra_provider_data: None },
                last_written: 0,
                rpc_interfaces: None,
            },
            last_signed_seqno: seqno,
            service_certificate: String::new(),
        }
    }

    #[test]
    fn test_root_is_highest_seqno() {
        let candidates = [candidate("a", 100), candidate("b", 250), candidate("c", 90)];
        assert_eq!(select_recovery_root(&candidates), Some(1));
    }

    #[test]
    fn test_root_ties_prefer_first() {
        let candidates = [candidate("a", 7), candidate("b", 9), candidate("c", 9)];
        assert_eq!(select_recovery_root(&candidates), Some(1));
    }

    #[test]
    fn test_root_of_nothing() {
        assert_eq!(select_recovery_root(&[]), None);
    }

    #[test]
    fn test_response_message() {
        let response = serde_json::json!({ "message": "1/1 recovery shares successfully submitted. End of recovery procedure initiated." });
        assert!(response_message(&response).contains(END_OF_RECOVERY));
        assert_eq!(response_message(&serde_json::json!({})), "");
    }
}
