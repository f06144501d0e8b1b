//! Waits that take a freshly created node to a usable state.
//!
//! A joining node moves through [`JoinPhase`]s:
//!
//! ```text
//! Created -> HealthCheck -> [AwaitingNetworkAppearance -> [AwaitingTrust]] -> AwaitingTargetState -> Ready
//! ```
//!
//! The bracketed phases only happen when the service is already open: an
//! open service admits new nodes as `Pending`, and a governance proposal has
//! to trust them before they finish joining. Every wait is bounded by a
//! [`TimeoutConfig`](consortium_types::config::TimeoutConfig) budget, and
//! waits on a node the provider can observe run its health check between
//! attempts so that a crashed node fails fast.

use std::{fmt, future::Future, time::Duration};

use chrono::{SecondsFormat, Utc};
use consortium_client::{ClusterClient, ClusterEndpoint, PollPolicy, PollState, poll_until, poll_until_healthy};
use consortium_types::{
    LoadBalancerEndpoint, MembershipStatus, NetworkInfo, NetworkNode, NetworkNodeList, NodeEndpoint, NodeState,
    NodeStateReport, Proposal, SelfSignedCertificate, ServiceStatus,
    node_name::{node_name, to_id},
};
use futures::future::join_all;
use serde_json::json;
use tracing::{debug, info};

use crate::{
    error::{OrchestratorError, Result},
    network::NetworkOrchestrator,
    provider::{JoinTarget, NetworkScope, NodeTemplate},
};

/// Step of bringing a new node into a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinPhase {
    /// The provider was asked to create the node.
    Created,
    /// The provider reports on the node's health.
    HealthCheck,
    /// Waiting for the node to be listed by the target node.
    AwaitingNetworkAppearance,
    /// Waiting for the trust proposal to commit.
    AwaitingTrust,
    /// Waiting for the node to report the target state.
    AwaitingTargetState,
    /// The node reached the target state.
    Ready,
}

impl fmt::Display for JoinPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

fn enter(node: &str, phase: JoinPhase) {
    info!(node, %phase, "Join phase");
}

/// Node whose provider health is checked between poll attempts.
pub(crate) type Watched<'a> = Option<(NetworkScope<'a>, &'a str)>;

// ============================================================================
// Poll helpers
// ============================================================================

/// Polls a probe whose error converts into [`OrchestratorError`].
pub(crate) async fn wait_until<T, PE, P, Fut>(what: &str, policy: PollPolicy, mut probe: P) -> Result<T>
where
    OrchestratorError: From<PE>,
    P: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<PollState<T>, PE>>,
{
    poll_until(what, policy, || {
        let attempt = probe();
        async move { attempt.await.map_err(OrchestratorError::from) }
    })
    .await
}

impl NetworkOrchestrator {
    async fn watch(&self, watched: Watched<'_>) -> Result<()> {
        match watched {
            Some((scope, node)) => self.check_node_healthy(scope, node).await,
            None => Ok(()),
        }
    }

    /// Like [`wait_until`], running the provider health check of `watched`
    /// before every retry.
    pub(crate) async fn wait_until_healthy<T, PE, P, Fut>(
        &self,
        what: &str,
        timeout: Duration,
        watched: Watched<'_>,
        mut probe: P,
    ) -> Result<T>
    where
        OrchestratorError: From<PE>,
        P: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<PollState<T>, PE>>,
    {
        poll_until_healthy(
            what,
            self.policy(timeout),
            || {
                let attempt = probe();
                async move { attempt.await.map_err(OrchestratorError::from) }
            },
            || self.watch(watched),
        )
        .await
    }

    // =========================================================================
    // Certificates
    // =========================================================================

    /// Fetches the service certificate from an endpoint that may still be
    /// starting.
    pub(crate) async fn service_certificate(&self, name: &str, url: &str, watched: Watched<'_>) -> Result<String> {
        let client = &self.insecure_client(name, url);
        let what = format!("{name}: {url}/node/network");
        self.wait_until_healthy(&what, self.timeouts().certificate, watched, || async move {
            Ok::<_, OrchestratorError>(
                client.probe_json::<NetworkInfo>("/node/network").await?.map(|info| info.service_certificate),
            )
        })
        .await
    }

    /// Fetches the self-signed certificate of a node.
    pub(crate) async fn self_signed_certificate(&self, node: &NodeEndpoint, watched: Watched<'_>) -> Result<String> {
        let client = &self.insecure_client(&node.node_name, &node.client_rpc_address);
        let what = format!("{}: {}/node/self_signed_certificate", node.node_name, node.client_rpc_address);
        self.wait_until_healthy(&what, self.timeouts().certificate, watched, || async move {
            let state = client.probe_json::<SelfSignedCertificate>("/node/self_signed_certificate").await?;
            if matches!(state, PollState::Pending(_)) {
                self.log_node_state(node).await;
            }
            Ok::<_, OrchestratorError>(state.map(|cert| cert.self_signed_certificate))
        })
        .await
    }

    /// Logs what the node-endorsed interface reports while the client
    /// interface is unavailable.
    async fn log_node_state(&self, node: &NodeEndpoint) {
        if node.node_endorsed_rpc_address.is_empty() {
            return;
        }
        let client = self.insecure_client(&node.node_name, &node.node_endorsed_rpc_address);
        match client.node_state().await {
            Ok(report) => debug!(node = %node.node_name, state = %report.state, "Node endorsed interface reports state"),
            Err(e) => debug!(node = %node.node_name, error = %e, "Could not query node state"),
        }
    }

    /// Client for a node trusted through its own certificate.
    async fn node_client(&self, node: &NodeEndpoint, service_certificate: &str, watched: Watched<'_>) -> Result<ClusterClient> {
        let node_certificate = self.self_signed_certificate(node, watched).await?;
        Ok(self.client(ClusterEndpoint::with_node_certificates(
            &node.node_name,
            &node.client_rpc_address,
            service_certificate,
            node_certificate,
        )))
    }

    // =========================================================================
    // Node waits
    // =========================================================================

    /// Waits until `client`'s node reports `target`.
    async fn wait_for_node_state(
        &self,
        client: &ClusterClient,
        target: NodeState,
        timeout: Duration,
        watched: Watched<'_>,
    ) -> Result<NodeStateReport> {
        let what = format!("{} to report {target}", client.endpoint().name);
        self.wait_until_healthy(&what, timeout, watched, || async move {
            let state = match client.probe_json::<NodeStateReport>("/node/state").await? {
                PollState::Ready(report) if report.state == target => PollState::Ready(report),
                PollState::Ready(report) => PollState::pending(format!("state {}", report.state)),
                PollState::Pending(state) => PollState::Pending(state),
            };
            Ok::<_, OrchestratorError>(state)
        })
        .await
    }

    /// Waits until the start node accepts governance requests.
    pub(crate) async fn wait_for_start_node_ready(&self, start: &NodeEndpoint, service_certificate: &str) -> Result<()> {
        let client = self.node_client(start, service_certificate, None).await?;
        let what = format!("{}: {}/node/ready/gov to report 204", start.node_name, start.client_rpc_address);
        wait_until(&what, self.policy(self.timeouts().node_state), || client.probe_status("/node/ready/gov", 204)).await?;
        enter(&start.node_name, JoinPhase::Ready);
        Ok(())
    }

    /// Waits until `target` lists the node as `Pending` or `Trusted`.
    async fn wait_for_node_to_appear(
        &self,
        target: &ClusterClient,
        node_name: &str,
        watched: Watched<'_>,
    ) -> Result<NetworkNode> {
        let id = &to_id(node_name);
        let what = format!("{node_name} to be listed by {}", target.endpoint().name);
        self.wait_until_healthy(&what, self.timeouts().node_state, watched, || async move {
            let state = target.probe_json::<NetworkNodeList>("/node/network/nodes").await?;
            let state = match state {
                PollState::Ready(list) => list
                    .nodes
                    .into_iter()
                    .find(|n| {
                        n.node_data.id == *id
                            && matches!(n.status, MembershipStatus::Pending | MembershipStatus::Trusted)
                    })
                    .map_or_else(|| PollState::pending("not listed"), PollState::Ready),
                PollState::Pending(state) => PollState::Pending(state),
            };
            Ok::<_, OrchestratorError>(state)
        })
        .await
    }

    /// Submits the proposal trusting a pending node.
    async fn transition_node_to_trusted(&self, target: &ClusterClient, node_id: &str) -> Result<()> {
        info!(node_id, "Submitting transition_node_to_trusted proposal");
        let proposal = Proposal::single(
            "transition_node_to_trusted",
            Some(json!({
                "node_id": node_id,
                "valid_from": Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            })),
        );
        let governance = self.governance(target.clone())?;
        let info = governance
            .create_proposal_with_commit(&proposal, self.policy(self.timeouts().trust_commit))
            .await?;
        info!(node_id, proposal_id = %info.proposal_id, state = %info.proposal_state, "Trust proposal committed");
        Ok(())
    }

    /// Drives a created join node until it reports `target_state`.
    pub(crate) async fn wait_for_join_node_ready(
        &self,
        scope: NetworkScope<'_>,
        target: &NodeEndpoint,
        joining: &NodeEndpoint,
        service_certificate: &str,
        target_state: NodeState,
    ) -> Result<()> {
        let name = joining.node_name.as_str();
        let watched = Some((scope, name));
        let service = self.service_client(&target.node_name, &target.client_rpc_address, service_certificate);

        let network = service.network_info().await?;
        if network.service_status == ServiceStatus::Open {
            enter(name, JoinPhase::AwaitingNetworkAppearance);
            let node = self.wait_for_node_to_appear(&service, name, watched).await?;
            if node.status == MembershipStatus::Pending {
                enter(name, JoinPhase::AwaitingTrust);
                self.transition_node_to_trusted(&service, &node.node_id).await?;
            }
        }

        let client = self.node_client(joining, service_certificate, watched).await?;
        enter(name, JoinPhase::AwaitingTargetState);
        self.wait_for_node_state(&client, target_state, self.timeouts().node_state, watched).await?;
        enter(name, JoinPhase::Ready);
        Ok(())
    }

    /// Waits until a recovering node reaches `target_state`.
    ///
    /// Returns its membership record and the highest sequence number it has
    /// signed.
    pub(crate) async fn wait_for_recover_node_ready(
        &self,
        node: &NodeEndpoint,
        service_certificate: &str,
        target_state: NodeState,
        timeout: Duration,
    ) -> Result<(NetworkNode, u64)> {
        let client = self.node_client(node, service_certificate, None).await?;
        let report = self.wait_for_node_state(&client, target_state, timeout, None).await?;
        let member = client.network_node(&report.node_id).await?;
        Ok((member, report.last_signed_seqno))
    }

    /// Waits until the service answers through the load balancer.
    pub(crate) async fn wait_for_load_balancer_ready(
        &self,
        lb: &LoadBalancerEndpoint,
        service_certificate: &str,
    ) -> Result<()> {
        let client = self.service_client(&lb.name, &lb.endpoint, service_certificate);
        let what = format!("{}: {}/node/network to report 200", lb.name, lb.endpoint);
        wait_until(&what, self.policy(self.timeouts().load_balancer), || client.probe_status("/node/network", 200))
            .await?;
        info!(load_balancer = %lb.name, endpoint = %lb.endpoint, "Load balancer is ready");
        Ok(())
    }

    // =========================================================================
    // Join fan-out
    // =========================================================================

    /// Creates one join node and drives it to `target_state`.
    async fn create_join_node(
        &self,
        template: &NodeTemplate,
        name: String,
        target: &NodeEndpoint,
        service_certificate: &str,
        target_state: NodeState,
    ) -> Result<NodeEndpoint> {
        let scope = template.scope();
        enter(&name, JoinPhase::Created);
        let join_target = JoinTarget {
            node_name: target.node_name.clone(),
            rpc_address: target.client_rpc_address.clone(),
            service_certificate: service_certificate.to_owned(),
        };
        let endpoint = self.node_provider.create_join_node(&template.spec(&name), &join_target).await?;

        enter(&name, JoinPhase::HealthCheck);
        self.check_node_healthy(scope, &name).await?;
        self.wait_for_join_node_ready(scope, target, &endpoint, service_certificate, target_state).await?;
        info!(network = scope.name, node = %name, address = %endpoint.client_rpc_address, "Node is up");
        Ok(endpoint)
    }

    /// Creates `count` join nodes with consecutive ordinals, concurrently.
    ///
    /// Every node is driven to completion; the first failure in ordinal
    /// order is returned after all of them finished.
    pub(crate) async fn create_join_nodes(
        &self,
        template: &NodeTemplate,
        count: usize,
        first_ordinal: u64,
        target: &NodeEndpoint,
        service_certificate: &str,
        target_state: NodeState,
    ) -> Result<Vec<NodeEndpoint>> {
        let joins = (first_ordinal..).take(count).map(|ordinal| {
            let name = node_name(&template.network_name, ordinal);
            self.create_join_node(template, name, target, service_certificate, target_state)
        });
        join_all(joins).await.into_iter().collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_join_phase_display() {
        assert_eq!(JoinPhase::AwaitingNetworkAppearance.to_string(), "AwaitingNetworkAppearance");
        assert_eq!(JoinPhase::Ready.to_string(), "Ready");
    }
}
