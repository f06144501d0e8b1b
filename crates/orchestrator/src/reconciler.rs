//! Converging a running network to a desired node count.
//!
//! One reconciliation pass:
//!
//! 1. Clean up nodes left retired by earlier passes.
//! 2. Compare the provider's node count with the desired count, then either add join nodes, remove
//!    the nodes picked by [`select_nodes_to_remove`](crate::select_nodes_to_remove), or replace
//!    nodes the provider reports as needing replacement.
//!
//! A removed node goes through governance first (`remove_node`), then waits
//! until the service lists it as removable before the provider deletes it and
//! its membership record is dropped. Replacements add before they remove so
//! the network never dips below the desired size.

use std::cmp::Ordering;

use consortium_client::{ClusterClient, PollState};
use consortium_types::{
    MembershipStatus, NetworkNode, NetworkNodeList, NodeState, Proposal, node_name::to_id,
};
use futures::future::join_all;
use serde_json::json;
use tracing::{info, warn};

use crate::{
    error::{OrchestratorError, Result},
    network::{NetworkOrchestrator, Primary},
    provider::{NetworkScope, NodeTemplate},
    readiness::wait_until,
};

/// What one reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Retired nodes cleaned up.
    pub retired: Vec<String>,
    /// Nodes added.
    pub added: Vec<String>,
    /// Nodes removed.
    pub removed: Vec<String>,
}

impl ReconcileOutcome {
    /// Whether the set of provisioned nodes changed.
    pub fn changed(&self) -> bool {
        !(self.retired.is_empty() && self.added.is_empty() && self.removed.is_empty())
    }
}

impl NetworkOrchestrator {
    /// Runs one reconciliation pass against `primary`.
    pub(crate) async fn reconcile(
        &self,
        template: &NodeTemplate,
        primary: &Primary,
        desired: usize,
    ) -> Result<ReconcileOutcome> {
        let scope = template.scope();
        let client = self.service_client(
            &primary.endpoint.node_name,
            &primary.endpoint.client_rpc_address,
            &primary.service_certificate,
        );

        let mut outcome = ReconcileOutcome {
            retired: self.cleanup_retired_nodes(scope, &client).await?,
            ..ReconcileOutcome::default()
        };

        let current = self.node_provider.nodes(scope).await?.len();
        info!(network = scope.name, current, desired, "Reconciling node count");
        match current.cmp(&desired) {
            Ordering::Less => {
                outcome.added = self.add_nodes(template, primary, desired - current).await?;
            },
            Ordering::Greater => {
                let picked = self.pick_nodes_to_remove(scope, primary, &client, current - desired).await?;
                outcome.removed = self.remove_nodes(scope, &client, &picked).await?;
            },
            Ordering::Equal => {
                let (added, removed) = self.replace_unhealthy_nodes(template, primary, &client).await?;
                outcome.added = added;
                outcome.removed = removed;
            },
        }
        Ok(outcome)
    }

    async fn add_nodes(&self, template: &NodeTemplate, primary: &Primary, count: usize) -> Result<Vec<String>> {
        let ordinal = self.next_ordinal(template.scope()).await?;
        let added = self
            .create_join_nodes(
                template,
                count,
                ordinal,
                &primary.endpoint,
                &primary.service_certificate,
                NodeState::PartOfNetwork,
            )
            .await?;
        Ok(added.into_iter().map(|n| n.node_name).collect())
    }

    /// Replaces the nodes the provider reports as needing replacement.
    ///
    /// Nothing happens if the primary is among them.
    async fn replace_unhealthy_nodes(
        &self,
        template: &NodeTemplate,
        primary: &Primary,
        client: &ClusterClient,
    ) -> Result<(Vec<String>, Vec<String>)> {
        let scope = template.scope();
        let unhealthy: Vec<String> = self
            .node_provider
            .nodes_health(scope)
            .await?
            .into_iter()
            .filter(|h| h.needs_replacement())
            .map(|h| to_id(&h.name))
            .collect();
        if unhealthy.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }

        let to_replace: Vec<NetworkNode> = client
            .network_nodes()
            .await?
            .into_iter()
            .filter(|n| unhealthy.contains(&to_id(&n.node_data.name)))
            .collect();
        if let Some(node) = to_replace.iter().find(|n| n.primary || n.node_id == primary.node_id) {
            warn!(
                network = scope.name,
                node = %node.node_data.name,
                node_id = %node.node_id,
                "Primary needs replacement, skipping replacement of unhealthy nodes"
            );
            return Ok((Vec::new(), Vec::new()));
        }
        if to_replace.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }

        info!(
            network = scope.name,
            nodes = ?to_replace.iter().map(|n| n.node_data.name.as_str()).collect::<Vec<_>>(),
            "Replacing unhealthy nodes"
        );
        let added = self.add_nodes(template, primary, to_replace.len()).await?;
        let removed = self.remove_nodes(scope, client, &to_replace).await?;
        Ok((added, removed))
    }

    // =========================================================================
    // Removal
    // =========================================================================

    /// Retires, deletes, and drops `nodes` concurrently.
    ///
    /// Returns the provider names of the removed nodes.
    pub(crate) async fn remove_nodes(
        &self,
        scope: NetworkScope<'_>,
        client: &ClusterClient,
        nodes: &[NetworkNode],
    ) -> Result<Vec<String>> {
        let removals = nodes.iter().map(|node| self.remove_node(scope, client, node));
        join_all(removals).await.into_iter().collect::<Result<Vec<()>>>()?;
        Ok(nodes.iter().map(|n| n.node_data.name.clone()).collect())
    }

    async fn remove_node(&self, scope: NetworkScope<'_>, client: &ClusterClient, node: &NetworkNode) -> Result<()> {
        if !node.is_retired() {
            info!(network = scope.name, node_id = %node.node_id, node = %node.node_data.name, "Submitting remove_node proposal");
            let proposal = Proposal::single("remove_node", Some(json!({ "node_id": node.node_id })));
            self.governance(client.clone())?.create_proposal(&proposal).await?;
            self.wait_for_node_status(client, &node.node_id, MembershipStatus::Retired).await?;
        }
        self.delete_retired_node(scope, client, node).await
    }

    /// Waits until the node is removable, then deletes it from the provider
    /// and drops its membership record.
    ///
    /// Once the provider has deleted the node, a failure to drop the record
    /// is logged and the removal still counts.
    async fn delete_retired_node(&self, scope: NetworkScope<'_>, client: &ClusterClient, node: &NetworkNode) -> Result<()> {
        self.wait_for_node_removable(client, &node.node_id).await?;
        self.node_provider.delete_node(scope, &node.node_data.name, &node.node_data).await?;
        if let Err(e) = client.delete_network_node(&node.node_id).await {
            warn!(network = scope.name, node_id = %node.node_id, error = %e, "Could not drop retired node record");
        }
        info!(network = scope.name, node_id = %node.node_id, node = %node.node_data.name, "Node removed");
        Ok(())
    }

    async fn wait_for_node_status(&self, client: &ClusterClient, node_id: &str, status: MembershipStatus) -> Result<()> {
        let path = &format!("/node/network/nodes/{node_id}");
        let what = format!("{node_id} to become {status:?}");
        wait_until(&what, self.policy(self.timeouts().node_state), || async move {
            let state = match client.probe_json::<NetworkNode>(path).await? {
                PollState::Ready(node) if node.status == status => PollState::Ready(()),
                PollState::Ready(node) => PollState::pending(format!("status {:?}", node.status)),
                PollState::Pending(state) => PollState::Pending(state),
            };
            Ok::<_, OrchestratorError>(state)
        })
        .await
    }

    async fn wait_for_node_removable(&self, client: &ClusterClient, node_id: &str) -> Result<()> {
        let what = format!("{node_id} to become removable");
        wait_until(&what, self.policy(self.timeouts().node_state), || async move {
            let state = match client.probe_json::<NetworkNodeList>("/node/network/removable_nodes").await? {
                PollState::Ready(list) if list.nodes.iter().any(|n| n.node_id == node_id) => PollState::Ready(()),
                PollState::Ready(_) => PollState::pending("not removable"),
                PollState::Pending(state) => PollState::Pending(state),
            };
            Ok::<_, OrchestratorError>(state)
        })
        .await
    }

    // =========================================================================
    // Retired cleanup
    // =========================================================================

    /// Deletes every retired node and its membership record.
    ///
    /// Nodes that do not become removable in time are logged and left for a
    /// later pass. Returns the provider names of the deleted nodes.
    pub(crate) async fn cleanup_retired_nodes(
        &self,
        scope: NetworkScope<'_>,
        client: &ClusterClient,
    ) -> Result<Vec<String>> {
        let retired: Vec<NetworkNode> = client.network_nodes().await?.into_iter().filter(NetworkNode::is_retired).collect();
        if retired.is_empty() {
            return Ok(Vec::new());
        }
        info!(network = scope.name, count = retired.len(), "Cleaning up retired nodes");

        let results = join_all(retired.iter().map(|node| self.delete_retired_node(scope, client, node))).await;
        let mut deleted = Vec::with_capacity(retired.len());
        for (node, result) in retired.iter().zip(results) {
            match result {
                Ok(()) => deleted.push(node.node_data.name.clone()),
                Err(e) if e.is_timeout() => {
                    warn!(network = scope.name, node_id = %node.node_id, error = %e, "Retired node not removable yet");
                },
                Err(e) => return Err(e),
            }
        }
        Ok(deleted)
    }

    /// Drops the membership records of nodes retired by a recovery.
    ///
    /// The provider already deleted the old nodes, so only the records are
    /// dropped. Failures are logged.
    pub(crate) async fn cleanup_retired_nodes_post_recovery(&self, client: &ClusterClient) -> Result<()> {
        let retired: Vec<NetworkNode> = client.network_nodes().await?.into_iter().filter(NetworkNode::is_retired).collect();
        let results = join_all(retired.iter().map(|node| client.delete_network_node(&node.node_id))).await;
        for (node, result) in retired.iter().zip(results) {
            match result {
                Ok(()) => info!(node_id = %node.node_id, "Dropped retired node record"),
                Err(e) => warn!(node_id = %node.node_id, error = %e, "Could not drop retired node record"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_changed() {
        assert!(!ReconcileOutcome::default().changed());
        let added = ReconcileOutcome { added: vec!["net-3".to_owned()], ..ReconcileOutcome::default() };
        assert!(added.changed());
        let retired = ReconcileOutcome { retired: vec!["net-1".to_owned()], ..ReconcileOutcome::default() };
        assert!(retired.changed());
    }
}
