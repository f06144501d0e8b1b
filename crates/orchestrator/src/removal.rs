//! Choosing which nodes to remove when shrinking a network.
//!
//! Preference order:
//!
//! 1. Nodes the provider reports as needing replacement.
//! 2. The remaining nodes by consensus staleness: the longer ago the primary last received an ack
//!    from a node, the earlier it goes.
//!
//! Retired nodes are skipped. The primary is never chosen: the selection is
//! computed from the consensus view of the node assumed to be primary, and
//! any sign that the primary moved aborts it before any proposal is sent.

use std::collections::HashSet;

use consortium_client::ClusterClient;
use consortium_types::{ConsensusView, NetworkNode, node_name::to_id};
use tracing::info;

use crate::{
    error::{PrimaryShiftedSnafu, Result},
    network::{NetworkOrchestrator, Primary},
    provider::NetworkScope,
};

/// Selects up to `count` nodes to remove.
///
/// `unhealthy` holds the provider names of nodes needing replacement.
/// Fewer than `count` nodes are returned if there are not enough eligible
/// candidates.
///
/// # Errors
///
/// Returns [`OrchestratorError::PrimaryShifted`](crate::OrchestratorError::PrimaryShifted)
/// if `view` names a primary other than `assumed_primary`, or if a chosen
/// node reports itself as primary.
pub fn select_nodes_to_remove(
    count: usize,
    nodes: &[NetworkNode],
    view: &ConsensusView,
    unhealthy: &[String],
    assumed_primary: &str,
) -> Result<Vec<NetworkNode>> {
    let observed = view.primary_id.as_deref().unwrap_or("<none>");
    if observed != assumed_primary {
        return PrimaryShiftedSnafu { expected: assumed_primary, actual: observed }.fail();
    }

    let unhealthy_ids: HashSet<String> = unhealthy.iter().map(|name| to_id(name)).collect();
    let mut candidates: Vec<&str> = nodes
        .iter()
        .filter(|n| unhealthy_ids.contains(&n.node_data.id))
        .map(|n| n.node_id.as_str())
        .collect();

    let mut stalest: Vec<(&String, u64)> = view
        .acks
        .iter()
        .filter(|(id, _)| !candidates.contains(&id.as_str()))
        .map(|(id, ack)| (id, ack.last_received_ms))
        .collect();
    stalest.sort_by(|a, b| b.1.cmp(&a.1));
    candidates.extend(stalest.into_iter().map(|(id, _)| id.as_str()));
    info!(?candidates, count, "Removal candidate order");

    let mut chosen = Vec::with_capacity(count);
    for id in candidates {
        if chosen.len() == count {
            break;
        }
        let Some(node) = nodes.iter().find(|n| n.node_id == id && !n.is_retired()) else {
            continue;
        };
        if node.primary {
            return PrimaryShiftedSnafu { expected: assumed_primary, actual: node.node_id.as_str() }.fail();
        }
        chosen.push(node.clone());
    }
    Ok(chosen)
}

impl NetworkOrchestrator {
    /// Reads membership and consensus from the primary and selects `count`
    /// nodes to remove.
    pub(crate) async fn pick_nodes_to_remove(
        &self,
        scope: NetworkScope<'_>,
        primary: &Primary,
        primary_client: &ClusterClient,
        count: usize,
    ) -> Result<Vec<NetworkNode>> {
        let nodes = primary_client.network_nodes().await?;
        let view = primary_client.consensus().await?;
        let unhealthy: Vec<String> = self
            .node_provider
            .nodes_health(scope)
            .await?
            .into_iter()
            .filter(|h| h.needs_replacement())
            .map(|h| h.name)
            .collect();

        let chosen = select_nodes_to_remove(count, &nodes, &view, &unhealthy, &primary.node_id)?;
        info!(
            network = scope.name,
            requested = count,
            picked = ?chosen.iter().map(|n| n.node_id.as_str()).collect::<Vec<_>>(),
            "Picked nodes to remove"
        );
        Ok(chosen)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::collections::BTreeMap;

    use consortium_types::{ConsensusAck, MembershipStatus, NodeData};

    use super::*;
    use crate::OrchestratorError;

    fn node(id: &str, name: &str, status: MembershipStatus, primary: bool) -> NetworkNode {
        NetworkNode {
            node_id: id.to_owned(),
            status,
            primary,
            node_data: NodeData { id: to_id(name), name: name.to_owned(), infra_provider_data: None },
            last_written: 0,
            rpc_interfaces: None,
        }
    }

    fn view(primary: &str, acks: &[(&str, u64)]) -> ConsensusView {
        ConsensusView {
            primary_id: Some(primary.to_owned()),
            acks: acks
                .iter()
                .map(|(id, ms)| ((*id).to_owned(), ConsensusAck { last_received_ms: *ms, seqno: 0 }))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    fn cluster() -> Vec<NetworkNode> {
        vec![
            node("p", "net-0", MembershipStatus::Trusted, true),
            node("a", "net-1", MembershipStatus::Trusted, false),
            node("b", "net-2", MembershipStatus::Trusted, false),
            node("c", "net-3", MembershipStatus::Trusted, false),
        ]
    }

    fn ids(nodes: &[NetworkNode]) -> Vec<&str> {
        nodes.iter().map(|n| n.node_id.as_str()).collect()
    }

    #[test]
    fn test_unhealthy_first_then_stalest() {
        let chosen = select_nodes_to_remove(
            2,
            &cluster(),
            &view("p", &[("a", 100), ("b", 500), ("c", 5000)]),
            &["net-1".to_owned()],
            "p",
        )
        .unwrap();
        assert_eq!(ids(&chosen), vec!["a", "c"]);
    }

    #[test]
    fn test_unhealthy_match_ignores_case() {
        let chosen =
            select_nodes_to_remove(1, &cluster(), &view("p", &[("b", 1)]), &["NET-3".to_owned()], "p").unwrap();
        assert_eq!(ids(&chosen), vec!["c"]);
    }

    #[test]
    fn test_primary_shift_in_view() {
        let err = select_nodes_to_remove(1, &cluster(), &view("b", &[("a", 1)]), &[], "p").unwrap_err();
        match err {
            OrchestratorError::PrimaryShifted { expected, actual } => {
                assert_eq!(expected, "p");
                assert_eq!(actual, "b");
            },
            other => panic!("expected PrimaryShifted, got {other:?}"),
        }
    }

    #[test]
    fn test_candidate_reporting_primary_aborts() {
        let mut nodes = cluster();
        nodes[3].primary = true;
        let err = select_nodes_to_remove(1, &nodes, &view("p", &[("c", 900), ("a", 1)]), &[], "p").unwrap_err();
        assert!(matches!(err, OrchestratorError::PrimaryShifted { .. }), "got {err:?}");
    }

    #[test]
    fn test_retired_nodes_skipped() {
        let mut nodes = cluster();
        nodes[3].status = MembershipStatus::Retired;
        let chosen =
            select_nodes_to_remove(1, &nodes, &view("p", &[("c", 9000), ("b", 10)]), &[], "p").unwrap();
        assert_eq!(ids(&chosen), vec!["b"]);
    }

    #[test]
    fn test_fewer_candidates_than_requested() {
        let chosen = select_nodes_to_remove(3, &cluster(), &view("p", &[("a", 10)]), &[], "p").unwrap();
        assert_eq!(ids(&chosen), vec!["a"]);
    }

    #[test]
    fn test_missing_primary_in_view_is_shift() {
        let mut consensus = view("p", &[]);
        consensus.primary_id = None;
        let err = select_nodes_to_remove(1, &cluster(), &consensus, &[], "p").unwrap_err();
        assert!(matches!(err, OrchestratorError::PrimaryShifted { .. }));
    }
}
