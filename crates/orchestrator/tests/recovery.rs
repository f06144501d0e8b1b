//! Disaster recovery integration tests.
//!
//! Each test creates a network, records ledger progress on its nodes, and
//! recovers it from the retained storage.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;

use consortium_orchestrator::{NetworkOrchestrator, NetworkRequest, NetworkScope, OrchestratorError};
use consortium_test_utils::{Event, FakeConsortium, MEMBER_ID};
use consortium_types::{DeleteOption, RecoveryServiceEndpoint, ServiceStatus};

// ============================================================================
// Test Helpers
// ============================================================================

const NETWORK: &str = "net";

fn request(node_count: usize) -> NetworkRequest {
    NetworkRequest::builder().network_name(NETWORK).node_count(node_count).build()
}

fn recovery_service() -> RecoveryServiceEndpoint {
    RecoveryServiceEndpoint {
        endpoint: "https://recovery.sim".to_owned(),
        service_cert: "recovery-service-cert".to_owned(),
    }
}

/// Creates a three node network whose ledgers reached the given sequence
/// numbers and returns its service certificate.
async fn crashed_network(fake: &Arc<FakeConsortium>, orchestrator: &NetworkOrchestrator, seqnos: [u64; 3]) -> String {
    orchestrator.create_network(&request(3)).await.unwrap();
    fake.open_service(NETWORK);
    for (ordinal, seqno) in seqnos.into_iter().enumerate() {
        fake.set_last_signed_seqno(&format!("{NETWORK}-{ordinal}"), seqno);
    }
    fake.service_certificate(NETWORK).unwrap()
}

fn position(events: &[Event], event: &Event) -> usize {
    events.iter().position(|e| e == event).unwrap_or_else(|| panic!("{event:?} not in {events:?}"))
}

// ============================================================================
// Recovery with a member share
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_recovery_roots_on_highest_seqno() {
    let fake = FakeConsortium::new();
    let orchestrator = fake.orchestrator();
    let previous = crashed_network(&fake, &orchestrator, [100, 250, 90]).await;

    let network = orchestrator.recover_network(&request(3), &previous, None).await.unwrap();

    assert_eq!(network.node_count, 3);
    assert_eq!(fake.count(|e| matches!(e, Event::RecoverNodeCreated(_))), 3);
    assert_eq!(fake.count(|e| *e == Event::NodeDeleted("net-0".to_owned())), 1);
    assert_eq!(fake.count(|e| *e == Event::NodeDeleted("net-1".to_owned())), 0);
    assert_eq!(fake.count(|e| *e == Event::NodeDeleted("net-2".to_owned())), 1);
    // net-1 holds the furthest ledger; fresh nodes join it.
    assert_eq!(fake.node_names(NETWORK), ["net-1", "net-2", "net-3"]);
    assert_eq!(fake.service_status(NETWORK), Some(ServiceStatus::Open));
}

#[tokio::test(start_paused = true)]
async fn test_recovery_steps_run_in_order() {
    let fake = FakeConsortium::new();
    let orchestrator = fake.orchestrator();
    let previous = crashed_network(&fake, &orchestrator, [10, 20, 30]).await;

    orchestrator.recover_network(&request(3), &previous, None).await.unwrap();

    let events = fake.events();
    let deleted = position(&events, &Event::NetworkDeleted {
        network: NETWORK.to_owned(),
        option: DeleteOption::RetainStorage,
    });
    let recovering = position(&events, &Event::RecoverNodeCreated("net-0".to_owned()));
    let opened = position(&events, &Event::ProposalSubmitted("transition_service_to_open".to_owned()));
    let shared = position(&events, &Event::RecoveryShareSubmitted(MEMBER_ID.to_owned()));
    let balanced = events.iter().rposition(|e| matches!(e, Event::LoadBalancerCreated(_))).unwrap();
    assert!(deleted < recovering, "events: {events:?}");
    assert!(recovering < balanced && balanced < opened, "events: {events:?}");
    assert!(opened < shared, "events: {events:?}");
}

#[tokio::test(start_paused = true)]
async fn test_recovery_opens_service_under_new_identity() {
    let fake = FakeConsortium::new();
    let orchestrator = fake.orchestrator();
    let previous = crashed_network(&fake, &orchestrator, [5, 5, 5]).await;

    orchestrator.recover_network(&request(3), &previous, None).await.unwrap();

    let current = fake.service_certificate(NETWORK).unwrap();
    assert_ne!(current, previous);
    let args = fake.proposal_args("transition_service_to_open");
    assert_eq!(args.len(), 1);
    assert_eq!(args[0]["previous_service_identity"], previous.as_str());
    assert_eq!(args[0]["next_service_identity"], current.as_str());
}

#[tokio::test(start_paused = true)]
async fn test_recovery_decrypts_member_share() {
    let fake = FakeConsortium::new();
    let orchestrator = fake.orchestrator();
    let previous = crashed_network(&fake, &orchestrator, [1, 2, 3]).await;

    orchestrator.recover_network(&request(3), &previous, None).await.unwrap();

    assert_eq!(fake.submitted_shares(), [format!("decrypted:encrypted:{MEMBER_ID}")]);
}

#[tokio::test(start_paused = true)]
async fn test_recovery_with_supplied_share() {
    let fake = FakeConsortium::new();
    let orchestrator = fake.orchestrator();
    let previous = crashed_network(&fake, &orchestrator, [1, 2, 3]).await;

    orchestrator.recover_network(&request(3), &previous, Some("c2hhcmU=")).await.unwrap();

    assert_eq!(fake.submitted_shares(), ["c2hhcmU=".to_owned()]);
}

#[tokio::test(start_paused = true)]
async fn test_recovery_drops_retired_records() {
    let fake = FakeConsortium::new();
    let orchestrator = fake.orchestrator();
    let previous = crashed_network(&fake, &orchestrator, [100, 250, 90]).await;

    orchestrator.recover_network(&request(3), &previous, None).await.unwrap();

    let records = fake.records(NETWORK);
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| !r.is_retired()));
    // Three pre-crash records plus the two discarded recover nodes.
    assert_eq!(fake.count(|e| matches!(e, Event::RecordDeleted(_))), 5);
}

#[tokio::test(start_paused = true)]
async fn test_share_not_ending_recovery_fails() {
    let fake = FakeConsortium::new();
    let orchestrator = fake.orchestrator();
    let previous = crashed_network(&fake, &orchestrator, [1, 2, 3]).await;
    fake.set_share_response("1/2 recovery shares successfully submitted.");

    let err = orchestrator.recover_network(&request(3), &previous, None).await.unwrap_err();

    assert!(matches!(err, OrchestratorError::RecoveryIncomplete { .. }), "got {err:?}");
    assert_eq!(fake.submitted_shares().len(), 1);
    assert_eq!(fake.service_status(NETWORK), Some(ServiceStatus::WaitingForRecoveryShares));
}

#[tokio::test(start_paused = true)]
async fn test_recovery_without_ledgers_fails() {
    let fake = FakeConsortium::new();
    let orchestrator = fake.orchestrator();
    let previous = crashed_network(&fake, &orchestrator, [1, 2, 3]).await;
    orchestrator.delete_network(NetworkScope::new(NETWORK, None), DeleteOption::DeleteStorage).await.unwrap();

    let err = orchestrator.recover_network(&request(3), &previous, None).await.unwrap_err();

    assert!(matches!(err, OrchestratorError::InvalidArgument { .. }), "got {err:?}");
    assert_eq!(fake.count(|e| matches!(e, Event::RecoverNodeCreated(_))), 0);
}

#[tokio::test(start_paused = true)]
async fn test_recovery_requires_signer() {
    let fake = FakeConsortium::new();
    let orchestrator = fake.orchestrator();
    let previous = crashed_network(&fake, &orchestrator, [1, 2, 3]).await;
    orchestrator.clear_signer();
    let before = fake.events().len();

    let err = orchestrator.recover_network(&request(3), &previous, None).await.unwrap_err();

    assert!(matches!(err, OrchestratorError::SigningNotConfigured), "got {err:?}");
    // Checked before anything is torn down.
    assert_eq!(fake.events().len(), before);
}

// ============================================================================
// Public network recovery
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_recover_public_network_leaves_service_recovering() {
    let fake = FakeConsortium::new();
    let orchestrator = fake.orchestrator();
    let previous = crashed_network(&fake, &orchestrator, [7, 3, 1]).await;
    orchestrator.delete_network(NetworkScope::new(NETWORK, None), DeleteOption::RetainStorage).await.unwrap();

    let network = orchestrator.recover_public_network(&request(2), NETWORK, &previous).await.unwrap();

    assert_eq!(network.node_count, 2);
    assert_eq!(network.endpoint, "https://lb-nw-net.lb.sim");
    assert_eq!(fake.node_names(NETWORK), ["net-0", "net-1"]);
    assert_eq!(fake.service_status(NETWORK), Some(ServiceStatus::Recovering));
    assert_eq!(fake.total_proposals(), 0);
}

// ============================================================================
// Confidential recovery
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_confidential_recovery_uses_recovery_service_share() {
    let fake = FakeConsortium::new();
    let orchestrator = fake.orchestrator();
    let previous = crashed_network(&fake, &orchestrator, [4, 9, 2]).await;

    let network = orchestrator
        .recover_confidential_network(&request(3), &previous, "recovery-operator", &recovery_service())
        .await
        .unwrap();

    assert_eq!(network.node_count, 3);
    assert_eq!(fake.count(|e| *e == Event::RecoveryShareSubmitted("recovery-operator".to_owned())), 1);
    assert!(fake.submitted_shares().is_empty());
    assert_eq!(fake.service_status(NETWORK), Some(ServiceStatus::Open));
}

#[tokio::test(start_paused = true)]
async fn test_confidential_recovery_requires_full_key_confirmation() {
    let fake = FakeConsortium::new();
    let orchestrator = fake.orchestrator();
    let previous = crashed_network(&fake, &orchestrator, [4, 9, 2]).await;
    fake.set_agent_share_response("End of recovery procedure initiated.");

    let err = orchestrator
        .recover_confidential_network(&request(3), &previous, "recovery-operator", &recovery_service())
        .await
        .unwrap_err();

    assert!(matches!(err, OrchestratorError::RecoveryIncomplete { .. }), "got {err:?}");
}
