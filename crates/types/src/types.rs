//! Core type definitions for the consortium network orchestrator.
//!
//! Two families of types live here:
//! - Provider-side views (endpoints, health, network descriptors) produced by node and load balancer
//!   providers
//! - Cluster-side views (membership, node state, consensus) decoded from the node HTTP surface

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

// ============================================================================
// Infrastructure
// ============================================================================

/// Infrastructure backend hosting the nodes of a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InfraType {
    /// Container-based local nodes without confidential compute.
    Virtual,
    /// Container instances in the cloud without confidential compute.
    VirtualAci,
    /// Confidential container instances.
    Caci,
}

impl fmt::Display for InfraType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InfraType::Virtual => write!(f, "virtual"),
            InfraType::VirtualAci => write!(f, "virtualaci"),
            InfraType::Caci => write!(f, "caci"),
        }
    }
}

/// Whether node storage survives a network deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeleteOption {
    /// Keep ledger storage so the network can be recovered later.
    RetainStorage,
    /// Remove ledger storage together with compute.
    DeleteStorage,
}

/// How the confidential-compute enforcement policy of a node is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PolicyCreationOption {
    /// Policy shipped with the node image.
    #[default]
    Cached,
    /// Debug variant of the shipped policy.
    CachedDebug,
    /// Policy allowing every operation.
    AllowAll,
    /// Policy supplied by the caller.
    UserSupplied,
}

/// Security policy selection for new nodes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityPolicyConfig {
    /// How the policy is produced.
    #[serde(default)]
    pub policy_creation_option: PolicyCreationOption,
    /// Base64-encoded policy when [`PolicyCreationOption::UserSupplied`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,
}

// ============================================================================
// Provider views
// ============================================================================

/// Addresses of a provisioned node as reported by the node provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEndpoint {
    /// Node name, `{network}-{ordinal}`.
    pub node_name: String,
    /// Address serving client and governance RPCs.
    pub client_rpc_address: String,
    /// Address whose certificate is endorsed by the node itself.
    pub node_endorsed_rpc_address: String,
}

/// Health verdict for a provisioned resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeHealthStatus {
    /// Resource is running.
    Ok,
    /// Resource has failed and should be replaced.
    NeedsReplacement,
}

/// Reason attached to a health verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reason {
    /// Machine-readable reason code, e.g. `ContainerExited`.
    pub code: String,
    /// Human-readable detail.
    pub message: String,
}

/// Provider-reported health of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHealth {
    /// Node name.
    pub name: String,
    /// Client RPC address of the node.
    pub endpoint: String,
    /// Health verdict.
    pub status: NodeHealthStatus,
    /// Reasons backing the verdict.
    #[serde(default)]
    pub reasons: Vec<Reason>,
}

impl NodeHealth {
    /// Returns `true` if the provider wants this node replaced.
    pub fn needs_replacement(&self) -> bool {
        self.status == NodeHealthStatus::NeedsReplacement
    }

    /// Joins the reasons into a single diagnostic string.
    pub fn describe_reasons(&self) -> String {
        self.reasons
            .iter()
            .map(|r| format!("{}: {}", r.code, r.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Name and externally reachable address of a load balancer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerEndpoint {
    /// Load balancer name, `lb-nw-{network}`.
    pub name: String,
    /// Externally reachable URL.
    pub endpoint: String,
}

/// Provider-reported health of a load balancer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerHealth {
    /// Load balancer name.
    pub name: String,
    /// Externally reachable URL.
    pub endpoint: String,
    /// Health verdict.
    pub status: NodeHealthStatus,
    /// Reasons backing the verdict.
    #[serde(default)]
    pub reasons: Vec<Reason>,
}

/// Realized description of a network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    /// Network name.
    pub name: String,
    /// Infrastructure backend.
    pub infra_type: InfraType,
    /// Number of nodes currently provisioned.
    pub node_count: usize,
    /// Load balancer URL fronting the network.
    pub endpoint: String,
    /// Client RPC addresses of the nodes, in provider order.
    pub nodes: Vec<String>,
}

/// Combined health report for a network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkHealth {
    /// Health of the load balancer.
    pub load_balancer_health: LoadBalancerHealth,
    /// Health of every node.
    pub node_health: Vec<NodeHealth>,
}

// ============================================================================
// Cluster views
// ============================================================================

/// Membership status of a node as recorded by the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MembershipStatus {
    /// Node has joined but has not been trusted by governance.
    Pending,
    /// Node participates in consensus.
    Trusted,
    /// Node has been removed by governance.
    Retired,
    /// Status not known to this client.
    #[serde(other)]
    Unknown,
}

/// Lifecycle state reported by a node about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    /// Node process started but not configured.
    Uninitialized,
    /// Node configured, not yet started.
    Initialized,
    /// Node is waiting to be admitted.
    Pending,
    /// Node is replaying the public part of the ledger during recovery.
    PartOfPublicNetwork,
    /// Node is a full member.
    PartOfNetwork,
    /// Node is reading the public ledger.
    ReadingPublicLedger,
    /// Node is reading the private ledger.
    ReadingPrivateLedger,
    /// Node is verifying a snapshot.
    VerifyingSnapshot,
    /// State not known to this client.
    #[serde(other)]
    Unknown,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Service lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceStatus {
    /// Service is starting and not yet accepting user transactions.
    Opening,
    /// Service is open.
    Open,
    /// Recovered service waits for recovery shares.
    WaitingForRecoveryShares,
    /// Service is recovering its private state.
    Recovering,
    /// Status not known to this client.
    #[serde(other)]
    Unknown,
}

/// Application data attached to a node at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeData {
    /// Derived lowercase id of the node name.
    #[serde(default)]
    pub id: String,
    /// Node name.
    #[serde(default)]
    pub name: String,
    /// Opaque provider data.
    #[serde(rename = "infraProviderData", default, skip_serializing_if = "Option::is_none")]
    pub infra_provider_data: Option<serde_json::Value>,
}

/// Entry of the cluster membership list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkNode {
    /// Cluster-assigned node id.
    pub node_id: String,
    /// Membership status.
    pub status: MembershipStatus,
    /// Whether the node considers itself primary.
    #[serde(default)]
    pub primary: bool,
    /// Data attached at creation.
    #[serde(default)]
    pub node_data: NodeData,
    /// Sequence number of the last write to this node's record.
    #[serde(default)]
    pub last_written: u64,
    /// RPC interface descriptions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc_interfaces: Option<serde_json::Value>,
}

impl NetworkNode {
    /// Returns `true` if governance has retired this node.
    pub fn is_retired(&self) -> bool {
        self.status == MembershipStatus::Retired
    }
}

/// Response of the node membership list endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkNodeList {
    /// Nodes in the membership list.
    #[serde(default)]
    pub nodes: Vec<NetworkNode>,
}

/// Node self-report from `/node/state`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStateReport {
    /// Cluster-assigned node id.
    pub node_id: String,
    /// Current lifecycle state.
    pub state: NodeState,
    /// Highest signed ledger sequence number.
    #[serde(default)]
    pub last_signed_seqno: u64,
}

/// Service information from `/node/network`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    /// PEM-encoded service certificate.
    pub service_certificate: String,
    /// Service lifecycle status.
    pub service_status: ServiceStatus,
    /// Consensus view number.
    #[serde(default)]
    pub current_view: Option<u64>,
    /// Primary node id, if known.
    #[serde(default)]
    pub primary_id: Option<String>,
}

/// Self-signed node certificate from `/node/self_signed_certificate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelfSignedCertificate {
    /// PEM-encoded certificate.
    pub self_signed_certificate: String,
}

/// Per-follower acknowledgement in the consensus view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusAck {
    /// Milliseconds since the primary last heard from this follower.
    pub last_received_ms: u64,
    /// Last acknowledged sequence number.
    #[serde(default)]
    pub seqno: u64,
}

/// Snapshot of the consensus state as seen by the queried node.
///
/// Valid only as a snapshot: the primary can shift at any time, so
/// workflows must compare [`primary_id`](Self::primary_id) against their
/// assumed primary before acting on it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConsensusView {
    /// Current primary node id.
    #[serde(default)]
    pub primary_id: Option<String>,
    /// Follower acknowledgements keyed by node id.
    #[serde(default)]
    pub acks: BTreeMap<String, ConsensusAck>,
}

/// Envelope of `/node/consensus`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsensusDetails {
    /// Consensus view.
    #[serde(default)]
    pub details: ConsensusView,
}

/// Attestation quote published by a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeQuote {
    /// Cluster-assigned node id.
    pub node_id: String,
    /// Quote format, e.g. `Insecure_Virtual` or `AMD_SEV_SNP_v1`.
    pub format: String,
    /// Base64-encoded raw evidence.
    pub raw: String,
    /// Base64-encoded endorsements.
    #[serde(default)]
    pub endorsements: String,
}

/// Response of `/node/quotes`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuoteList {
    /// Published quotes.
    #[serde(default)]
    pub quotes: Vec<NodeQuote>,
}

/// Host data extracted from a node attestation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeReport {
    /// Cluster-assigned node id.
    pub node_id: String,
    /// Quote format.
    pub format: String,
    /// Host data claim.
    pub host_data: String,
    /// Whether the claim came from a cryptographically verified report.
    pub verified: bool,
}

/// A recovered node ranked by how far its ledger progressed.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryCandidate {
    /// Provider endpoint of the node.
    pub endpoint: NodeEndpoint,
    /// Membership record of the node in the recovered network.
    pub node: NetworkNode,
    /// Highest signed sequence number of its ledger.
    pub last_signed_seqno: u64,
    /// Service certificate served by the node.
    pub service_certificate: String,
}

// ============================================================================
// Members
// ============================================================================

/// Consortium member installed in the genesis transaction of a new network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitialMember {
    /// PEM certificate of the member signing identity.
    pub certificate: String,
    /// PEM public key used to encrypt the member's recovery share.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_public_key: Option<String>,
    /// Application data stored with the member record.
    #[serde(default)]
    pub member_data: serde_json::Value,
}

/// Location of a confidential recovery service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryServiceEndpoint {
    /// Service URL.
    pub endpoint: String,
    /// PEM service certificate to trust when calling it.
    pub service_cert: String,
}
