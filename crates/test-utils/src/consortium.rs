//! In-memory consortium: node provider, load balancer, recovery service, and
//! cluster HTTP surface backed by one shared state.
//!
//! Nodes answer requests synchronously from the state, so a workflow run
//! against [`FakeConsortium`] is deterministic. Knobs (`set_*`) inject
//! faults; queries (`events`, `proposal_count`, ...) let tests assert on
//! what the orchestrator did.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::Bytes;
use consortium_client::{
    ClusterEndpoint, ClusterRequest, ClusterTransport, Method, RawResponse, RecoveryShareDecryptor,
};
use consortium_orchestrator::{
    END_OF_RECOVERY, JoinTarget, LoadBalancerProvider, NetworkOrchestrator, NetworkScope, NodeProvider, NodeSpec,
    ProviderError, ProviderResult, RecoveryAgent,
};
use consortium_types::{
    DeleteOption, InfraType, InitialMember, LoadBalancerEndpoint, LoadBalancerHealth, MembershipStatus,
    NetworkNode, NodeData, NodeEndpoint, NodeHealth, NodeHealthStatus, NodeState, PolicyCreationOption,
    ProposalAction, ProposalState, Reason, RecoveryMember, RecoveryServiceEndpoint, ServiceStatus,
    config::{OrchestratorConfig, TimeoutConfig},
};
use parking_lot::Mutex;
use serde_json::{Value, json};

use crate::signing::{FakeDecryptor, FakeSigner};

/// Member id of the signer installed by [`FakeConsortium::orchestrator`].
pub const MEMBER_ID: &str = "m0";

/// Share response confirming a complete recovery.
pub const COMPLETE_SHARE_RESPONSE: &str =
    "1/1 recovery shares successfully submitted. End of recovery procedure initiated.";

/// Recovery service response confirming a complete recovery.
pub const COMPLETE_AGENT_RESPONSE: &str =
    "Full recovery key successfully submitted. End of recovery procedure initiated.";

/// Something the orchestrator did to the consortium.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Start node provisioned.
    StartNodeCreated(String),
    /// Join node provisioned.
    JoinNodeCreated(String),
    /// Recover node provisioned.
    RecoverNodeCreated(String),
    /// Single node deprovisioned.
    NodeDeleted(String),
    /// Every node of a network deprovisioned.
    NetworkDeleted {
        /// Network name.
        network: String,
        /// Storage handling.
        option: DeleteOption,
    },
    /// Load balancer created over these servers.
    LoadBalancerCreated(Vec<String>),
    /// Load balancer backends replaced.
    LoadBalancerUpdated(Vec<String>),
    /// Load balancer deleted.
    LoadBalancerDeleted(String),
    /// Proposal with this action submitted.
    ProposalSubmitted(String),
    /// Ballot cast on this proposal.
    BallotSubmitted(String),
    /// Recovery share submitted by this member.
    RecoveryShareSubmitted(String),
    /// Membership record with this node id dropped.
    RecordDeleted(String),
    /// Recovery member activated.
    RecoveryMemberActivated(String),
    /// Join policy pushed to the recovery service for this network.
    JoinPolicyPushed(String),
}

struct SimNode {
    network: String,
    node_id: String,
    state: NodeState,
    last_signed_seqno: u64,
    health: NodeHealthStatus,
    stuck: bool,
    spec: NodeSpec,
}

impl SimNode {
    fn name(&self) -> &str {
        &self.spec.node_name
    }

    fn endpoint(&self) -> NodeEndpoint {
        NodeEndpoint {
            node_name: self.name().to_owned(),
            client_rpc_address: node_address(self.name()),
            node_endorsed_rpc_address: format!("https://{}.sim:8081", self.name()),
        }
    }

    fn reported_state(&self) -> NodeState {
        if self.stuck { NodeState::Initialized } else { self.state }
    }
}

struct Service {
    status: ServiceStatus,
    generation: u32,
    primary: Option<String>,
    records: Vec<NetworkNode>,
}

impl Service {
    fn certificate(&self, network: &str) -> String {
        format!("service-cert-{network}-{}", self.generation)
    }
}

struct LoadBalancer {
    name: String,
    network: String,
    servers: Vec<String>,
}

struct SimState {
    nodes: Vec<SimNode>,
    services: HashMap<String, Service>,
    load_balancers: Vec<LoadBalancer>,
    ledgers: HashMap<String, Vec<(String, u64)>>,
    acks: HashMap<String, u64>,
    events: Vec<Event>,
    proposals: Vec<ProposalAction>,
    shares: Vec<String>,
    next_node_id: u64,
    next_transaction: u64,
    removable: bool,
    consensus_primary: Option<String>,
    unhealthy_on_create: HashSet<String>,
    failing_record_deletes: HashSet<String>,
    share_response: String,
    agent_share_response: String,
    member_proposal_state: ProposalState,
    ballot_state: ProposalState,
    join_policy: Value,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            services: HashMap::new(),
            load_balancers: Vec::new(),
            ledgers: HashMap::new(),
            acks: HashMap::new(),
            events: Vec::new(),
            proposals: Vec::new(),
            shares: Vec::new(),
            next_node_id: 0,
            next_transaction: 0,
            removable: true,
            consensus_primary: None,
            unhealthy_on_create: HashSet::new(),
            failing_record_deletes: HashSet::new(),
            share_response: COMPLETE_SHARE_RESPONSE.to_owned(),
            agent_share_response: COMPLETE_AGENT_RESPONSE.to_owned(),
            member_proposal_state: ProposalState::Open,
            ballot_state: ProposalState::Accepted,
            join_policy: json!({ "snp": { "hostData": { "73973b78d70cc68353426de188db5dfc57e5b766e399935fb73a61127ea26d20": "" } } }),
        }
    }
}

fn node_address(name: &str) -> String {
    format!("https://{name}.sim:8080")
}

fn fqdn(lb_name: &str) -> String {
    format!("{lb_name}.lb.sim")
}

fn host(url: &str) -> &str {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    rest.split([':', '/']).next().unwrap_or(rest)
}

fn respond(status: u16, body: &impl serde::Serialize) -> RawResponse {
    RawResponse::new(status, serde_json::to_vec(body).unwrap_or_default())
}

fn unavailable() -> RawResponse {
    RawResponse::new(503, Bytes::from_static(b"ServiceUnavailable"))
}

/// Where a request landed.
enum Target {
    Network(String),
    Node(usize),
}

impl SimState {
    fn node(&self, name: &str) -> Option<&SimNode> {
        self.nodes.iter().find(|n| n.name() == name)
    }

    fn node_mut(&mut self, name: &str) -> Option<&mut SimNode> {
        self.nodes.iter_mut().find(|n| n.name() == name)
    }

    fn network_of(&self, target: &Target) -> String {
        match target {
            Target::Network(network) => network.clone(),
            Target::Node(index) => self.nodes[*index].network.clone(),
        }
    }

    fn resolve(&self, url: &str) -> Option<Target> {
        let host = host(url);
        if let Some(lb_name) = host.strip_suffix(".lb.sim") {
            return self.load_balancers.iter().find(|lb| lb.name == lb_name).map(|lb| Target::Network(lb.network.clone()));
        }
        let name = host.strip_suffix(".sim")?;
        self.nodes.iter().position(|n| n.name() == name).map(Target::Node)
    }

    fn provision(&mut self, spec: &NodeSpec, state: NodeState, last_signed_seqno: u64) -> (NodeEndpoint, String) {
        self.next_node_id += 1;
        let node_id = format!("n{}", self.next_node_id);
        let unhealthy = self.unhealthy_on_create.contains(&spec.node_name);
        let node = SimNode {
            network: spec.network_name.clone(),
            node_id: node_id.clone(),
            state,
            last_signed_seqno,
            health: if unhealthy { NodeHealthStatus::NeedsReplacement } else { NodeHealthStatus::Ok },
            stuck: unhealthy,
            spec: spec.clone(),
        };
        let endpoint = node.endpoint();
        self.nodes.retain(|n| n.name() != spec.node_name);
        self.nodes.push(node);
        (endpoint, node_id)
    }

    fn record(node_id: &str, status: MembershipStatus, node_data: &NodeData) -> NetworkNode {
        NetworkNode {
            node_id: node_id.to_owned(),
            status,
            primary: false,
            node_data: node_data.clone(),
            last_written: 0,
            rpc_interfaces: None,
        }
    }

    fn records(&self, network: &str) -> Vec<NetworkNode> {
        let Some(service) = self.services.get(network) else {
            return Vec::new();
        };
        service
            .records
            .iter()
            .cloned()
            .map(|mut record| {
                record.primary = service.primary.as_deref() == Some(record.node_id.as_str());
                record
            })
            .collect()
    }

    fn transaction(&mut self) -> String {
        self.next_transaction += 1;
        format!("2.{}", self.next_transaction)
    }

    fn complete_recovery(&mut self, network: &str) {
        if let Some(service) = self.services.get_mut(network) {
            service.status = ServiceStatus::Open;
        }
        for node in self.nodes.iter_mut().filter(|n| n.network == network) {
            if node.state == NodeState::PartOfPublicNetwork {
                node.state = NodeState::PartOfNetwork;
            }
        }
    }

    // =========================================================================
    // Routing
    // =========================================================================

    fn route(&mut self, target: &Target, request: &ClusterRequest) -> RawResponse {
        let network = self.network_of(target);
        let (path, query) = request.path.split_once('?').unwrap_or((request.path.as_str(), ""));
        let path = path.trim_start_matches('/');

        if !self.services.contains_key(&network) {
            return unavailable();
        }

        match (request.method, path) {
            (Method::Get, "node/network") => self.network_info(&network),
            (Method::Get, "node/self_signed_certificate") => match target {
                Target::Node(index) => {
                    respond(200, &json!({ "self_signed_certificate": format!("node-cert-{}", self.nodes[*index].name()) }))
                },
                Target::Network(_) => RawResponse::new(404, Bytes::new()),
            },
            (Method::Get, "node/state") => match target {
                Target::Node(index) => {
                    let node = &self.nodes[*index];
                    respond(
                        200,
                        &json!({
                            "node_id": node.node_id,
                            "state": node.reported_state(),
                            "last_signed_seqno": node.last_signed_seqno,
                        }),
                    )
                },
                Target::Network(_) => RawResponse::new(404, Bytes::new()),
            },
            (Method::Get, "node/ready/gov") => match target {
                Target::Node(index) if self.nodes[*index].reported_state() == NodeState::PartOfNetwork => {
                    RawResponse::new(204, Bytes::new())
                },
                _ => unavailable(),
            },
            (Method::Get, "node/network/nodes") => respond(200, &json!({ "nodes": self.records(&network) })),
            (Method::Get, "node/network/removable_nodes") => {
                let removable: Vec<NetworkNode> = if self.removable {
                    self.records(&network).into_iter().filter(NetworkNode::is_retired).collect()
                } else {
                    Vec::new()
                };
                respond(200, &json!({ "nodes": removable }))
            },
            (Method::Get, "node/consensus") => self.consensus(&network),
            (Method::Get, "node/quotes") => {
                let quotes: Vec<Value> = self
                    .nodes
                    .iter()
                    .filter(|n| n.network == network)
                    .map(|n| {
                        json!({
                            "node_id": n.node_id,
                            "format": "Insecure_Virtual",
                            "raw": STANDARD.encode(json!({ "host_data": format!("hd-{}", n.name()) }).to_string()),
                        })
                    })
                    .collect();
                respond(200, &json!({ "quotes": quotes }))
            },
            (Method::Get, "gov/service/join-policy") => respond(200, &self.join_policy),
            (Method::Get, "gov/tx") => {
                let transaction_id = query
                    .split('&')
                    .find_map(|pair| pair.strip_prefix("transaction_id="))
                    .unwrap_or_default();
                respond(200, &json!({ "transactionId": transaction_id, "status": "Committed" }))
            },
            (Method::Get, p) if p.starts_with("gov/recovery/encrypted-shares/") => {
                let member = p.trim_start_matches("gov/recovery/encrypted-shares/");
                respond(200, &json!({ "encryptedShare": format!("encrypted:{member}") }))
            },
            (Method::Get, p) if p.starts_with("node/network/nodes/") => {
                let node_id = p.trim_start_matches("node/network/nodes/");
                match self.records(&network).into_iter().find(|r| r.node_id == node_id) {
                    Some(record) => respond(200, &record),
                    None => RawResponse::new(404, Bytes::new()),
                }
            },
            (Method::Delete, p) if p.starts_with("node/network/nodes/") => {
                let node_id = p.trim_start_matches("node/network/nodes/").to_owned();
                self.delete_record(&network, &node_id)
            },
            (Method::Post, "gov/members/proposals:create") => self.proposal(&network, request),
            (Method::Post, p) if p.starts_with("gov/members/proposals/") && p.ends_with(":submit") => {
                let proposal_id = p.trim_start_matches("gov/members/proposals/").split('/').next().unwrap_or_default();
                self.events.push(Event::BallotSubmitted(proposal_id.to_owned()));
                let mut response = respond(200, &json!({ "proposalId": proposal_id, "proposalState": self.ballot_state }));
                response.transaction_id = Some(self.transaction());
                response
            },
            (Method::Post, p) if p.starts_with("gov/recovery/members/") && p.ends_with(":recover") => {
                let member = p.trim_start_matches("gov/recovery/members/").trim_end_matches(":recover").to_owned();
                let share = signed_payload(request)
                    .and_then(|body| body.get("share").and_then(Value::as_str).map(str::to_owned))
                    .unwrap_or_default();
                self.shares.push(share);
                self.events.push(Event::RecoveryShareSubmitted(member));
                if self.share_response.contains(END_OF_RECOVERY) {
                    self.complete_recovery(&network);
                }
                respond(200, &json!({ "message": self.share_response }))
            },
            _ => RawResponse::new(404, Bytes::from(format!("no route for {} {path}", request.method))),
        }
    }

    fn network_info(&self, network: &str) -> RawResponse {
        let Some(service) = self.services.get(network) else {
            return unavailable();
        };
        respond(
            200,
            &json!({
                "service_certificate": service.certificate(network),
                "service_status": service.status,
                "current_view": 2,
                "primary_id": service.primary,
            }),
        )
    }

    fn consensus(&self, network: &str) -> RawResponse {
        let Some(service) = self.services.get(network) else {
            return unavailable();
        };
        let primary = self.consensus_primary.clone().or_else(|| service.primary.clone());
        let acks: serde_json::Map<String, Value> = self
            .nodes
            .iter()
            .filter(|n| n.network == network && Some(&n.node_id) != service.primary.as_ref())
            .filter(|n| service.records.iter().any(|r| r.node_id == n.node_id && !r.is_retired()))
            .map(|n| {
                let ms = self.acks.get(n.name()).copied().unwrap_or_default();
                (n.node_id.clone(), json!({ "last_received_ms": ms, "seqno": n.last_signed_seqno }))
            })
            .collect();
        respond(200, &json!({ "details": { "primary_id": primary, "acks": acks } }))
    }

    fn delete_record(&mut self, network: &str, node_id: &str) -> RawResponse {
        if self.failing_record_deletes.contains(node_id) {
            return RawResponse::new(500, Bytes::from_static(b"InternalError"));
        }
        let removable = self.removable;
        let Some(service) = self.services.get_mut(network) else {
            return unavailable();
        };
        let Some(position) = service.records.iter().position(|r| r.node_id == node_id) else {
            return RawResponse::new(404, Bytes::new());
        };
        if !removable || !service.records[position].is_retired() {
            return RawResponse::new(400, Bytes::from_static(b"NodeNotRetiredCommitted"));
        }
        service.records.remove(position);
        self.events.push(Event::RecordDeleted(node_id.to_owned()));
        RawResponse::new(204, Bytes::new())
    }

    fn proposal(&mut self, network: &str, request: &ClusterRequest) -> RawResponse {
        let Some(body) = signed_payload(request) else {
            return RawResponse::new(400, Bytes::from_static(b"unsigned proposal"));
        };
        let actions: Vec<ProposalAction> = body
            .get("actions")
            .cloned()
            .and_then(|actions| serde_json::from_value(actions).ok())
            .unwrap_or_default();

        let mut state = ProposalState::Accepted;
        for action in &actions {
            self.events.push(Event::ProposalSubmitted(action.name.clone()));
            self.proposals.push(action.clone());
            let node_id = action.args.as_ref().and_then(|a| a.get("node_id")).and_then(Value::as_str).map(str::to_owned);
            match action.name.as_str() {
                "transition_node_to_trusted" => {
                    if let Some(node_id) = node_id {
                        self.set_record_status(network, &node_id, MembershipStatus::Trusted);
                        if let Some(node) = self.nodes.iter_mut().find(|n| n.node_id == node_id) {
                            node.state = NodeState::PartOfNetwork;
                        }
                    }
                },
                "remove_node" => {
                    if let Some(node_id) = node_id {
                        self.set_record_status(network, &node_id, MembershipStatus::Retired);
                    }
                },
                "transition_service_to_open" => self.open_recovered_service(network),
                "set_member" => state = self.member_proposal_state,
                _ => {},
            }
        }

        let proposal_id = format!("p{}", self.next_transaction + 1);
        let mut response = respond(200, &json!({ "proposalId": proposal_id, "proposalState": state }));
        response.transaction_id = Some(self.transaction());
        response
    }

    fn set_record_status(&mut self, network: &str, node_id: &str, status: MembershipStatus) {
        if let Some(record) =
            self.services.get_mut(network).and_then(|s| s.records.iter_mut().find(|r| r.node_id == node_id))
        {
            record.status = status;
        }
    }

    fn open_recovered_service(&mut self, network: &str) {
        let provisioned: HashSet<String> =
            self.nodes.iter().filter(|n| n.network == network).map(|n| n.node_id.clone()).collect();
        let Some(service) = self.services.get_mut(network) else {
            return;
        };
        for record in &mut service.records {
            if !provisioned.contains(&record.node_id) {
                record.status = MembershipStatus::Retired;
            }
        }
        if service.primary.as_ref().is_none_or(|p| !provisioned.contains(p)) {
            service.primary = service
                .records
                .iter()
                .find(|r| provisioned.contains(&r.node_id) && !r.is_retired())
                .map(|r| r.node_id.clone());
        }
        service.status = if service.status == ServiceStatus::Recovering {
            ServiceStatus::WaitingForRecoveryShares
        } else {
            ServiceStatus::Open
        };
    }
}

/// Decodes the JSON payload of a `{type}|{payload}` envelope.
fn signed_payload(request: &ClusterRequest) -> Option<Value> {
    let body = request.body.as_ref()?;
    let separator = body.iter().position(|b| *b == b'|')?;
    serde_json::from_slice(&body[separator + 1..]).ok()
}

/// Simulated consortium network.
#[derive(Default)]
pub struct FakeConsortium {
    state: Mutex<SimState>,
}

impl std::fmt::Debug for FakeConsortium {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("FakeConsortium")
            .field("nodes", &state.nodes.iter().map(SimNode::name).collect::<Vec<_>>())
            .field("events", &state.events.len())
            .finish()
    }
}

impl FakeConsortium {
    /// Creates an empty consortium.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Orchestrator wired to this consortium for every provider seam, with
    /// short timeouts, a signer, and a share decryptor.
    pub fn orchestrator(self: &Arc<Self>) -> NetworkOrchestrator {
        let config = OrchestratorConfig { timeouts: TimeoutConfig::fast(), ..OrchestratorConfig::default() };
        let orchestrator = NetworkOrchestrator::builder()
            .node_provider(Arc::clone(self) as Arc<dyn NodeProvider>)
            .load_balancer(Arc::clone(self) as Arc<dyn LoadBalancerProvider>)
            .transport(Arc::clone(self) as Arc<dyn ClusterTransport>)
            .recovery_agent(Arc::clone(self) as Arc<dyn RecoveryAgent>)
            .share_decryptor(Arc::new(FakeDecryptor) as Arc<dyn RecoveryShareDecryptor>)
            .config(config)
            .build();
        orchestrator.set_signer(Arc::new(FakeSigner::new(MEMBER_ID)));
        orchestrator
    }

    // =========================================================================
    // Knobs
    // =========================================================================

    /// Sets the provider health of a node.
    pub fn set_health(&self, node_name: &str, status: NodeHealthStatus) {
        if let Some(node) = self.state.lock().node_mut(node_name) {
            node.health = status;
        }
    }

    /// Makes a node created under this name unhealthy and never ready.
    pub fn fail_on_create(&self, node_name: &str) {
        self.state.lock().unhealthy_on_create.insert(node_name.to_owned());
    }

    /// Makes every DELETE of the membership record `node_id` fail.
    pub fn fail_record_delete(&self, node_id: &str) {
        self.state.lock().failing_record_deletes.insert(node_id.to_owned());
    }

    /// Controls whether retired nodes become removable.
    pub fn set_removable(&self, removable: bool) {
        self.state.lock().removable = removable;
    }

    /// Overrides the primary reported by `/node/consensus`.
    pub fn set_consensus_primary(&self, node_id: Option<&str>) {
        self.state.lock().consensus_primary = node_id.map(str::to_owned);
    }

    /// Sets how long ago the primary heard from a node.
    pub fn set_ack(&self, node_name: &str, last_received_ms: u64) {
        self.state.lock().acks.insert(node_name.to_owned(), last_received_ms);
    }

    /// Sets the highest signed sequence number of a node's ledger.
    pub fn set_last_signed_seqno(&self, node_name: &str, seqno: u64) {
        if let Some(node) = self.state.lock().node_mut(node_name) {
            node.last_signed_seqno = seqno;
        }
    }

    /// Opens the service of a network, as its members would.
    pub fn open_service(&self, network: &str) {
        if let Some(service) = self.state.lock().services.get_mut(network) {
            service.status = ServiceStatus::Open;
        }
    }

    /// Retires a node's membership record without deprovisioning it.
    pub fn retire(&self, node_name: &str) {
        let mut state = self.state.lock();
        let Some((network, node_id)) = state.node(node_name).map(|n| (n.network.clone(), n.node_id.clone())) else {
            return;
        };
        state.set_record_status(&network, &node_id, MembershipStatus::Retired);
    }

    /// Sets the message returned for submitted recovery shares.
    pub fn set_share_response(&self, message: &str) {
        self.state.lock().share_response = message.to_owned();
    }

    /// Sets the message the recovery service returns for its share.
    pub fn set_agent_share_response(&self, message: &str) {
        self.state.lock().agent_share_response = message.to_owned();
    }

    /// Sets the state `set_member` proposals are created in.
    pub fn set_member_proposal_state(&self, state: ProposalState) {
        self.state.lock().member_proposal_state = state;
    }

    /// Sets the proposal state ballots resolve to.
    pub fn set_ballot_state(&self, state: ProposalState) {
        self.state.lock().ballot_state = state;
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Everything the orchestrator did, in order.
    pub fn events(&self) -> Vec<Event> {
        self.state.lock().events.clone()
    }

    /// Number of events matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&Event) -> bool) -> usize {
        self.state.lock().events.iter().filter(|e| predicate(e)).count()
    }

    /// Number of submitted proposals with this action.
    pub fn proposal_count(&self, action: &str) -> usize {
        self.state.lock().proposals.iter().filter(|a| a.name == action).count()
    }

    /// Arguments of every submitted proposal with this action.
    pub fn proposal_args(&self, action: &str) -> Vec<Value> {
        self.state.lock().proposals.iter().filter(|a| a.name == action).filter_map(|a| a.args.clone()).collect()
    }

    /// Total number of submitted proposals.
    pub fn total_proposals(&self) -> usize {
        self.state.lock().proposals.len()
    }

    /// Recovery shares submitted through governance.
    pub fn submitted_shares(&self) -> Vec<String> {
        self.state.lock().shares.clone()
    }

    /// Names of the provisioned nodes of a network, in creation order.
    pub fn node_names(&self, network: &str) -> Vec<String> {
        self.state.lock().nodes.iter().filter(|n| n.network == network).map(|n| n.name().to_owned()).collect()
    }

    /// Cluster-assigned id of a provisioned node.
    pub fn node_id(&self, node_name: &str) -> Option<String> {
        self.state.lock().node(node_name).map(|n| n.node_id.clone())
    }

    /// Spec a provisioned node was created with.
    pub fn node_spec(&self, node_name: &str) -> Option<NodeSpec> {
        self.state.lock().node(node_name).map(|n| n.spec.clone())
    }

    /// State a provisioned node reports.
    pub fn node_state(&self, node_name: &str) -> Option<NodeState> {
        self.state.lock().node(node_name).map(SimNode::reported_state)
    }

    /// Membership records of a network.
    pub fn records(&self, network: &str) -> Vec<NetworkNode> {
        self.state.lock().records(network)
    }

    /// Service status of a network.
    pub fn service_status(&self, network: &str) -> Option<ServiceStatus> {
        self.state.lock().services.get(network).map(|s| s.status)
    }

    /// Service certificate a network currently serves.
    pub fn service_certificate(&self, network: &str) -> Option<String> {
        self.state.lock().services.get(network).map(|s| s.certificate(network))
    }

    /// Backends of a network's load balancer.
    pub fn load_balancer_servers(&self, network: &str) -> Option<Vec<String>> {
        self.state.lock().load_balancers.iter().find(|lb| lb.network == network).map(|lb| lb.servers.clone())
    }
}

#[async_trait]
impl ClusterTransport for FakeConsortium {
    async fn send(&self, endpoint: &ClusterEndpoint, request: ClusterRequest) -> consortium_client::Result<RawResponse> {
        let mut state = self.state.lock();
        let Some(target) = state.resolve(&endpoint.url) else {
            return Ok(unavailable());
        };
        Ok(state.route(&target, &request))
    }
}

#[async_trait]
impl NodeProvider for FakeConsortium {
    fn infra_type(&self) -> InfraType {
        InfraType::Virtual
    }

    async fn create_start_node(
        &self,
        spec: &NodeSpec,
        _initial_members: &[InitialMember],
    ) -> ProviderResult<NodeEndpoint> {
        let mut state = self.state.lock();
        state.events.push(Event::StartNodeCreated(spec.node_name.clone()));
        let (endpoint, node_id) = state.provision(spec, NodeState::PartOfNetwork, 0);
        let record = SimState::record(&node_id, MembershipStatus::Trusted, &spec.node_data);
        state.services.insert(
            spec.network_name.clone(),
            Service { status: ServiceStatus::Opening, generation: 1, primary: Some(node_id), records: vec![record] },
        );
        Ok(endpoint)
    }

    async fn create_join_node(&self, spec: &NodeSpec, target: &JoinTarget) -> ProviderResult<NodeEndpoint> {
        let mut state = self.state.lock();
        state.events.push(Event::JoinNodeCreated(spec.node_name.clone()));
        let target_id = state
            .node(&target.node_name)
            .map(|n| n.node_id.clone())
            .ok_or_else(|| ProviderError::NotFound { resource: format!("join target {}", target.node_name) })?;
        let service_status = state
            .services
            .get(&spec.network_name)
            .map(|s| s.status)
            .ok_or_else(|| ProviderError::failed("create_join_node", "network has no service"))?;

        let (node_state, record_status) = match service_status {
            ServiceStatus::Open => (NodeState::Pending, MembershipStatus::Pending),
            ServiceStatus::Recovering | ServiceStatus::WaitingForRecoveryShares => {
                (NodeState::PartOfPublicNetwork, MembershipStatus::Trusted)
            },
            ServiceStatus::Opening | ServiceStatus::Unknown => (NodeState::PartOfNetwork, MembershipStatus::Trusted),
        };
        let (endpoint, node_id) = state.provision(spec, node_state, 0);
        let record = SimState::record(&node_id, record_status, &spec.node_data);
        let provisioned: HashSet<String> = state.nodes.iter().map(|n| n.node_id.clone()).collect();
        if let Some(service) = state.services.get_mut(&spec.network_name) {
            service.records.push(record);
            if service.primary.as_ref().is_none_or(|p| !provisioned.contains(p)) {
                service.primary = Some(target_id);
            }
        }
        Ok(endpoint)
    }

    async fn create_recover_node(
        &self,
        spec: &NodeSpec,
        network_to_recover: &str,
        _previous_service_certificate: &str,
    ) -> ProviderResult<NodeEndpoint> {
        let mut state = self.state.lock();
        state.events.push(Event::RecoverNodeCreated(spec.node_name.clone()));
        let seqno = state
            .ledgers
            .get(network_to_recover)
            .and_then(|ledgers| ledgers.iter().find(|(name, _)| *name == spec.node_name))
            .map(|(_, seqno)| *seqno)
            .ok_or_else(|| ProviderError::NotFound { resource: format!("ledger of {}", spec.node_name) })?;

        let (endpoint, node_id) = state.provision(spec, NodeState::PartOfPublicNetwork, seqno);
        let record = SimState::record(&node_id, MembershipStatus::Trusted, &spec.node_data);
        let service = state.services.entry(spec.network_name.clone()).or_insert_with(|| Service {
            status: ServiceStatus::Recovering,
            generation: 0,
            primary: None,
            records: Vec::new(),
        });
        if service.status != ServiceStatus::Recovering {
            service.status = ServiceStatus::Recovering;
            service.generation += 1;
            service.primary = None;
        }
        service.records.push(record);
        Ok(endpoint)
    }

    async fn candidate_recovery_nodes(&self, scope: NetworkScope<'_>) -> ProviderResult<Vec<String>> {
        let state = self.state.lock();
        Ok(state.ledgers.get(scope.name).map(|l| l.iter().map(|(name, _)| name.clone()).collect()).unwrap_or_default())
    }

    async fn delete_nodes(&self, scope: NetworkScope<'_>, option: DeleteOption) -> ProviderResult<()> {
        let mut state = self.state.lock();
        state.events.push(Event::NetworkDeleted { network: scope.name.to_owned(), option });
        let (deleted, kept): (Vec<SimNode>, Vec<SimNode>) =
            std::mem::take(&mut state.nodes).into_iter().partition(|n| n.network == scope.name);
        state.nodes = kept;
        match option {
            DeleteOption::RetainStorage => {
                let ledgers = deleted.iter().map(|n| (n.name().to_owned(), n.last_signed_seqno)).collect();
                state.ledgers.insert(scope.name.to_owned(), ledgers);
            },
            DeleteOption::DeleteStorage => {
                state.ledgers.remove(scope.name);
                state.services.remove(scope.name);
            },
        }
        Ok(())
    }

    async fn delete_node(&self, scope: NetworkScope<'_>, node_name: &str, _node_data: &NodeData) -> ProviderResult<()> {
        let mut state = self.state.lock();
        state.events.push(Event::NodeDeleted(node_name.to_owned()));
        state.nodes.retain(|n| !(n.network == scope.name && n.name() == node_name));
        Ok(())
    }

    async fn nodes(&self, scope: NetworkScope<'_>) -> ProviderResult<Vec<NodeEndpoint>> {
        let state = self.state.lock();
        Ok(state.nodes.iter().filter(|n| n.network == scope.name).map(SimNode::endpoint).collect())
    }

    async fn nodes_health(&self, scope: NetworkScope<'_>) -> ProviderResult<Vec<NodeHealth>> {
        let state = self.state.lock();
        Ok(state.nodes.iter().filter(|n| n.network == scope.name).map(health).collect())
    }

    async fn node_health(&self, scope: NetworkScope<'_>, node_name: &str) -> ProviderResult<NodeHealth> {
        let state = self.state.lock();
        state
            .nodes
            .iter()
            .find(|n| n.network == scope.name && n.name() == node_name)
            .map(health)
            .ok_or_else(|| ProviderError::NotFound { resource: format!("node {node_name}") })
    }

    async fn generate_security_policy(&self, option: PolicyCreationOption) -> ProviderResult<Value> {
        Ok(json!({ "policy": option, "digest": format!("{option:?}").to_lowercase() }))
    }

    async fn generate_join_policy(&self, option: PolicyCreationOption) -> ProviderResult<Value> {
        Ok(json!({ "snp": { "hostData": { format!("{option:?}").to_lowercase(): "" } } }))
    }
}

fn health(node: &SimNode) -> NodeHealth {
    let reasons = match node.health {
        NodeHealthStatus::Ok => Vec::new(),
        NodeHealthStatus::NeedsReplacement => {
            vec![Reason { code: "ContainerExited".to_owned(), message: "exit code 137".to_owned() }]
        },
    };
    NodeHealth {
        name: node.name().to_owned(),
        endpoint: node_address(node.name()),
        status: node.health,
        reasons,
    }
}

#[async_trait]
impl LoadBalancerProvider for FakeConsortium {
    async fn create(
        &self,
        lb_name: &str,
        scope: NetworkScope<'_>,
        servers: &[String],
    ) -> ProviderResult<LoadBalancerEndpoint> {
        let mut state = self.state.lock();
        state.events.push(Event::LoadBalancerCreated(servers.to_vec()));
        state.load_balancers.retain(|lb| lb.network != scope.name);
        state.load_balancers.push(LoadBalancer {
            name: lb_name.to_owned(),
            network: scope.name.to_owned(),
            servers: servers.to_vec(),
        });
        Ok(LoadBalancerEndpoint { name: lb_name.to_owned(), endpoint: format!("https://{}", fqdn(lb_name)) })
    }

    async fn update(
        &self,
        lb_name: &str,
        scope: NetworkScope<'_>,
        servers: &[String],
    ) -> ProviderResult<LoadBalancerEndpoint> {
        let mut state = self.state.lock();
        state.events.push(Event::LoadBalancerUpdated(servers.to_vec()));
        let lb = state
            .load_balancers
            .iter_mut()
            .find(|lb| lb.network == scope.name)
            .ok_or_else(|| ProviderError::NotFound { resource: format!("load balancer {lb_name}") })?;
        lb.servers = servers.to_vec();
        Ok(LoadBalancerEndpoint { name: lb_name.to_owned(), endpoint: format!("https://{}", fqdn(lb_name)) })
    }

    async fn delete(&self, scope: NetworkScope<'_>) -> ProviderResult<()> {
        let mut state = self.state.lock();
        if let Some(position) = state.load_balancers.iter().position(|lb| lb.network == scope.name) {
            let lb = state.load_balancers.remove(position);
            state.events.push(Event::LoadBalancerDeleted(lb.name));
        }
        Ok(())
    }

    fn generate_fqdn(&self, lb_name: &str, _scope: NetworkScope<'_>) -> String {
        fqdn(lb_name)
    }

    async fn try_endpoint(&self, scope: NetworkScope<'_>) -> ProviderResult<Option<LoadBalancerEndpoint>> {
        let state = self.state.lock();
        Ok(state.load_balancers.iter().find(|lb| lb.network == scope.name).map(|lb| LoadBalancerEndpoint {
            name: lb.name.clone(),
            endpoint: format!("https://{}", fqdn(&lb.name)),
        }))
    }

    async fn health(&self, scope: NetworkScope<'_>) -> ProviderResult<LoadBalancerHealth> {
        let endpoint = self.endpoint(scope).await?;
        Ok(LoadBalancerHealth {
            name: endpoint.name,
            endpoint: endpoint.endpoint,
            status: NodeHealthStatus::Ok,
            reasons: Vec::new(),
        })
    }
}

#[async_trait]
impl RecoveryAgent for FakeConsortium {
    async fn generate_recovery_member(
        &self,
        _scope: NetworkScope<'_>,
        member_name: &str,
        service: &RecoveryServiceEndpoint,
    ) -> ProviderResult<RecoveryMember> {
        Ok(RecoveryMember {
            signing_cert: format!("recovery-cert-{member_name}"),
            encryption_public_key: format!("recovery-key-{member_name}"),
            recovery_service: json!({ "endpoint": service.endpoint, "hostData": "rs-host-data" }),
        })
    }

    async fn activate_recovery_member(
        &self,
        _scope: NetworkScope<'_>,
        member_name: &str,
        _service: &RecoveryServiceEndpoint,
    ) -> ProviderResult<()> {
        self.state.lock().events.push(Event::RecoveryMemberActivated(member_name.to_owned()));
        Ok(())
    }

    async fn submit_recovery_share(
        &self,
        scope: NetworkScope<'_>,
        member_name: &str,
        _service: &RecoveryServiceEndpoint,
    ) -> ProviderResult<Value> {
        let mut state = self.state.lock();
        state.events.push(Event::RecoveryShareSubmitted(member_name.to_owned()));
        let message = state.agent_share_response.clone();
        if message.contains(END_OF_RECOVERY) {
            state.complete_recovery(scope.name);
        }
        Ok(json!({ "message": message }))
    }

    async fn set_network_join_policy(
        &self,
        scope: NetworkScope<'_>,
        _service: &RecoveryServiceEndpoint,
        _join_policy: &Value,
    ) -> ProviderResult<()> {
        self.state.lock().events.push(Event::JoinPolicyPushed(scope.name.to_owned()));
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_host_parsing() {
        assert_eq!(host("https://net-0.sim:8080"), "net-0.sim");
        assert_eq!(host("https://lb-nw-net.lb.sim"), "lb-nw-net.lb.sim");
        assert_eq!(host("net-1.sim/node/state"), "net-1.sim");
    }

    #[test]
    fn test_unknown_host_is_unavailable() {
        let state = SimState::default();
        assert!(state.resolve("https://ghost.sim:8080").is_none());
        assert!(state.resolve("https://lb-nw-ghost.lb.sim").is_none());
    }
}
