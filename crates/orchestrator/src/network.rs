//! Network lifecycle orchestration.
//!
//! [`NetworkOrchestrator`] is the entry point: it creates, updates, deletes,
//! and inspects networks. The heavier workflows live in sibling modules as
//! further `impl NetworkOrchestrator` blocks:
//!
//! - `readiness`: waits that take a new node from created to ready
//! - `reconciler`: scale up, scale down, replace unhealthy, retired cleanup
//! - `recovery`: disaster recovery from retained ledgers
//! - `governance`: single-proposal wrappers and attestation reports

use std::sync::Arc;

use consortium_client::{
    AttestationVerifier, ClientError, ClusterClient, ClusterEndpoint, ClusterTransport,
    GovernanceClient, GovernanceSigner, HttpTransport, PollPolicy, RecoveryShareDecryptor,
};
use consortium_types::{
    DeleteOption, InitialMember, LoadBalancerEndpoint, Network, NetworkHealth, NodeEndpoint, NodeState,
    SecurityPolicyConfig,
    config::{OrchestratorConfig, TimeoutConfig},
    node_name::{load_balancer_name, next_ordinal, node_san, start_node_name, to_id},
};
use parking_lot::RwLock;
use serde_json::Value;
use snafu::{OptionExt, ensure};
use tracing::info;

use crate::{
    error::{
        CapabilityNotConfiguredSnafu, InvalidArgumentSnafu, InvariantViolationSnafu, Result,
        SigningNotConfiguredSnafu,
    },
    provider::{LoadBalancerProvider, NetworkScope, NodeProvider, NodeTemplate, RecoveryAgent},
    readiness::JoinPhase,
};

/// Desired shape of a network.
#[derive(Debug, Clone, bon::Builder)]
pub struct NetworkRequest {
    /// Network name.
    #[builder(into)]
    pub network_name: String,
    /// Desired number of nodes.
    pub node_count: usize,
    /// Members installed at genesis. Only used when creating a network.
    #[builder(default)]
    pub initial_members: Vec<InitialMember>,
    /// Node log verbosity; falls back to the configured default.
    #[builder(into)]
    pub node_log_level: Option<String>,
    /// Enforcement policy for new nodes.
    #[builder(default)]
    pub security_policy: SecurityPolicyConfig,
    /// Backend-specific settings passed to providers.
    pub provider_config: Option<Value>,
}

impl NetworkRequest {
    /// Provider scope of the requested network.
    pub fn scope(&self) -> NetworkScope<'_> {
        NetworkScope::new(&self.network_name, self.provider_config.as_ref())
    }
}

/// The primary node of a running network and the service identity it serves.
#[derive(Debug, Clone)]
pub(crate) struct Primary {
    pub endpoint: NodeEndpoint,
    pub node_id: String,
    pub service_certificate: String,
}

/// Drives network lifecycle operations against pluggable providers.
///
/// The orchestrator keeps no state between calls apart from its signing
/// identity, which can be swapped at runtime.
///
/// # Example
///
/// ```no_run
/// # use std::sync::Arc;
/// # use consortium_orchestrator::{NetworkOrchestrator, NetworkRequest, LoadBalancerProvider, NodeProvider};
/// # async fn example(nodes: Arc<dyn NodeProvider>, lb: Arc<dyn LoadBalancerProvider>) -> consortium_orchestrator::Result<()> {
/// let orchestrator = NetworkOrchestrator::builder().node_provider(nodes).load_balancer(lb).build();
/// let request = NetworkRequest::builder().network_name("contoso").node_count(3).build();
/// let network = orchestrator.create_network(&request).await?;
/// println!("{} is up at {}", network.name, network.endpoint);
/// # Ok(())
/// # }
/// ```
#[derive(bon::Builder)]
pub struct NetworkOrchestrator {
    /// Node provisioning backend.
    pub(crate) node_provider: Arc<dyn NodeProvider>,
    /// Load balancer provisioning backend.
    pub(crate) load_balancer: Arc<dyn LoadBalancerProvider>,
    /// Byte-level cluster transport.
    #[builder(default = Arc::new(HttpTransport::new()) as Arc<dyn ClusterTransport>)]
    pub(crate) transport: Arc<dyn ClusterTransport>,
    /// Timeouts, API version, and defaults.
    #[builder(default)]
    pub(crate) config: OrchestratorConfig,
    /// Confidential recovery service client.
    pub(crate) recovery_agent: Option<Arc<dyn RecoveryAgent>>,
    /// Unwraps encrypted recovery shares for manual recovery.
    pub(crate) share_decryptor: Option<Arc<dyn RecoveryShareDecryptor>>,
    /// Verifies hardware attestation quotes.
    pub(crate) attestation_verifier: Option<Arc<dyn AttestationVerifier>>,
    #[builder(skip)]
    signer: RwLock<Option<Arc<dyn GovernanceSigner>>>,
}

impl std::fmt::Debug for NetworkOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkOrchestrator")
            .field("infra_type", &self.node_provider.infra_type())
            .field("config", &self.config)
            .field("signing_configured", &self.signer.read().is_some())
            .finish_non_exhaustive()
    }
}

impl NetworkOrchestrator {
    // =========================================================================
    // Signing identity
    // =========================================================================

    /// Installs the identity used to sign governance messages.
    pub fn set_signer(&self, signer: Arc<dyn GovernanceSigner>) {
        info!(member_id = signer.member_id(), "Signing identity configured");
        *self.signer.write() = Some(signer);
    }

    /// Removes the signing identity.
    pub fn clear_signer(&self) {
        *self.signer.write() = None;
    }

    /// Returns the signing identity or fails if none is configured.
    pub(crate) fn require_signer(&self) -> Result<Arc<dyn GovernanceSigner>> {
        self.signer.read().clone().context(SigningNotConfiguredSnafu)
    }

    pub(crate) fn require_recovery_agent(&self) -> Result<Arc<dyn RecoveryAgent>> {
        self.recovery_agent.clone().context(CapabilityNotConfiguredSnafu { capability: "recovery agent" })
    }

    // =========================================================================
    // Client construction
    // =========================================================================

    pub(crate) fn timeouts(&self) -> &TimeoutConfig {
        &self.config.timeouts
    }

    /// Poll policy with the configured interval.
    pub(crate) fn policy(&self, timeout: std::time::Duration) -> PollPolicy {
        PollPolicy::with_timeout(self.timeouts(), timeout)
    }

    pub(crate) fn client(&self, endpoint: ClusterEndpoint) -> ClusterClient {
        ClusterClient::new(Arc::clone(&self.transport), endpoint, self.config.api_version.clone())
            .with_request_timeout(self.timeouts().request)
    }

    /// Client for an endpoint whose identity is not known yet.
    pub(crate) fn insecure_client(&self, name: &str, url: &str) -> ClusterClient {
        self.client(ClusterEndpoint::insecure(name, url))
    }

    /// Client for an endpoint serving the network identity.
    pub(crate) fn service_client(&self, name: &str, url: &str, service_certificate: &str) -> ClusterClient {
        self.client(ClusterEndpoint::with_service_certificate(name, url, service_certificate))
    }

    /// Governance client submitting through `cluster`.
    pub(crate) fn governance(&self, cluster: ClusterClient) -> Result<GovernanceClient> {
        let signer = self.require_signer()?;
        let commit = self.policy(self.timeouts().proposal_commit);
        Ok(GovernanceClient::new(cluster, signer, commit))
    }

    /// Fails with [`ClientError::NodeUnhealthy`] if the provider reports
    /// that the node needs replacement.
    pub(crate) async fn check_node_healthy(&self, scope: NetworkScope<'_>, node_name: &str) -> Result<()> {
        let health = self.node_provider.node_health(scope, node_name).await?;
        if health.needs_replacement() {
            return Err(ClientError::NodeUnhealthy {
                node: node_name.to_owned(),
                detail: health.describe_reasons(),
            }
            .into());
        }
        Ok(())
    }

    fn template(&self, request: &NetworkRequest, lb_fqdn: &str) -> NodeTemplate {
        NodeTemplate {
            network_name: request.network_name.clone(),
            node_log_level: request.node_log_level.clone().or_else(|| self.config.node_log_level.clone()),
            security_policy: request.security_policy.clone(),
            san: vec![node_san(lb_fqdn)],
            provider_config: request.provider_config.clone(),
        }
    }

    /// Node template for `request`, with the SAN of the network's load balancer.
    pub(crate) fn node_template(&self, request: &NetworkRequest) -> NodeTemplate {
        let lb_name = load_balancer_name(&request.network_name);
        let fqdn = self.load_balancer.generate_fqdn(&lb_name, request.scope());
        self.template(request, &fqdn)
    }

    /// Next free ordinal among the provider's nodes of a network.
    pub(crate) async fn next_ordinal(&self, scope: NetworkScope<'_>) -> Result<u64> {
        let nodes = self.node_provider.nodes(scope).await?;
        Ok(next_ordinal(nodes.iter().map(|n| n.node_name.as_str())))
    }

    fn network(&self, name: &str, endpoint: &LoadBalancerEndpoint, nodes: Vec<String>) -> Network {
        Network {
            name: name.to_owned(),
            infra_type: self.node_provider.infra_type(),
            node_count: nodes.len(),
            endpoint: endpoint.endpoint.clone(),
            nodes,
        }
    }

    // =========================================================================
    // Lifecycle operations
    // =========================================================================

    /// Creates a network of `request.node_count` nodes behind a load balancer.
    ///
    /// The start node is created and made ready first; the remaining nodes
    /// join it concurrently. The load balancer is created last and waited on.
    ///
    /// # Errors
    ///
    /// Returns a provider error, a timeout, or a node health failure.
    pub async fn create_network(&self, request: &NetworkRequest) -> Result<Network> {
        ensure!(
            request.node_count >= 1,
            InvalidArgumentSnafu { message: "node count cannot be less than 1" }
        );
        let scope = request.scope();
        let template = self.node_template(request);
        let start_name = start_node_name(&request.network_name);

        info!(network = scope.name, node = %start_name, phase = %JoinPhase::Created, "Creating start node");
        let start =
            self.node_provider.create_start_node(&template.spec(&start_name), &request.initial_members).await?;
        let service_certificate =
            self.service_certificate(&start.node_name, &start.client_rpc_address, Some((scope, start_name.as_str()))).await?;
        self.wait_for_start_node_ready(&start, &service_certificate).await?;

        info!(
            network = scope.name,
            node = %start.node_name,
            address = %start.client_rpc_address,
            remaining = request.node_count - 1,
            "Start node is up, joining remaining nodes"
        );
        let ordinal = self.next_ordinal(scope).await?;
        let joined = self
            .create_join_nodes(
                &template,
                request.node_count - 1,
                ordinal,
                &start,
                &service_certificate,
                NodeState::PartOfNetwork,
            )
            .await?;

        let servers: Vec<String> = std::iter::once(start.client_rpc_address.clone())
            .chain(joined.iter().map(|n| n.client_rpc_address.clone()))
            .collect();
        let lb_name = load_balancer_name(&request.network_name);
        let lb = self.load_balancer.create(&lb_name, scope, &servers).await?;
        self.wait_for_load_balancer_ready(&lb, &service_certificate).await?;

        info!(network = scope.name, endpoint = %lb.endpoint, "Network is up");
        Ok(self.network(&request.network_name, &lb, servers))
    }

    /// Converges a running network to `request.node_count` healthy nodes.
    ///
    /// Retired leftovers are cleaned up first, then nodes are added, removed,
    /// or replaced. The load balancer is only updated if anything changed.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::InvalidArgument`](crate::OrchestratorError::InvalidArgument)
    /// for a zero node count, [`OrchestratorError::SigningNotConfigured`](crate::OrchestratorError::SigningNotConfigured)
    /// without a signer, [`OrchestratorError::InvariantViolation`](crate::OrchestratorError::InvariantViolation)
    /// if no primary can be located, [`OrchestratorError::PrimaryShifted`](crate::OrchestratorError::PrimaryShifted)
    /// if the primary moves mid-way, or a provider, cluster, or timeout error.
    pub async fn update_network(&self, request: &NetworkRequest) -> Result<Network> {
        ensure!(
            request.node_count >= 1,
            InvalidArgumentSnafu { message: "node count cannot be less than 1" }
        );
        self.require_signer()?;

        let scope = request.scope();
        let mut lb = self.load_balancer.endpoint(scope).await?;
        let fqdn = self.load_balancer.generate_fqdn(&lb.name, scope);
        let template = self.template(request, &fqdn);

        let primary = self.locate_primary(scope, &lb).await?;
        info!(
            network = scope.name,
            node = %primary.endpoint.node_name,
            node_id = %primary.node_id,
            address = %primary.endpoint.client_rpc_address,
            "Located primary"
        );

        let outcome = self.reconcile(&template, &primary, request.node_count).await?;

        let mut nodes = self.node_provider.nodes(scope).await?;
        if outcome.changed() {
            let health = self.node_provider.nodes_health(scope).await?;
            let servers: Vec<String> = nodes
                .iter()
                .filter(|n| !health.iter().any(|h| h.name == n.node_name && h.needs_replacement()))
                .map(|n| n.client_rpc_address.clone())
                .collect();
            info!(network = scope.name, ?servers, ?outcome, "Updating load balancer backends");
            lb = self.load_balancer.update(&lb.name, scope, &servers).await?;
            self.wait_for_load_balancer_ready(&lb, &primary.service_certificate).await?;
            nodes = self.node_provider.nodes(scope).await?;
        } else {
            info!(network = scope.name, "Network already matches the requested shape");
        }

        Ok(self.network(&request.network_name, &lb, nodes.into_iter().map(|n| n.client_rpc_address).collect()))
    }

    /// Deletes the nodes and the load balancer of a network.
    ///
    /// No governance is involved; with [`DeleteOption::RetainStorage`] the
    /// ledgers survive for a later recovery.
    ///
    /// # Errors
    ///
    /// Returns a provider error.
    pub async fn delete_network(&self, scope: NetworkScope<'_>, option: DeleteOption) -> Result<()> {
        info!(network = scope.name, ?option, "Deleting network");
        self.node_provider.delete_nodes(scope, option).await?;
        self.load_balancer.delete(scope).await?;
        Ok(())
    }

    /// Describes a network, or returns `None` if it has no load balancer.
    ///
    /// # Errors
    ///
    /// Returns a provider error.
    pub async fn get_network(&self, scope: NetworkScope<'_>) -> Result<Option<Network>> {
        let Some(lb) = self.load_balancer.try_endpoint(scope).await? else {
            return Ok(None);
        };
        let nodes = self.node_provider.nodes(scope).await?;
        Ok(Some(self.network(scope.name, &lb, nodes.into_iter().map(|n| n.client_rpc_address).collect())))
    }

    /// Reports node and load balancer health, queried concurrently.
    ///
    /// # Errors
    ///
    /// Returns a provider error.
    pub async fn get_network_health(&self, scope: NetworkScope<'_>) -> Result<NetworkHealth> {
        let (node_health, load_balancer_health) =
            futures::join!(self.node_provider.nodes_health(scope), self.load_balancer.health(scope));
        Ok(NetworkHealth { load_balancer_health: load_balancer_health?, node_health: node_health? })
    }

    // =========================================================================
    // Primary location
    // =========================================================================

    /// Finds the primary through the load balancer and maps it to its
    /// provider endpoint.
    pub(crate) async fn locate_primary(&self, scope: NetworkScope<'_>, lb: &LoadBalancerEndpoint) -> Result<Primary> {
        let service_certificate = self.service_certificate(&lb.name, &lb.endpoint, None).await?;
        let service = self.service_client(&lb.name, &lb.endpoint, &service_certificate);
        let members = service.network_nodes().await?;
        let primary = members
            .into_iter()
            .find(|n| n.primary)
            .context(InvariantViolationSnafu { message: "no node reports itself as primary" })?;

        let endpoints = self.node_provider.nodes(scope).await?;
        let endpoint = endpoints.into_iter().find(|n| to_id(&n.node_name) == primary.node_data.id).context(
            InvariantViolationSnafu {
                message: format!(
                    "primary {} with node data id {} has no provider endpoint",
                    primary.node_id, primary.node_data.id
                ),
            },
        )?;

        Ok(Primary { endpoint, node_id: primary.node_id, service_certificate })
    }

    /// Service client reaching the network through its load balancer, and
    /// the service certificate it trusts.
    pub(crate) async fn load_balancer_client(&self, scope: NetworkScope<'_>) -> Result<(ClusterClient, String)> {
        let lb = self.load_balancer.endpoint(scope).await?;
        let service_certificate = self.service_certificate(&lb.name, &lb.endpoint, None).await?;
        Ok((self.service_client(&lb.name, &lb.endpoint, &service_certificate), service_certificate))
    }
}
