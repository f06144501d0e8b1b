//! Infrastructure provider interfaces.
//!
//! The orchestrator never provisions compute or networking itself. Node
//! containers or VMs, load balancers, and the confidential recovery service
//! are reached through these traits, selected by the embedding application.

use async_trait::async_trait;
use consortium_types::{
    DeleteOption, InfraType, InitialMember, LoadBalancerEndpoint, LoadBalancerHealth, NodeData,
    NodeEndpoint, NodeHealth, PolicyCreationOption, RecoveryMember, RecoveryServiceEndpoint,
    SecurityPolicyConfig, node_name::to_id,
};
use serde_json::Value;

use crate::error::ProviderError;

/// Result type alias for provider calls.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Network a provider call applies to.
#[derive(Debug, Clone, Copy)]
pub struct NetworkScope<'a> {
    /// Network name.
    pub name: &'a str,
    /// Backend-specific settings passed through untouched.
    pub provider_config: Option<&'a Value>,
}

impl<'a> NetworkScope<'a> {
    /// Creates a scope.
    pub fn new(name: &'a str, provider_config: Option<&'a Value>) -> Self {
        Self { name, provider_config }
    }
}

/// Everything a provider needs to create one node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSpec {
    /// Network the node belongs to.
    pub network_name: String,
    /// Node name, `{network}-{ordinal}`.
    pub node_name: String,
    /// Log verbosity passed to the node process.
    pub node_log_level: Option<String>,
    /// Enforcement policy for confidential backends.
    pub security_policy: SecurityPolicyConfig,
    /// Data recorded with the node in the membership table.
    pub node_data: NodeData,
    /// Subject alternative names of the node certificate.
    pub san: Vec<String>,
    /// Backend-specific settings.
    pub provider_config: Option<Value>,
}

/// Node settings shared by every node created in one operation.
#[derive(Debug, Clone)]
pub(crate) struct NodeTemplate {
    pub network_name: String,
    pub node_log_level: Option<String>,
    pub security_policy: SecurityPolicyConfig,
    pub san: Vec<String>,
    pub provider_config: Option<Value>,
}

impl NodeTemplate {
    /// Builds the spec of a node named `node_name`.
    pub(crate) fn spec(&self, node_name: &str) -> NodeSpec {
        NodeSpec {
            network_name: self.network_name.clone(),
            node_name: node_name.to_owned(),
            node_log_level: self.node_log_level.clone(),
            security_policy: self.security_policy.clone(),
            node_data: NodeData {
                id: to_id(node_name),
                name: node_name.to_owned(),
                infra_provider_data: None,
            },
            san: self.san.clone(),
            provider_config: self.provider_config.clone(),
        }
    }

    pub(crate) fn scope(&self) -> NetworkScope<'_> {
        NetworkScope::new(&self.network_name, self.provider_config.as_ref())
    }
}

/// Existing node a new node joins through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinTarget {
    /// Name of the target node.
    pub node_name: String,
    /// Client RPC address of the target node.
    pub rpc_address: String,
    /// PEM service certificate of the network.
    pub service_certificate: String,
}

/// Provisions and inspects ledger nodes.
#[async_trait]
pub trait NodeProvider: Send + Sync {
    /// Backend kind.
    fn infra_type(&self) -> InfraType;

    /// Starts the first node of a new network.
    async fn create_start_node(
        &self,
        spec: &NodeSpec,
        initial_members: &[InitialMember],
    ) -> ProviderResult<NodeEndpoint>;

    /// Starts a node that joins an existing network through `target`.
    async fn create_join_node(&self, spec: &NodeSpec, target: &JoinTarget) -> ProviderResult<NodeEndpoint>;

    /// Starts a node that recovers the retained ledger of `network_to_recover`.
    async fn create_recover_node(
        &self,
        spec: &NodeSpec,
        network_to_recover: &str,
        previous_service_certificate: &str,
    ) -> ProviderResult<NodeEndpoint>;

    /// Names of the nodes whose retained storage can seed a recovery.
    async fn candidate_recovery_nodes(&self, scope: NetworkScope<'_>) -> ProviderResult<Vec<String>>;

    /// Deletes every node of a network.
    ///
    /// Must succeed when the network has no nodes left.
    async fn delete_nodes(&self, scope: NetworkScope<'_>, option: DeleteOption) -> ProviderResult<()>;

    /// Deletes one node.
    ///
    /// Deleting a node that no longer exists must succeed. Retired cleanup
    /// retries the deletion while the node's membership record remains.
    async fn delete_node(&self, scope: NetworkScope<'_>, node_name: &str, node_data: &NodeData) -> ProviderResult<()>;

    /// Lists the provisioned nodes of a network.
    async fn nodes(&self, scope: NetworkScope<'_>) -> ProviderResult<Vec<NodeEndpoint>>;

    /// Reports the health of every node of a network.
    async fn nodes_health(&self, scope: NetworkScope<'_>) -> ProviderResult<Vec<NodeHealth>>;

    /// Reports the health of one node.
    async fn node_health(&self, scope: NetworkScope<'_>, node_name: &str) -> ProviderResult<NodeHealth>;

    /// Produces the enforcement policy for new nodes.
    async fn generate_security_policy(&self, option: PolicyCreationOption) -> ProviderResult<Value>;

    /// Produces the join policy matching [`Self::generate_security_policy`].
    async fn generate_join_policy(&self, option: PolicyCreationOption) -> ProviderResult<Value>;
}

/// Provisions the load balancer fronting a network.
#[async_trait]
pub trait LoadBalancerProvider: Send + Sync {
    /// Creates the load balancer over `servers`.
    async fn create(
        &self,
        lb_name: &str,
        scope: NetworkScope<'_>,
        servers: &[String],
    ) -> ProviderResult<LoadBalancerEndpoint>;

    /// Replaces the backend set.
    async fn update(
        &self,
        lb_name: &str,
        scope: NetworkScope<'_>,
        servers: &[String],
    ) -> ProviderResult<LoadBalancerEndpoint>;

    /// Deletes the load balancer. Deleting a missing one succeeds.
    async fn delete(&self, scope: NetworkScope<'_>) -> ProviderResult<()>;

    /// Fully qualified domain name the load balancer will be reachable at.
    fn generate_fqdn(&self, lb_name: &str, scope: NetworkScope<'_>) -> String;

    /// Endpoint of the load balancer, if it exists.
    async fn try_endpoint(&self, scope: NetworkScope<'_>) -> ProviderResult<Option<LoadBalancerEndpoint>>;

    /// Endpoint of the load balancer.
    ///
    /// Fails with [`ProviderError::NotFound`] if there is none.
    async fn endpoint(&self, scope: NetworkScope<'_>) -> ProviderResult<LoadBalancerEndpoint> {
        self.try_endpoint(scope).await?.ok_or_else(|| ProviderError::NotFound {
            resource: format!("load balancer of network {}", scope.name),
        })
    }

    /// Reports load balancer health.
    async fn health(&self, scope: NetworkScope<'_>) -> ProviderResult<LoadBalancerHealth>;
}

/// Client of the confidential recovery service.
#[async_trait]
pub trait RecoveryAgent: Send + Sync {
    /// Asks the recovery service to mint a recovery member identity.
    async fn generate_recovery_member(
        &self,
        scope: NetworkScope<'_>,
        member_name: &str,
        service: &RecoveryServiceEndpoint,
    ) -> ProviderResult<RecoveryMember>;

    /// Asks the recovery service to accept its membership.
    async fn activate_recovery_member(
        &self,
        scope: NetworkScope<'_>,
        member_name: &str,
        service: &RecoveryServiceEndpoint,
    ) -> ProviderResult<()>;

    /// Asks the recovery service to submit its recovery share.
    ///
    /// Returns the share submission response, which carries a `message`.
    async fn submit_recovery_share(
        &self,
        scope: NetworkScope<'_>,
        member_name: &str,
        service: &RecoveryServiceEndpoint,
    ) -> ProviderResult<Value>;

    /// Pushes the network join policy to the recovery service.
    async fn set_network_join_policy(
        &self,
        scope: NetworkScope<'_>,
        service: &RecoveryServiceEndpoint,
        join_policy: &Value,
    ) -> ProviderResult<()>;
}
