//! Typed access to the node and governance HTTP surface of a cluster.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use consortium_types::{
    ConsensusDetails, ConsensusView, EncryptedShare, NetworkInfo, NetworkNode, NetworkNodeList,
    NodeQuote, NodeStateReport, QuoteList, SelfSignedCertificate, TransactionInfo,
};
use serde::de::DeserializeOwned;

use crate::{
    error::Result,
    poll::PollState,
    transport::{ClusterEndpoint, ClusterRequest, ClusterTransport, Method, RawResponse},
};

/// Client bound to one cluster endpoint.
///
/// Cheap to clone; clones share the transport.
#[derive(Clone)]
pub struct ClusterClient {
    transport: Arc<dyn ClusterTransport>,
    endpoint: ClusterEndpoint,
    api_version: String,
    request_timeout: Option<Duration>,
}

impl std::fmt::Debug for ClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterClient")
            .field("endpoint", &self.endpoint)
            .field("api_version", &self.api_version)
            .finish_non_exhaustive()
    }
}

impl ClusterClient {
    /// Creates a client for `endpoint`.
    pub fn new(
        transport: Arc<dyn ClusterTransport>,
        endpoint: ClusterEndpoint,
        api_version: impl Into<String>,
    ) -> Self {
        Self { transport, endpoint, api_version: api_version.into(), request_timeout: None }
    }

    /// Applies a timeout to every request sent by this client.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Endpoint this client talks to.
    pub fn endpoint(&self) -> &ClusterEndpoint {
        &self.endpoint
    }

    /// Governance API version appended to `gov/` paths.
    pub fn api_version(&self) -> &str {
        &self.api_version
    }

    /// Appends the API version query parameter to a governance path.
    pub fn gov_path(&self, path: &str) -> String {
        let separator = if path.contains('?') { '&' } else { '?' };
        format!("{path}{separator}api-version={}", self.api_version)
    }

    /// Sends a request and returns the response whatever its status.
    ///
    /// # Errors
    ///
    /// Returns a transport error if no response was received.
    pub async fn send(&self, request: ClusterRequest) -> Result<RawResponse> {
        let request = request.timeout(self.request_timeout);
        self.transport.send(&self.endpoint, request).await
    }

    /// Sends a `GET` and decodes a successful JSON response.
    ///
    /// # Errors
    ///
    /// Returns a transport error, [`ClientError::RemoteCall`](crate::ClientError::RemoteCall)
    /// on a non-success status, or a decode error.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.send(ClusterRequest::get(path)).await?.error_for_status(Method::Get, path)?;
        response.json(path)
    }

    /// Sends a `POST` and returns a successful response.
    ///
    /// # Errors
    ///
    /// Returns a transport error or [`ClientError::RemoteCall`](crate::ClientError::RemoteCall).
    pub async fn post(&self, path: &str, body: Bytes, content_type: &'static str) -> Result<RawResponse> {
        self.send(ClusterRequest::post(path, body, content_type)).await?.error_for_status(Method::Post, path)
    }

    /// Probes a JSON endpoint for polling.
    ///
    /// Transport failures and non-success statuses are reported as
    /// [`PollState::Pending`] so the caller keeps polling a node that is
    /// still starting. Only an undecodable success body is an error.
    ///
    /// # Errors
    ///
    /// Returns a decode error if a successful body does not match `T`.
    pub async fn probe_json<T: DeserializeOwned>(&self, path: &str) -> Result<PollState<T>> {
        match self.send(ClusterRequest::get(path)).await {
            Ok(response) if response.is_success() => Ok(PollState::Ready(response.json(path)?)),
            Ok(response) => Ok(PollState::Pending(format!("{path} returned {}", response.status))),
            Err(e) => Ok(PollState::Pending(format!("{path} unreachable: {e}"))),
        }
    }

    /// Probes an endpoint for an exact status code.
    ///
    /// # Errors
    ///
    /// Never fails; unreachable endpoints are pending.
    pub async fn probe_status(&self, path: &str, expected: u16) -> Result<PollState<()>> {
        match self.send(ClusterRequest::get(path)).await {
            Ok(response) if response.status == expected => Ok(PollState::Ready(())),
            Ok(response) => Ok(PollState::Pending(format!("{path} returned {}", response.status))),
            Err(e) => Ok(PollState::Pending(format!("{path} unreachable: {e}"))),
        }
    }

    // =========================================================================
    // Node surface
    // =========================================================================

    /// Reads service information.
    ///
    /// # Errors
    ///
    /// Returns a transport, status, or decode error.
    pub async fn network_info(&self) -> Result<NetworkInfo> {
        self.get_json("/node/network").await
    }

    /// Reads the node's self-signed certificate.
    ///
    /// # Errors
    ///
    /// Returns a transport, status, or decode error.
    pub async fn self_signed_certificate(&self) -> Result<String> {
        let cert: SelfSignedCertificate = self.get_json("/node/self_signed_certificate").await?;
        Ok(cert.self_signed_certificate)
    }

    /// Reads the node's own state report.
    ///
    /// # Errors
    ///
    /// Returns a transport, status, or decode error.
    pub async fn node_state(&self) -> Result<NodeStateReport> {
        self.get_json("/node/state").await
    }

    /// Lists every node in the membership table.
    ///
    /// # Errors
    ///
    /// Returns a transport, status, or decode error.
    pub async fn network_nodes(&self) -> Result<Vec<NetworkNode>> {
        let list: NetworkNodeList = self.get_json("/node/network/nodes").await?;
        Ok(list.nodes)
    }

    /// Reads one membership record.
    ///
    /// # Errors
    ///
    /// Returns a transport, status, or decode error.
    pub async fn network_node(&self, node_id: &str) -> Result<NetworkNode> {
        self.get_json(&format!("/node/network/nodes/{node_id}")).await
    }

    /// Lists retired nodes whose retirement is committed and that can be
    /// deleted.
    ///
    /// # Errors
    ///
    /// Returns a transport, status, or decode error.
    pub async fn removable_nodes(&self) -> Result<Vec<NetworkNode>> {
        let list: NetworkNodeList = self.get_json("/node/network/removable_nodes").await?;
        Ok(list.nodes)
    }

    /// Deletes a removable node from the membership table.
    ///
    /// # Errors
    ///
    /// Returns a transport or status error.
    pub async fn delete_network_node(&self, node_id: &str) -> Result<()> {
        let path = format!("/node/network/nodes/{node_id}");
        self.send(ClusterRequest::delete(&path)).await?.error_for_status(Method::Delete, &path)?;
        Ok(())
    }

    /// Reads the consensus view of the queried node.
    ///
    /// # Errors
    ///
    /// Returns a transport, status, or decode error.
    pub async fn consensus(&self) -> Result<ConsensusView> {
        let details: ConsensusDetails = self.get_json("/node/consensus").await?;
        Ok(details.details)
    }

    /// Lists the attestation quotes of all nodes.
    ///
    /// # Errors
    ///
    /// Returns a transport, status, or decode error.
    pub async fn quotes(&self) -> Result<Vec<NodeQuote>> {
        let list: QuoteList = self.get_json("/node/quotes").await?;
        Ok(list.quotes)
    }

    // =========================================================================
    // Governance surface
    // =========================================================================

    /// Reads the commit status of a transaction.
    ///
    /// # Errors
    ///
    /// Returns a transport, status, or decode error.
    pub async fn transaction_status(&self, transaction_id: &str) -> Result<TransactionInfo> {
        self.get_json(&self.gov_path(&format!("gov/tx?transaction_id={transaction_id}"))).await
    }

    /// Reads the join policy of the service.
    ///
    /// # Errors
    ///
    /// Returns a transport, status, or decode error.
    pub async fn join_policy(&self) -> Result<serde_json::Value> {
        self.get_json(&self.gov_path("gov/service/join-policy")).await
    }

    /// Reads the recovery share encrypted for a member.
    ///
    /// # Errors
    ///
    /// Returns a transport, status, or decode error.
    pub async fn encrypted_share(&self, member_id: &str) -> Result<String> {
        let share: EncryptedShare =
            self.get_json(&self.gov_path(&format!("gov/recovery/encrypted-shares/{member_id}"))).await?;
        Ok(share.encrypted_share)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::ClientError;

    /// Transport answering every request with the same response.
    struct Canned {
        response: Option<RawResponse>,
        seen: Mutex<Vec<ClusterRequest>>,
    }

    #[async_trait]
    impl ClusterTransport for Canned {
        async fn send(&self, endpoint: &ClusterEndpoint, request: ClusterRequest) -> Result<RawResponse> {
            self.seen.lock().push(request);
            self.response.clone().ok_or_else(|| ClientError::InvalidEndpoint {
                url: endpoint.url.clone(),
                message: "down".to_owned(),
            })
        }
    }

    fn client(response: Option<RawResponse>) -> (ClusterClient, Arc<Canned>) {
        let transport = Arc::new(Canned { response, seen: Mutex::new(Vec::new()) });
        let client = ClusterClient::new(
            Arc::clone(&transport) as Arc<dyn ClusterTransport>,
            ClusterEndpoint::insecure("net-0", "https://net-0"),
            "2024-07-01",
        )
        .with_request_timeout(Duration::from_secs(30));
        (client, transport)
    }

    #[test]
    fn test_gov_path_appends_api_version() {
        let (client, _) = client(None);
        assert_eq!(client.gov_path("gov/service/join-policy"), "gov/service/join-policy?api-version=2024-07-01");
        assert_eq!(client.gov_path("gov/tx?transaction_id=2.4"), "gov/tx?transaction_id=2.4&api-version=2024-07-01");
    }

    #[tokio::test]
    async fn test_request_timeout_applied() {
        let (client, transport) = client(Some(RawResponse::new(200, r#"{"nodes":[]}"#)));
        assert!(client.network_nodes().await.unwrap().is_empty());
        assert_eq!(transport.seen.lock()[0].timeout, Some(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn test_probe_maps_failures_to_pending() {
        let (down, _) = client(None);
        assert!(matches!(down.probe_json::<NetworkInfo>("/node/network").await.unwrap(), PollState::Pending(_)));

        let (starting, _) = client(Some(RawResponse::new(503, "starting")));
        match starting.probe_json::<NetworkInfo>("/node/network").await.unwrap() {
            PollState::Pending(state) => assert!(state.contains("503"), "{state}"),
            PollState::Ready(_) => panic!("expected pending"),
        }
    }

    #[tokio::test]
    async fn test_probe_status_requires_exact_code() {
        let (ok, _) = client(Some(RawResponse::new(200, "")));
        assert!(matches!(ok.probe_status("/node/ready/gov", 204).await.unwrap(), PollState::Pending(_)));
        let (ready, _) = client(Some(RawResponse::new(204, "")));
        assert_eq!(ready.probe_status("/node/ready/gov", 204).await.unwrap(), PollState::Ready(()));
    }

    #[tokio::test]
    async fn test_consensus_unwraps_details() {
        let body = r#"{"details":{"primary_id":"p1","acks":{"f1":{"last_received_ms":12,"seqno":3}}}}"#;
        let (client, _) = client(Some(RawResponse::new(200, body)));
        let view = client.consensus().await.unwrap();
        assert_eq!(view.primary_id.as_deref(), Some("p1"));
        assert_eq!(view.acks["f1"].last_received_ms, 12);
    }

    #[tokio::test]
    async fn test_delete_surfaces_status() {
        let (client, _) = client(Some(RawResponse::new(400, "not removable")));
        let err = client.delete_network_node("abc").await.unwrap_err();
        assert_eq!(err.status(), Some(400));
    }
}
