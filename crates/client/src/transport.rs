//! Byte-level exchange with a cluster endpoint.
//!
//! [`ClusterTransport`] is the seam between typed cluster calls and the
//! network. [`HttpTransport`] implements it with reqwest and keeps one
//! connection pool per service-level trust anchor, so repeated calls against
//! the same service certificate reuse TLS sessions. Clients pinned to a
//! single node's self-signed certificate are built per call and dropped.

use std::{collections::HashMap, fmt, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use snafu::ResultExt;

use crate::error::{ClientError, JsonSnafu, RemoteCallSnafu, Result, TransportSnafu};

/// Response header carrying the id of the transaction a write produced.
pub const TRANSACTION_ID_HEADER: &str = "x-ms-ccf-transaction-id";

/// How the TLS identity of an endpoint is checked.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum TrustAnchor {
    /// Accept any certificate. Only used to bootstrap the service
    /// certificate from a freshly started node.
    Insecure,
    /// Trust exactly this PEM-encoded service certificate.
    ServiceCertificate(String),
    /// Trust a node directly: its self-signed certificate or the service
    /// certificate it was endorsed with.
    NodeCertificates {
        /// PEM service certificate.
        service: String,
        /// PEM self-signed node certificate.
        node: String,
    },
}

impl TrustAnchor {
    /// Whether clients for this anchor outlive a single node.
    ///
    /// Self-signed node certificates change with every node, so clients
    /// trusting one are never cached.
    pub fn is_shared(&self) -> bool {
        !matches!(self, TrustAnchor::NodeCertificates { .. })
    }
}

impl fmt::Debug for TrustAnchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrustAnchor::Insecure => write!(f, "Insecure"),
            TrustAnchor::ServiceCertificate(pem) => {
                write!(f, "ServiceCertificate({} bytes)", pem.len())
            },
            TrustAnchor::NodeCertificates { service, node } => {
                write!(f, "NodeCertificates({} + {} bytes)", service.len(), node.len())
            },
        }
    }
}

/// A named cluster address plus the identity it must present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterEndpoint {
    /// Node or load balancer name, used in logs and errors.
    pub name: String,
    /// Base URL, e.g. `https://net-0.example:8080`.
    pub url: String,
    /// TLS trust anchor.
    pub trust: TrustAnchor,
}

impl ClusterEndpoint {
    /// Endpoint trusted without verification.
    pub fn insecure(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self { name: name.into(), url: url.into(), trust: TrustAnchor::Insecure }
    }

    /// Endpoint trusted through a service certificate.
    pub fn with_service_certificate(
        name: impl Into<String>,
        url: impl Into<String>,
        service_certificate: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            trust: TrustAnchor::ServiceCertificate(service_certificate.into()),
        }
    }

    /// Endpoint of a single node trusted through its own and the service
    /// certificate.
    pub fn with_node_certificates(
        name: impl Into<String>,
        url: impl Into<String>,
        service_certificate: impl Into<String>,
        node_certificate: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            trust: TrustAnchor::NodeCertificates {
                service: service_certificate.into(),
                node: node_certificate.into(),
            },
        }
    }
}

/// HTTP method of a cluster request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// `GET`
    Get,
    /// `POST`
    Post,
    /// `DELETE`
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Post => write!(f, "POST"),
            Method::Delete => write!(f, "DELETE"),
        }
    }
}

/// Request sent through a [`ClusterTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterRequest {
    /// HTTP method.
    pub method: Method,
    /// Path and query, relative to the endpoint URL.
    pub path: String,
    /// Request body.
    pub body: Option<Bytes>,
    /// Content type of the body.
    pub content_type: Option<&'static str>,
    /// Per-request timeout.
    pub timeout: Option<Duration>,
}

impl ClusterRequest {
    /// Builds a `GET` request.
    pub fn get(path: impl Into<String>) -> Self {
        Self { method: Method::Get, path: path.into(), body: None, content_type: None, timeout: None }
    }

    /// Builds a `POST` request.
    pub fn post(path: impl Into<String>, body: Bytes, content_type: &'static str) -> Self {
        Self {
            method: Method::Post,
            path: path.into(),
            body: Some(body),
            content_type: Some(content_type),
            timeout: None,
        }
    }

    /// Builds a `DELETE` request.
    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            method: Method::Delete,
            path: path.into(),
            body: None,
            content_type: None,
            timeout: None,
        }
    }

    /// Sets the per-request timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Response received through a [`ClusterTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    /// HTTP status code.
    pub status: u16,
    /// Value of the transaction id header, if present.
    pub transaction_id: Option<String>,
    /// Response body.
    pub body: Bytes,
}

impl RawResponse {
    /// Creates a response without a transaction id.
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self { status, transaction_id: None, body: body.into() }
    }

    /// Returns `true` for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body as lossy UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Fails with [`ClientError::RemoteCall`] unless the status is 2xx.
    ///
    /// # Errors
    ///
    /// Returns the status and body of a non-success response.
    pub fn error_for_status(self, method: Method, path: &str) -> Result<Self> {
        if self.is_success() {
            return Ok(self);
        }
        RemoteCallSnafu { method: method.to_string(), path, status: self.status, body: self.text() }
            .fail()
    }

    /// Decodes the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Json`] if the body does not match `T`.
    pub fn json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        serde_json::from_slice(&self.body).context(JsonSnafu { path })
    }
}

/// Sends requests to cluster endpoints.
///
/// Implementations return `Ok` for any HTTP response, including error
/// statuses; `Err` is reserved for requests that never got a response.
#[async_trait]
pub trait ClusterTransport: Send + Sync {
    /// Sends `request` to `endpoint`.
    async fn send(&self, endpoint: &ClusterEndpoint, request: ClusterRequest) -> Result<RawResponse>;
}

/// reqwest-backed [`ClusterTransport`].
#[derive(Default)]
pub struct HttpTransport {
    clients: RwLock<HashMap<TrustAnchor, reqwest::Client>>,
}

impl HttpTransport {
    /// Creates a transport with an empty client cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the client for an endpoint's trust anchor.
    ///
    /// Shared anchors are cached and built on first use.
    fn client_for(&self, endpoint: &ClusterEndpoint) -> Result<reqwest::Client> {
        let shared = endpoint.trust.is_shared();
        if shared {
            if let Some(client) = self.clients.read().get(&endpoint.trust) {
                return Ok(client.clone());
            }
        }

        let builder = reqwest::Client::builder();
        let builder = match &endpoint.trust {
            TrustAnchor::Insecure => builder.danger_accept_invalid_certs(true),
            TrustAnchor::ServiceCertificate(pem) => builder
                .tls_built_in_root_certs(false)
                .add_root_certificate(parse_certificate(endpoint, "service", pem)?),
            TrustAnchor::NodeCertificates { service, node } => builder
                .tls_built_in_root_certs(false)
                .add_root_certificate(parse_certificate(endpoint, "service", service)?)
                .add_root_certificate(parse_certificate(endpoint, "node", node)?),
        };
        let client = builder.build().map_err(|e| ClientError::InvalidEndpoint {
            url: endpoint.url.clone(),
            message: e.to_string(),
        })?;

        if shared {
            self.clients.write().entry(endpoint.trust.clone()).or_insert_with(|| client.clone());
        }
        Ok(client)
    }
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport").field("cached_clients", &self.clients.read().len()).finish()
    }
}

fn parse_certificate(endpoint: &ClusterEndpoint, kind: &str, pem: &str) -> Result<reqwest::Certificate> {
    reqwest::Certificate::from_pem(pem.as_bytes()).map_err(|e| ClientError::InvalidEndpoint {
        url: endpoint.url.clone(),
        message: format!("unusable {kind} certificate: {e}"),
    })
}

/// Joins an endpoint base URL and a request path.
fn join_url(base: &str, path: &str) -> Result<url::Url> {
    let joined = format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'));
    url::Url::parse(&joined)
        .map_err(|e| ClientError::InvalidEndpoint { url: joined, message: e.to_string() })
}

#[async_trait]
impl ClusterTransport for HttpTransport {
    async fn send(&self, endpoint: &ClusterEndpoint, request: ClusterRequest) -> Result<RawResponse> {
        let client = self.client_for(endpoint)?;
        let url = join_url(&endpoint.url, &request.path)?;
        let url_text = url.to_string();

        let mut builder = match request.method {
            Method::Get => client.get(url),
            Method::Post => client.post(url),
            Method::Delete => client.delete(url),
        };
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(content_type) = request.content_type {
            builder = builder.header(reqwest::header::CONTENT_TYPE, content_type);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.context(TransportSnafu { url: url_text.clone() })?;
        let status = response.status().as_u16();
        let transaction_id = response
            .headers()
            .get(TRANSACTION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let body = response.bytes().await.context(TransportSnafu { url: url_text })?;

        Ok(RawResponse { status, transaction_id, body })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use axum::{
        Router,
        http::{HeaderMap, StatusCode},
        routing::{delete, get, post},
    };

    use super::*;

    async fn start_server() -> String {
        let app = Router::new()
            .route("/node/network", get(|| async { r#"{"service_status":"Open"}"# }))
            .route(
                "/gov/members/proposals",
                post(|headers: HeaderMap, body: Bytes| async move {
                    let content_type = headers
                        .get("content-type")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_owned();
                    let mut out = HeaderMap::new();
                    out.insert(TRANSACTION_ID_HEADER, "2.15".parse().unwrap());
                    (StatusCode::OK, out, format!("{content_type}:{}", body.len()))
                }),
            )
            .route("/node/network/nodes/abc", delete(|| async { StatusCode::NO_CONTENT }))
            .route("/missing", get(|| async { (StatusCode::NOT_FOUND, "no such thing") }));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_get_returns_body() {
        let url = start_server().await;
        let transport = HttpTransport::new();
        let endpoint = ClusterEndpoint::insecure("net-0", url);
        let response = transport.send(&endpoint, ClusterRequest::get("/node/network")).await.unwrap();
        assert!(response.is_success());
        let value: serde_json::Value = response.json("/node/network").unwrap();
        assert_eq!(value["service_status"], "Open");
    }

    #[tokio::test]
    async fn test_post_captures_transaction_id() {
        let url = start_server().await;
        let transport = HttpTransport::new();
        let endpoint = ClusterEndpoint::insecure("net-0", url);
        let request = ClusterRequest::post(
            "gov/members/proposals",
            Bytes::from_static(b"signed"),
            "application/cose",
        );
        let response = transport.send(&endpoint, request).await.unwrap();
        assert_eq!(response.transaction_id.as_deref(), Some("2.15"));
        assert_eq!(response.text(), "application/cose:6");
    }

    #[tokio::test]
    async fn test_error_status_is_not_transport_error() {
        let url = start_server().await;
        let transport = HttpTransport::new();
        let endpoint = ClusterEndpoint::insecure("net-0", url);
        let response = transport.send(&endpoint, ClusterRequest::get("/missing")).await.unwrap();
        assert_eq!(response.status, 404);
        let err = response.error_for_status(Method::Get, "/missing").unwrap_err();
        assert_eq!(err.status(), Some(404));
        assert!(err.to_string().contains("no such thing"));
    }

    #[tokio::test]
    async fn test_delete_no_content() {
        let url = start_server().await;
        let transport = HttpTransport::new();
        let endpoint = ClusterEndpoint::insecure("net-0", url);
        let response =
            transport.send(&endpoint, ClusterRequest::delete("/node/network/nodes/abc")).await.unwrap();
        assert_eq!(response.status, 204);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transport_error() {
        let transport = HttpTransport::new();
        let endpoint = ClusterEndpoint::insecure("gone", "http://127.0.0.1:1");
        let err = transport.send(&endpoint, ClusterRequest::get("/node/network")).await.unwrap_err();
        assert!(matches!(err, ClientError::Transport { .. }), "got {err:?}");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_clients_cached_per_trust_anchor() {
        let transport = HttpTransport::new();
        transport.client_for(&ClusterEndpoint::insecure("a", "https://a")).unwrap();
        transport.client_for(&ClusterEndpoint::insecure("b", "https://b")).unwrap();
        assert_eq!(transport.clients.read().len(), 1);
    }

    #[test]
    fn test_node_certificate_anchors_are_not_shared() {
        assert!(TrustAnchor::Insecure.is_shared());
        assert!(TrustAnchor::ServiceCertificate("service".to_owned()).is_shared());
        let node = TrustAnchor::NodeCertificates { service: "service".to_owned(), node: "net-0".to_owned() };
        assert!(!node.is_shared());
    }

    #[test]
    fn test_join_url_normalizes_slashes() {
        assert_eq!(
            join_url("https://net-0:8080/", "/node/state").unwrap().as_str(),
            "https://net-0:8080/node/state"
        );
        assert_eq!(
            join_url("https://net-0:8080", "gov/tx?transaction_id=2.3").unwrap().as_str(),
            "https://net-0:8080/gov/tx?transaction_id=2.3"
        );
    }

    #[test]
    fn test_trust_anchor_debug_hides_pem() {
        let anchor = TrustAnchor::ServiceCertificate("-----BEGIN CERTIFICATE-----".to_owned());
        assert_eq!(format!("{anchor:?}"), "ServiceCertificate(27 bytes)");
    }
}
