//! Host data extraction from node attestation quotes.

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use consortium_types::{NodeQuote, NodeReport};

use crate::error::{ClientError, Result};

/// Quote format published by nodes without confidential hardware.
pub const INSECURE_VIRTUAL_FORMAT: &str = "Insecure_Virtual";

/// Verifies hardware attestation evidence.
#[async_trait]
pub trait AttestationVerifier: Send + Sync {
    /// Verifies an SNP quote and returns its host data claim.
    async fn verify_snp_attestation(&self, evidence: &str, endorsements: &str) -> Result<String>;
}

/// Reads the host data of a placeholder quote.
///
/// The raw evidence is base64-encoded JSON with a `host_data` field.
fn insecure_host_data(quote: &NodeQuote) -> Result<String> {
    let rejected = |message: String| ClientError::Attestation {
        node_id: quote.node_id.clone(),
        message,
    };

    let decoded = STANDARD.decode(quote.raw.as_bytes()).map_err(|e| rejected(e.to_string()))?;
    let value: serde_json::Value =
        serde_json::from_slice(&decoded).map_err(|e| rejected(e.to_string()))?;
    value
        .get("host_data")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .ok_or_else(|| rejected("missing host_data".to_owned()))
}

/// Builds the report for one quote.
///
/// Placeholder quotes are decoded locally and marked unverified; every other
/// format goes through `verifier`.
///
/// # Errors
///
/// Returns [`ClientError::Attestation`] if the evidence cannot be decoded,
/// or the verifier's error.
pub async fn node_report(quote: &NodeQuote, verifier: &dyn AttestationVerifier) -> Result<NodeReport> {
    let (host_data, verified) = if quote.format == INSECURE_VIRTUAL_FORMAT {
        (insecure_host_data(quote)?, false)
    } else {
        (verifier.verify_snp_attestation(&quote.raw, &quote.endorsements).await?, true)
    };

    Ok(NodeReport { node_id: quote.node_id.clone(), format: quote.format.clone(), host_data, verified })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    struct FixedVerifier;

    #[async_trait]
    impl AttestationVerifier for FixedVerifier {
        async fn verify_snp_attestation(&self, evidence: &str, _endorsements: &str) -> Result<String> {
            Ok(format!("verified:{evidence}"))
        }
    }

    fn quote(format: &str, raw: String) -> NodeQuote {
        NodeQuote { node_id: "n1".to_owned(), format: format.to_owned(), raw, endorsements: String::new() }
    }

    #[tokio::test]
    async fn test_insecure_quote_decoded_locally() {
        let raw = STANDARD.encode(br#"{"host_data":"abc123"}"#);
        let report = node_report(&quote(INSECURE_VIRTUAL_FORMAT, raw), &FixedVerifier).await.unwrap();
        assert_eq!(report.host_data, "abc123");
        assert!(!report.verified);
    }

    #[tokio::test]
    async fn test_snp_quote_goes_through_verifier() {
        let report =
            node_report(&quote("AMD_SEV_SNP_v1", "evidence".to_owned()), &FixedVerifier).await.unwrap();
        assert_eq!(report.host_data, "verified:evidence");
        assert!(report.verified);
    }

    #[tokio::test]
    async fn test_insecure_quote_without_host_data_rejected() {
        let raw = STANDARD.encode(br#"{"other":1}"#);
        let err = node_report(&quote(INSECURE_VIRTUAL_FORMAT, raw), &FixedVerifier).await.unwrap_err();
        assert!(matches!(err, ClientError::Attestation { .. }));
    }
}
