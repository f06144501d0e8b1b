//! Signing and share decryption doubles.

use async_trait::async_trait;
use consortium_client::{GovernanceSigner, RecoveryShareDecryptor, SigningRequest};

/// Signs governance messages as `{message_type}|{payload}`.
///
/// [`FakeConsortium`](crate::FakeConsortium) reads the payload back after
/// the separator.
#[derive(Debug, Clone)]
pub struct FakeSigner {
    member_id: String,
}

impl FakeSigner {
    /// Creates a signer for `member_id`.
    pub fn new(member_id: impl Into<String>) -> Self {
        Self { member_id: member_id.into() }
    }
}

#[async_trait]
impl GovernanceSigner for FakeSigner {
    fn member_id(&self) -> &str {
        &self.member_id
    }

    async fn sign(&self, request: SigningRequest<'_>) -> consortium_client::Result<Vec<u8>> {
        let mut envelope = format!("{}|", request.message_type).into_bytes();
        envelope.extend_from_slice(request.payload);
        Ok(envelope)
    }
}

/// "Decrypts" a share by prefixing it with `decrypted:`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FakeDecryptor;

#[async_trait]
impl RecoveryShareDecryptor for FakeDecryptor {
    async fn decrypt_share(&self, encrypted_share: &str) -> consortium_client::Result<String> {
        Ok(format!("decrypted:{encrypted_share}"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use chrono::Utc;
    use consortium_client::GovMessageType;

    use super::*;

    #[tokio::test]
    async fn test_envelope_prefixes_message_type() {
        let signer = FakeSigner::new("m0");
        let envelope = signer
            .sign(SigningRequest {
                message_type: GovMessageType::Ballot,
                payload: br#"{"ballot":"x"}"#,
                proposal_id: Some("p1"),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        assert_eq!(envelope, br#"ballot|{"ballot":"x"}"#.to_vec());
        assert_eq!(signer.member_id(), "m0");
    }

    #[tokio::test]
    async fn test_decryptor_marks_share() {
        assert_eq!(FakeDecryptor.decrypt_share("abc").await.unwrap(), "decrypted:abc");
    }
}
