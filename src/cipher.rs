//! Credential bundles and their decryption.
//!
//! CloudFormation passes up to three credential sets per invocation. For
//! resources they arrive as plain JSON objects. For Hooks they arrive as
//! strings which are either JSON (when no encryption key is configured,
//! e.g. during contract tests) or base64 KMS ciphertext.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::client::{KeyDecryptor, ServiceClients};
use crate::error::{ExtensionError, ExtensionResult};

/// An AWS credential triple.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    /// Access key ID
    pub access_key_id: String,
    /// Secret access key
    pub secret_access_key: String,
    /// Session token
    pub session_token: String,
}

impl Credentials {
    /// Creates a new credential triple.
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        session_token: impl Into<String>,
    ) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: session_token.into(),
        }
    }

    /// Returns false when any part of the triple is empty.
    pub fn is_usable(&self) -> bool {
        !self.access_key_id.is_empty()
            && !self.secret_access_key.is_empty()
            && !self.session_token.is_empty()
    }

    /// Parses a credential triple from an object or a JSON-encoded string.
    ///
    /// Returns `None` for null, empty or malformed input.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Object(_) => serde_json::from_value(value.clone()).ok(),
            Value::String(text) if !text.is_empty() => serde_json::from_str(text).ok(),
            _ => None,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &"<redacted>")
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &"<redacted>")
            .finish()
    }
}

/// Deserializes an optional credential field without failing the request.
///
/// Used with `#[serde(default, deserialize_with = "...")]` on request data.
pub fn deserialize_optional_credentials<'de, D>(deserializer: D) -> Result<Option<Credentials>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(Credentials::from_value))
}

/// Turns an encrypted credential string into credentials.
#[async_trait]
pub trait Cipher: Send + Sync {
    /// Decrypts a credential bundle.
    ///
    /// Returns `Ok(None)` when no bundle was sent.
    async fn decrypt_credentials(&self, encrypted: Option<&str>) -> ExtensionResult<Option<Credentials>>;
}

/// Cipher used when no encryption key is configured.
///
/// The bundle is treated as plain JSON; malformed input yields `None`.
#[derive(Debug, Clone, Default)]
pub struct PlaintextCipher;

#[async_trait]
impl Cipher for PlaintextCipher {
    async fn decrypt_credentials(&self, encrypted: Option<&str>) -> ExtensionResult<Option<Credentials>> {
        Ok(encrypted
            .filter(|text| !text.is_empty())
            .and_then(|text| serde_json::from_str(text).ok()))
    }
}

/// Cipher that decrypts base64 KMS ciphertext with a configured key.
pub struct KmsCipher {
    key_arn: String,
    decryptor: Arc<dyn KeyDecryptor>,
}

impl KmsCipher {
    /// Creates a cipher for `key_arn` backed by `decryptor`.
    pub fn new(key_arn: impl Into<String>, decryptor: Arc<dyn KeyDecryptor>) -> Self {
        Self {
            key_arn: key_arn.into(),
            decryptor,
        }
    }
}

#[async_trait]
impl Cipher for KmsCipher {
    async fn decrypt_credentials(&self, encrypted: Option<&str>) -> ExtensionResult<Option<Credentials>> {
        let Some(encrypted) = encrypted.filter(|text| !text.is_empty()) else {
            return Ok(None);
        };

        let ciphertext = base64::engine::general_purpose::STANDARD
            .decode(encrypted)
            .map_err(|e| ExtensionError::encryption(e.to_string()))?;
        let plaintext = self
            .decryptor
            .decrypt(&self.key_arn, &ciphertext)
            .await
            .map_err(|e| ExtensionError::encryption(e.to_string()))?;

        let decoded: Value = serde_json::from_slice(&plaintext)
            .map_err(|e| ExtensionError::encryption(e.to_string()))?;
        if decoded.is_null() {
            return Err(ExtensionError::encryption("Decrypted credentials are 'null'."));
        }
        serde_json::from_value(decoded)
            .map(Some)
            .map_err(|e| ExtensionError::encryption(e.to_string()))
    }
}

/// Picks the cipher for a Hook invocation.
///
/// A KMS cipher is used only when both the key ARN and the role to assume
/// for it are present.
pub async fn cipher_for(
    key_arn: Option<&str>,
    key_role: Option<&str>,
    clients: &dyn ServiceClients,
) -> ExtensionResult<Box<dyn Cipher>> {
    match (key_arn, key_role) {
        (Some(key_arn), Some(key_role)) if !key_arn.is_empty() && !key_role.is_empty() => {
            let decryptor = clients.key_decryptor(key_arn, key_role).await?;
            Ok(Box::new(KmsCipher::new(key_arn, decryptor)))
        }
        _ => Ok(Box::new(PlaintextCipher)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HandlerErrorCode;
    use serde_json::json;
    use std::sync::Mutex;

    struct FakeDecryptor {
        plaintext: Result<Vec<u8>, String>,
        calls: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl FakeDecryptor {
        fn returning(plaintext: &str) -> Arc<Self> {
            Arc::new(Self {
                plaintext: Ok(plaintext.as_bytes().to_vec()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn failing(message: &str) -> Arc<Self> {
            Arc::new(Self {
                plaintext: Err(message.to_string()),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl KeyDecryptor for FakeDecryptor {
        async fn decrypt(&self, key_id: &str, ciphertext: &[u8]) -> ExtensionResult<Vec<u8>> {
            self.calls
                .lock()
                .unwrap()
                .push((key_id.to_string(), ciphertext.to_vec()));
            self.plaintext
                .clone()
                .map_err(|message| ExtensionError::service("kms", "InvalidCiphertextException", message, Some(400)))
        }
    }

    fn encoded(bytes: &[u8]) -> String {
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }

    #[test]
    fn test_credentials_debug_is_redacted() {
        let creds = Credentials::new("AKID", "SECRET", "TOKEN");
        let debug = format!("{:?}", creds);
        assert!(!debug.contains("SECRET"));
        assert!(!debug.contains("AKID"));
    }

    #[test]
    fn test_credentials_from_value() {
        let object = json!({"accessKeyId": "a", "secretAccessKey": "b", "sessionToken": "c"});
        assert_eq!(Credentials::from_value(&object), Some(Credentials::new("a", "b", "c")));

        let text = Value::String(object.to_string());
        assert_eq!(Credentials::from_value(&text), Some(Credentials::new("a", "b", "c")));

        assert_eq!(Credentials::from_value(&Value::Null), None);
        assert_eq!(Credentials::from_value(&json!("")), None);
        assert_eq!(Credentials::from_value(&json!({"accessKeyId": "a"})), None);
    }

    #[test]
    fn test_is_usable() {
        assert!(Credentials::new("a", "b", "c").is_usable());
        assert!(!Credentials::new("", "", "").is_usable());
    }

    #[tokio::test]
    async fn test_plaintext_cipher() {
        let cipher = PlaintextCipher;
        let creds = r#"{"accessKeyId": "a", "secretAccessKey": "b", "sessionToken": "c"}"#;
        assert_eq!(
            cipher.decrypt_credentials(Some(creds)).await.unwrap(),
            Some(Credentials::new("a", "b", "c"))
        );
        assert_eq!(cipher.decrypt_credentials(None).await.unwrap(), None);
        assert_eq!(cipher.decrypt_credentials(Some("{not json")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_kms_cipher_decrypts() {
        let decryptor = FakeDecryptor::returning(
            r#"{"accessKeyId": "a", "secretAccessKey": "b", "sessionToken": "c"}"#,
        );
        let cipher = KmsCipher::new("arn:aws:kms:us-east-1:123456789012:key/k", decryptor.clone());
        let result = cipher.decrypt_credentials(Some(&encoded(b"blob"))).await.unwrap();
        assert_eq!(result, Some(Credentials::new("a", "b", "c")));

        let calls = decryptor.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "arn:aws:kms:us-east-1:123456789012:key/k");
        assert_eq!(calls[0].1, b"blob".to_vec());
    }

    #[tokio::test]
    async fn test_kms_cipher_null_plaintext() {
        let cipher = KmsCipher::new("key", FakeDecryptor::returning("null"));
        let err = cipher.decrypt_credentials(Some(&encoded(b"blob"))).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Failed to decrypt credentials. Decrypted credentials are 'null'."
        );
        assert_eq!(err.error_code(), HandlerErrorCode::AccessDenied);
    }

    #[tokio::test]
    async fn test_kms_cipher_failures_are_encryption_errors() {
        let cipher = KmsCipher::new("key", FakeDecryptor::failing("bad ciphertext"));
        let err = cipher.decrypt_credentials(Some(&encoded(b"blob"))).await.unwrap_err();
        assert!(matches!(err, ExtensionError::Encryption { .. }));

        let cipher = KmsCipher::new("key", FakeDecryptor::returning("{}"));
        let err = cipher.decrypt_credentials(Some("%%% not base64")).await.unwrap_err();
        assert!(matches!(err, ExtensionError::Encryption { .. }));

        let err = cipher.decrypt_credentials(Some(&encoded(b"blob"))).await.unwrap_err();
        assert!(matches!(err, ExtensionError::Encryption { .. }));
    }

    #[tokio::test]
    async fn test_kms_cipher_absent_bundle() {
        let cipher = KmsCipher::new("key", FakeDecryptor::failing("unused"));
        assert_eq!(cipher.decrypt_credentials(None).await.unwrap(), None);
    }
}
