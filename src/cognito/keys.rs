use std::path::{Path, PathBuf};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{DecodingKey, EncodingKey};
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};

use super::error::CognitoError;

/// A JSON Web Key for the JWKS document (RFC 7517, RSA members only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    pub kid: String,
    #[serde(rename = "use")]
    pub key_use: String,
    pub alg: String,
    pub n: String,
    pub e: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwkSet {
    pub keys: Vec<Jwk>,
}

/// Persisted key document: `<data-dir>/signing-key.json`.
#[derive(Debug, Serialize, Deserialize)]
struct KeyDocument {
    kid: String,
    private_key_pem: String,
}

/// Process-singleton RSA signing key. Loaded from disk if present,
/// generated at first use otherwise, read-only afterwards.
pub struct KeyStore {
    kid: String,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    public_key: RsaPublicKey,
}

impl KeyStore {
    pub fn open(data_dir: &Path) -> Result<Self, CognitoError> {
        let path = key_path(data_dir);
        let document = if path.exists() {
            load_document(&path)?
        } else {
            let document = generate_document()?;
            store_document(&path, &document)?;
            tracing::info!(path = %path.display(), kid = %document.kid, "generated signing key");
            document
        };
        Self::from_document(document)
    }

    fn from_document(document: KeyDocument) -> Result<Self, CognitoError> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(&document.private_key_pem)
            .map_err(|e| CognitoError::InternalError(format!("invalid signing key: {e}")))?;
        let public_key = private_key.to_public_key();
        let public_pem = public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CognitoError::InternalError(format!("key encoding failed: {e}")))?;

        let encoding_key = EncodingKey::from_rsa_pem(document.private_key_pem.as_bytes())
            .map_err(|e| CognitoError::InternalError(format!("invalid private key: {e}")))?;
        let decoding_key = DecodingKey::from_rsa_pem(public_pem.as_bytes())
            .map_err(|e| CognitoError::InternalError(format!("invalid public key: {e}")))?;

        Ok(KeyStore {
            kid: document.kid,
            encoding_key,
            decoding_key,
            public_key,
        })
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn encoding_key(&self) -> &EncodingKey {
        &self.encoding_key
    }

    pub fn decoding_key(&self) -> &DecodingKey {
        &self.decoding_key
    }

    /// The JWKS document verifiers fetch from the well-known endpoint.
    pub fn jwks(&self) -> JwkSet {
        let n = URL_SAFE_NO_PAD.encode(self.public_key.n().to_bytes_be());
        let e = URL_SAFE_NO_PAD.encode(self.public_key.e().to_bytes_be());
        JwkSet {
            keys: vec![Jwk {
                kty: "RSA".to_string(),
                kid: self.kid.clone(),
                key_use: "sig".to_string(),
                alg: "RS256".to_string(),
                n,
                e,
            }],
        }
    }
}

fn key_path(data_dir: &Path) -> PathBuf {
    data_dir.join("signing-key.json")
}

fn load_document(path: &Path) -> Result<KeyDocument, CognitoError> {
    let bytes = std::fs::read(path)
        .map_err(|e| CognitoError::InternalError(format!("read {}: {e}", path.display())))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| CognitoError::InternalError(format!("parse {}: {e}", path.display())))
}

fn store_document(path: &Path, document: &KeyDocument) -> Result<(), CognitoError> {
    let bytes = serde_json::to_vec_pretty(document)
        .map_err(|e| CognitoError::InternalError(e.to_string()))?;
    std::fs::write(path, bytes)
        .map_err(|e| CognitoError::InternalError(format!("write {}: {e}", path.display())))
}

fn generate_document() -> Result<KeyDocument, CognitoError> {
    use rand::rngs::OsRng;

    let private_key = RsaPrivateKey::new(&mut OsRng, 2048)
        .map_err(|e| CognitoError::InternalError(format!("key generation failed: {e}")))?;
    let private_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| CognitoError::InternalError(format!("key encoding failed: {e}")))?
        .to_string();
    let kid = format!("local-{}", &uuid::Uuid::new_v4().to_string()[..8]);

    Ok(KeyDocument {
        kid,
        private_key_pem: private_pem,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_then_reloads_the_same_key() {
        let dir = tempfile::tempdir().unwrap();
        let first = KeyStore::open(dir.path()).unwrap();
        let second = KeyStore::open(dir.path()).unwrap();
        assert_eq!(first.kid(), second.kid());
        assert_eq!(first.jwks().keys[0].n, second.jwks().keys[0].n);
    }

    #[test]
    fn jwks_document_shape() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::open(dir.path()).unwrap();
        let jwks = store.jwks();
        assert_eq!(jwks.keys.len(), 1);
        let key = &jwks.keys[0];
        assert_eq!(key.kty, "RSA");
        assert_eq!(key.alg, "RS256");
        assert_eq!(key.key_use, "sig");
        assert!(!key.n.is_empty());
        assert_eq!(key.e, "AQAB");
    }
}
