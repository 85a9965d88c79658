//! Expiring, ed25519-signed object URLs served by `GET /objects/{name}`.

use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const SIGNING_ALGORITHM: &str = "ed25519";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signed url expired")]
    Expired,
    #[error("malformed signature")]
    Malformed,
    #[error("signature mismatch")]
    Mismatch,
}

pub fn generate_signing_key() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

pub fn load_signing_key(path: &Path) -> Result<SigningKey> {
    let contents = std::fs::read(path)
        .with_context(|| format!("Failed to read signing key: {}", path.display()))?;

    if contents.len() == 32 {
        let bytes: [u8; 32] = contents
            .try_into()
            .map_err(|_| anyhow::anyhow!("Invalid signing key length"))?;
        return Ok(SigningKey::from_bytes(&bytes));
    }

    let text = std::str::from_utf8(&contents).context("Signing key is neither raw nor text")?;
    let trimmed = text.trim();
    let encoded = trimmed
        .strip_prefix(&format!("{SIGNING_ALGORITHM}:"))
        .unwrap_or(trimmed);
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .context("Failed to decode base64 signing key")?;

    if decoded.len() != 32 {
        anyhow::bail!(
            "Invalid signing key: expected 32 bytes, got {}",
            decoded.len()
        );
    }

    let bytes: [u8; 32] = decoded
        .try_into()
        .map_err(|_| anyhow::anyhow!("Invalid signing key length"))?;
    Ok(SigningKey::from_bytes(&bytes))
}

pub struct UrlSigner {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    base_url: String,
}

impl UrlSigner {
    pub fn new(signing_key: SigningKey, base_url: impl Into<String>) -> Self {
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Signer with a fresh key; URLs it issues die with the process.
    pub fn ephemeral(base_url: impl Into<String>) -> Self {
        Self::new(generate_signing_key(), base_url)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn sign(&self, name: &str, ttl: Duration) -> String {
        let expires = chrono::Utc::now().timestamp() + ttl.as_secs() as i64;
        self.sign_until(name, expires)
    }

    pub fn sign_until(&self, name: &str, expires: i64) -> String {
        let signature = self.signing_key.sign(&signed_payload(name, expires));
        format!(
            "{}/objects/{}?expires={}&signature={}",
            self.base_url,
            name,
            expires,
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        )
    }

    pub fn verify(&self, name: &str, expires: i64, signature: &str) -> Result<(), SignatureError> {
        if expires < chrono::Utc::now().timestamp() {
            return Err(SignatureError::Expired);
        }

        let bytes = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| SignatureError::Malformed)?;
        let bytes: [u8; 64] = bytes.try_into().map_err(|_| SignatureError::Malformed)?;
        let signature = Signature::from_bytes(&bytes);

        self.verifying_key
            .verify(&signed_payload(name, expires), &signature)
            .map_err(|_| SignatureError::Mismatch)
    }
}

fn signed_payload(name: &str, expires: i64) -> Vec<u8> {
    format!("GET\n{name}\n{expires}").into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query_param<'a>(url: &'a str, key: &str) -> &'a str {
        let query = url.split_once('?').unwrap().1;
        query
            .split('&')
            .find_map(|pair| pair.strip_prefix(&format!("{key}=")))
            .unwrap()
    }

    #[test]
    fn test_sign_verify_roundtrip() {
        let signer = UrlSigner::ephemeral("http://localhost:8080/");
        let url = signer.sign("abc.zip", Duration::from_secs(600));

        assert!(url.starts_with("http://localhost:8080/objects/abc.zip?expires="));
        let expires: i64 = query_param(&url, "expires").parse().unwrap();
        let signature = query_param(&url, "signature");
        assert_eq!(signer.verify("abc.zip", expires, signature), Ok(()));
        assert_eq!(
            signer.verify("other.zip", expires, signature),
            Err(SignatureError::Mismatch)
        );
        assert_eq!(
            signer.verify("abc.zip", expires + 1, signature),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_expired_url_is_rejected() {
        let signer = UrlSigner::ephemeral("http://localhost");
        let expires = chrono::Utc::now().timestamp() - 1;
        let url = signer.sign_until("abc.zip", expires);
        let signature = query_param(&url, "signature");
        assert_eq!(
            signer.verify("abc.zip", expires, signature),
            Err(SignatureError::Expired)
        );
    }

    #[test]
    fn test_malformed_signature() {
        let signer = UrlSigner::ephemeral("http://localhost");
        let expires = chrono::Utc::now().timestamp() + 60;
        assert_eq!(
            signer.verify("abc.zip", expires, "!!!"),
            Err(SignatureError::Malformed)
        );
        assert_eq!(
            signer.verify("abc.zip", expires, "AAAA"),
            Err(SignatureError::Malformed)
        );
    }

    #[test]
    fn test_load_signing_key_formats() {
        let dir = tempfile::tempdir().unwrap();
        let key = generate_signing_key();

        let raw_path = dir.path().join("raw.key");
        std::fs::write(&raw_path, key.to_bytes()).unwrap();
        assert_eq!(load_signing_key(&raw_path).unwrap().to_bytes(), key.to_bytes());

        let text_path = dir.path().join("text.key");
        let encoded = base64::engine::general_purpose::STANDARD.encode(key.to_bytes());
        std::fs::write(&text_path, format!("ed25519:{encoded}\n")).unwrap();
        assert_eq!(load_signing_key(&text_path).unwrap().to_bytes(), key.to_bytes());

        let bad_path = dir.path().join("bad.key");
        std::fs::write(&bad_path, "ed25519:AAAA").unwrap();
        assert!(load_signing_key(&bad_path).is_err());
    }
}
