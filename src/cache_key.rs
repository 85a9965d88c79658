use sha2::{Digest, Sha256};
use url::Url;

use crate::error::PackError;

/// Hex SHA-256 of arbitrary bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Rejects URL lists that cannot be admitted. Runs before any hashing or
/// storage side effect.
pub fn validate_urls(urls: &[String], domain: Option<&str>) -> Result<(), PackError> {
    if urls.is_empty() {
        return Err(PackError::invalid_request("no urls provided"));
    }

    for raw in urls {
        let parsed = Url::parse(raw).map_err(|_| PackError::invalid_url("invalid url", raw))?;
        if raw.contains(',') {
            return Err(PackError::invalid_url("invalid url", raw));
        }
        if let Some(domain) = domain.filter(|d| !d.is_empty()) {
            if parsed.host_str() != Some(domain) {
                return Err(PackError::invalid_url("invalid domain", raw));
            }
        }
    }

    Ok(())
}

/// Sorted, duplicate-free copy of the URL list.
pub fn normalize_urls(urls: &[String]) -> Vec<String> {
    let mut normalized = urls.to_vec();
    normalized.sort();
    normalized.dedup();
    normalized
}

/// Key of an already normalized URL list.
pub fn cache_key(normalized: &[String]) -> String {
    sha256_hex(normalized.join(",").as_bytes())
}

/// Validates, normalizes and hashes in one go.
pub fn derive(urls: &[String], domain: Option<&str>) -> Result<(String, Vec<String>), PackError> {
    validate_urls(urls, domain)?;
    let normalized = normalize_urls(urls);
    let key = cache_key(&normalized);
    Ok((key, normalized))
}

/// Cache keys are 64 lowercase hex characters.
pub fn is_valid_key(key: &str) -> bool {
    key.len() == 64 && key.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

pub fn archive_object_name(key: &str) -> String {
    format!("{key}.zip")
}

pub fn source_object_name(key: &str) -> String {
    format!("{key}.txt")
}
