//! Object storage access: presigned upload URLs, keyed fetch, prefix listing.
//!
//! The core never proxies upload bytes; callers PUT directly against a
//! presigned URL and hand the opaque key back through the API. The default
//! backend is filesystem-rooted, which keeps local runs and tests hermetic;
//! the trait is the seam a cloud-bucket client plugs into.

use crate::error::AppError;
use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::path::{Path, PathBuf};
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignedUpload {
    pub upload_url: String,
    pub key: String,
    pub expires_in_sec: u64,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetches an object; `Ok(None)` when the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, AppError>;

    /// Lists keys under a prefix. A missing prefix is an empty list.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, AppError>;

    /// Issues a signed PUT target for the given key.
    fn presign_put(&self, key: &str, ttl_seconds: u64) -> Result<PresignedUpload, AppError>;
}

/// Filesystem-rooted object store with HMAC-signed upload URLs.
pub struct FsObjectStore {
    root: PathBuf,
    secret: String,
    public_base_url: String,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>, secret: String, public_base_url: String) -> Self {
        Self {
            root: root.into(),
            secret,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, AppError> {
        // Keys are opaque but must stay inside the root.
        if key.split('/').any(|seg| seg == ".." || seg.is_empty()) {
            return Err(AppError::Validation(format!("invalid object key: {key}")));
        }
        Ok(self.root.join(key))
    }

    fn sign(&self, key: &str, expires_unix: i64) -> Result<String, AppError> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| AppError::DataLayer(format!("presign HMAC key: {e}")))?;
        mac.update(format!("PUT\n{key}\n{expires_unix}").as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Verifies a signature produced by [`Self::presign_put`].
    pub fn verify_signature(
        &self,
        key: &str,
        expires_unix: i64,
        signature: &str,
    ) -> Result<bool, AppError> {
        Ok(expires_unix > Utc::now().timestamp() && self.sign(key, expires_unix)? == signature)
    }

    /// Writes object bytes. Used by fixtures and the upload receiver.
    pub async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), AppError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AppError::DataLayer(format!("object store mkdir: {e}")))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| AppError::DataLayer(format!("object store write: {e}")))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, AppError> {
        let path = self.resolve(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AppError::DataLayer(format!("object store read: {e}"))),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, AppError> {
        let dir = self.resolve(prefix.trim_end_matches('/'))?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(AppError::DataLayer(format!("object store list: {e}"))),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| AppError::DataLayer(format!("object store list: {e}")))?
        {
            if entry
                .file_type()
                .await
                .map(|t| t.is_file())
                .unwrap_or(false)
            {
                let name = entry.file_name().to_string_lossy().to_string();
                keys.push(format!("{}/{name}", prefix.trim_end_matches('/')));
            }
        }
        keys.sort();
        debug!(prefix = %prefix, count = keys.len(), "object store list");
        Ok(keys)
    }

    fn presign_put(&self, key: &str, ttl_seconds: u64) -> Result<PresignedUpload, AppError> {
        let expires_unix = Utc::now().timestamp() + ttl_seconds as i64;
        let signature = self.sign(key, expires_unix)?;
        Ok(PresignedUpload {
            upload_url: format!(
                "{}/{key}?expires={expires_unix}&signature={signature}",
                self.public_base_url
            ),
            key: key.to_string(),
            expires_in_sec: ttl_seconds,
        })
    }
}

/// Stable, URL-safe object prefix for a card name.
pub fn reference_prefix(card_name: &str) -> String {
    let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .encode(card_name.trim().to_lowercase().as_bytes());
    format!("references/{encoded}")
}

/// Builds an upload key under the subject's namespace.
pub fn upload_key(subject: &str, file_ext: &str) -> String {
    format!(
        "uploads/{subject}/{}.{}",
        uuid::Uuid::new_v4(),
        file_ext.trim_start_matches('.')
    )
}

/// Strips a leading path and checks subject ownership of an upload key.
pub fn key_owned_by(key: &str, subject: &str) -> bool {
    key.strip_prefix("uploads/")
        .and_then(|rest| rest.split_once('/'))
        .map(|(owner, _)| owner == subject)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(root: &Path) -> FsObjectStore {
        FsObjectStore::new(
            root,
            "test-secret".to_string(),
            "http://localhost:3000/uploads".to_string(),
        )
    }

    #[tokio::test]
    async fn get_missing_key_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        assert!(store.get("uploads/sub-a/nothing.jpg").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn put_then_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.put("uploads/sub-a/one.jpg", b"bytes").await.unwrap();
        let got = store.get("uploads/sub-a/one.jpg").await.unwrap().unwrap();
        assert_eq!(got, b"bytes");
    }

    #[tokio::test]
    async fn list_missing_prefix_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        assert!(store.list("references/abc").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_returns_sorted_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.put("references/abc/b.json", b"{}").await.unwrap();
        store.put("references/abc/a.json", b"{}").await.unwrap();
        let keys = store.list("references/abc").await.unwrap();
        assert_eq!(keys, vec!["references/abc/a.json", "references/abc/b.json"]);
    }

    #[test]
    fn presign_signature_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let presigned = store.presign_put("uploads/sub-a/x.jpg", 900).unwrap();
        let query = presigned.upload_url.split_once('?').unwrap().1;
        let mut expires = 0i64;
        let mut signature = String::new();
        for pair in query.split('&') {
            match pair.split_once('=') {
                Some(("expires", v)) => expires = v.parse().unwrap(),
                Some(("signature", v)) => signature = v.to_string(),
                _ => {}
            }
        }
        assert!(store
            .verify_signature("uploads/sub-a/x.jpg", expires, &signature)
            .unwrap());
        assert!(!store
            .verify_signature("uploads/sub-b/x.jpg", expires, &signature)
            .unwrap());
    }

    #[test]
    fn traversal_keys_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        assert!(store.resolve("uploads/../etc/passwd").is_err());
    }

    #[test]
    fn reference_prefix_is_stable_and_case_insensitive() {
        assert_eq!(reference_prefix("Charizard"), reference_prefix("charizard "));
        assert!(reference_prefix("Charizard").starts_with("references/"));
    }

    #[test]
    fn upload_key_ownership() {
        let key = upload_key("sub-a", "jpg");
        assert!(key_owned_by(&key, "sub-a"));
        assert!(!key_owned_by(&key, "sub-b"));
        assert!(!key_owned_by("other/sub-a/x.jpg", "sub-a"));
    }
}
