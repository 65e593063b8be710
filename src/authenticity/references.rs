//! Authentic reference hashes, loaded from object storage per card name.

use crate::error::AppError;
use crate::objectstore::{reference_prefix, ObjectStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceHash {
    pub card_name: String,
    pub hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub set: Option<String>,
}

pub struct ReferenceStore {
    objects: Arc<dyn ObjectStore>,
}

impl ReferenceStore {
    pub fn new(objects: Arc<dyn ObjectStore>) -> Self {
        Self { objects }
    }

    /// Loads every parseable reference under the card's prefix. A missing
    /// prefix is an empty list; per-object parse failures are logged and
    /// skipped.
    pub async fn load(&self, card_name: &str) -> Result<Vec<ReferenceHash>, AppError> {
        let prefix = reference_prefix(card_name);
        let keys = self.objects.list(&prefix).await?;
        if keys.is_empty() {
            debug!(card = %card_name, "no reference hashes stored");
            return Ok(Vec::new());
        }

        let mut references = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(bytes) = self.objects.get(&key).await? else {
                continue;
            };
            match serde_json::from_slice::<ReferenceHash>(&bytes) {
                Ok(reference) => references.push(reference),
                Err(e) => warn!(key = %key, error = %e, "skipping unparseable reference object"),
            }
        }
        debug!(card = %card_name, count = references.len(), "reference hashes loaded");
        Ok(references)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objectstore::FsObjectStore;

    fn store(root: &std::path::Path) -> Arc<FsObjectStore> {
        Arc::new(FsObjectStore::new(
            root,
            "s".into(),
            "http://localhost/uploads".into(),
        ))
    }

    #[tokio::test]
    async fn missing_prefix_is_empty_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let refs = ReferenceStore::new(store(dir.path()));
        assert!(refs.load("Charizard").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn loads_and_skips_unparseable() {
        let dir = tempfile::tempdir().unwrap();
        let objects = store(dir.path());
        let prefix = reference_prefix("Charizard");

        let good = serde_json::to_vec(&ReferenceHash {
            card_name: "Charizard".to_string(),
            hash: "a1b2c3d4e5f60718".to_string(),
            variant: Some("unlimited".to_string()),
            set: Some("Base Set".to_string()),
        })
        .unwrap();
        objects.put(&format!("{prefix}/unlimited.json"), &good).await.unwrap();
        objects
            .put(&format!("{prefix}/broken.json"), b"{ not json")
            .await
            .unwrap();

        let refs = ReferenceStore::new(objects);
        let loaded = refs.load("Charizard").await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].hash, "a1b2c3d4e5f60718");
    }
}
