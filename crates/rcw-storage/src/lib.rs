//! Snapshot persistence and upstream catalog fetching for RCW.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use rcw_core::RewardProduct;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "rcw-storage";

/// Key/value collaborator holding the last-observed catalog as one
/// serialized array. Read at the start of every run, overwritten on the
/// scheduled path after a successful diff.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// A missing or corrupt snapshot loads as the empty catalog, never an
    /// error; only genuine I/O failures propagate.
    async fn load(&self) -> anyhow::Result<Vec<RewardProduct>>;

    async fn store(&self, catalog: &[RewardProduct]) -> anyhow::Result<()>;
}

/// Single JSON file acting as the one-key snapshot store.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn load(&self) -> anyhow::Result<Vec<RewardProduct>> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("reading snapshot {}", self.path.display()))
            }
        };

        match serde_json::from_slice::<Vec<RewardProduct>>(&bytes) {
            Ok(catalog) => Ok(catalog),
            Err(err) => {
                warn!(
                    path = %self.path.display(),
                    error = %err,
                    "stored snapshot is not a product array; treating as empty"
                );
                Ok(Vec::new())
            }
        }
    }

    /// Atomic overwrite: write to a uuid-named temp file in the same
    /// directory, then rename over the target.
    async fn store(&self, catalog: &[RewardProduct]) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec(catalog).context("serializing snapshot")?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("creating snapshot directory {}", parent.display()))?;
            }
        }

        let temp_name = format!(".{}.tmp", Uuid::new_v4());
        let temp_path = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.join(temp_name),
            _ => PathBuf::from(temp_name),
        };

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp snapshot file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp snapshot file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp snapshot file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &self.path).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming temp snapshot {} -> {}",
                        temp_path.display(),
                        self.path.display()
                    )
                })
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("catalog request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed catalog payload: {0}")]
    MalformedCatalog(String),
}

/// Upstream catalog collaborator: one GET returning the full catalog.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn fetch_catalog(&self) -> Result<Vec<RewardProduct>, FetchError>;
}

#[derive(Debug, Clone)]
pub struct CatalogClientConfig {
    pub endpoint: String,
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for CatalogClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://www.sephora.com/api/bi/rewards?source=profile".to_string(),
            timeout: Duration::from_secs(20),
            user_agent: "rcw-bot/0.1".to_string(),
        }
    }
}

/// reqwest-backed catalog source. The upstream payload is an object whose
/// `biRewardGroups` member maps reward-group keys to arrays of product
/// records; all groups are flattened into one list.
#[derive(Debug)]
pub struct HttpCatalogSource {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpCatalogSource {
    pub fn new(config: CatalogClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            endpoint: config.endpoint,
        })
    }
}

#[async_trait]
impl CatalogSource for HttpCatalogSource {
    async fn fetch_catalog(&self) -> Result<Vec<RewardProduct>, FetchError> {
        let resp = self.client.get(&self.endpoint).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        let payload: serde_json::Value = resp.json().await?;
        flatten_reward_groups(&payload)
    }
}

/// Flatten a raw catalog payload into one product list, keeping the
/// upstream group order and the product order within each group.
///
/// Shape validation happens here, at the fetch boundary: anything other
/// than an object of arrays of product records under `biRewardGroups` is a
/// `MalformedCatalog` error that aborts the run.
pub fn flatten_reward_groups(
    payload: &serde_json::Value,
) -> Result<Vec<RewardProduct>, FetchError> {
    let groups = payload
        .get("biRewardGroups")
        .ok_or_else(|| FetchError::MalformedCatalog("missing biRewardGroups".to_string()))?
        .as_object()
        .ok_or_else(|| FetchError::MalformedCatalog("biRewardGroups is not an object".to_string()))?;

    let mut products = Vec::new();
    for (group, value) in groups {
        let entries = value.as_array().ok_or_else(|| {
            FetchError::MalformedCatalog(format!("reward group {group} is not an array"))
        })?;
        for entry in entries {
            let product: RewardProduct =
                serde_json::from_value(entry.clone()).map_err(|err| {
                    FetchError::MalformedCatalog(format!(
                        "reward group {group} contains an invalid product record: {err}"
                    ))
                })?;
            products.push(product);
        }
    }
    Ok(products)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn missing_snapshot_loads_as_empty_catalog() {
        let dir = tempdir().expect("tempdir");
        let store = FileSnapshotStore::new(dir.path().join("snapshot.json"));
        assert!(store.load().await.expect("load").is_empty());
    }

    #[tokio::test]
    async fn corrupt_snapshot_loads_as_empty_catalog() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("snapshot.json");
        std::fs::write(&path, b"{\"not\": \"an array\"}").expect("seed corrupt snapshot");
        let store = FileSnapshotStore::new(path);
        assert!(store.load().await.expect("load").is_empty());
    }

    #[tokio::test]
    async fn store_then_load_round_trips_full_records() {
        let dir = tempdir().expect("tempdir");
        let store = FileSnapshotStore::new(dir.path().join("nested/snapshot.json"));

        let product: RewardProduct = serde_json::from_value(serde_json::json!({
            "productId": "P1",
            "productName": "Mini Lipstick",
            "rewardPoints": 500,
            "upstreamOnlyField": "kept"
        }))
        .expect("product");

        store.store(&[product.clone()]).await.expect("store");
        let loaded = store.load().await.expect("load");
        assert_eq!(loaded, vec![product]);
    }

    #[tokio::test]
    async fn store_overwrites_previous_snapshot() {
        let dir = tempdir().expect("tempdir");
        let store = FileSnapshotStore::new(dir.path().join("snapshot.json"));
        let first: RewardProduct =
            serde_json::from_value(serde_json::json!({"productId": "P1"})).expect("product");
        let second: RewardProduct =
            serde_json::from_value(serde_json::json!({"productId": "P2"})).expect("product");

        store.store(&[first]).await.expect("first store");
        store.store(&[second.clone()]).await.expect("second store");
        assert_eq!(store.load().await.expect("load"), vec![second]);
    }

    #[test]
    fn flattening_merges_all_reward_groups_in_order() {
        let payload = serde_json::json!({
            "biRewardGroups": {
                "Birthday": [{"productId": "B1", "rewardPoints": 0}],
                "Rewards": [
                    {"productId": "R1", "rewardPoints": 100},
                    {"productId": "R2", "rewardPoints": 250}
                ]
            }
        });
        let products = flatten_reward_groups(&payload).expect("flatten");
        let ids: Vec<&str> = products.iter().map(|p| p.product_id.as_str()).collect();
        assert_eq!(ids, vec!["B1", "R1", "R2"]);
    }

    #[test]
    fn flattening_keeps_upstream_group_order() {
        // Group keys deliberately out of alphabetical order: the flattened
        // list must follow the payload, not a sorted key set.
        let payload = serde_json::json!({
            "biRewardGroups": {
                "Rewards": [{"productId": "R1"}],
                "Birthday": [{"productId": "B1"}],
                "Celebration": [{"productId": "C1"}]
            }
        });
        let products = flatten_reward_groups(&payload).expect("flatten");
        let ids: Vec<&str> = products.iter().map(|p| p.product_id.as_str()).collect();
        assert_eq!(ids, vec!["R1", "B1", "C1"]);
    }

    #[test]
    fn flattening_rejects_non_object_groups() {
        let payload = serde_json::json!({"biRewardGroups": ["not", "an", "object"]});
        let err = flatten_reward_groups(&payload).expect_err("should fail");
        assert!(matches!(err, FetchError::MalformedCatalog(_)));
    }

    #[test]
    fn flattening_rejects_non_array_group_values() {
        let payload = serde_json::json!({"biRewardGroups": {"Rewards": {"productId": "R1"}}});
        let err = flatten_reward_groups(&payload).expect_err("should fail");
        assert!(matches!(err, FetchError::MalformedCatalog(_)));
    }

    #[test]
    fn flattening_rejects_missing_group_map() {
        let payload = serde_json::json!({"somethingElse": []});
        let err = flatten_reward_groups(&payload).expect_err("should fail");
        assert!(matches!(err, FetchError::MalformedCatalog(_)));
    }
}
