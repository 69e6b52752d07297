//! Content-addressed blob store for code and execution output.
//!
//! A [`BlobRef`] is `sha256:<hex>` of the content, so storing the same bytes
//! twice yields the same locator and blobs never change once written.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

const SCHEME: &str = "sha256:";

/// Stable locator for a stored blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlobRef(String);

impl BlobRef {
    pub fn for_bytes(bytes: &[u8]) -> Self {
        Self(format!("{SCHEME}{}", hex::encode(Sha256::digest(bytes))))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn digest(&self) -> &str {
        &self.0[SCHEME.len()..]
    }
}

impl std::fmt::Display for BlobRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for BlobRef {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let digest = s
            .strip_prefix(SCHEME)
            .ok_or_else(|| anyhow!("blob ref '{}' is missing the {} scheme", s, SCHEME))?;
        if digest.len() != 64 || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
            bail!("blob ref '{}' does not carry a sha256 digest", s);
        }
        Ok(Self(s.to_ascii_lowercase()))
    }
}

impl TryFrom<String> for BlobRef {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<BlobRef> for String {
    fn from(value: BlobRef) -> Self {
        value.0
    }
}

/// Write-once, read-many byte storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, bytes: &[u8]) -> Result<BlobRef>;

    /// `None` if no blob exists under `blob`.
    async fn get(&self, blob: &BlobRef) -> Result<Option<Vec<u8>>>;
}

/// Blobs on disk under `<root>/<first 2 hex>/<remaining hex>`.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, blob: &BlobRef) -> PathBuf {
        let digest = blob.digest();
        self.root.join(&digest[..2]).join(&digest[2..])
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, bytes: &[u8]) -> Result<BlobRef> {
        let blob = BlobRef::for_bytes(bytes);
        let path = self.path_for(&blob);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!(%blob, "blob already stored");
            return Ok(blob);
        }

        let dir = path
            .parent()
            .ok_or_else(|| anyhow!("blob path {} has no parent", path.display()))?;
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create blob directory {}", dir.display()))?;

        // Readers never observe a partially written blob.
        let tmp = dir.join(format!(".{}.tmp", Uuid::new_v4()));
        tokio::fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("Failed to write blob {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to move blob into {}", path.display()))?;
        debug!(%blob, size = bytes.len(), "blob stored");
        Ok(blob)
    }

    async fn get(&self, blob: &BlobRef) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(blob);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read blob {}", path.display())),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<BlobRef, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, bytes: &[u8]) -> Result<BlobRef> {
        let blob = BlobRef::for_bytes(bytes);
        self.blobs
            .lock()
            .map_err(|_| anyhow!("blob store lock poisoned"))?
            .entry(blob.clone())
            .or_insert_with(|| bytes.to_vec());
        Ok(blob)
    }

    async fn get(&self, blob: &BlobRef) -> Result<Option<Vec<u8>>> {
        Ok(self
            .blobs
            .lock()
            .map_err(|_| anyhow!("blob store lock poisoned"))?
            .get(blob)
            .cloned())
    }
}
