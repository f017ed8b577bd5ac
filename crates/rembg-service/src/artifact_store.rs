//! Artifact storage
//!
//! Write-once blobs keyed by a freshly generated UUIDv4. `put` returns the
//! id only after the bytes are readable under it; a write that is
//! interrupted leaves at most a hidden `.partial` file that is neither
//! served nor counted, and is swept the next time the store is opened.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

const ARTIFACT_EXTENSION: &str = ".png";
const PARTIAL_SUFFIX: &str = ".partial";

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store `bytes` under a new id and return it once the write is complete.
    async fn put(&self, bytes: Bytes) -> anyhow::Result<String>;

    /// `Ok(None)` when nothing was ever stored under `id`.
    async fn get(&self, id: &str) -> anyhow::Result<Option<Bytes>>;

    async fn exists(&self, id: &str) -> bool;

    /// Best-effort number of stored artifacts; `None` when unknown.
    async fn count(&self) -> Option<usize>;

    /// Short label for logs and status output.
    fn describe(&self) -> String;
}

fn new_artifact_id() -> String {
    Uuid::new_v4().to_string()
}

/// Accept only canonical hyphenated lowercase UUIDs, so an id can never
/// name a path outside the store.
fn canonical_id(id: &str) -> Option<String> {
    let parsed = Uuid::parse_str(id).ok()?;
    let canonical = parsed.hyphenated().to_string();
    (canonical == id).then_some(canonical)
}

/// One `<id>.png` file per artifact in a flat directory.
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub async fn open(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("cannot create artifact directory {}", root.display()))?;
        let store = Self { root };
        store.sweep_partials().await;
        Ok(store)
    }

    /// Remove `.<uuid>.png.partial` leftovers of writes cut short by a
    /// timeout or crash. Only runs at open, before any write of this process.
    async fn sweep_partials(&self) -> usize {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Cannot scan {} for partial writes: {}", self.root.display(), e);
                return 0;
            }
        };

        let mut removed = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let Some(id) = name
                .to_str()
                .and_then(|name| name.strip_prefix('.'))
                .and_then(|name| name.strip_suffix(PARTIAL_SUFFIX))
                .and_then(|name| name.strip_suffix(ARTIFACT_EXTENSION))
            else {
                continue;
            };
            if canonical_id(id).is_none() {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("Cannot remove stale partial {}: {}", entry.path().display(), e),
            }
        }

        if removed > 0 {
            info!("Swept {} stale partial write(s) from {}", removed, self.root.display());
        }
        removed
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn final_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}{}", id, ARTIFACT_EXTENSION))
    }

    fn partial_path(&self, id: &str) -> PathBuf {
        self.root.join(format!(".{}{}{}", id, ARTIFACT_EXTENSION, PARTIAL_SUFFIX))
    }

    async fn write_partial(&self, path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
        let mut file = tokio::fs::File::create(path)
            .await
            .with_context(|| format!("cannot create {}", path.display()))?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        Ok(())
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(&self, bytes: Bytes) -> anyhow::Result<String> {
        let id = new_artifact_id();
        let partial = self.partial_path(&id);
        let target = self.final_path(&id);

        let written = async {
            self.write_partial(&partial, &bytes).await?;
            tokio::fs::rename(&partial, &target)
                .await
                .with_context(|| format!("cannot publish {}", target.display()))
        }
        .await;

        if let Err(e) = written {
            if let Err(cleanup) = tokio::fs::remove_file(&partial).await {
                debug!("No partial file to clean up for {}: {}", id, cleanup);
            }
            return Err(e);
        }

        debug!("Stored artifact {} ({} bytes) at {}", id, bytes.len(), target.display());
        Ok(id)
    }

    async fn get(&self, id: &str) -> anyhow::Result<Option<Bytes>> {
        let Some(id) = canonical_id(id) else {
            return Ok(None);
        };
        match tokio::fs::read(self.final_path(&id)).await {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("cannot read artifact {}", id)),
        }
    }

    async fn exists(&self, id: &str) -> bool {
        match canonical_id(id) {
            Some(id) => tokio::fs::try_exists(self.final_path(&id)).await.unwrap_or(false),
            None => false,
        }
    }

    async fn count(&self) -> Option<usize> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Cannot list {}: {}", self.root.display(), e);
                return None;
            }
        };

        let mut count = 0;
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let name = entry.file_name();
                    let name = name.to_string_lossy();
                    if name.ends_with(ARTIFACT_EXTENSION) && !name.starts_with('.') {
                        count += 1;
                    }
                }
                Ok(None) => return Some(count),
                Err(e) => {
                    warn!("Listing {} failed part way: {}", self.root.display(), e);
                    return None;
                }
            }
        }
    }

    fn describe(&self) -> String {
        format!("fs:{}", self.root.display())
    }
}

/// Process-local store; contents are lost on restart.
#[derive(Clone, Default)]
pub struct InMemoryArtifactStore {
    blobs: Arc<DashMap<String, Bytes>>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn put(&self, bytes: Bytes) -> anyhow::Result<String> {
        let id = new_artifact_id();
        self.blobs.insert(id.clone(), bytes);
        Ok(id)
    }

    async fn get(&self, id: &str) -> anyhow::Result<Option<Bytes>> {
        Ok(self.blobs.get(id).map(|blob| blob.value().clone()))
    }

    async fn exists(&self, id: &str) -> bool {
        self.blobs.contains_key(id)
    }

    async fn count(&self) -> Option<usize> {
        Some(self.blobs.len())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
