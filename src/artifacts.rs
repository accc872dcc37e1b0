//! Virtual filesystem over a run's stored artifacts.
//!
//! Attachment keys scattered across one or more artifact-index documents
//! are presented as a single directory tree. Listing and attributes are
//! answered from the in-memory [`ArtifactTree`]; reading an artifact
//! streams its attachment into a per-session cache directory once and
//! hands back a handle to the cached file.
//!
//! # Cache layout
//!
//! ```text
//! <cache dir>/ras-XXXXXX/<hex(sha256(record_id + path))>
//! ```
//!
//! The session directory is removed when the filesystem is dropped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use ras_core::models::{ArtifactIndex, StoredDocument};
use ras_core::tree::{ArtifactAttributes, ArtifactNode, ArtifactTree, DirEntry};
use ras_core::{ArtifactPath, DocumentStore, RasError, Result};

use crate::config::RasConfig;
use crate::query::QueryService;

/// Read-only filesystem capabilities over an artifact tree.
#[async_trait]
pub trait ArtifactFileSystem: Send + Sync {
    /// Immediate children of a directory.
    fn list(&self, directory: &ArtifactPath) -> Result<Vec<DirEntry>>;

    /// Open an artifact for reading.
    async fn open(&self, path: &ArtifactPath) -> Result<tokio::fs::File>;

    fn read_attributes(&self, path: &ArtifactPath) -> Result<ArtifactAttributes>;

    /// Parent directory, or `None` for the root.
    fn resolve_parent(&self, path: &ArtifactPath) -> Option<ArtifactPath> {
        path.parent()
    }
}

pub struct VirtualArtifactFilesystem {
    store: Arc<dyn DocumentStore>,
    collection: String,
    tree: RwLock<ArtifactTree>,
    cache: TempDir,
    cached: Mutex<HashMap<ArtifactPath, PathBuf>>,
    /// Serializes fetches so one artifact is never downloaded twice.
    fetch_lock: tokio::sync::Mutex<()>,
}

impl VirtualArtifactFilesystem {
    /// Empty tree backed by `collection`, caching under `cache_root` or the
    /// system temp directory.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        collection: &str,
        cache_root: Option<&Path>,
    ) -> Result<Self> {
        let cache = match cache_root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                tempfile::Builder::new().prefix("ras-").tempdir_in(root)?
            }
            None => tempfile::Builder::new().prefix("ras-").tempdir()?,
        };
        debug!("artifact cache at {}", cache.path().display());
        Ok(Self {
            store,
            collection: collection.to_string(),
            tree: RwLock::new(ArtifactTree::new()),
            cache,
            cached: Mutex::new(HashMap::new()),
            fetch_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Build the tree from existing artifact-index documents.
    pub async fn load(
        store: Arc<dyn DocumentStore>,
        collection: &str,
        record_ids: &[String],
        cache_root: Option<&Path>,
    ) -> Result<Self> {
        let fs = Self::new(store, collection, cache_root)?;
        for record_id in record_ids {
            fs.load_record(record_id).await?;
        }
        Ok(fs)
    }

    /// Register every attachment of one artifact-index document.
    ///
    /// Returns the number of artifacts registered; a missing document
    /// registers nothing. Keys that cannot be placed in the tree are
    /// skipped with a warning.
    pub async fn load_record(&self, record_id: &str) -> Result<usize> {
        let Some(doc) = self.store.get_document(&self.collection, record_id).await? else {
            warn!("artifact record {} not found in {}", record_id, self.collection);
            return Ok(0);
        };
        let index: StoredDocument<ArtifactIndex> = serde_json::from_value(doc)?;
        let mut count = 0;
        for (key, stub) in &index.body.attachments {
            let registered = attachment_path(key).and_then(|path| {
                self.add_known_path(
                    &path,
                    record_id,
                    ArtifactAttributes {
                        content_type: stub.content_type.clone(),
                        length: stub.length,
                    },
                )
            });
            match registered {
                Ok(()) => count += 1,
                Err(e) => warn!("skipping artifact {} in record {}: {}", key, record_id, e),
            }
        }
        debug!("loaded {} artifacts from record {}", count, record_id);
        Ok(count)
    }

    /// Fails if `path` cannot be registered as an artifact.
    pub fn check_can_register(&self, path: &ArtifactPath) -> Result<()> {
        self.tree.read().check_can_register(path)
    }

    /// Register a leaf owned by `record_id`, synthesizing its ancestors.
    ///
    /// Any cached copy of the path is discarded.
    pub fn add_known_path(
        &self,
        path: &ArtifactPath,
        record_id: &str,
        attributes: ArtifactAttributes,
    ) -> Result<()> {
        self.tree.write().add_known_path(path, record_id, attributes)?;
        if let Some(stale) = self.cached.lock().remove(path) {
            let _ = std::fs::remove_file(stale);
        }
        Ok(())
    }

    pub fn root(&self) -> ArtifactPath {
        ArtifactPath::root()
    }

    pub fn contains(&self, path: &ArtifactPath) -> bool {
        self.tree.read().contains(path)
    }

    /// Every leaf artifact path, in order.
    pub fn artifact_paths(&self) -> Vec<ArtifactPath> {
        self.tree
            .read()
            .artifacts()
            .map(|(path, _)| path.clone())
            .collect()
    }

    pub fn cache_dir(&self) -> &Path {
        self.cache.path()
    }

    /// Read a whole artifact into memory.
    pub async fn read_to_vec(&self, path: &ArtifactPath) -> Result<Vec<u8>> {
        let mut file = self.open(path).await?;
        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut file, &mut buf).await?;
        Ok(buf)
    }

    fn cache_file(&self, record_id: &str, path: &ArtifactPath) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(record_id.as_bytes());
        hasher.update(path.to_string().as_bytes());
        self.cache.path().join(hex::encode(hasher.finalize()))
    }

    async fn fetch(&self, record_id: &str, path: &ArtifactPath) -> Result<PathBuf> {
        let target = self.cache_file(record_id, path);
        let mut file = tokio::fs::File::create(&target).await?;
        let written = self
            .store
            .get_attachment(&self.collection, record_id, &path.to_string(), &mut file)
            .await;
        let written = match written {
            Ok(Some(n)) => n,
            Ok(None) => {
                drop(file);
                let _ = tokio::fs::remove_file(&target).await;
                return Err(RasError::NotFound(format!(
                    "{} (record {})",
                    path, record_id
                )));
            }
            Err(e) => {
                drop(file);
                let _ = tokio::fs::remove_file(&target).await;
                return Err(e);
            }
        };
        file.flush().await?;
        debug!("cached {} ({} bytes) at {}", path, written, target.display());
        Ok(target)
    }
}

#[async_trait]
impl ArtifactFileSystem for VirtualArtifactFilesystem {
    fn list(&self, directory: &ArtifactPath) -> Result<Vec<DirEntry>> {
        self.tree.read().list(directory)
    }

    async fn open(&self, path: &ArtifactPath) -> Result<tokio::fs::File> {
        let node = self.tree.read().get(path).cloned();
        let record_id = match node {
            None => return Err(RasError::NotFound(path.to_string())),
            Some(ArtifactNode::Directory) => {
                return Err(RasError::InvalidPath {
                    path: path.to_string(),
                    reason: "is a directory".to_string(),
                })
            }
            Some(ArtifactNode::Artifact { record_id, .. }) => record_id,
        };

        let _guard = self.fetch_lock.lock().await;
        let hit = self.cached.lock().get(path).cloned();
        let local = match hit {
            Some(local) if local.exists() => local,
            _ => {
                let local = self.fetch(&record_id, path).await?;
                self.cached.lock().insert(path.clone(), local.clone());
                local
            }
        };
        Ok(tokio::fs::File::open(&local).await?)
    }

    fn read_attributes(&self, path: &ArtifactPath) -> Result<ArtifactAttributes> {
        self.tree.read().attributes(path).cloned()
    }
}

/// Attachment keys are stored as absolute paths; tolerate relative ones.
fn attachment_path(key: &str) -> Result<ArtifactPath> {
    if key.starts_with('/') {
        ArtifactPath::parse(key)
    } else {
        ArtifactPath::parse(&format!("/{}", key))
    }
}

/// `ras ls <run-id> [path]`: list a directory of a stored run.
pub async fn run_ls(config: &RasConfig, run_id: &str, path: &str) -> anyhow::Result<()> {
    let query = QueryService::connect(config)?;
    let run = query
        .get_run_by_id(run_id)
        .await?
        .with_context(|| format!("Run not found: {}", run_id))?;
    let fs = run.artifacts().await?;
    let dir = ArtifactPath::parse(path)?;

    for entry in fs.list(&dir)? {
        if entry.is_directory {
            println!("{}/", entry.name());
        } else {
            let attrs = fs.read_attributes(&entry.path)?;
            println!(
                "{:<40} {:>10}  {}",
                entry.name(),
                attrs.length,
                attrs.content_type
            );
        }
    }
    Ok(())
}

/// `ras cat <run-id> <path>`: write one artifact to stdout.
pub async fn run_cat(config: &RasConfig, run_id: &str, path: &str) -> anyhow::Result<()> {
    let query = QueryService::connect(config)?;
    let run = query
        .get_run_by_id(run_id)
        .await?
        .with_context(|| format!("Run not found: {}", run_id))?;
    let fs = run.artifacts().await?;
    let path = ArtifactPath::parse(path)?;

    let mut file = fs.open(&path).await?;
    let mut stdout = tokio::io::stdout();
    tokio::io::copy(&mut file, &mut stdout).await?;
    tokio::io::AsyncWriteExt::flush(&mut stdout).await?;
    Ok(())
}
