//! Per-run persistence: the run document, its log shards and artifacts.
//!
//! A [`RunRecordStore`] is the only writer of one run's documents. It owns
//! the last-seen revisions, the list of shard and artifact-index ids, and
//! the [`LogBatcher`], all behind a single per-run lock, so concurrent
//! callers inside one process serialize while other engines writing the
//! same run are caught by the store's revision check.
//!
//! # Lifecycle
//!
//! 1. [`start`](RunRecordStore::start) validates the server, creates the
//!    run document and creates the artifact-index document. Any failure
//!    aborts construction.
//! 2. The engine calls [`update_test_structure`](RunRecordStore::update_test_structure),
//!    [`write_log`](RunRecordStore::write_log) and
//!    [`store_artifact`](RunRecordStore::store_artifact) while the run executes.
//! 3. [`shutdown`](RunRecordStore::shutdown) stops the periodic flush,
//!    waiting for a flush in progress, then drains the log buffer. Writes
//!    that reach the state lock after the final drain are rejected.
//!
//! # Termination
//!
//! A run-document conflict means another engine is writing the same run.
//! The run document is never refreshed from the server; instead the run is
//! marked terminated and every later write fails with
//! [`RasError::RunTerminated`]. The same applies to any failure while
//! persisting a log shard or updating the structure, and to exhausted
//! artifact retries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde_json::json;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use ras_core::models::{Collections, DocumentRef, LogShard, RunDocument};
use ras_core::tree::ArtifactAttributes;
use ras_core::{ArtifactPath, DocumentStore, RasError, Result};

use crate::artifacts::VirtualArtifactFilesystem;
use crate::config::RasConfig;
use crate::log_batcher::{LogBatch, LogBatcher};
use crate::retry::{InterruptibleSleeper, RevisionedUpdateProcessor};

/// Mutable per-run state, guarded by one lock.
struct RunState {
    run_doc: Option<DocumentRef>,
    structure: RunDocument,
    log_record_ids: Vec<String>,
    artifact_doc: Option<DocumentRef>,
    artifact_record_ids: Vec<String>,
    batcher: LogBatcher,
}

pub struct RunRecordStore {
    store: Arc<dyn DocumentStore>,
    collections: Collections,
    run_name: String,
    run_id: OnceLock<String>,
    updates: RevisionedUpdateProcessor,
    run_document_attempts: u32,
    sleeper: Arc<InterruptibleSleeper>,
    state: tokio::sync::Mutex<RunState>,
    artifacts: Arc<VirtualArtifactFilesystem>,
    terminated: parking_lot::Mutex<Option<String>>,
    /// Set under the state lock by the final drain.
    closed: AtomicBool,
    heartbeat: parking_lot::Mutex<Option<Heartbeat>>,
}

/// The periodic flush task and its stop signal.
struct Heartbeat {
    stop: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl RunRecordStore {
    /// Validate the server and create the run's documents.
    ///
    /// Starts the periodic flush when `log.flush_interval_secs` is set.
    pub async fn start(
        store: Arc<dyn DocumentStore>,
        config: &RasConfig,
        run_name: &str,
    ) -> Result<Arc<Self>> {
        let sleeper = Arc::new(InterruptibleSleeper::new());
        let updates = RevisionedUpdateProcessor::from_config(&config.retry, sleeper.clone());
        Self::start_with(store, config, run_name, updates, sleeper).await
    }

    /// Like [`start`](Self::start) with an explicit update processor.
    ///
    /// `sleeper` is interrupted on shutdown; pass the one `updates` sleeps on.
    pub async fn start_with(
        store: Arc<dyn DocumentStore>,
        config: &RasConfig,
        run_name: &str,
        updates: RevisionedUpdateProcessor,
        sleeper: Arc<InterruptibleSleeper>,
    ) -> Result<Arc<Self>> {
        let requirements = config
            .store
            .requirements()
            .map_err(|e| RasError::Validation(format!("{:#}", e)))?;
        let info = store.validate_server(&requirements).await?;
        info!("Document store {} version {}", info.product, info.version);

        let collections = config.store.collections();
        let artifacts = Arc::new(VirtualArtifactFilesystem::new(
            store.clone(),
            &collections.artifacts,
            config.cache.dir.as_deref(),
        )?);

        let run = Arc::new(Self {
            store,
            collections,
            run_name: run_name.to_string(),
            run_id: OnceLock::new(),
            updates,
            run_document_attempts: config.retry.run_document_attempts,
            sleeper,
            state: tokio::sync::Mutex::new(RunState {
                run_doc: None,
                structure: RunDocument::new(run_name),
                log_record_ids: Vec::new(),
                artifact_doc: None,
                artifact_record_ids: Vec::new(),
                batcher: LogBatcher::new(config.log.batch_lines),
            }),
            artifacts,
            terminated: parking_lot::Mutex::new(None),
            closed: AtomicBool::new(false),
            heartbeat: parking_lot::Mutex::new(None),
        });

        run.update_test_structure(RunDocument::new(run_name)).await?;
        run.create_artifact_record().await?;
        info!(
            "Recording run {} as {}",
            run.run_name,
            run.run_id().unwrap_or_default()
        );

        if config.log.flush_interval_secs > 0 {
            run.spawn_periodic_flush(Duration::from_secs(config.log.flush_interval_secs));
        }
        Ok(run)
    }

    pub fn run_name(&self) -> &str {
        &self.run_name
    }

    /// Store-assigned id of the run document.
    pub fn run_id(&self) -> Option<&str> {
        self.run_id.get().map(String::as_str)
    }

    pub fn collections(&self) -> &Collections {
        &self.collections
    }

    /// Id and last-seen revision of the run document.
    pub async fn run_document_ref(&self) -> Option<DocumentRef> {
        self.state.lock().await.run_doc.clone()
    }

    /// The structure as last written.
    pub async fn structure(&self) -> RunDocument {
        self.state.lock().await.structure.clone()
    }

    /// Whether the run has been stopped after a fatal write failure.
    pub fn is_terminated(&self) -> bool {
        self.terminated.lock().is_some()
    }

    /// The artifacts written so far, as a filesystem.
    pub fn artifacts(&self) -> Arc<VirtualArtifactFilesystem> {
        self.artifacts.clone()
    }

    pub fn stored_artifacts_root(&self) -> ArtifactPath {
        self.artifacts.root()
    }

    /// Persist `structure`, merging in the current shard and artifact ids.
    pub async fn update_test_structure(&self, structure: RunDocument) -> Result<()> {
        self.check_live()?;
        let mut state = self.state.lock().await;
        self.check_live()?;
        self.write_structure(&mut state, structure).await
    }

    /// Buffer a console message, writing a shard for every full batch.
    pub async fn write_log(&self, message: &str) -> Result<()> {
        self.check_live()?;
        let mut state = self.state.lock().await;
        self.check_live()?;
        let batches = state.batcher.append(message);
        for batch in batches {
            self.persist_batch(&mut state, batch).await?;
        }
        Ok(())
    }

    /// Buffer already-split lines.
    pub async fn write_log_lines<I, S>(&self, lines: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.check_live()?;
        let mut state = self.state.lock().await;
        self.check_live()?;
        let batches = state.batcher.append_lines(lines);
        for batch in batches {
            self.persist_batch(&mut state, batch).await?;
        }
        Ok(())
    }

    /// Attach `data` to the artifact-index document under `path`.
    ///
    /// A path that clashes with an artifact or directory already stored
    /// fails with [`RasError::InvalidPath`] before anything is written.
    pub async fn store_artifact(
        &self,
        path: &ArtifactPath,
        content_type: &str,
        data: Vec<u8>,
    ) -> Result<()> {
        self.check_live()?;
        let mut state = self.state.lock().await;
        self.check_live()?;
        self.artifacts.check_can_register(path)?;
        let doc = state
            .artifact_doc
            .clone()
            .ok_or_else(|| RasError::store("artifact record has not been created"))?;

        let store = &self.store;
        let collection = self.collections.artifacts.as_str();
        let name = path.to_string();
        let name = name.as_str();
        let data = &data;
        let doc_ref = &doc;
        let result = self
            .updates
            .retry(move |attempt| async move {
                // Retries present the server's current revision.
                let revision = if attempt == 1 {
                    doc_ref.revision.clone()
                } else {
                    store
                        .get_revision(collection, &doc_ref.id)
                        .await?
                        .ok_or_else(|| {
                            RasError::NotFound(format!("{}/{}", collection, doc_ref.id))
                        })?
                };
                store
                    .put_attachment(
                        collection,
                        &doc_ref.id,
                        &revision,
                        name,
                        content_type,
                        data.clone(),
                    )
                    .await
            })
            .await;

        match result {
            Ok(updated) => {
                state.artifact_doc = Some(updated);
                debug!("stored artifact {} ({} bytes)", path, data.len());
                self.artifacts.add_known_path(
                    path,
                    &doc.id,
                    ArtifactAttributes {
                        content_type: content_type.to_string(),
                        length: data.len() as u64,
                    },
                )
            }
            Err(e) => {
                if e.is_fatal() {
                    self.terminate(&format!("storing artifact {}: {}", path, e));
                }
                Err(e)
            }
        }
    }

    /// Write any buffered log lines. Failures are logged, not returned.
    pub async fn flush(&self) {
        if let Err(e) = self.try_flush().await {
            warn!("Log flush for run {} failed: {}", self.run_name, e);
        }
    }

    /// Write any buffered log lines.
    pub async fn try_flush(&self) -> Result<()> {
        self.check_not_terminated()?;
        let mut state = self.state.lock().await;
        match state.batcher.take_batch() {
            Some(batch) => self.persist_batch(&mut state, batch).await,
            None => Ok(()),
        }
    }

    /// Drain the log buffer and stop accepting writes.
    ///
    /// Wakes any backoff in progress and lets a periodic flush that is
    /// already writing finish first. Idempotent; failures are logged.
    pub async fn shutdown(&self) {
        self.sleeper.interrupt();
        let heartbeat = self.heartbeat.lock().take();
        if let Some(heartbeat) = heartbeat {
            heartbeat.stop.notify_one();
            if let Err(e) = heartbeat.handle.await {
                warn!("Periodic flush for run {} ended abnormally: {}", self.run_name, e);
            }
        }

        let mut state = self.state.lock().await;
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if !self.is_terminated() {
            if let Some(batch) = state.batcher.take_batch() {
                if let Err(e) = self.persist_batch(&mut state, batch).await {
                    warn!("Final log flush for run {} failed: {}", self.run_name, e);
                }
            }
        }
        info!("Run store for {} shut down", self.run_name);
    }

    /// Flush on a fixed interval until shutdown or drop.
    ///
    /// Replaces any periodic flush already running.
    pub fn spawn_periodic_flush(self: &Arc<Self>, interval: Duration) {
        let weak = Arc::downgrade(self);
        let stop = Arc::new(Notify::new());
        let stopped = stop.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = stopped.notified() => break,
                    _ = ticker.tick() => {}
                }
                let Some(run) = weak.upgrade() else { break };
                if run.closed.load(Ordering::SeqCst) || run.is_terminated() {
                    break;
                }
                run.flush().await;
            }
        });
        let previous = self.heartbeat.lock().replace(Heartbeat { stop, handle });
        if let Some(previous) = previous {
            previous.stop.notify_one();
        }
    }

    fn check_not_terminated(&self) -> Result<()> {
        match self.terminated.lock().as_ref() {
            Some(reason) => Err(RasError::RunTerminated {
                run_name: self.run_name.clone(),
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    fn check_live(&self) -> Result<()> {
        self.check_not_terminated()?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(RasError::RunTerminated {
                run_name: self.run_name.clone(),
                reason: "run store has been shut down".to_string(),
            });
        }
        Ok(())
    }

    fn terminate(&self, reason: &str) {
        let mut terminated = self.terminated.lock();
        if terminated.is_none() {
            error!("Terminating run {}: {}", self.run_name, reason);
            *terminated = Some(reason.to_string());
        }
    }

    async fn create_artifact_record(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let run_id = self.run_id().unwrap_or_default().to_string();
        let body = json!({ "runId": run_id, "runName": self.run_name });
        let created = self
            .store
            .create_document(&self.collections.artifacts, &body)
            .await?;
        debug!("created artifact record {}", created.id);
        state.artifact_record_ids.push(created.id.clone());
        state.artifact_doc = Some(created);
        Ok(())
    }

    async fn persist_batch(&self, state: &mut RunState, batch: LogBatch) -> Result<()> {
        let shard = LogShard {
            run_id: self.run_id().unwrap_or_default().to_string(),
            run_name: self.run_name.clone(),
            order: batch.order,
            lines: batch.lines,
        };
        let body = serde_json::to_value(&shard)?;
        let created = match self.store.create_document(&self.collections.log, &body).await {
            Ok(created) => created,
            Err(e) => {
                self.terminate(&format!("writing log shard {}: {}", shard.order, e));
                return Err(e);
            }
        };
        debug!(
            "wrote log shard {} ({} lines) as {}",
            shard.order,
            shard.lines.len(),
            created.id
        );
        state.log_record_ids.push(created.id);

        let structure = state.structure.clone();
        self.write_structure(state, structure).await
    }

    async fn write_structure(&self, state: &mut RunState, mut structure: RunDocument) -> Result<()> {
        if structure.run_name.is_empty() {
            structure.run_name = self.run_name.clone();
        }
        structure.log_record_ids = state.log_record_ids.clone();
        structure.artifact_record_ids = state.artifact_record_ids.clone();
        let body = serde_json::to_value(&structure)?;

        let collection = self.collections.run.as_str();
        let result = match state.run_doc.clone() {
            None => self.store.create_document(collection, &body).await,
            Some(doc) => {
                let store = &self.store;
                let body = &body;
                let doc = &doc;
                self.updates
                    .retry_with_limit(self.run_document_attempts, move |_| async move {
                        store
                            .update_document(collection, &doc.id, &doc.revision, body)
                            .await
                    })
                    .await
            }
        };

        match result {
            Ok(updated) => {
                let _ = self.run_id.set(updated.id.clone());
                debug!("run document {} now at {}", updated.id, updated.revision);
                state.run_doc = Some(updated);
                state.structure = structure;
                Ok(())
            }
            Err(e) => {
                if state.run_doc.is_some() {
                    self.terminate(&format!("updating run document: {}", e));
                }
                Err(e)
            }
        }
    }
}

impl Drop for RunRecordStore {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.heartbeat.get_mut().take() {
            heartbeat.handle.abort();
        }
    }
}
