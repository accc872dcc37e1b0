//! Read-only discovery across historical runs.
//!
//! [`QueryService`] finds run documents by name or by requestor and queue
//! time, lists the distinct requestors and test names from the store's
//! grouped views, and loads a single run by id. Each hit is a
//! [`RunResult`] that can reassemble the run's console log and open its
//! artifact tree.
//!
//! # Query shapes
//!
//! | Query | Store request |
//! |-------|---------------|
//! | by name | `_find` with `{"runName": {"$eq": name}}` |
//! | by requestor / time | `_find` with an `$and` of the given filters |
//! | no filters | `_all_docs?include_docs=true` |
//! | requestors, tests | grouped view, keys only |
//!
//! `_find` results are paged with the returned bookmark until a page comes
//! back empty.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::{DateTime, NaiveDate, SecondsFormat, TimeZone, Utc};
use serde_json::{json, Value};
use tracing::{debug, warn};

use ras_core::models::{Collections, LogShard, RunDocument, StoredDocument};
use ras_core::store::{REQUESTORS_VIEW, TEST_NAMES_VIEW};
use ras_core::{DocumentStore, RasError, Result};

use crate::artifacts::VirtualArtifactFilesystem;
use crate::config::RasConfig;
use crate::couchdb::CouchDbStore;

pub struct QueryService {
    store: Arc<dyn DocumentStore>,
    collections: Collections,
    cache_root: Option<PathBuf>,
}

/// One run found by a query.
///
/// Queries return the run document only. The artifact tree is resolved
/// when [`artifacts`](Self::artifacts) is called, and the log by
/// [`log`](Self::log).
#[derive(Clone)]
pub struct RunResult {
    pub run_id: String,
    pub revision: String,
    pub structure: RunDocument,
    store: Arc<dyn DocumentStore>,
    collections: Collections,
    cache_root: Option<PathBuf>,
}

impl std::fmt::Debug for RunResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunResult")
            .field("run_id", &self.run_id)
            .field("revision", &self.revision)
            .field("structure", &self.structure)
            .finish()
    }
}

impl RunResult {
    pub fn run_name(&self) -> &str {
        &self.structure.run_name
    }

    /// Load the run's artifact tree from its artifact-index documents.
    pub async fn artifacts(&self) -> Result<VirtualArtifactFilesystem> {
        VirtualArtifactFilesystem::load(
            self.store.clone(),
            &self.collections.artifacts,
            &self.structure.artifact_record_ids,
            self.cache_root.as_deref(),
        )
        .await
    }

    /// Reassemble the console log from its shards, in shard order.
    pub async fn log(&self) -> Result<String> {
        let mut shards = Vec::with_capacity(self.structure.log_record_ids.len());
        for id in &self.structure.log_record_ids {
            match self.store.get_document(&self.collections.log, id).await? {
                Some(doc) => {
                    let shard: StoredDocument<LogShard> = serde_json::from_value(doc)
                        .map_err(|e| RasError::store(format!("malformed log shard {}: {}", id, e)))?;
                    shards.push(shard.body);
                }
                None => warn!("log shard {} of run {} is missing", id, self.run_name()),
            }
        }
        shards.sort_by_key(|shard| shard.order);
        let lines: Vec<String> = shards.into_iter().flat_map(|shard| shard.lines).collect();
        Ok(lines.join("\n"))
    }
}

impl QueryService {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        collections: Collections,
        cache_root: Option<PathBuf>,
    ) -> Self {
        Self {
            store,
            collections,
            cache_root,
        }
    }

    /// Query service over the configured CouchDB server.
    pub fn connect(config: &RasConfig) -> anyhow::Result<Self> {
        let store = CouchDbStore::new(&config.store)?;
        Ok(Self::new(
            Arc::new(store),
            config.store.collections(),
            config.cache.dir.clone(),
        ))
    }

    /// Runs whose name equals `run_name`.
    pub async fn find_runs_by_name(&self, run_name: &str) -> Result<Vec<RunResult>> {
        let selector = json!({ "runName": { "$eq": run_name } });
        self.find_all(&selector).await
    }

    /// Runs matching every given filter; queue time is `[from, to)`.
    ///
    /// With no filters at all every run document is listed.
    pub async fn find_runs(
        &self,
        requestor: Option<&str>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<RunResult>> {
        match run_selector(requestor, from, to) {
            Some(selector) => self.find_all(&selector).await,
            None => {
                debug!("no filters, listing every run document");
                let docs = self.store.all_documents(&self.collections.run).await?;
                docs.into_iter().map(|doc| self.to_result(doc)).collect()
            }
        }
    }

    pub async fn get_run_by_id(&self, run_id: &str) -> Result<Option<RunResult>> {
        match self.store.get_document(&self.collections.run, run_id).await? {
            Some(doc) => Ok(Some(self.to_result(doc)?)),
            None => Ok(None),
        }
    }

    /// Distinct requestors of every stored run.
    pub async fn list_requestors(&self) -> Result<Vec<String>> {
        self.view_keys(REQUESTORS_VIEW).await
    }

    /// Distinct test names of every stored run.
    pub async fn list_tests(&self) -> Result<Vec<String>> {
        self.view_keys(TEST_NAMES_VIEW).await
    }

    async fn view_keys(&self, view: &str) -> Result<Vec<String>> {
        let rows = self.store.view(&self.collections.run, view, true).await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| match row.key {
                Value::String(key) => Some(key),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .collect())
    }

    async fn find_all(&self, selector: &Value) -> Result<Vec<RunResult>> {
        let mut results = Vec::new();
        let mut bookmark: Option<String> = None;
        loop {
            let page = self
                .store
                .find(&self.collections.run, selector, bookmark.as_deref())
                .await?;
            if page.docs.is_empty() {
                break;
            }
            for doc in page.docs {
                results.push(self.to_result(doc)?);
            }
            match page.bookmark {
                Some(next) => bookmark = Some(next),
                None => break,
            }
        }
        debug!("found {} runs", results.len());
        Ok(results)
    }

    fn to_result(&self, doc: Value) -> Result<RunResult> {
        let doc: StoredDocument<RunDocument> = serde_json::from_value(doc)
            .map_err(|e| RasError::store(format!("malformed run document: {}", e)))?;
        Ok(RunResult {
            run_id: doc.id,
            revision: doc.revision,
            structure: doc.body,
            store: self.store.clone(),
            collections: self.collections.clone(),
            cache_root: self.cache_root.clone(),
        })
    }
}

/// Conjunctive `_find` selector, or `None` when no filter is given.
pub fn run_selector(
    requestor: Option<&str>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
) -> Option<Value> {
    let mut clauses = Vec::new();
    if let Some(requestor) = requestor {
        clauses.push(json!({ "requestor": { "$eq": requestor } }));
    }
    if let Some(from) = from {
        clauses.push(json!({ "queued": { "$gte": timestamp(from) } }));
    }
    if let Some(to) = to {
        clauses.push(json!({ "queued": { "$lt": timestamp(to) } }));
    }
    if clauses.is_empty() {
        None
    } else {
        Some(json!({ "$and": clauses }))
    }
}

/// Same text form the run document uses for its timestamps.
fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Parse an RFC 3339 timestamp or a `YYYY-MM-DD` date (midnight UTC).
pub fn parse_time(s: &str) -> anyhow::Result<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .with_context(|| format!("Invalid time '{}': expected RFC 3339 or YYYY-MM-DD", s))?;
    date.and_hms_opt(0, 0, 0)
        .map(|t| Utc.from_utc_datetime(&t))
        .with_context(|| format!("Invalid date: {}", s))
}

fn print_runs(runs: &[RunResult]) {
    if runs.is_empty() {
        println!("No runs.");
        return;
    }
    println!(
        "{:<34} {:<12} {:<16} {:<12} {:<25} TEST",
        "ID", "NAME", "REQUESTOR", "RESULT", "QUEUED"
    );
    for run in runs {
        let s = &run.structure;
        println!(
            "{:<34} {:<12} {:<16} {:<12} {:<25} {}",
            run.run_id,
            s.run_name,
            s.requestor.as_deref().unwrap_or("-"),
            s.result.as_deref().or(s.status.as_deref()).unwrap_or("-"),
            s.queued.map(timestamp).unwrap_or_else(|| "-".to_string()),
            s.test_name.as_deref().unwrap_or("-"),
        );
    }
}

/// `ras runs`: find runs by name, or by requestor and queue time.
pub async fn run_runs(
    config: &RasConfig,
    name: Option<&str>,
    requestor: Option<&str>,
    from: Option<&str>,
    to: Option<&str>,
) -> anyhow::Result<()> {
    if name.is_some() && (requestor.is_some() || from.is_some() || to.is_some()) {
        bail!("--name cannot be combined with --requestor, --from or --to");
    }
    let from = from.map(parse_time).transpose()?;
    let to = to.map(parse_time).transpose()?;

    let query = QueryService::connect(config)?;
    let runs = match name {
        Some(name) => query.find_runs_by_name(name).await?,
        None => query.find_runs(requestor, from, to).await?,
    };
    print_runs(&runs);
    Ok(())
}

/// `ras requestors`
pub async fn run_requestors(config: &RasConfig) -> anyhow::Result<()> {
    let query = QueryService::connect(config)?;
    for requestor in query.list_requestors().await? {
        println!("{}", requestor);
    }
    Ok(())
}

/// `ras tests`
pub async fn run_tests(config: &RasConfig) -> anyhow::Result<()> {
    let query = QueryService::connect(config)?;
    for test in query.list_tests().await? {
        println!("{}", test);
    }
    Ok(())
}

/// `ras log <run-id>`: print a run's console log.
pub async fn run_log(config: &RasConfig, run_id: &str) -> anyhow::Result<()> {
    let query = QueryService::connect(config)?;
    let run = query
        .get_run_by_id(run_id)
        .await?
        .with_context(|| format!("Run not found: {}", run_id))?;
    let log = run.log().await?;
    if !log.is_empty() {
        println!("{}", log);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_uses_only_given_filters() {
        assert!(run_selector(None, None, None).is_none());

        let sel = run_selector(Some("alice"), None, None).unwrap();
        assert_eq!(sel, json!({"$and": [{"requestor": {"$eq": "alice"}}]}));

        let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let sel = run_selector(None, Some(from), Some(to)).unwrap();
        assert_eq!(
            sel,
            json!({"$and": [
                {"queued": {"$gte": "2024-01-01T00:00:00Z"}},
                {"queued": {"$lt": "2024-02-01T00:00:00Z"}}
            ]})
        );
    }

    #[test]
    fn test_timestamp_matches_document_serialization() {
        let t = Utc.with_ymd_and_hms(2024, 3, 4, 5, 6, 7).unwrap();
        let serialized = serde_json::to_value(t).unwrap();
        assert_eq!(serialized, json!(timestamp(t)));
    }

    #[test]
    fn test_parse_time_formats() {
        let t = parse_time("2024-05-06").unwrap();
        assert_eq!(t, Utc.with_ymd_and_hms(2024, 5, 6, 0, 0, 0).unwrap());
        let t = parse_time("2024-05-06T10:00:00+02:00").unwrap();
        assert_eq!(t, Utc.with_ymd_and_hms(2024, 5, 6, 8, 0, 0).unwrap());
        assert!(parse_time("yesterday").is_err());
    }
}
