//! Documents persisted by the Result Archive Store.
//!
//! Each persisted entity is a plain body type; the store-assigned identity
//! travels alongside it as a [`DocumentRef`] (or inside a
//! [`StoredDocument`] when read back), never as part of the body.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Store-assigned identity of a document: its id plus the revision token
/// returned by the last successful write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRef {
    pub id: String,
    pub revision: String,
}

impl DocumentRef {
    pub fn new(id: impl Into<String>, revision: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            revision: revision.into(),
        }
    }
}

/// A document body read back together with its `_id` and `_rev`.
#[derive(Debug, Clone, Deserialize)]
pub struct StoredDocument<T> {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev")]
    pub revision: String,
    #[serde(flatten)]
    pub body: T,
}

impl<T> StoredDocument<T> {
    pub fn doc_ref(&self) -> DocumentRef {
        DocumentRef::new(self.id.clone(), self.revision.clone())
    }
}

/// The structure document of one test run.
///
/// Only the identifiers the archive itself reads or writes are modelled;
/// the test engine fills in the rest before calling
/// `update_test_structure`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunDocument {
    #[serde(default)]
    pub run_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_short_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requestor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Shard document ids, in shard order.
    #[serde(default)]
    pub log_record_ids: Vec<String>,
    #[serde(default)]
    pub artifact_record_ids: Vec<String>,
}

impl RunDocument {
    pub fn new(run_name: impl Into<String>) -> Self {
        Self {
            run_name: run_name.into(),
            ..Default::default()
        }
    }
}

/// One immutable batch of console log lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogShard {
    pub run_id: String,
    pub run_name: String,
    /// Per-run sequence number, gap-free from 1.
    pub order: u64,
    pub lines: Vec<String>,
}

/// Attachment metadata as the store reports it in `_attachments`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentStub {
    pub content_type: String,
    #[serde(default)]
    pub length: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(default)]
    pub stub: bool,
}

/// The document that carries a run's binary artifacts as attachments,
/// keyed by their logical path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactIndex {
    pub run_id: String,
    pub run_name: String,
    #[serde(
        rename = "_attachments",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub attachments: BTreeMap<String, AttachmentStub>,
}

/// Collection names derived from one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collections {
    pub run: String,
    pub log: String,
    pub artifacts: String,
}

impl Collections {
    pub fn for_namespace(namespace: &str) -> Self {
        Self {
            run: format!("{}_run", namespace),
            log: format!("{}_log", namespace),
            artifacts: format!("{}_artifacts", namespace),
        }
    }
}

/// One page of a `_find` query.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FindPage {
    pub docs: Vec<serde_json::Value>,
    #[serde(default)]
    pub bookmark: Option<String>,
    #[serde(default)]
    pub warning: Option<String>,
}

/// One row of a grouped view.
#[derive(Debug, Clone, Deserialize)]
pub struct ViewRow {
    pub key: serde_json::Value,
    #[serde(default)]
    pub value: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_run_document_uses_camel_case() {
        let mut doc = RunDocument::new("L10");
        doc.log_record_ids.push("log-1".into());
        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["runName"], "L10");
        assert_eq!(value["logRecordIds"], json!(["log-1"]));
        assert!(value.get("requestor").is_none());
    }

    #[test]
    fn test_stored_document_splits_identity() {
        let value = json!({
            "_id": "run-1",
            "_rev": "3-abc",
            "runName": "U7",
            "requestor": "alice",
            "_attachments": {}
        });
        let stored: StoredDocument<RunDocument> = serde_json::from_value(value).unwrap();
        assert_eq!(stored.doc_ref(), DocumentRef::new("run-1", "3-abc"));
        assert_eq!(stored.body.run_name, "U7");
        assert_eq!(stored.body.requestor.as_deref(), Some("alice"));
    }

    #[test]
    fn test_artifact_index_reads_attachment_stubs() {
        let value = json!({
            "_id": "art-1",
            "_rev": "2-def",
            "runId": "run-1",
            "runName": "U7",
            "_attachments": {
                "/run.log": {"content_type": "text/plain", "length": 12, "stub": true}
            }
        });
        let stored: StoredDocument<ArtifactIndex> = serde_json::from_value(value).unwrap();
        let stub = &stored.body.attachments["/run.log"];
        assert_eq!(stub.content_type, "text/plain");
        assert_eq!(stub.length, 12);
    }

    #[test]
    fn test_new_artifact_index_serializes_without_attachments() {
        let index = ArtifactIndex {
            run_id: "run-1".into(),
            run_name: "U7".into(),
            attachments: BTreeMap::new(),
        };
        assert_eq!(
            serde_json::to_value(&index).unwrap(),
            json!({"runId": "run-1", "runName": "U7"})
        );
    }

    #[test]
    fn test_collections_for_namespace() {
        let c = Collections::for_namespace("galasa");
        assert_eq!(c.run, "galasa_run");
        assert_eq!(c.log, "galasa_log");
        assert_eq!(c.artifacts, "galasa_artifacts");
    }
}
