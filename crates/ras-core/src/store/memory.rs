//! In-memory [`DocumentStore`] implementation for testing.
//!
//! Mimics the CouchDB behaviour the archive relies on: store-assigned ids,
//! `N-hash` revision tokens that change on every write, conflicts on stale
//! revisions, attachments with stub metadata, `_find` paging by bookmark
//! (terminated by an empty page) and grouped views. Every request is
//! recorded so tests can assert on the exact traffic a component produced.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::{RasError, Result};
use crate::models::{DocumentRef, FindPage, ViewRow};
use crate::server::{ServerInfo, ServerRequirements};

use super::DocumentStore;

/// One request as seen by the store.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreRequest {
    ValidateServer,
    Create {
        collection: String,
        id: String,
        body: Value,
    },
    Update {
        collection: String,
        id: String,
        revision: String,
        body: Value,
    },
    Get {
        collection: String,
        id: String,
    },
    PutAttachment {
        collection: String,
        id: String,
        name: String,
    },
    GetAttachment {
        collection: String,
        id: String,
        name: String,
    },
    Find {
        collection: String,
        selector: Value,
        bookmark: Option<String>,
    },
    View {
        collection: String,
        name: String,
    },
    AllDocuments {
        collection: String,
    },
}

struct StoredAttachment {
    content_type: String,
    data: Vec<u8>,
}

struct StoredDoc {
    generation: u64,
    revision: String,
    body: Map<String, Value>,
    attachments: BTreeMap<String, StoredAttachment>,
}

impl StoredDoc {
    fn to_json(&self, id: &str) -> Value {
        let mut doc = self.body.clone();
        doc.insert("_id".into(), json!(id));
        doc.insert("_rev".into(), json!(self.revision));
        if !self.attachments.is_empty() {
            let stubs: Map<String, Value> = self
                .attachments
                .iter()
                .map(|(name, att)| {
                    (
                        name.clone(),
                        json!({
                            "content_type": att.content_type,
                            "length": att.data.len(),
                            "digest": format!("sha256-{}", hex::encode(Sha256::digest(&att.data))),
                            "stub": true,
                        }),
                    )
                })
                .collect();
            doc.insert("_attachments".into(), Value::Object(stubs));
        }
        Value::Object(doc)
    }

    fn bump(&mut self) {
        self.generation += 1;
        self.revision = make_revision(self.generation, &self.body);
    }
}

#[derive(Default)]
struct Inner {
    collections: HashMap<String, BTreeMap<String, StoredDoc>>,
    views: HashMap<(String, String), String>,
    requests: Vec<StoreRequest>,
    injected_conflicts: HashMap<String, u32>,
    find_warning: Option<String>,
}

/// In-memory document store for tests.
pub struct InMemoryDocumentStore {
    inner: Mutex<Inner>,
    server_root: Mutex<Value>,
    page_size: usize,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            server_root: Mutex::new(json!({"couchdb": "Welcome", "version": "3.3.3"})),
            page_size: 25,
        }
    }

    /// Documents per `_find` page.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Replace the document served from the store root.
    pub fn set_server_root(&self, root: Value) {
        *self.server_root.lock() = root;
    }

    /// Register a view keyed by a top-level document field.
    pub fn register_view(&self, collection: &str, view_name: &str, key_field: &str) {
        self.inner.lock().views.insert(
            (collection.to_string(), view_name.to_string()),
            key_field.to_string(),
        );
    }

    /// Make the next `count` updates or attachment writes in `collection`
    /// fail with a conflict, as if another writer had won the race.
    pub fn inject_conflicts(&self, collection: &str, count: u32) {
        self.inner
            .lock()
            .injected_conflicts
            .insert(collection.to_string(), count);
    }

    /// Attach a warning to every `_find` response.
    pub fn set_find_warning(&self, warning: Option<&str>) {
        self.inner.lock().find_warning = warning.map(str::to_string);
    }

    /// Insert a document directly, bypassing the request log.
    pub fn insert(&self, collection: &str, id: &str, body: Value) -> Result<DocumentRef> {
        let body = into_body(&body)?;
        let revision = make_revision(1, &body);
        self.inner
            .lock()
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(
                id.to_string(),
                StoredDoc {
                    generation: 1,
                    revision: revision.clone(),
                    body,
                    attachments: BTreeMap::new(),
                },
            );
        Ok(DocumentRef::new(id, revision))
    }

    pub fn requests(&self) -> Vec<StoreRequest> {
        self.inner.lock().requests.clone()
    }

    pub fn clear_requests(&self) {
        self.inner.lock().requests.clear();
    }

    /// Current body of a document, with `_id`/`_rev`/`_attachments`.
    pub fn document(&self, collection: &str, id: &str) -> Option<Value> {
        let inner = self.inner.lock();
        inner
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .map(|doc| doc.to_json(id))
    }

    /// Every document of a collection, ordered by id.
    pub fn documents(&self, collection: &str) -> Vec<Value> {
        let inner = self.inner.lock();
        inner
            .collections
            .get(collection)
            .map(|docs| docs.iter().map(|(id, doc)| doc.to_json(id)).collect())
            .unwrap_or_default()
    }
}

impl Default for InMemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

fn make_revision(generation: u64, body: &Map<String, Value>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(generation.to_le_bytes());
    hasher.update(Value::Object(body.clone()).to_string().as_bytes());
    hasher.update(uuid::Uuid::new_v4().as_bytes());
    format!("{}-{}", generation, &hex::encode(hasher.finalize())[..32])
}

fn into_body(body: &Value) -> Result<Map<String, Value>> {
    let mut map = body
        .as_object()
        .cloned()
        .ok_or_else(|| RasError::store("document body must be a JSON object"))?;
    map.remove("_id");
    map.remove("_rev");
    map.remove("_attachments");
    Ok(map)
}

fn conflict(collection: &str, id: &str) -> RasError {
    RasError::Conflict {
        collection: collection.to_string(),
        id: id.to_string(),
    }
}

impl Inner {
    fn take_injected_conflict(&mut self, collection: &str) -> bool {
        match self.injected_conflicts.get_mut(collection) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }

    fn checked_doc(
        &mut self,
        collection: &str,
        id: &str,
        revision: &str,
    ) -> Result<&mut StoredDoc> {
        if self.take_injected_conflict(collection) {
            return Err(conflict(collection, id));
        }
        let doc = self
            .collections
            .get_mut(collection)
            .and_then(|docs| docs.get_mut(id))
            .ok_or_else(|| RasError::NotFound(format!("{}/{}", collection, id)))?;
        if doc.revision != revision {
            return Err(conflict(collection, id));
        }
        Ok(doc)
    }
}

// ============ Selector evaluation ============

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn field_matches(value: Option<&Value>, condition: &Value) -> bool {
    let operators = condition
        .as_object()
        .filter(|obj| obj.keys().all(|k| k.starts_with('$')));
    let Some(operators) = operators else {
        return value == Some(condition);
    };
    operators.iter().all(|(op, operand)| {
        let Some(value) = value else {
            return op == "$exists" && operand == &Value::Bool(false);
        };
        match op.as_str() {
            "$eq" => value == operand,
            "$ne" => value != operand,
            "$gt" => compare(value, operand) == Some(Ordering::Greater),
            "$gte" => matches!(
                compare(value, operand),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            "$lt" => compare(value, operand) == Some(Ordering::Less),
            "$lte" => matches!(
                compare(value, operand),
                Some(Ordering::Less | Ordering::Equal)
            ),
            "$exists" => operand == &Value::Bool(true),
            _ => false,
        }
    })
}

fn selector_matches(doc: &Value, selector: &Value) -> bool {
    let Some(clauses) = selector.as_object() else {
        return false;
    };
    clauses.iter().all(|(key, condition)| match key.as_str() {
        "$and" => condition
            .as_array()
            .map(|parts| parts.iter().all(|part| selector_matches(doc, part)))
            .unwrap_or(false),
        "$or" => condition
            .as_array()
            .map(|parts| parts.iter().any(|part| selector_matches(doc, part)))
            .unwrap_or(false),
        field => field_matches(doc.get(field), condition),
    })
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn validate_server(&self, requirements: &ServerRequirements) -> Result<ServerInfo> {
        self.inner.lock().requests.push(StoreRequest::ValidateServer);
        let root = self.server_root.lock().clone();
        requirements.validate(&root)
    }

    async fn create_document(&self, collection: &str, body: &Value) -> Result<DocumentRef> {
        let map = into_body(body)?;
        let id = uuid::Uuid::new_v4().simple().to_string();
        let revision = make_revision(1, &map);
        let mut inner = self.inner.lock();
        inner.requests.push(StoreRequest::Create {
            collection: collection.to_string(),
            id: id.clone(),
            body: body.clone(),
        });
        inner
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(
                id.clone(),
                StoredDoc {
                    generation: 1,
                    revision: revision.clone(),
                    body: map,
                    attachments: BTreeMap::new(),
                },
            );
        Ok(DocumentRef::new(id, revision))
    }

    async fn update_document(
        &self,
        collection: &str,
        id: &str,
        revision: &str,
        body: &Value,
    ) -> Result<DocumentRef> {
        let map = into_body(body)?;
        let mut inner = self.inner.lock();
        inner.requests.push(StoreRequest::Update {
            collection: collection.to_string(),
            id: id.to_string(),
            revision: revision.to_string(),
            body: body.clone(),
        });
        let doc = inner.checked_doc(collection, id, revision)?;
        doc.body = map;
        doc.bump();
        Ok(DocumentRef::new(id, doc.revision.clone()))
    }

    async fn get_document(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let mut inner = self.inner.lock();
        inner.requests.push(StoreRequest::Get {
            collection: collection.to_string(),
            id: id.to_string(),
        });
        Ok(inner
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .map(|doc| doc.to_json(id)))
    }

    async fn put_attachment(
        &self,
        collection: &str,
        id: &str,
        revision: &str,
        name: &str,
        content_type: &str,
        data: Vec<u8>,
    ) -> Result<DocumentRef> {
        let mut inner = self.inner.lock();
        inner.requests.push(StoreRequest::PutAttachment {
            collection: collection.to_string(),
            id: id.to_string(),
            name: name.to_string(),
        });
        let doc = inner.checked_doc(collection, id, revision)?;
        doc.attachments.insert(
            name.to_string(),
            StoredAttachment {
                content_type: content_type.to_string(),
                data,
            },
        );
        doc.bump();
        Ok(DocumentRef::new(id, doc.revision.clone()))
    }

    async fn get_attachment(
        &self,
        collection: &str,
        id: &str,
        name: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<Option<u64>> {
        let data = {
            let mut inner = self.inner.lock();
            inner.requests.push(StoreRequest::GetAttachment {
                collection: collection.to_string(),
                id: id.to_string(),
                name: name.to_string(),
            });
            inner
                .collections
                .get(collection)
                .and_then(|docs| docs.get(id))
                .and_then(|doc| doc.attachments.get(name))
                .map(|att| att.data.clone())
        };
        match data {
            Some(data) => {
                sink.write_all(&data).await?;
                sink.flush().await?;
                Ok(Some(data.len() as u64))
            }
            None => Ok(None),
        }
    }

    async fn find(
        &self,
        collection: &str,
        selector: &Value,
        bookmark: Option<&str>,
    ) -> Result<FindPage> {
        let mut inner = self.inner.lock();
        inner.requests.push(StoreRequest::Find {
            collection: collection.to_string(),
            selector: selector.clone(),
            bookmark: bookmark.map(str::to_string),
        });
        let offset: usize = match bookmark {
            Some(b) => b
                .parse()
                .map_err(|_| RasError::store(format!("invalid bookmark '{}'", b)))?,
            None => 0,
        };
        let docs: Vec<Value> = inner
            .collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .map(|(id, doc)| doc.to_json(id))
                    .filter(|doc| selector_matches(doc, selector))
                    .skip(offset)
                    .take(self.page_size)
                    .collect()
            })
            .unwrap_or_default();
        Ok(FindPage {
            bookmark: Some((offset + docs.len()).to_string()),
            docs,
            warning: inner.find_warning.clone(),
        })
    }

    async fn view(&self, collection: &str, view_name: &str, grouped: bool) -> Result<Vec<ViewRow>> {
        let mut inner = self.inner.lock();
        inner.requests.push(StoreRequest::View {
            collection: collection.to_string(),
            name: view_name.to_string(),
        });
        let field = inner
            .views
            .get(&(collection.to_string(), view_name.to_string()))
            .cloned()
            .ok_or_else(|| {
                RasError::store(format!("view {}/{} does not exist", collection, view_name))
            })?;
        let keys: Vec<Value> = inner
            .collections
            .get(collection)
            .map(|docs| {
                docs.values()
                    .filter_map(|doc| doc.body.get(&field).cloned())
                    .collect()
            })
            .unwrap_or_default();

        if !grouped {
            return Ok(keys
                .into_iter()
                .map(|key| ViewRow {
                    key,
                    value: json!(1),
                })
                .collect());
        }
        let mut counts: BTreeMap<String, (Value, u64)> = BTreeMap::new();
        for key in keys {
            counts.entry(key.to_string()).or_insert((key, 0)).1 += 1;
        }
        Ok(counts
            .into_values()
            .map(|(key, count)| ViewRow {
                key,
                value: json!(count),
            })
            .collect())
    }

    async fn all_documents(&self, collection: &str) -> Result<Vec<Value>> {
        let mut inner = self.inner.lock();
        inner.requests.push(StoreRequest::AllDocuments {
            collection: collection.to_string(),
        });
        Ok(inner
            .collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|(id, _)| !id.starts_with("_design/"))
                    .map(|(id, doc)| doc.to_json(id))
                    .collect()
            })
            .unwrap_or_default())
    }
}
