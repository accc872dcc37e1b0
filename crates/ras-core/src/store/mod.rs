//! Storage abstraction for the Result Archive Store.
//!
//! The [`DocumentStore`] trait is the whole surface the archive needs from a
//! CouchDB-family document store: revisioned create/update, plain reads,
//! attachments, bookmark-paged `_find` queries and grouped views. The HTTP
//! implementation lives in the main crate; [`memory::InMemoryDocumentStore`]
//! implements the same semantics for tests.
//!
//! Implementations must be `Send + Sync`; one handle is shared by every run
//! and reader in the process.

pub mod memory;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWrite;

use crate::error::Result;
use crate::models::{DocumentRef, FindPage, ViewRow};
use crate::server::{ServerInfo, ServerRequirements};

/// Design document that holds the aggregate views.
pub const DESIGN_DOC: &str = "docs";
/// Grouped view keyed by run requestor.
pub const REQUESTORS_VIEW: &str = "requestors-view";
/// Grouped view keyed by test name.
pub const TEST_NAMES_VIEW: &str = "testnames-view";

/// Abstract document store.
///
/// # Operations
///
/// | Method | HTTP shape |
/// |--------|------------|
/// | [`validate_server`](DocumentStore::validate_server) | `GET /` |
/// | [`create_document`](DocumentStore::create_document) | `POST /{db}` → 201 |
/// | [`update_document`](DocumentStore::update_document) | `PUT /{db}/{id}` + `If-Match` → 201 / 409 |
/// | [`get_document`](DocumentStore::get_document) | `GET /{db}/{id}` → 200 / 404 |
/// | [`put_attachment`](DocumentStore::put_attachment) | `PUT /{db}/{id}/{name}` + `If-Match` |
/// | [`get_attachment`](DocumentStore::get_attachment) | `GET /{db}/{id}/{name}` |
/// | [`find`](DocumentStore::find) | `POST /{db}/_find` |
/// | [`view`](DocumentStore::view) | `GET /{db}/_design/docs/_view/{name}` |
/// | [`all_documents`](DocumentStore::all_documents) | `GET /{db}/_all_docs?include_docs=true` |
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Check the server's identity and version.
    async fn validate_server(&self, requirements: &ServerRequirements) -> Result<ServerInfo>;

    /// Create a document with a store-assigned id.
    async fn create_document(&self, collection: &str, body: &Value) -> Result<DocumentRef>;

    /// Replace a document, presenting the last revision seen.
    ///
    /// A stale `revision` yields [`RasError::Conflict`](crate::RasError::Conflict).
    async fn update_document(
        &self,
        collection: &str,
        id: &str,
        revision: &str,
        body: &Value,
    ) -> Result<DocumentRef>;

    /// Fetch a document including `_id`, `_rev` and `_attachments` stubs.
    /// Absence is `Ok(None)`.
    async fn get_document(&self, collection: &str, id: &str) -> Result<Option<Value>>;

    /// Current revision of a document, if it exists.
    async fn get_revision(&self, collection: &str, id: &str) -> Result<Option<String>> {
        Ok(self.get_document(collection, id).await?.and_then(|doc| {
            doc.get("_rev")
                .and_then(Value::as_str)
                .map(str::to_string)
        }))
    }

    /// Add or replace a named attachment, as a revisioned update.
    async fn put_attachment(
        &self,
        collection: &str,
        id: &str,
        revision: &str,
        name: &str,
        content_type: &str,
        data: Vec<u8>,
    ) -> Result<DocumentRef>;

    /// Stream an attachment's bytes into `sink`.
    ///
    /// Returns the number of bytes written, or `None` if the document or
    /// attachment does not exist.
    async fn get_attachment(
        &self,
        collection: &str,
        id: &str,
        name: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<Option<u64>>;

    /// Run one page of a `_find` query.
    async fn find(
        &self,
        collection: &str,
        selector: &Value,
        bookmark: Option<&str>,
    ) -> Result<FindPage>;

    /// Read a view from the [`DESIGN_DOC`] design document.
    async fn view(&self, collection: &str, view_name: &str, grouped: bool) -> Result<Vec<ViewRow>>;

    /// Every non-design document in a collection.
    async fn all_documents(&self, collection: &str) -> Result<Vec<Value>>;
}
