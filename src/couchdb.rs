//! CouchDB document store client.
//!
//! Implements [`DocumentStore`] over the CouchDB HTTP API with `reqwest`.
//! Every response status is translated into a typed result here; no
//! `reqwest` or `serde_json` error escapes this module unwrapped.
//!
//! # Endpoints
//!
//! | Operation | Request | Success |
//! |-----------|---------|---------|
//! | validate | `GET /` | 200 |
//! | create | `POST /{db}` | 201 |
//! | update | `PUT /{db}/{id}` with `If-Match: {rev}` | 201, 409 = conflict |
//! | get | `GET /{db}/{id}` | 200, 404 = absent |
//! | attach | `PUT /{db}/{id}/{name}` with `If-Match: {rev}` | 201, 409 = conflict |
//! | fetch attachment | `GET /{db}/{id}/{name}` | 200, 404 = absent |
//! | find | `POST /{db}/_find` | 200 |
//! | view | `GET /{db}/_design/docs/_view/{name}?group=true` | 200 |
//! | list all | `GET /{db}/_all_docs?include_docs=true` | 200 |
//!
//! # Authentication
//!
//! When a token is configured every request carries
//! `Authorization: Bearer <token>`.

use std::borrow::Cow;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde_json::{json, Value};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use ras_core::models::{DocumentRef, FindPage, ViewRow};
use ras_core::server::{ServerInfo, ServerRequirements};
use ras_core::store::{DocumentStore, DESIGN_DOC};
use ras_core::{RasError, Result};

use crate::config::{RasConfig, StoreConfig};

/// HTTP-backed [`DocumentStore`].
///
/// Cheap to clone; the underlying connection pool is shared.
#[derive(Clone)]
pub struct CouchDbStore {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl CouchDbStore {
    /// Build a client from configuration, reading the bearer token from the
    /// configured environment variable.
    pub fn new(config: &StoreConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self::with_client(client, &config.url, config.token()))
    }

    pub fn with_client(client: Client, base_url: &str, token: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `base/seg1/seg2...` with every segment percent-encoded.
    fn url(&self, segments: &[&str]) -> String {
        let mut url = self.base_url.clone();
        for segment in segments {
            url.push('/');
            url.push_str(&encode_segment(segment));
        }
        url
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, url)
            .header("Accept", "application/json");
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder, what: &str) -> Result<Response> {
        let resp = builder
            .send()
            .await
            .map_err(|e| RasError::store(format!("{} failed: {}", what, e)))?;
        debug!(status = %resp.status(), "{}", what);
        Ok(resp)
    }
}

/// Turn a non-success response into a [`RasError::Store`] carrying the
/// status and the start of the body.
async fn unexpected_status(resp: Response, what: &str) -> RasError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    RasError::store(format!(
        "{} failed (HTTP {}): {}",
        what,
        status,
        body.chars().take(500).collect::<String>()
    ))
}

async fn read_json(resp: Response, what: &str) -> Result<Value> {
    resp.json::<Value>()
        .await
        .map_err(|e| RasError::store(format!("{} returned invalid JSON: {}", what, e)))
}

/// Extract `{id, rev}` from a write response.
fn parse_write_response(body: &Value, what: &str) -> Result<DocumentRef> {
    let id = body.get("id").and_then(Value::as_str);
    let rev = body.get("rev").and_then(Value::as_str);
    match (id, rev) {
        (Some(id), Some(rev)) => Ok(DocumentRef::new(id, rev)),
        _ => Err(RasError::store(format!(
            "UnexpectedResponse: {} did not return an id and revision: {}",
            what, body
        ))),
    }
}

/// Expect a 201 write response; 409 is a conflict.
async fn write_result(
    resp: Response,
    collection: &str,
    id: &str,
    what: &str,
) -> Result<DocumentRef> {
    match resp.status() {
        StatusCode::CREATED => parse_write_response(&read_json(resp, what).await?, what),
        StatusCode::CONFLICT => Err(RasError::Conflict {
            collection: collection.to_string(),
            id: id.to_string(),
        }),
        _ => Err(unexpected_status(resp, what).await),
    }
}

#[async_trait]
impl DocumentStore for CouchDbStore {
    async fn validate_server(&self, requirements: &ServerRequirements) -> Result<ServerInfo> {
        let url = format!("{}/", self.base_url);
        let resp = self
            .request(Method::GET, &url)
            .send()
            .await
            .map_err(|e| RasError::Validation(format!("cannot reach {}: {}", url, e)))?;
        if resp.status() != StatusCode::OK {
            return Err(RasError::Validation(format!(
                "GET {} returned HTTP {}",
                url,
                resp.status()
            )));
        }
        let body: Value = resp
            .json()
            .await
            .map_err(|e| RasError::Validation(format!("invalid welcome document: {}", e)))?;
        requirements.validate(&body)
    }

    async fn create_document(&self, collection: &str, body: &Value) -> Result<DocumentRef> {
        let what = format!("create in {}", collection);
        let url = self.url(&[collection]);
        let resp = self
            .send(self.request(Method::POST, &url).json(body), &what)
            .await?;
        if resp.status() != StatusCode::CREATED {
            return Err(unexpected_status(resp, &what).await);
        }
        parse_write_response(&read_json(resp, &what).await?, &what)
    }

    async fn update_document(
        &self,
        collection: &str,
        id: &str,
        revision: &str,
        body: &Value,
    ) -> Result<DocumentRef> {
        let what = format!("update {}/{}", collection, id);
        let url = self.url(&[collection, id]);
        let builder = self
            .request(Method::PUT, &url)
            .header("If-Match", revision)
            .json(body);
        let resp = self.send(builder, &what).await?;
        write_result(resp, collection, id, &what).await
    }

    async fn get_document(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let what = format!("get {}/{}", collection, id);
        let url = self.url(&[collection, id]);
        let resp = self.send(self.request(Method::GET, &url), &what).await?;
        match resp.status() {
            StatusCode::OK => Ok(Some(read_json(resp, &what).await?)),
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(unexpected_status(resp, &what).await),
        }
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
        let what = format!("attach {} to {}/{}", name, collection, id);
        let url = self.url(&[collection, id, name]);
        let builder = self
            .request(Method::PUT, &url)
            .header("If-Match", revision)
            .header("Content-Type", content_type)
            .body(data);
        let resp = self.send(builder, &what).await?;
        write_result(resp, collection, id, &what).await
    }

    async fn get_attachment(
        &self,
        collection: &str,
        id: &str,
        name: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<Option<u64>> {
        let what = format!("fetch {} from {}/{}", name, collection, id);
        let url = self.url(&[collection, id, name]);
        let mut resp = self.send(self.request(Method::GET, &url), &what).await?;
        match resp.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Ok(None),
            _ => return Err(unexpected_status(resp, &what).await),
        }
        let mut written = 0u64;
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| RasError::store(format!("{} interrupted: {}", what, e)))?
        {
            sink.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        sink.flush().await?;
        Ok(Some(written))
    }

    async fn find(
        &self,
        collection: &str,
        selector: &Value,
        bookmark: Option<&str>,
    ) -> Result<FindPage> {
        let what = format!("find in {}", collection);
        let url = format!("{}/_find", self.url(&[collection]));
        let mut query = json!({
            "selector": selector,
            "execution_stats": true,
        });
        if let Some(bookmark) = bookmark {
            query["bookmark"] = json!(bookmark);
        }
        let resp = self
            .send(self.request(Method::POST, &url).json(&query), &what)
            .await?;
        if resp.status() != StatusCode::OK {
            return Err(unexpected_status(resp, &what).await);
        }
        let body = read_json(resp, &what).await?;
        if body.get("docs").map(Value::is_array) != Some(true) {
            return Err(RasError::store(format!("{} response has no docs array", what)));
        }
        let page: FindPage = serde_json::from_value(body)
            .map_err(|e| RasError::store(format!("{} response is malformed: {}", what, e)))?;
        if let Some(warning) = &page.warning {
            warn!("{} returned a warning: {}", what, warning);
        }
        Ok(page)
    }

    async fn view(&self, collection: &str, view_name: &str, grouped: bool) -> Result<Vec<ViewRow>> {
        let what = format!("view {}/{}", collection, view_name);
        let url = format!(
            "{}?group={}",
            self.url(&[collection, "_design", DESIGN_DOC, "_view", view_name]),
            grouped
        );
        let resp = self.send(self.request(Method::GET, &url), &what).await?;
        if resp.status() != StatusCode::OK {
            return Err(unexpected_status(resp, &what).await);
        }
        let body = read_json(resp, &what).await?;
        let rows = body
            .get("rows")
            .cloned()
            .ok_or_else(|| RasError::store(format!("{} response has no rows", what)))?;
        serde_json::from_value(rows)
            .map_err(|e| RasError::store(format!("{} rows are malformed: {}", what, e)))
    }

    async fn all_documents(&self, collection: &str) -> Result<Vec<Value>> {
        let what = format!("list {}", collection);
        let url = format!("{}/_all_docs?include_docs=true", self.url(&[collection]));
        let resp = self.send(self.request(Method::GET, &url), &what).await?;
        if resp.status() != StatusCode::OK {
            return Err(unexpected_status(resp, &what).await);
        }
        let body = read_json(resp, &what).await?;
        let rows = body
            .get("rows")
            .and_then(Value::as_array)
            .ok_or_else(|| RasError::store(format!("{} response has no rows", what)))?;
        Ok(rows
            .iter()
            .filter(|row| {
                !row.get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .starts_with("_design/")
            })
            .filter_map(|row| row.get("doc").cloned())
            .collect())
    }
}

const HEX_UPPER: &[u8; 16] = b"0123456789ABCDEF";

fn is_unreserved(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~')
}

/// Percent-encode one segment of a CouchDB URL path.
///
/// Document ids and collection names are normally unreserved and pass
/// through untouched. Attachment keys carry slashes, which are encoded so
/// `/logs/run.log` stays a single segment.
fn encode_segment(segment: &str) -> Cow<'_, str> {
    if segment.bytes().all(is_unreserved) {
        return Cow::Borrowed(segment);
    }
    let mut encoded = String::with_capacity(segment.len() * 3);
    for byte in segment.bytes() {
        if is_unreserved(byte) {
            encoded.push(char::from(byte));
        } else {
            encoded.push('%');
            encoded.push(char::from(HEX_UPPER[usize::from(byte >> 4)]));
            encoded.push(char::from(HEX_UPPER[usize::from(byte & 0x0f)]));
        }
    }
    Cow::Owned(encoded)
}

/// `ras check`: validate the configured server and report its collections.
pub async fn run_check(config: &RasConfig) -> anyhow::Result<()> {
    let store = CouchDbStore::new(&config.store)?;
    let requirements = config.store.requirements()?;
    let info = store
        .validate_server(&requirements)
        .await
        .with_context(|| format!("Server check failed for {}", store.base_url()))?;

    println!("{:<12} {}", "SERVER", store.base_url());
    println!("{:<12} {}", "PRODUCT", info.product);
    println!("{:<12} {} (minimum {})", "VERSION", info.version, requirements.min_version);

    let collections = config.store.collections();
    println!();
    println!("{:<24} STATUS", "COLLECTION");
    for name in [
        collections.run.as_str(),
        collections.log.as_str(),
        collections.artifacts.as_str(),
    ] {
        let url = store.url(&[name]);
        let status = match store.send(store.request(Method::HEAD, &url), name).await {
            Ok(resp) if resp.status().is_success() => "OK".to_string(),
            Ok(resp) if resp.status() == StatusCode::NOT_FOUND => "MISSING".to_string(),
            Ok(resp) => format!("HTTP {}", resp.status().as_u16()),
            Err(e) => format!("ERROR ({})", e),
        };
        println!("{:<24} {}", name, status);
    }
    Ok(())
}
