//! A fake CouchDB for integration tests.
//!
//! Serves the CouchDB HTTP endpoints the archive uses from an
//! [`InMemoryDocumentStore`], bound to an ephemeral localhost port.

#![allow(dead_code)]

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use result_archive_store::config::RasConfig;
use result_archive_store::ras_core::models::DocumentRef;
use result_archive_store::ras_core::store::memory::InMemoryDocumentStore;
use result_archive_store::ras_core::{DocumentStore, RasError};

#[derive(Clone)]
struct Fake {
    store: Arc<InMemoryDocumentStore>,
}

/// Start the fake server and return its base URL.
pub async fn spawn_fake_couchdb(store: Arc<InMemoryDocumentStore>) -> String {
    let app = Router::new()
        .route("/", get(root))
        .route("/{db}", post(create).head(head_db))
        .route("/{db}/_find", post(find))
        .route("/{db}/_all_docs", get(all_docs))
        .route("/{db}/_design/docs/_view/{view}", get(view))
        .route("/{db}/{id}", get(get_doc).put(update_doc))
        .route("/{db}/{id}/{name}", get(get_attachment).put(put_attachment))
        .with_state(Fake { store });
    serve(app).await
}

/// Serve an arbitrary router on an ephemeral port.
pub async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

/// Config pointing at `url` with deterministic, fast retry.
pub fn test_config(url: &str) -> RasConfig {
    let mut config = RasConfig::for_url(url);
    config.retry.min_delay_ms = 1;
    config.retry.max_delay_ms = 1;
    config
}

fn error_response(e: RasError) -> Response {
    let (status, error) = match &e {
        RasError::Conflict { .. } => (StatusCode::CONFLICT, "conflict"),
        RasError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        _ => (StatusCode::BAD_REQUEST, "bad_request"),
    };
    (
        status,
        Json(json!({ "error": error, "reason": e.to_string() })),
    )
        .into_response()
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "not_found", "reason": "missing" })),
    )
        .into_response()
}

fn written(result: Result<DocumentRef, RasError>) -> Response {
    match result {
        Ok(doc) => (
            StatusCode::CREATED,
            Json(json!({ "ok": true, "id": doc.id, "rev": doc.revision })),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

fn if_match(headers: &HeaderMap) -> String {
    headers
        .get(header::IF_MATCH)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

async fn root() -> Response {
    Json(json!({ "couchdb": "Welcome", "version": "3.3.3" })).into_response()
}

async fn head_db() -> StatusCode {
    StatusCode::OK
}

async fn create(
    State(fake): State<Fake>,
    Path(db): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    written(fake.store.create_document(&db, &body).await)
}

async fn update_doc(
    State(fake): State<Fake>,
    Path((db, id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let rev = if_match(&headers);
    written(fake.store.update_document(&db, &id, &rev, &body).await)
}

async fn get_doc(State(fake): State<Fake>, Path((db, id)): Path<(String, String)>) -> Response {
    match fake.store.get_document(&db, &id).await {
        Ok(Some(doc)) => Json(doc).into_response(),
        Ok(None) => not_found(),
        Err(e) => error_response(e),
    }
}

async fn put_attachment(
    State(fake): State<Fake>,
    Path((db, id, name)): Path<(String, String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let rev = if_match(&headers);
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    written(
        fake.store
            .put_attachment(&db, &id, &rev, &name, &content_type, body.to_vec())
            .await,
    )
}

async fn get_attachment(
    State(fake): State<Fake>,
    Path((db, id, name)): Path<(String, String, String)>,
) -> Response {
    let mut buf: Vec<u8> = Vec::new();
    match fake.store.get_attachment(&db, &id, &name, &mut buf).await {
        Ok(Some(_)) => buf.into_response(),
        Ok(None) => not_found(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct FindRequest {
    selector: Value,
    #[serde(default)]
    bookmark: Option<String>,
}

async fn find(
    State(fake): State<Fake>,
    Path(db): Path<String>,
    Json(req): Json<FindRequest>,
) -> Response {
    match fake
        .store
        .find(&db, &req.selector, req.bookmark.as_deref())
        .await
    {
        Ok(page) => {
            let mut body = json!({ "docs": page.docs, "bookmark": page.bookmark });
            if let Some(warning) = page.warning {
                body["warning"] = json!(warning);
            }
            Json(body).into_response()
        }
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct ViewParams {
    #[serde(default)]
    group: bool,
}

async fn view(
    State(fake): State<Fake>,
    Path((db, view)): Path<(String, String)>,
    Query(params): Query<ViewParams>,
) -> Response {
    match fake.store.view(&db, &view, params.group).await {
        Ok(rows) => {
            let rows: Vec<Value> = rows
                .into_iter()
                .map(|row| json!({ "key": row.key, "value": row.value }))
                .collect();
            Json(json!({ "rows": rows })).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn all_docs(State(fake): State<Fake>, Path(db): Path<String>) -> Response {
    match fake.store.all_documents(&db).await {
        Ok(docs) => {
            let rows: Vec<Value> = docs
                .into_iter()
                .map(|doc| {
                    let id = doc["_id"].clone();
                    let rev = doc["_rev"].clone();
                    json!({ "id": id, "key": id, "value": { "rev": rev }, "doc": doc })
                })
                .collect();
            Json(json!({ "total_rows": rows.len(), "offset": 0, "rows": rows })).into_response()
        }
        Err(e) => error_response(e),
    }
}
