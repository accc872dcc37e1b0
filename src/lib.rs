//! # Result Archive Store
//!
//! Persists the record of automated test runs into a CouchDB-family
//! document store and reads it back.
//!
//! Each run owns three kinds of documents: one run (structure) document,
//! an append-only series of console log shards, and an artifact-index
//! document whose attachments are the run's stored files. Writers use
//! optimistic concurrency: every update presents the last revision seen
//! and a stale one is rejected by the server.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌────────────────┐   ┌──────────────┐
//! │ Test engine  │──▶│ RunRecordStore │──▶│   CouchDB    │
//! │ (one run)    │   │ batcher+retry  │   │ run/log/art. │
//! └──────────────┘   └────────────────┘   └──────┬───────┘
//!                                                │
//!                     ┌──────────────────────────┤
//!                     ▼                          ▼
//!               ┌────────────┐           ┌──────────────┐
//!               │QueryService│           │ Artifact VFS │
//!               │ (ras runs) │           │ (ras ls/cat) │
//!               └────────────┘           └──────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`couchdb`] | HTTP document store client |
//! | [`retry`] | Conflict-aware retry with jittered backoff |
//! | [`log_batcher`] | Console log batching into ordered shards |
//! | [`run_store`] | Per-run writer of run, shard and artifact documents |
//! | [`artifacts`] | Virtual filesystem over stored artifacts |
//! | [`query`] | Read-only run discovery |
//!
//! Storage-independent types (documents, errors, paths, the
//! [`DocumentStore`](ras_core::DocumentStore) trait) live in `ras_core`.

pub mod artifacts;
pub mod config;
pub mod couchdb;
pub mod log_batcher;
pub mod logging;
pub mod query;
pub mod retry;
pub mod run_store;

pub use ras_core;
