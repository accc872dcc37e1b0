//! # Result Archive Store Core
//!
//! Runtime-agnostic pieces of the Result Archive Store: the documents it
//! persists, its error taxonomy, artifact paths and the synthetic tree they
//! form, server identity checks, and the [`store::DocumentStore`]
//! abstraction with an in-memory implementation.
//!
//! This crate contains no HTTP client, async runtime or filesystem cache;
//! those live in the `result-archive-store` crate.

pub mod error;
pub mod models;
pub mod path;
pub mod server;
pub mod store;
pub mod tree;

pub use error::{RasError, Result};
pub use path::ArtifactPath;
pub use store::DocumentStore;
