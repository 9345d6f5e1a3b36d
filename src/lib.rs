//! Multimodal media search: CLIP embeddings, a pluggable vector index, and
//! access-scoped similarity queries over user media.
//!
//! Images and text are encoded into one shared embedding space, so an image can
//! be found by a text description or by another image. Every query runs inside
//! a scope (everything the caller may see, public media only, one owner's media,
//! or one collection) and the scope is enforced inside the index query itself,
//! never by filtering results afterwards.
//!
//! # Architecture
//!
//! - **Encoder**: CLIP vision and text towers on ONNX Runtime, loaded lazily once
//! - **Index**: [sqlite-vec](https://github.com/asg017/sqlite-vec) next to the
//!   document store, or an Elasticsearch `dense_vector` index
//! - **Search**: pre-filtered k-NN, hydration from the document store, threshold,
//!   then pagination
//! - **Indexing**: best-effort on upload; failures leave media in the processing
//!   state instead of failing the upload
//!
//! # Modules
//!
//! - [`config`]: configuration from TOML files and environment variables
//! - [`db`]: SQLite initialization, schema, migrations, and health checks
//! - [`embedding`]: image and text encoding into unit vectors
//! - [`index`]: vector index abstraction and its backends
//! - [`search`]: scope resolution and the search orchestrator
//! - [`ingest`]: the indexing pipeline driven by media lifecycle events
//! - [`service`]: the boundary API consumed by the application and the CLI
//! - [`store`]: media records, collections, and media bytes

pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod index;
pub mod ingest;
pub mod search;
pub mod service;
pub mod store;

pub use error::{MosaicError, Result};
