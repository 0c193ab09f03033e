//! # Viking Store Core
//!
//! Runtime-agnostic logic for Viking Store: the context data model,
//! `viking://` URI mapping, collection schema, filter algebra, RRF
//! fusion, the vector-store abstraction with an in-memory backend,
//! embedding/summarizer traits, and hierarchical retrieval.
//!
//! This crate does no filesystem or network I/O and pulls in no async
//! runtime. The object store, locks, transactions, queues, and the
//! SQLite backend live in the `viking-store` crate.

pub mod embedding;
pub mod filter;
pub mod fusion;
pub mod intent;
pub mod llm;
pub mod models;
pub mod retrieve;
pub mod schema;
pub mod store;
pub mod uri;
