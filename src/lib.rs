//! # Viking Store
//!
//! A context store for AI agents. Memories, resources, and skills live
//! in one `viking://` hierarchy on an object store; every directory
//! carries a one-sentence abstract (L0) and an overview (L1) generated
//! bottom-up, and a vector index over all of it drives hierarchical
//! retrieval.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────┐   ┌─────────────┐
//! │   CLI    │──▶│  VikingFs  │──▶│ ObjectStore │
//! │   (vk)   │   │ + PathLock │   │ Local/Memory│
//! └──────────┘   └─────┬──────┘   └─────────────┘
//!                      │ reindex
//!                      ▼
//!              ┌──────────────┐   ┌────────────────┐   ┌─────────────┐
//!              │ Semantic  Q  │──▶│  Embedding  Q  │──▶│ VectorStore │
//!              │ (L0/L1 gen)  │   │ (embed+upsert) │   │ SQLite/Mem  │
//!              └──────────────┘   └────────────────┘   └─────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Typed errors and their taxonomy |
//! | [`objstore`] | Object-store trait with local-disk and in-memory backends |
//! | [`lock`] | Path locks held by lock-marker files |
//! | [`transaction`] | Transaction lifecycle, rollback, and timeout sweep |
//! | [`vfs`] | The `viking://` filesystem facade |
//! | [`queue`] | Durable named queues and their dispatcher |
//! | [`semantic`] | Bottom-up abstract/overview generation |
//! | [`embed_worker`] | Embedding-queue consumer |
//! | [`embedding`] | Embedding provider clients |
//! | [`llm`] | Summarizer clients |
//! | [`http`] | Shared JSON-over-HTTP client with retries |
//! | [`sqlite_store`] | SQLite vector backend |
//! | [`backend`] | Vector backend selection |
//! | [`db`] | SQLite connection pool |
//! | [`migrate`] | Vector database schema |
//! | [`services`] | Component wiring |
//! | [`commands`] | `vk` subcommand implementations |

pub mod backend;
pub mod commands;
pub mod config;
pub mod db;
pub mod embed_worker;
pub mod embedding;
pub mod error;
pub mod http;
pub mod llm;
pub mod lock;
pub mod migrate;
pub mod objstore;
pub mod queue;
pub mod semantic;
pub mod services;
pub mod sqlite_store;
pub mod transaction;
pub mod vfs;
