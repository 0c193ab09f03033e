//! Durable work queues for the indexing pipeline.
//!
//! | Queue | Message | Consumer |
//! |-------|---------|----------|
//! | `Semantic` | [`SemanticMsg`] | [`SemanticProcessor`](crate::semantic::SemanticProcessor) |
//! | `Embedding` | [`EmbeddingMsg`] | [`EmbeddingConsumer`](crate::embed_worker::EmbeddingConsumer) |
//!
//! Delivery is FIFO within a queue; there is no ordering across
//! queues. A message that fails is counted and dropped.

pub mod manager;
pub mod messages;
pub mod named;

pub use manager::{format_status_table, QueueManager, EMBEDDING, SEMANTIC};
pub use messages::{EmbeddingMsg, SemanticMsg};
pub use named::{DequeueHandler, NamedQueue, QueueError, QueueStatus};
