//! Adapters implementing the Kiln ports.
//!
//! In-memory variants back tests and single-process runs; the file-backed
//! variants give the CLI durable logs and a durable failure corpus.

pub mod corpus_store;
pub mod embedder;
pub mod event_bus;
pub mod executor;
pub mod log_store;

pub use corpus_store::{JsonFileCorpusStore, MemoryCorpusStore};
pub use embedder::HashingEmbedder;
pub use event_bus::{BroadcastEventBus, BusMetrics};
pub use executor::{ProcessExecutor, ProcessExecutorConfig};
pub use log_store::{FileLogStore, MemoryLogStore};
