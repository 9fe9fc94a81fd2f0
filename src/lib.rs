//! # Story Memory
//!
//! Long-term memory for an agentic development workflow. Completed work is
//! captured as traceable narrative, cut into shards, embedded and stored in
//! one of three collections; agents starting new work get a ranked,
//! budget-bounded context block back.
//!
//! ## Architecture
//!
//! The pipeline has a few layers, leaf first:
//! - **Traceability** - `path:line` / `path:start-end` extraction and validation
//! - **Chunker** - splits narrative into bounded shards without cutting a reference
//! - **Router** - fixed mapping from hook kind to collection
//! - **Storage** - embeds and writes shards to LanceDB (or memory), scoped search
//! - **Retrieval** - ranks, deduplicates and renders context within a budget
//! - **Hooks** - the lifecycle operations composing the above
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use story_memory::{Config, FastEmbedder, LanceVectorStore, MemoryHooks, ShardStore, StoryCompletion};
//!
//! let config = Config::default();
//! let store = Arc::new(ShardStore::new(
//!     Arc::new(FastEmbedder::new(&config)?),
//!     Arc::new(LanceVectorStore::open(&config).await?),
//!     config.storage_timeout,
//! ));
//! store.ensure_collections().await?;
//!
//! let hooks = MemoryHooks::connect("dev", store, &config).await?;
//!
//! // Pull prior memory before starting
//! let context = hooks.before_story_start("2-23", "shard storage retry").await?;
//!
//! // Record what was built, with file:line evidence
//! let ids = hooks
//!     .after_story_complete(StoryCompletion::new(
//!         "2-23",
//!         "2",
//!         "storage",
//!         "Retrying writer in src/storage/mod.rs:150-180",
//!     ))
//!     .await?;
//! ```

pub mod chunker;
pub mod config;
pub mod embedding;
pub mod error;
pub mod hooks;
pub mod retrieval;
pub mod router;
pub mod shard;
pub mod storage;
pub mod trace;

pub use chunker::Chunker;
pub use config::{BackendKind, Config, EmbedderKind};
pub use embedding::{Embedder, FastEmbedder, HashEmbedder, TokenCounter};
pub use error::{Error, Result, StorageError, ValidationError};
pub use hooks::{MemoryHooks, StoryCompletion};
pub use retrieval::{ContextQuery, ContextRetriever, Search};
pub use router::{route, HookKind};
pub use shard::{
    Collection, Importance, MemoryKind, ScoredShard, Scope, Shard, ShardFilter, ShardId,
};
pub use storage::{InMemoryVectorStore, LanceVectorStore, ShardStore, StatusReport, VectorStore};
pub use trace::TraceRef;
