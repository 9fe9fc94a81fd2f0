//! Storage for shards: the vector-store seam and the adapter that embeds
//! drafts and writes them.

mod memory;
pub mod vector;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::embedding::Embedder;
use crate::error::{Result, StorageError, StorageResult};
use crate::shard::{
    rank, Collection, ScoredShard, Scope, Shard, ShardDraft, ShardFilter, ShardId,
};

pub use memory::InMemoryVectorStore;
pub use vector::LanceVectorStore;

/// Vector database collaborator. Implementations handle their own
/// concurrent-write safety.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Succeeds when the store is reachable
    async fn health(&self) -> StorageResult<()>;

    /// Names of every collection present
    async fn collections(&self) -> StorageResult<Vec<String>>;

    /// Create an empty collection for vectors of `dimensions`
    async fn create_collection(&self, collection: Collection, dimensions: usize)
        -> StorageResult<()>;

    /// Write a shard; visible to `search` once this returns
    async fn upsert(&self, shard: &Shard) -> StorageResult<()>;

    /// Up to `top_k` shards in `scope` passing `filter`, best first, newer
    /// first on ties
    async fn search(
        &self,
        collection: Collection,
        vector: &[f32],
        scope: &Scope,
        filter: &ShardFilter,
        top_k: usize,
    ) -> StorageResult<Vec<ScoredShard>>;

    /// Number of shards in a collection
    async fn count(&self, collection: Collection) -> StorageResult<usize>;
}

/// Reachability and collection presence, for operational tooling
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub collections: Vec<CollectionStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionStatus {
    pub name: &'static str,
    pub present: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shards: Option<usize>,
}

impl StatusReport {
    /// Healthy and every collection present
    pub fn is_ready(&self) -> bool {
        self.healthy && self.collections.iter().all(|c| c.present)
    }
}

/// Embeds drafts and writes them; embeds queries and searches
pub struct ShardStore {
    embedder: Arc<dyn Embedder>,
    vectors: Arc<dyn VectorStore>,
    timeout: Duration,
}

impl ShardStore {
    pub fn new(embedder: Arc<dyn Embedder>, vectors: Arc<dyn VectorStore>, timeout: Duration) -> Self {
        Self {
            embedder,
            vectors,
            timeout,
        }
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = StorageResult<T>>,
    ) -> StorageResult<T> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| StorageError::Timeout {
                operation,
                limit: self.timeout,
            })?
    }

    /// Create whichever of the three collections is missing
    pub async fn ensure_collections(&self) -> Result<()> {
        let present = self.bounded("list collections", self.vectors.collections()).await?;
        for collection in Collection::ALL {
            if !present.iter().any(|name| name == collection.name()) {
                info!("Creating collection {}", collection);
                self.bounded(
                    "create collection",
                    self.vectors
                        .create_collection(collection, self.embedder.dimensions()),
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Fail fast unless the store is healthy and holds all three collections
    pub async fn verify_collections(&self) -> Result<()> {
        self.bounded("health check", self.vectors.health())
            .await
            .map_err(|e| match e {
                StorageError::Timeout { .. } | StorageError::Unhealthy(_) => e,
                other => StorageError::Unhealthy(other.to_string()),
            })?;

        let present = self.bounded("list collections", self.vectors.collections()).await?;
        for collection in Collection::ALL {
            if !present.iter().any(|name| name == collection.name()) {
                return Err(StorageError::MissingCollection(collection.name().to_string()).into());
            }
        }
        Ok(())
    }

    /// Embed a draft, assign its id and write it to its collection
    pub async fn store(&self, draft: ShardDraft) -> Result<ShardId> {
        let vector = self.bounded("embedding", self.embedder.embed(&draft.text)).await?;
        let shard = Shard::from_draft(draft, vector);
        self.bounded("upsert", self.vectors.upsert(&shard)).await?;

        info!(
            id = %shard.id,
            collection = %shard.collection,
            unique_id = %shard.metadata.unique_id,
            "Stored shard"
        );
        Ok(shard.id)
    }

    /// Write drafts in order. On failure the shards already written stay and
    /// their ids are reported in `StorageError::PartialWrite`.
    pub async fn store_all(&self, drafts: Vec<ShardDraft>) -> Result<Vec<ShardId>> {
        let total = drafts.len();
        let mut written = Vec::with_capacity(total);

        for draft in drafts {
            match self.store(draft).await {
                Ok(id) => written.push(id),
                Err(crate::Error::Storage(source)) if !written.is_empty() => {
                    warn!(
                        written = written.len(),
                        total, "Shard write failed part way, keeping written shards"
                    );
                    return Err(StorageError::PartialWrite {
                        written,
                        total,
                        source: Box::new(source),
                    }
                    .into());
                }
                Err(e) => return Err(e),
            }
        }

        Ok(written)
    }

    /// Embed `query` and search one collection within `scope`
    pub async fn search(
        &self,
        collection: Collection,
        query: &str,
        scope: &Scope,
        top_k: usize,
    ) -> Result<Vec<ScoredShard>> {
        self.search_filtered(collection, query, scope, &ShardFilter::default(), top_k)
            .await
    }

    /// Like [`ShardStore::search`], keeping only shards that pass `filter`
    pub async fn search_filtered(
        &self,
        collection: Collection,
        query: &str,
        scope: &Scope,
        filter: &ShardFilter,
        top_k: usize,
    ) -> Result<Vec<ScoredShard>> {
        let vector = self.bounded("embedding", self.embedder.embed(query)).await?;
        let mut results = self
            .bounded(
                "search",
                self.vectors.search(collection, &vector, scope, filter, top_k),
            )
            .await?;
        rank(&mut results);
        results.truncate(top_k);

        debug!(
            collection = %collection,
            filtered = !filter.is_empty(),
            results = results.len(),
            "Searched shards"
        );
        Ok(results)
    }

    /// Reachability plus presence and size of each collection. Never fails.
    pub async fn status(&self) -> StatusReport {
        let health = self.bounded("health check", self.vectors.health()).await;
        let present = match &health {
            Ok(()) => self
                .bounded("list collections", self.vectors.collections())
                .await
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        };

        let mut collections = Vec::with_capacity(Collection::ALL.len());
        for collection in Collection::ALL {
            let is_present = present.iter().any(|name| name == collection.name());
            let shards = if is_present {
                self.bounded("count", self.vectors.count(collection)).await.ok()
            } else {
                None
            };
            collections.push(CollectionStatus {
                name: collection.name(),
                present: is_present,
                shards,
            });
        }

        StatusReport {
            healthy: health.is_ok(),
            error: health.err().map(|e| e.to_string()),
            collections,
        }
    }
}
