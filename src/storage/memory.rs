//! Process-local vector store using cosine similarity

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{StorageError, StorageResult};
use crate::shard::{rank, Collection, ScoredShard, Scope, Shard, ShardFilter};

use super::VectorStore;

/// Vector store held in memory. Contents are lost when it is dropped.
#[derive(Default)]
pub struct InMemoryVectorStore {
    collections: RwLock<HashMap<String, Vec<Shard>>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 {
        return Some(0.0);
    }
    Some((dot / denom) as f32)
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn health(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn collections(&self) -> StorageResult<Vec<String>> {
        let mut names: Vec<String> = self.collections.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn create_collection(&self, collection: Collection, _dimensions: usize) -> StorageResult<()> {
        self.collections
            .write()
            .await
            .entry(collection.name().to_string())
            .or_default();
        Ok(())
    }

    async fn upsert(&self, shard: &Shard) -> StorageResult<()> {
        let mut collections = self.collections.write().await;
        let rows = collections
            .get_mut(shard.collection.name())
            .ok_or_else(|| StorageError::MissingCollection(shard.collection.name().to_string()))?;

        match rows.iter_mut().find(|s| s.id == shard.id) {
            Some(existing) => *existing = shard.clone(),
            None => rows.push(shard.clone()),
        }
        Ok(())
    }

    async fn search(
        &self,
        collection: Collection,
        vector: &[f32],
        scope: &Scope,
        filter: &ShardFilter,
        top_k: usize,
    ) -> StorageResult<Vec<ScoredShard>> {
        let collections = self.collections.read().await;
        let rows = collections
            .get(collection.name())
            .ok_or_else(|| StorageError::MissingCollection(collection.name().to_string()))?;

        let mut hits: Vec<ScoredShard> = rows
            .iter()
            .filter(|shard| scope.matches(&shard.metadata) && filter.matches(&shard.metadata))
            .filter_map(|shard| {
                let score = cosine_similarity(vector, &shard.vector)?;
                Some(ScoredShard {
                    shard: shard.clone(),
                    score,
                })
            })
            .collect();

        rank(&mut hits);
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn count(&self, collection: Collection) -> StorageResult<usize> {
        self.collections
            .read()
            .await
            .get(collection.name())
            .map(Vec::len)
            .ok_or_else(|| StorageError::MissingCollection(collection.name().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::{Importance, MemoryKind, ShardDraft, ShardMetadata};
    use chrono::{Duration, TimeZone, Utc};

    fn shard(agent: &str, vector: Vec<f32>, minutes: i64) -> Shard {
        let created = Utc.with_ymd_and_hms(2026, 1, 4, 8, 0, 0).unwrap() + Duration::minutes(minutes);
        Shard::from_draft(
            ShardDraft {
                collection: Collection::AgentMemory,
                text: format!("{agent} at {minutes}"),
                metadata: ShardMetadata::new(
                    agent,
                    "proj",
                    MemoryKind::ChatDecision,
                    Importance::Low,
                    "chat",
                    created,
                ),
            },
            vector,
        )
    }

    #[test]
    fn cosine_handles_degenerate_vectors() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0]), None);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), Some(0.0));
        let s = cosine_similarity(&[1.0, 1.0], &[2.0, 2.0]).unwrap();
        assert!((s - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn upsert_requires_the_collection() {
        let store = InMemoryVectorStore::new();
        let err = store.upsert(&shard("dev", vec![1.0], 0)).await.unwrap_err();
        assert!(matches!(err, StorageError::MissingCollection(_)));
    }

    #[tokio::test]
    async fn search_filters_scope_and_orders_ties_by_recency() {
        let store = InMemoryVectorStore::new();
        store.create_collection(Collection::AgentMemory, 2).await.unwrap();

        store.upsert(&shard("dev", vec![1.0, 0.0], 0)).await.unwrap();
        store.upsert(&shard("dev", vec![1.0, 0.0], 10)).await.unwrap();
        store.upsert(&shard("dev", vec![0.0, 1.0], 20)).await.unwrap();
        store.upsert(&shard("pm", vec![1.0, 0.0], 30)).await.unwrap();

        let hits = store
            .search(
                Collection::AgentMemory,
                &[1.0, 0.0],
                &Scope::agent_group("dev", "proj"),
                &ShardFilter::default(),
                10,
            )
            .await
            .unwrap();

        let texts: Vec<_> = hits.iter().map(|h| h.shard.text.as_str()).collect();
        assert_eq!(texts, vec!["dev at 10", "dev at 0", "dev at 20"]);

        let top = store
            .search(
                Collection::AgentMemory,
                &[1.0, 0.0],
                &Scope::agent_group("dev", "proj"),
                &ShardFilter::default(),
                1,
            )
            .await
            .unwrap();
        assert_eq!(top.len(), 1);
    }

    #[tokio::test]
    async fn search_applies_metadata_filter() {
        let store = InMemoryVectorStore::new();
        store.create_collection(Collection::AgentMemory, 2).await.unwrap();

        let mut flagged = shard("dev", vec![0.0, 1.0], 0);
        flagged.metadata.importance = Importance::Critical;
        store.upsert(&flagged).await.unwrap();
        store.upsert(&shard("dev", vec![1.0, 0.0], 5)).await.unwrap();

        let hits = store
            .search(
                Collection::AgentMemory,
                &[1.0, 0.0],
                &Scope::agent_group("dev", "proj"),
                &ShardFilter::default().with_importance([Importance::Critical]),
                10,
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].shard.id, flagged.id);

        let none = store
            .search(
                Collection::AgentMemory,
                &[1.0, 0.0],
                &Scope::agent_group("dev", "proj"),
                &ShardFilter::kinds([MemoryKind::ErrorPattern]),
                10,
            )
            .await
            .unwrap();
        assert!(none.is_empty());
    }
}
