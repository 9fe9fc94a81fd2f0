//! Vector storage using LanceDB, one table per collection

use std::sync::Arc;

use arrow_array::{
    Array, FixedSizeListArray, Float32Array, RecordBatch, RecordBatchIterator, StringArray,
};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use futures::TryStreamExt;
use lance_arrow::FixedSizeListArrayExt;
use lancedb::connect;
use lancedb::query::{ExecutableQuery, QueryBase};
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{StorageError, StorageResult};
use crate::shard::{rank, Collection, ScoredShard, Scope, Shard, ShardFilter, ShardMetadata};

use super::VectorStore;

/// Vector storage backend using LanceDB
pub struct LanceVectorStore {
    db: lancedb::Connection,
}

fn db_err(e: impl std::fmt::Display) -> StorageError {
    StorageError::vector_db(e.to_string())
}

/// Quote a value for a LanceDB filter expression
fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn scope_filter(scope: &Scope) -> String {
    match scope {
        Scope::AgentGroup { agent, group_id } => format!(
            "agent = {} AND group_id = {}",
            sql_literal(agent),
            sql_literal(group_id)
        ),
        Scope::Session(session_id) => format!("session_id = {}", sql_literal(session_id)),
        Scope::Group(group_id) => format!("group_id = {}", sql_literal(group_id)),
    }
}

fn sql_list<'a>(values: impl Iterator<Item = &'a str>) -> String {
    values.map(sql_literal).collect::<Vec<_>>().join(", ")
}

/// Scope and metadata filter as one LanceDB predicate
fn search_filter(scope: &Scope, filter: &ShardFilter) -> String {
    let mut filters = vec![scope_filter(scope)];
    if !filter.kinds.is_empty() {
        filters.push(format!(
            "kind IN ({})",
            sql_list(filter.kinds.iter().map(|k| k.as_str()))
        ));
    }
    if !filter.importance.is_empty() {
        filters.push(format!(
            "importance IN ({})",
            sql_list(filter.importance.iter().map(|i| i.as_str()))
        ));
    }
    if let Some(story_id) = &filter.story_id {
        filters.push(format!("story_id = {}", sql_literal(story_id)));
    }
    if let Some(component) = &filter.component {
        filters.push(format!("component = {}", sql_literal(component)));
    }
    filters.join(" AND ")
}

/// Schema shared by the three collection tables
fn schema(dimensions: usize) -> Schema {
    Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new("text", DataType::Utf8, false),
        Field::new("agent", DataType::Utf8, false),
        Field::new("group_id", DataType::Utf8, false),
        Field::new("session_id", DataType::Utf8, true),
        Field::new("kind", DataType::Utf8, false),
        Field::new("importance", DataType::Utf8, false),
        Field::new("story_id", DataType::Utf8, true),
        Field::new("component", DataType::Utf8, true),
        Field::new("created_at", DataType::Utf8, false),
        Field::new("metadata", DataType::Utf8, false),
        Field::new(
            "vector",
            DataType::FixedSizeList(
                Arc::new(Field::new("item", DataType::Float32, true)),
                dimensions as i32,
            ),
            false,
        ),
    ])
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> StorageResult<&'a StringArray> {
    batch
        .column_by_name(name)
        .ok_or_else(|| db_err(format!("Missing {} column", name)))?
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| db_err(format!("{} column is not StringArray", name)))
}

impl LanceVectorStore {
    /// Connect to the LanceDB directory under the configured data dir
    pub async fn open(config: &Config) -> StorageResult<Self> {
        config.ensure_dirs().map_err(db_err)?;
        let path = config.vector_db_path();
        let uri = path
            .to_str()
            .ok_or_else(|| db_err(format!("vector path {:?} is not valid UTF-8", path)))?;

        let db = connect(uri).execute().await.map_err(db_err)?;
        info!("Opened LanceDB at {}", uri);

        Ok(Self { db })
    }

    async fn open_table(&self, collection: Collection) -> StorageResult<lancedb::Table> {
        self.db
            .open_table(collection.name())
            .execute()
            .await
            .map_err(|e| match e {
                lancedb::Error::TableNotFound { .. } => {
                    StorageError::MissingCollection(collection.name().to_string())
                }
                other => db_err(other),
            })
    }
}

#[async_trait]
impl VectorStore for LanceVectorStore {
    async fn health(&self) -> StorageResult<()> {
        self.db
            .table_names()
            .execute()
            .await
            .map(|_| ())
            .map_err(|e| StorageError::Unhealthy(e.to_string()))
    }

    async fn collections(&self) -> StorageResult<Vec<String>> {
        self.db.table_names().execute().await.map_err(db_err)
    }

    async fn create_collection(&self, collection: Collection, dimensions: usize) -> StorageResult<()> {
        let schema = Arc::new(schema(dimensions));

        // Create an empty table with the schema
        let empty_batch = RecordBatch::new_empty(schema.clone());
        let reader = RecordBatchIterator::new(vec![empty_batch].into_iter().map(Ok), schema);

        self.db
            .create_table(collection.name(), Box::new(reader))
            .execute()
            .await
            .map_err(db_err)?;

        Ok(())
    }

    async fn upsert(&self, shard: &Shard) -> StorageResult<()> {
        let dimensions = shard.vector.len();
        if dimensions == 0 {
            return Err(db_err("Shard has no embedding"));
        }

        let metadata = serde_json::to_string(&shard.metadata).map_err(db_err)?;

        let values = Float32Array::from(shard.vector.clone());
        let vector_array = FixedSizeListArray::try_new_from_values(values, dimensions as i32)
            .map_err(|e: arrow_schema::ArrowError| db_err(e))?;

        let schema = Arc::new(schema(dimensions));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(StringArray::from(vec![shard.id.to_string()])) as Arc<dyn Array>,
                Arc::new(StringArray::from(vec![shard.text.clone()])),
                Arc::new(StringArray::from(vec![shard.metadata.agent.clone()])),
                Arc::new(StringArray::from(vec![shard.metadata.group_id.clone()])),
                Arc::new(StringArray::from(vec![shard.metadata.session_id.clone()])),
                Arc::new(StringArray::from(vec![shard.metadata.kind.as_str()])),
                Arc::new(StringArray::from(vec![shard.metadata.importance.as_str()])),
                Arc::new(StringArray::from(vec![shard.metadata.story_id.clone()])),
                Arc::new(StringArray::from(vec![shard.metadata.component.clone()])),
                Arc::new(StringArray::from(vec![shard.metadata.created_at.to_rfc3339()])),
                Arc::new(StringArray::from(vec![metadata])),
                Arc::new(vector_array),
            ],
        )
        .map_err(db_err)?;

        let reader = RecordBatchIterator::new(vec![batch].into_iter().map(Ok), schema);

        self.open_table(shard.collection)
            .await?
            .add(Box::new(reader))
            .execute()
            .await
            .map_err(db_err)?;

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
        let table = self.open_table(collection).await?;

        // Vector search on an empty table has no index to probe.
        if table.count_rows(None).await.map_err(db_err)? == 0 {
            return Ok(Vec::new());
        }

        let stream = table
            .vector_search(vector.to_vec())
            .map_err(db_err)?
            .only_if(search_filter(scope, filter))
            .limit(top_k)
            .execute()
            .await
            .map_err(db_err)?;

        let batches: Vec<RecordBatch> = stream
            .try_collect::<Vec<RecordBatch>>()
            .await
            .map_err(|e: lancedb::Error| db_err(e))?;

        let mut results = Vec::new();
        for batch in batches {
            let ids = string_column(&batch, "id")?;
            let texts = string_column(&batch, "text")?;
            let metadata = string_column(&batch, "metadata")?;
            let distances = batch
                .column_by_name("_distance")
                .ok_or_else(|| db_err("Missing _distance column"))?
                .as_any()
                .downcast_ref::<Float32Array>()
                .ok_or_else(|| db_err("_distance column is not Float32Array"))?;

            for i in 0..batch.num_rows() {
                let metadata: ShardMetadata =
                    serde_json::from_str(metadata.value(i)).map_err(db_err)?;
                // LanceDB returns L2 distance, convert to similarity score
                let score = 1.0 / (1.0 + distances.value(i));

                results.push(ScoredShard {
                    shard: Shard {
                        id: Uuid::parse_str(ids.value(i)).map_err(db_err)?,
                        collection,
                        text: texts.value(i).to_string(),
                        metadata,
                        vector: Vec::new(),
                    },
                    score,
                });
            }
        }

        rank(&mut results);
        Ok(results)
    }

    async fn count(&self, collection: Collection) -> StorageResult<usize> {
        self.open_table(collection)
            .await?
            .count_rows(None)
            .await
            .map_err(db_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::{Importance, MemoryKind};

    #[test]
    fn filters_escape_quotes() {
        assert_eq!(
            scope_filter(&Scope::agent_group("dev", "o'brien")),
            "agent = 'dev' AND group_id = 'o''brien'"
        );
        assert_eq!(
            scope_filter(&Scope::Session("s-1".to_string())),
            "session_id = 's-1'"
        );
        assert_eq!(
            scope_filter(&Scope::Group("universal".to_string())),
            "group_id = 'universal'"
        );
    }

    #[test]
    fn metadata_filters_join_the_scope() {
        let scope = Scope::Group("proj".to_string());
        assert_eq!(
            search_filter(&scope, &ShardFilter::default()),
            "group_id = 'proj'"
        );

        let filter = ShardFilter::kinds([MemoryKind::StoryOutcome, MemoryKind::ErrorPattern])
            .with_importance([Importance::Critical])
            .with_story("2-1")
            .with_component("it's");
        assert_eq!(
            search_filter(&scope, &filter),
            "group_id = 'proj' AND kind IN ('story_outcome', 'error_pattern') \
             AND importance IN ('critical') AND story_id = '2-1' AND component = 'it''s'"
        );
    }

    #[test]
    fn schema_has_fixed_size_vectors() {
        let schema = schema(384);
        let field = schema.field_with_name("vector").unwrap();
        assert!(matches!(field.data_type(), DataType::FixedSizeList(_, 384)));
        assert!(schema.field_with_name("session_id").unwrap().is_nullable());
        assert!(schema.field_with_name("component").unwrap().is_nullable());
        assert!(!schema.field_with_name("kind").unwrap().is_nullable());
    }
}
