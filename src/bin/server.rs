//! Story Memory Server
//!
//! HTTP API over the lifecycle hooks, for workflow scripts and tooling.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use story_memory::{
    config::{BackendKind, Config, EmbedderKind},
    embedding::{Embedder, FastEmbedder, HashEmbedder, TokenCounter},
    hooks::{MemoryHooks, StoryCompletion},
    shard::{Importance, MemoryKind, ScoredShard, ShardFilter, ShardId},
    storage::{InMemoryVectorStore, LanceVectorStore, ShardStore, StatusReport, VectorStore},
    Error,
};

/// Application state shared across handlers
struct AppState {
    store: Arc<ShardStore>,
    config: Config,
    token_counter: TokenCounter,
}

type SharedState = Arc<AppState>;

impl AppState {
    fn hooks(&self, agent: &str, group_id: Option<String>, session_id: Option<String>) -> MemoryHooks {
        let mut hooks = MemoryHooks::new(agent, self.store.clone(), &self.config);
        if let Some(group_id) = group_id {
            hooks = hooks.with_group(group_id);
        }
        if let Some(session_id) = session_id {
            hooks = hooks.with_session(session_id);
        }
        hooks
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!("Starting Story Memory Server on port {}", config.server_port);
    tracing::info!("Data directory: {:?}", config.data_dir);

    // Initialize components
    let embedder: Arc<dyn Embedder> = match config.embedder {
        EmbedderKind::FastEmbed => Arc::new(FastEmbedder::new(&config)?),
        EmbedderKind::Hash => Arc::new(HashEmbedder::new(config.embedding_dimensions)),
    };
    let vectors: Arc<dyn VectorStore> = match config.backend {
        BackendKind::Lance => Arc::new(LanceVectorStore::open(&config).await?),
        BackendKind::Memory => {
            tracing::warn!("Using in-memory vector store, shards are lost on exit");
            Arc::new(InMemoryVectorStore::new())
        }
    };

    let store = Arc::new(ShardStore::new(embedder, vectors, config.storage_timeout));
    if config.create_collections {
        store.ensure_collections().await?;
    }
    store.verify_collections().await?;

    let token_counter = TokenCounter::for_claude()?;
    let port = config.server_port;

    let state = Arc::new(AppState {
        store,
        config,
        token_counter,
    });

    let app = app(state);

    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!("Server listening on http://127.0.0.1:{}", port);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Every route, over shared state
fn app(state: SharedState) -> Router {
    Router::new()
        // Operational
        .route("/health", get(health))
        .route("/status", get(status))
        // Hooks
        .route("/hooks/before-story-start", post(before_story_start))
        .route("/hooks/after-story-complete", post(after_story_complete))
        .route("/hooks/before-architecture-decision", post(before_architecture_decision))
        .route("/hooks/architecture-decision", post(after_architecture_decision))
        .route("/hooks/before-implementation", post(before_implementation))
        .route("/hooks/bug-fix", post(after_bug_fix))
        .route("/hooks/best-practice", post(store_best_practice))
        .route("/hooks/chat-decision", post(store_chat_decision))
        .route("/hooks/chat-context", post(load_chat_context))
        // Search
        .route("/best-practices/search", post(search_best_practices))
        .route("/knowledge/search", post(search_knowledge))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state)
}

// === Errors ===

/// Hook error mapped to a status code and a `{kind, message}` body
struct ApiError(Error);

#[derive(Debug, Serialize)]
struct ErrorBody {
    kind: &'static str,
    message: String,
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self.0 {
            Error::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "validation"),
            Error::Storage(_) => (StatusCode::SERVICE_UNAVAILABLE, "storage"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        if status != StatusCode::UNPROCESSABLE_ENTITY {
            tracing::error!("Hook failed: {}", self.0);
        }

        let body = ErrorBody {
            kind,
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// === Handlers ===

async fn health(State(state): State<SharedState>) -> (StatusCode, &'static str) {
    if state.store.status().await.healthy {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    }
}

async fn status(State(state): State<SharedState>) -> (StatusCode, Json<StatusReport>) {
    let report = state.store.status().await;
    let code = if report.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report))
}

// --- Hook handlers ---

#[derive(Debug, Deserialize)]
struct BeforeStoryStartRequest {
    agent: String,
    group_id: Option<String>,
    story_id: String,
    feature: String,
}

#[derive(Debug, Serialize)]
struct ContextResponse {
    context: String,
    tokens: u32,
}

async fn before_story_start(
    State(state): State<SharedState>,
    Json(req): Json<BeforeStoryStartRequest>,
) -> ApiResult<ContextResponse> {
    let context = state
        .hooks(&req.agent, req.group_id, None)
        .before_story_start(&req.story_id, &req.feature)
        .await?;

    let tokens = state.token_counter.count(&context);
    Ok(Json(ContextResponse { context, tokens }))
}

#[derive(Debug, Deserialize)]
struct AfterStoryCompleteRequest {
    agent: String,
    group_id: Option<String>,
    session_id: Option<String>,
    #[serde(flatten)]
    completion: StoryCompletion,
}

#[derive(Debug, Serialize)]
struct ShardIdsResponse {
    shard_ids: Vec<ShardId>,
}

async fn after_story_complete(
    State(state): State<SharedState>,
    Json(req): Json<AfterStoryCompleteRequest>,
) -> ApiResult<ShardIdsResponse> {
    let shard_ids = state
        .hooks(&req.agent, req.group_id, req.session_id)
        .after_story_complete(req.completion)
        .await?;

    Ok(Json(ShardIdsResponse { shard_ids }))
}

#[derive(Debug, Deserialize)]
struct BeforeArchitectureDecisionRequest {
    agent: String,
    group_id: Option<String>,
    topic: String,
    technology: String,
}

async fn before_architecture_decision(
    State(state): State<SharedState>,
    Json(req): Json<BeforeArchitectureDecisionRequest>,
) -> ApiResult<ContextResponse> {
    let context = state
        .hooks(&req.agent, req.group_id, None)
        .before_architecture_decision(&req.topic, &req.technology)
        .await?;

    let tokens = state.token_counter.count(&context);
    Ok(Json(ContextResponse { context, tokens }))
}

#[derive(Debug, Deserialize)]
struct ArchitectureDecisionRequest {
    agent: String,
    group_id: Option<String>,
    session_id: Option<String>,
    topic: String,
    decision: String,
    justification: String,
    tradeoffs: String,
    component: String,
    #[serde(default)]
    breaking_change: bool,
}

async fn after_architecture_decision(
    State(state): State<SharedState>,
    Json(req): Json<ArchitectureDecisionRequest>,
) -> ApiResult<ShardIdResponse> {
    let shard_id = state
        .hooks(&req.agent, req.group_id, req.session_id)
        .after_architecture_decision(
            &req.topic,
            &req.decision,
            &req.justification,
            &req.tradeoffs,
            &req.component,
            req.breaking_change,
        )
        .await?;

    Ok(Json(ShardIdResponse { shard_id }))
}

#[derive(Debug, Deserialize)]
struct BeforeImplementationRequest {
    agent: String,
    group_id: Option<String>,
    component: String,
    feature: String,
}

async fn before_implementation(
    State(state): State<SharedState>,
    Json(req): Json<BeforeImplementationRequest>,
) -> ApiResult<ContextResponse> {
    let context = state
        .hooks(&req.agent, req.group_id, None)
        .before_implementation(&req.component, &req.feature)
        .await?;

    let tokens = state.token_counter.count(&context);
    Ok(Json(ContextResponse { context, tokens }))
}

#[derive(Debug, Deserialize)]
struct BugFixRequest {
    agent: String,
    group_id: Option<String>,
    session_id: Option<String>,
    error: String,
    root_cause: String,
    solution: String,
    prevention: String,
    component: String,
    story_id: Option<String>,
}

async fn after_bug_fix(
    State(state): State<SharedState>,
    Json(req): Json<BugFixRequest>,
) -> ApiResult<ShardIdResponse> {
    let shard_id = state
        .hooks(&req.agent, req.group_id, req.session_id)
        .after_bug_fix(
            &req.error,
            &req.root_cause,
            &req.solution,
            &req.prevention,
            &req.component,
            req.story_id.as_deref(),
        )
        .await?;

    Ok(Json(ShardIdResponse { shard_id }))
}

#[derive(Debug, Deserialize)]
struct BestPracticeRequest {
    agent: String,
    category: String,
    pattern: String,
    content: String,
    evidence: String,
}

#[derive(Debug, Serialize)]
struct ShardIdResponse {
    shard_id: ShardId,
}

async fn store_best_practice(
    State(state): State<SharedState>,
    Json(req): Json<BestPracticeRequest>,
) -> ApiResult<ShardIdResponse> {
    let shard_id = state
        .hooks(&req.agent, None, None)
        .store_best_practice(&req.category, &req.pattern, &req.content, &req.evidence)
        .await?;

    Ok(Json(ShardIdResponse { shard_id }))
}

#[derive(Debug, Deserialize)]
struct ChatDecisionRequest {
    agent: String,
    group_id: Option<String>,
    session_id: Option<String>,
    decision: String,
    reasoning: String,
    context: String,
    importance: String,
}

async fn store_chat_decision(
    State(state): State<SharedState>,
    Json(req): Json<ChatDecisionRequest>,
) -> ApiResult<ShardIdResponse> {
    let shard_id = state
        .hooks(&req.agent, req.group_id, req.session_id)
        .store_chat_decision(&req.decision, &req.reasoning, &req.context, &req.importance)
        .await?;

    Ok(Json(ShardIdResponse { shard_id }))
}

#[derive(Debug, Deserialize)]
struct ChatContextRequest {
    agent: String,
    group_id: Option<String>,
    session_id: Option<String>,
    topic: String,
}

async fn load_chat_context(
    State(state): State<SharedState>,
    Json(req): Json<ChatContextRequest>,
) -> ApiResult<ContextResponse> {
    let context = state
        .hooks(&req.agent, req.group_id, req.session_id)
        .load_chat_context(&req.topic)
        .await?;

    let tokens = state.token_counter.count(&context);
    Ok(Json(ContextResponse { context, tokens }))
}

// --- Search handlers ---

#[derive(Debug, Deserialize)]
struct SearchBestPracticesRequest {
    #[serde(default = "default_agent")]
    agent: String,
    query: String,
    limit: Option<usize>,
}

fn default_agent() -> String {
    "dev".to_string()
}

#[derive(Debug, Deserialize)]
struct SearchKnowledgeRequest {
    #[serde(default = "default_agent")]
    agent: String,
    group_id: Option<String>,
    query: String,
    #[serde(default)]
    memory_types: Vec<MemoryKind>,
    #[serde(default)]
    importance: Vec<Importance>,
    story_id: Option<String>,
    component: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct KnowledgeHit {
    id: ShardId,
    unique_id: String,
    kind: MemoryKind,
    importance: Importance,
    story_id: Option<String>,
    component: Option<String>,
    text: String,
    score: f32,
}

impl From<ScoredShard> for KnowledgeHit {
    fn from(r: ScoredShard) -> Self {
        let meta = r.shard.metadata;
        Self {
            id: r.shard.id,
            unique_id: meta.unique_id,
            kind: meta.kind,
            importance: meta.importance,
            story_id: meta.story_id,
            component: meta.component,
            text: r.shard.text,
            score: r.score,
        }
    }
}

async fn search_knowledge(
    State(state): State<SharedState>,
    Json(req): Json<SearchKnowledgeRequest>,
) -> ApiResult<Vec<KnowledgeHit>> {
    let limit = req.limit.unwrap_or(state.config.max_retrieval_results);
    let filter = ShardFilter {
        kinds: req.memory_types,
        importance: req.importance,
        story_id: req.story_id,
        component: req.component,
    };
    let results = state
        .hooks(&req.agent, req.group_id, None)
        .search_knowledge(&req.query, &filter, limit)
        .await?;

    Ok(Json(results.into_iter().map(KnowledgeHit::from).collect()))
}

#[derive(Debug, Serialize)]
struct BestPracticeHit {
    id: ShardId,
    unique_id: String,
    category: Option<String>,
    pattern: Option<String>,
    text: String,
    score: f32,
}

async fn search_best_practices(
    State(state): State<SharedState>,
    Json(req): Json<SearchBestPracticesRequest>,
) -> ApiResult<Vec<BestPracticeHit>> {
    let limit = req.limit.unwrap_or(state.config.max_retrieval_results);
    let results = state
        .hooks(&req.agent, None, None)
        .search_best_practices(&req.query, limit)
        .await?;

    Ok(Json(
        results
            .into_iter()
            .map(|r| BestPracticeHit {
                id: r.shard.id,
                unique_id: r.shard.metadata.unique_id,
                category: r.shard.metadata.category,
                pattern: r.shard.metadata.pattern,
                text: r.shard.text,
                score: r.score,
            })
            .collect(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{json, Value};
    use std::time::Duration;
    use story_memory::error::StorageResult;
    use story_memory::StorageError;
    use tower::ServiceExt;

    const DIMS: usize = 32;

    struct DownEmbedder;

    #[async_trait]
    impl Embedder for DownEmbedder {
        async fn embed(&self, _text: &str) -> StorageResult<Vec<f32>> {
            Err(StorageError::embedding("connection refused"))
        }

        fn dimensions(&self) -> usize {
            DIMS
        }
    }

    async fn state_with(embedder: Arc<dyn Embedder>) -> SharedState {
        let store = Arc::new(ShardStore::new(
            embedder,
            Arc::new(InMemoryVectorStore::new()),
            Duration::from_secs(5),
        ));
        store.ensure_collections().await.unwrap();

        let mut config = Config::with_data_dir(std::env::temp_dir().join("story-memory-server"));
        config.group_id = "server-tests".to_string();
        config.embedding_dimensions = DIMS;

        Arc::new(AppState {
            store,
            config,
            token_counter: TokenCounter::for_claude().unwrap(),
        })
    }

    async fn post_json(state: SharedState, uri: &str, body: Value) -> (StatusCode, Value) {
        let response = app(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn completion(what_built: &str) -> Value {
        json!({
            "agent": "dev",
            "story_id": "API-001",
            "epic_id": "API",
            "component": "server",
            "what_built": what_built,
        })
    }

    #[tokio::test]
    async fn missing_references_are_unprocessable() {
        let state = state_with(Arc::new(HashEmbedder::new(DIMS))).await;
        let (status, body) = post_json(
            state,
            "/hooks/after-story-complete",
            completion("Content without file references"),
        )
        .await;

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["kind"], "validation");
        assert!(body["message"].as_str().unwrap().contains("reference"));
    }

    #[tokio::test]
    async fn failing_embedder_is_unavailable() {
        let state = state_with(Arc::new(DownEmbedder)).await;
        let (status, body) = post_json(
            state,
            "/hooks/after-story-complete",
            completion("Routes in src/bin/server.rs:1-40"),
        )
        .await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["kind"], "storage");
    }

    #[tokio::test]
    async fn story_start_on_an_empty_store_is_ok() {
        let state = state_with(Arc::new(HashEmbedder::new(DIMS))).await;
        let (status, body) = post_json(
            state,
            "/hooks/before-story-start",
            json!({"agent": "dev", "story_id": "API-002", "feature": "routing"}),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["context"], "");
        assert_eq!(body["tokens"], 0);
    }

    #[tokio::test]
    async fn stored_story_is_found_by_knowledge_search() {
        let state = state_with(Arc::new(HashEmbedder::new(DIMS))).await;
        let (status, body) = post_json(
            state.clone(),
            "/hooks/after-story-complete",
            completion("Routes in src/bin/server.rs:1-40"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["shard_ids"].as_array().unwrap().len(), 1);

        let (status, body) = post_json(
            state,
            "/knowledge/search",
            json!({
                "query": "routes server",
                "memory_types": ["story_outcome"],
                "story_id": "API-001",
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let hits = body.as_array().unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0]["kind"], "story_outcome");
        assert_eq!(hits[0]["component"], "server");
    }
}
