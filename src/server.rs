//! HTTP API server.
//!
//! Exposes the answering and ingestion surface over JSON HTTP:
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/ask` | Answer a question; streams NDJSON answer events |
//! | `GET`  | `/groups` | List knowledge groups and their run status |
//! | `POST` | `/groups/{name}/sync` | Start a sync run for a group |
//! | `POST` | `/groups/{name}/stop` | Cooperatively stop a running sync |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! `/ask` responses are one JSON event per line, in delivery order:
//! `init`, any `tool-call`s, the `stream-delta` sequence, and a final
//! `answer-complete`. Errors use the body shape
//! `{ "error": { "code": "...", "message": "..." } }`.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};

use crate::answer::{AnswerEvent, AnswerListener, AnswerOptions, Answerer};
use crate::broker::EventBroker;
use crate::config::Config;
use crate::crawl::PageFetcher;
use crate::flow::FlowOptions;
use crate::indexer::make_indexer;
use crate::ingest::{run_sync, stop_group, SyncDeps};
use crate::llm::{get_model, OpenAiChatModel};
use crate::store::MetaStore;

#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    store: Arc<dyn MetaStore>,
    fetcher: Arc<dyn PageFetcher>,
    broker: Arc<EventBroker>,
}

/// Start the HTTP server on the configured bind address.
pub async fn run_server(
    config: &Config,
    store: Arc<dyn MetaStore>,
    fetcher: Arc<dyn PageFetcher>,
) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();

    let state = AppState {
        config: Arc::new(config.clone()),
        store,
        fetcher,
        broker: Arc::new(EventBroker::new()),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/ask", post(handle_ask))
        .route("/groups", get(handle_list_groups))
        .route("/groups/{name}/sync", post(handle_sync))
        .route("/groups/{name}/stop", post(handle_stop))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    println!("ragbase server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /groups ============

#[derive(Serialize)]
struct GroupInfo {
    name: String,
    kind: String,
    status: String,
    items: usize,
    last_error: Option<String>,
}

async fn handle_list_groups(
    State(state): State<AppState>,
) -> Result<Json<Vec<GroupInfo>>, AppError> {
    let mut groups = Vec::new();

    for (name, group) in &state.config.groups {
        let run = state
            .store
            .group_run(name)
            .await
            .map_err(|e| internal(e.to_string()))?;
        let items = state
            .store
            .list_items(name)
            .await
            .map_err(|e| internal(e.to_string()))?;

        groups.push(GroupInfo {
            name: name.clone(),
            kind: group.kind.clone(),
            status: run.status.as_str().to_string(),
            items: items.len(),
            last_error: run.fetch_error,
        });
    }

    Ok(Json(groups))
}

// ============ POST /groups/{name}/sync ============

#[derive(Serialize)]
struct SyncStarted {
    group: String,
    started: bool,
}

async fn handle_sync(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<SyncStarted>, AppError> {
    if !state.config.groups.contains_key(&name) {
        return Err(not_found(format!("no group named: {}", name)));
    }

    let config = state.config.clone();
    let deps = SyncDeps {
        store: state.store.clone(),
        fetcher: state.fetcher.clone(),
        upload: None,
        external_adapter: None,
    };
    let group = name.clone();

    tokio::spawn(async move {
        match run_sync(&config, deps, &group, None).await {
            Ok(report) => {
                tracing::info!(
                    group = %report.group_id,
                    visited = report.visited,
                    completed = report.completed,
                    failed = report.failed,
                    "Sync finished"
                );
            }
            Err(e) => {
                tracing::error!(group = %group, error = %e, "Sync could not start");
            }
        }
    });

    Ok(Json(SyncStarted {
        group: name,
        started: true,
    }))
}

// ============ POST /groups/{name}/stop ============

async fn handle_stop(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    stop_group(state.store.as_ref(), &name)
        .await
        .map_err(|e| internal(e.to_string()))?;
    Ok(Json(serde_json::json!({ "group": name, "stopped": true })))
}

// ============ POST /ask ============

#[derive(Deserialize)]
struct AskRequest {
    group: String,
    query: String,
    /// Topic the events are also fanned out to (thread id).
    #[serde(default)]
    topic: Option<String>,
}

async fn handle_ask(
    State(state): State<AppState>,
    Json(request): Json<AskRequest>,
) -> Result<Response, AppError> {
    if request.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }

    let Some(group) = state.config.groups.get(&request.group).cloned() else {
        return Err(not_found(format!("no group named: {}", request.group)));
    };

    let indexer = make_indexer(&state.config, group.indexer.as_deref())
        .map_err(|e| internal(e.to_string()))?;

    let mut model_config = get_model(&state.config.llm.model);
    if let Some(base_url) = &state.config.llm.base_url {
        model_config.base_url = base_url.clone();
    }
    model_config.api_key_env = state.config.llm.api_key_env.clone();
    let credits = model_config.credits_per_message;
    let top_n = model_config.rag_top_n;

    let model = OpenAiChatModel::new(model_config).map_err(|e| internal(e.to_string()))?;

    let answerer = Answerer::new(
        state.store.clone(),
        indexer,
        Arc::new(model),
        AnswerOptions {
            group_id: request.group.clone(),
            collection_id: request.group.clone(),
            chat_prompt: group.chat_prompt.clone(),
            top_k: state.config.retrieval.top_k.max(top_n),
            min_score: group.min_score,
            credits_per_message: credits,
            flow: FlowOptions {
                max_tool_calls: state.config.llm.max_tool_calls,
                max_steps: state.config.llm.max_steps,
            },
        },
    );

    let (tx, rx) = mpsc::unbounded_channel::<AnswerEvent>();
    let broker = state.broker.clone();
    let topic = request.topic.clone().unwrap_or_else(|| request.group.clone());

    let listener: Arc<AnswerListener> = Arc::new(move |event: AnswerEvent| {
        broker.publish(&topic, event.clone());
        let _ = tx.send(event);
    });

    let query = request.query.clone();
    let stream_listener = listener.clone();
    tokio::spawn(async move {
        match answerer.answer(&query, Vec::new(), Some(stream_listener.clone())).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                // No content from the model: surface "I don't know"
                // instead of an empty success.
                stream_listener(AnswerEvent::AnswerComplete {
                    content: "I don't know.".to_string(),
                    sources: Vec::new(),
                    credits_used: 0,
                });
            }
            Err(e) => {
                tracing::error!(error = %e, "Answer turn failed");
            }
        }
    });

    let stream = futures::stream::unfold(rx, |mut rx| async {
        rx.recv().await.map(|event| {
            let line = serde_json::to_string(&event).unwrap_or_default();
            (Ok::<_, Infallible>(format!("{}\n", line)), rx)
        })
    });

    Ok(Response::builder()
        .header("Content-Type", "application/x-ndjson")
        .body(Body::from_stream(stream))
        .map_err(|e| internal(e.to_string()))?)
}
