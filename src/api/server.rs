use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, Request, State},
    http::{header, HeaderMap, Method, StatusCode},
    middleware::{self, Next},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::Stream;
use serde::Deserialize;
use tokio::sync::broadcast;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::{
    api::ApiError,
    bus::{self, EventBus},
    chat::NewMessage,
    ontology::{OntologyData, OntologyReader},
    store::MessageStore,
    sync::{self, SyncBatch},
};

/// Header the original dashboard client used for the poll checkpoint.
pub const LAST_TIMESTAMP_HEADER: &str = "last-timestamp";

// -----------------------------------------------------------------------------
// Server State
// -----------------------------------------------------------------------------

pub struct AppState {
    pub store: Arc<dyn MessageStore>,
    pub ontology: Arc<OntologyReader>,
    pub bus: Arc<EventBus>,
    /// Sender left out of `/api/responses` when the request doesn't name one.
    pub exclude_sender: String,
}

// -----------------------------------------------------------------------------
// Implementation
// -----------------------------------------------------------------------------

pub struct ApiServer {
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(state: AppState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }

    pub fn state(&self) -> Arc<AppState> {
        self.state.clone()
    }

    pub fn router(&self) -> Router {
        Router::new()
            // Wrong methods on known paths get the same JSON 404 as unknown paths.
            .route("/api/ontology", get(ontology_handler).fallback(not_found))
            .route(
                "/api/messages",
                get(messages_handler).post(chat_handler).fallback(not_found),
            )
            .route("/api/responses", get(responses_handler).fallback(not_found))
            .route("/api/chat", post(chat_handler).fallback(not_found))
            .route("/api/events", get(events_handler).fallback(not_found))
            .fallback(not_found)
            .with_state(self.state.clone())
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            // Outermost so every OPTIONS gets a 204 before routing or CORS.
            .layer(middleware::from_fn(preflight))
    }
}

async fn preflight(req: Request, next: Next) -> Response {
    if req.method() == Method::OPTIONS {
        return (
            StatusCode::NO_CONTENT,
            [
                (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
                (header::ACCESS_CONTROL_ALLOW_METHODS, "GET, POST, OPTIONS"),
                (header::ACCESS_CONTROL_ALLOW_HEADERS, "Content-Type, last-timestamp"),
            ],
        )
            .into_response();
    }
    next.run(req).await
}

async fn not_found() -> ApiError {
    ApiError::NotFound
}

async fn ontology_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<OntologyData>, ApiError> {
    Ok(Json(state.ontology.load().await?))
}

async fn messages_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SyncBatch>, ApiError> {
    Ok(Json(state.store.snapshot().await?))
}

#[derive(Debug, Default, Deserialize)]
struct ResponsesQuery {
    last: Option<String>,
    exclude: Option<String>,
}

fn parse_checkpoint(raw: &str) -> Result<i64, ApiError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(0);
    }
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("bad checkpoint {:?}", raw)))
}

/// Checkpoint from `?last=`, falling back to the `last-timestamp` header, then 0.
fn checkpoint_from(query: &ResponsesQuery, headers: &HeaderMap) -> Result<i64, ApiError> {
    if let Some(last) = &query.last {
        return parse_checkpoint(last);
    }
    match headers.get(LAST_TIMESTAMP_HEADER) {
        Some(value) => {
            let value = value
                .to_str()
                .map_err(|_| ApiError::BadRequest("non-ASCII last-timestamp".into()))?;
            parse_checkpoint(value)
        }
        None => Ok(0),
    }
}

async fn responses_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ResponsesQuery>,
    headers: HeaderMap,
) -> Result<Json<SyncBatch>, ApiError> {
    let last_seen = checkpoint_from(&query, &headers)?;
    let exclude = query.exclude.as_deref().unwrap_or(&state.exclude_sender);

    let batch = sync::poll(state.store.as_ref(), last_seen, exclude).await?;
    Ok(Json(batch))
}

/// Accepts any content type; the body just has to be JSON.
async fn chat_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let new: NewMessage =
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let msg = state.store.append(new.sender(), &new.message).await?;
    info!("Message from {} stored at {}", msg.sender, msg.timestamp);

    state.bus.publish(bus::Event::MessageAppended(msg));

    Ok(Json(serde_json::json!({ "success": true })))
}

async fn events_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, axum::BoxError>>> {
    info!("New SSE connection established");

    let mut rx = state.bus.subscribe();

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(bus::Event::MessageAppended(msg)) => {
                    yield Event::default()
                        .event("message")
                        .json_data(&msg)
                        .map_err(axum::BoxError::from);
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("SSE subscriber lagged, {} events dropped", missed);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}
