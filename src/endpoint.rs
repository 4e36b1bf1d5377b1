// ABOUTME: HTTP surface of the relay: the event stream and a health report
// ABOUTME: Authenticates, resolves the table filter and hands the transport to a session

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::header::{self, HeaderMap, HeaderName};
use axum::http::StatusCode;
use axum::response::sse::Sse;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use table_watcher::{FeedState, FeedStatus, FeedStatusBoard, TableName, TableSet};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::auth::Authenticator;
use crate::bus::{BusMetricsSnapshot, EventBus};
use crate::error::{AuthError, StreamError};
use crate::frame::EncodedFrame;
use crate::session::ClientSession;
use crate::shutdown::Shutdown;

/// Frames buffered between a session's writer loop and the HTTP body.
const OUTBOUND_BUFFER: usize = 16;

/// Shared state behind every route
#[derive(Clone)]
pub struct AppState {
    pub bus: Arc<EventBus>,
    pub authenticator: Arc<dyn Authenticator>,
    /// Tables the relay has change feeds for
    pub watched: TableSet,
    pub heartbeat_interval: Duration,
    pub shutdown: Shutdown,
    pub feeds: FeedStatusBoard,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/stream", get(open_stream))
        .route("/health", get(health))
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    /// Fallback for clients that cannot set an Authorization header
    access_token: Option<String>,
    tables: Option<String>,
}

/// GET /stream
async fn open_stream(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Result<Response, StreamError> {
    if state.shutdown.is_triggered() {
        return Err(StreamError::ShuttingDown);
    }

    let credential = bearer_token(&headers)
        .or(query.access_token.as_deref())
        .ok_or(AuthError::MissingCredential)?;
    let principal = state
        .authenticator
        .authenticate(credential)
        .await
        .inspect_err(|e| tracing::info!("Rejected stream request: {}", e))?;

    // `?tables=` with no names means no narrowing.
    let mut tables = state.watched.intersection(principal.scope);
    let requested = query
        .tables
        .as_deref()
        .map(str::trim)
        .filter(|requested| !requested.is_empty());
    if let Some(requested) = requested {
        tables = tables.intersection(requested.parse()?);
    }
    if tables.is_empty() {
        return Err(StreamError::EmptyScope {
            principal: principal.name,
        });
    }

    let session = ClientSession::open(&state.bus, tables, state.heartbeat_interval);
    tracing::info!(
        session_id = %session.id(),
        principal = %principal.name,
        tables = %tables,
        "Opened event stream"
    );

    let (tx, rx) = mpsc::channel::<EncodedFrame>(OUTBOUND_BUFFER);
    tokio::spawn(session.run(tx, state.shutdown.clone()));

    let body = ReceiverStream::new(rx).map(|frame| Ok::<_, Infallible>(frame.to_sse()));
    Ok((
        [
            (header::CACHE_CONTROL, "no-cache"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Sse::new(body),
    )
        .into_response())
}

/// Extracts the token from `Authorization: Bearer <token>`.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub version: &'static str,
    pub watched: TableSet,
    pub active_subscribers: usize,
    pub bus: BusMetricsSnapshot,
    pub feeds: BTreeMap<TableName, FeedStatus>,
}

/// GET /health
async fn health(State(state): State<AppState>) -> Response {
    let feeds = state.feeds.snapshot();
    let bus = state.bus.metrics();

    let (status, code) = if state.shutdown.is_triggered() {
        ("shutting_down", StatusCode::SERVICE_UNAVAILABLE)
    } else if state
        .watched
        .iter()
        .all(|table| feeds.get(&table).is_some_and(|f| f.state == FeedState::Live))
    {
        ("ok", StatusCode::OK)
    } else {
        ("degraded", StatusCode::OK)
    };

    let response = HealthResponse {
        status,
        timestamp: Utc::now(),
        version: env!("CARGO_PKG_VERSION"),
        watched: state.watched,
        active_subscribers: bus.active_subscribers,
        bus,
        feeds,
    };
    (code, Json(response)).into_response()
}
