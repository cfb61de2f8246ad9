//! Axum route handlers for the conversation insights API.

use axum::body::{Body, Bytes};
use axum::extract::rejection::JsonRejection;
use axum::extract::{MatchedPath, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::circuit_breaker::CircuitBreaker;
use crate::config::Config;
use crate::db::{Db, UpsertOutcome};
use crate::llm::LlmBackend;
use crate::metrics::Metrics;
use crate::normalize::{normalize_conversation, NormalizedConversation};
use crate::queue::WorkQueue;
use crate::rate_limiter::RateLimiter;
use insights_types::*;

/// Lines buffered per transaction on the NDJSON stream path.
const STREAM_CHUNK_SIZE: usize = 32;

pub struct AppState {
    pub config: Config,
    pub db: Arc<Db>,
    pub queue: Arc<WorkQueue>,
    pub rate_limiter: Arc<RateLimiter>,
    pub breaker: Arc<CircuitBreaker>,
    pub llm: Arc<LlmBackend>,
    pub metrics: Arc<Metrics>,
    /// Cleared when shutdown begins; writes are refused from then on.
    pub accepting: AtomicBool,
}

impl AppState {
    fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Queue drain estimate: depth over observed analyzer throughput,
    /// clamped to 1..=300 seconds. Drives the Retry-After header.
    fn retry_after_seconds(&self) -> u64 {
        let estimate = self.queue.depth() as f64 / self.metrics.observed_throughput();
        (estimate.ceil() as u64).clamp(1, 300)
    }
}

fn error_response(status: StatusCode, body: ErrorBody) -> Response {
    (status, Json(body)).into_response()
}

fn shutting_down() -> Response {
    error_response(
        StatusCode::SERVICE_UNAVAILABLE,
        ErrorBody::new("shutting_down"),
    )
}

fn store_unavailable(e: rusqlite::Error) -> Response {
    log::error!("[INGEST] store unavailable: {}", e);
    error_response(
        StatusCode::SERVICE_UNAVAILABLE,
        ErrorBody::new("store_unavailable"),
    )
}

// =====================================================
// Ingest: Single
// =====================================================

// POST /api/v1/conversations
pub async fn ingest_single(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ConversationIn>, JsonRejection>,
) -> Response {
    if !state.is_accepting() {
        return shutting_down();
    }
    let Json(conversation) = match payload {
        Ok(p) => p,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                ErrorBody::with_detail("validation", e.body_text()),
            )
        }
    };
    let normalized = match normalize_conversation(&conversation) {
        Ok(n) => n,
        Err(e) => {
            return error_response(StatusCode::BAD_REQUEST, ErrorBody::with_detail("validation", e))
        }
    };

    // Persist and commit before the enqueue attempt.
    let outcome = match state.db.upsert_batch(std::slice::from_ref(&normalized)) {
        Ok(mut outcomes) => outcomes.remove(0),
        Err(e) => return store_unavailable(e),
    };

    let enqueued = state.queue.offer(&outcome.conversation_id);
    if !enqueued {
        state.metrics.record_backpressure();
        let retry_after = state.retry_after_seconds();
        log::warn!(
            "[INGEST] queue full, {} persisted but not enqueued (retry in {}s)",
            outcome.conversation_id,
            retry_after
        );
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::RETRY_AFTER, retry_after.to_string())],
            Json(ErrorBody::with_detail(
                "queue_full",
                "conversation persisted; analysis will be retried",
            )),
        )
            .into_response();
    }

    (StatusCode::CREATED, Json(ingest_result(outcome, true))).into_response()
}

// =====================================================
// Ingest: Bulk Array
// =====================================================

// POST /api/v1/conversations/bulk
pub async fn ingest_bulk(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<BulkConversationsIn>, JsonRejection>,
) -> Response {
    if !state.is_accepting() {
        return shutting_down();
    }
    let Json(bulk) = match payload {
        Ok(p) => p,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                ErrorBody::with_detail("validation", e.body_text()),
            )
        }
    };
    if bulk.conversations.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            ErrorBody::new("validation"),
        );
    }
    if bulk.conversations.len() > state.config.bulk_max_conversations {
        return error_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            ErrorBody::with_detail(
                "too_many_conversations",
                format!("at most {} per request", state.config.bulk_max_conversations),
            ),
        );
    }

    let mut normalized = Vec::with_capacity(bulk.conversations.len());
    for (i, conv) in bulk.conversations.iter().enumerate() {
        match normalize_conversation(conv) {
            Ok(n) => normalized.push(n),
            Err(e) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    ErrorBody::with_detail("validation", format!("conversation {}: {}", i, e)),
                )
            }
        }
    }

    // One transaction for the whole batch; enqueue only after commit.
    let outcomes = match state.db.upsert_batch(&normalized) {
        Ok(o) => o,
        Err(e) => return store_unavailable(e),
    };

    let mut backpressure = 0;
    let results: Vec<IngestResult> = outcomes
        .into_iter()
        .map(|outcome| {
            let enqueued = state.queue.offer(&outcome.conversation_id);
            if !enqueued {
                state.metrics.record_backpressure();
                backpressure += 1;
            }
            ingest_result(outcome, enqueued)
        })
        .collect();

    let response = BulkIngestResponse {
        accepted: results.len(),
        rejected: 0,
        backpressure,
        results,
    };
    (StatusCode::OK, Json(response)).into_response()
}

// =====================================================
// Ingest: NDJSON Stream
// =====================================================

// POST /api/v1/conversations/bulk/stream
pub async fn ingest_stream(State(state): State<Arc<AppState>>, request: Request) -> Response {
    if !state.is_accepting() {
        return shutting_down();
    }
    let body_stream = request.into_body().into_data_stream();
    let (tx, rx) = tokio::sync::mpsc::channel::<String>(64);
    tokio::spawn(async move {
        stream_ingest_task(state, body_stream, tx).await;
    });

    let lines = ReceiverStream::new(rx).map(Ok::<_, std::convert::Infallible>);
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(lines))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// One parsed input line: either ready for the batch or already failed.
enum StreamLine {
    Pending(usize, NormalizedConversation),
    Failed(usize, String),
}

async fn stream_ingest_task(
    state: Arc<AppState>,
    mut body: axum::body::BodyDataStream,
    tx: tokio::sync::mpsc::Sender<String>,
) {
    let mut buffer: Vec<u8> = Vec::new();
    let mut chunk: Vec<StreamLine> = Vec::new();
    let mut summary = StreamSummary {
        accepted: 0,
        rejected: 0,
        backpressure: 0,
    };
    let mut line_no = 0usize;
    let max_lines = state.config.bulk_max_conversations;

    'read: while let Some(piece) = body.next().await {
        let piece: Bytes = match piece {
            Ok(b) => b,
            Err(e) => {
                let _ = send_line(
                    &tx,
                    &serde_json::json!({"error": "body_read", "detail": e.to_string()}),
                )
                .await;
                break;
            }
        };
        buffer.extend_from_slice(&piece);
        while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            let line = &line[..line.len() - 1];
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            if line_no >= max_lines {
                break 'read;
            }
            line_no += 1;
            chunk.push(parse_stream_line(line_no, line));
            if chunk.len() >= STREAM_CHUNK_SIZE {
                flush_stream_chunk(&state, &tx, &mut chunk, &mut summary).await;
            }
        }
    }

    // Final line without a trailing newline.
    if !buffer.iter().all(u8::is_ascii_whitespace) && line_no < max_lines {
        line_no += 1;
        let line = buffer.clone();
        chunk.push(parse_stream_line(line_no, &line));
    }
    flush_stream_chunk(&state, &tx, &mut chunk, &mut summary).await;

    let _ = send_line(&tx, &serde_json::json!({ "_summary": summary })).await;
}

fn parse_stream_line(line_no: usize, raw: &[u8]) -> StreamLine {
    let conversation: ConversationIn = match serde_json::from_slice(raw) {
        Ok(c) => c,
        Err(e) => return StreamLine::Failed(line_no, format!("invalid_json: {}", e)),
    };
    match normalize_conversation(&conversation) {
        Ok(n) => StreamLine::Pending(line_no, n),
        Err(e) => StreamLine::Failed(line_no, format!("validation: {}", e)),
    }
}

/// Upsert the chunk's valid lines in one transaction, then emit one result
/// line per input line in input order.
async fn flush_stream_chunk(
    state: &AppState,
    tx: &tokio::sync::mpsc::Sender<String>,
    chunk: &mut Vec<StreamLine>,
    summary: &mut StreamSummary,
) {
    if chunk.is_empty() {
        return;
    }
    let pending: Vec<NormalizedConversation> = chunk
        .iter()
        .filter_map(|l| match l {
            StreamLine::Pending(_, n) => Some(n.clone()),
            StreamLine::Failed(..) => None,
        })
        .collect();

    let mut outcomes = match state.db.upsert_batch(&pending) {
        Ok(o) => o.into_iter(),
        Err(e) => {
            // The whole chunk failed to persist; report each line.
            log::error!("[INGEST] stream chunk upsert failed: {}", e);
            for line in chunk.drain(..) {
                let (line_no, error) = match line {
                    StreamLine::Pending(n, _) => (n, "store_unavailable".to_string()),
                    StreamLine::Failed(n, e) => (n, e),
                };
                summary.rejected += 1;
                let _ = send_line(tx, &StreamLineResult { line: line_no, error: Some(error), result: None }).await;
            }
            return;
        }
    };

    for line in chunk.drain(..) {
        let out = match line {
            StreamLine::Failed(line_no, error) => {
                summary.rejected += 1;
                StreamLineResult {
                    line: line_no,
                    error: Some(error),
                    result: None,
                }
            }
            StreamLine::Pending(line_no, _) => {
                let outcome = outcomes.next().expect("one outcome per pending line");
                let enqueued = state.queue.offer(&outcome.conversation_id);
                if !enqueued {
                    state.metrics.record_backpressure();
                    summary.backpressure += 1;
                }
                summary.accepted += 1;
                StreamLineResult {
                    line: line_no,
                    error: None,
                    result: Some(ingest_result(outcome, enqueued)),
                }
            }
        };
        let _ = send_line(tx, &out).await;
    }
}

async fn send_line<T: serde::Serialize>(
    tx: &tokio::sync::mpsc::Sender<String>,
    value: &T,
) -> Result<(), ()> {
    let mut line = serde_json::to_string(value).map_err(|_| ())?;
    line.push('\n');
    tx.send(line).await.map_err(|_| ())
}

fn ingest_result(outcome: UpsertOutcome, enqueued: bool) -> IngestResult {
    IngestResult {
        conversation_id: outcome.conversation_id,
        root_tweet_id: outcome.root_tweet_id,
        message_count: outcome.message_count,
        created: outcome.created,
        enqueued,
    }
}

// =====================================================
// Insights
// =====================================================

#[derive(Debug, Default, Deserialize)]
pub struct InsightsQuery {
    pub conversation_id: Option<String>,
    pub sentiment: Option<String>,
    pub topic: Option<String>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    pub include_skipped: Option<bool>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

// GET /api/v1/insights
pub async fn get_insights(
    State(state): State<Arc<AppState>>,
    Query(query): Query<InsightsQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(20);
    if !(1..=100).contains(&limit) {
        return error_response(
            StatusCode::BAD_REQUEST,
            ErrorBody::with_detail("bad_filter", "limit must be in 1..=100"),
        );
    }
    let offset = query.offset.unwrap_or(0);
    if offset < 0 {
        return error_response(
            StatusCode::BAD_REQUEST,
            ErrorBody::with_detail("bad_filter", "offset must be >= 0"),
        );
    }
    let sentiment = match query.sentiment.as_deref() {
        None => None,
        Some(raw) => match Sentiment::parse_filter(raw) {
            Some(s) => Some(s.as_str().to_string()),
            None => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    ErrorBody::with_detail("bad_filter", format!("unknown sentiment '{}'", raw)),
                )
            }
        },
    };
    let date_from = match parse_date_bound(query.date_from.as_deref()) {
        Ok(d) => d,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, ErrorBody::with_detail("bad_filter", e)),
    };
    let date_to = match parse_date_bound(query.date_to.as_deref()) {
        Ok(d) => d,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, ErrorBody::with_detail("bad_filter", e)),
    };

    let filter = InsightFilter {
        conversation_id: query.conversation_id,
        sentiment,
        topic: query.topic,
        date_from,
        date_to,
        include_skipped: query.include_skipped.unwrap_or(true),
    };

    match state.db.list_insights(&filter, limit as usize, offset as usize) {
        Ok((items, total)) => (
            StatusCode::OK,
            Json(InsightsPage {
                items,
                total,
                limit: limit as usize,
                offset: offset as usize,
            }),
        )
            .into_response(),
        Err(e) => store_unavailable(e),
    }
}

fn parse_date_bound(raw: Option<&str>) -> Result<Option<String>, String> {
    match raw {
        None => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(s)
            .map(|d| Some(d.with_timezone(&Utc).to_rfc3339()))
            .map_err(|_| format!("'{}' is not RFC 3339", s)),
    }
}

// =====================================================
// Trends
// =====================================================

#[derive(Debug, Default, Deserialize)]
pub struct TrendsQuery {
    pub window: Option<String>,
}

// GET /api/v1/trends?window=1d|7d|30d
pub async fn get_trends(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TrendsQuery>,
) -> Response {
    let window = query.window.as_deref().unwrap_or("7d");
    let days = match window {
        "1d" => 1,
        "7d" => 7,
        "30d" => 30,
        other => {
            return error_response(
                StatusCode::BAD_REQUEST,
                ErrorBody::with_detail("bad_window", format!("'{}' is not one of 1d, 7d, 30d", other)),
            )
        }
    };
    match state.db.aggregate(days) {
        Ok(agg) => (
            StatusCode::OK,
            Json(TrendsResponse {
                window: window.to_string(),
                volume: agg.volume,
                sentiment_counts: agg.sentiment_counts,
                top_topics: agg.top_topics,
                top_gaps: agg.top_gaps,
            }),
        )
            .into_response(),
        Err(e) => store_unavailable(e),
    }
}

// =====================================================
// Health and Metrics
// =====================================================

// GET /health
pub async fn health(State(state): State<Arc<AppState>>) -> Response {
    let stats = state.db.stats().unwrap_or_default();
    let body = ServiceHealth {
        status: "ok".to_string(),
        queue_depth: state.queue.depth(),
        process_id: std::process::id(),
        uptime_secs: state.metrics.uptime_secs(),
        stats,
    };
    (StatusCode::OK, Json(body)).into_response()
}

// GET /metrics
pub async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    let text = state
        .metrics
        .render(state.queue.depth(), state.breaker.state());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        text,
    )
        .into_response()
}

/// Request latency middleware feeding the duration histogram.
pub async fn track_latency(
    State(state): State<Arc<AppState>>,
    matched_path: Option<MatchedPath>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().as_str().to_string();
    let path = matched_path
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let start = Instant::now();
    let response = next.run(request).await;
    state
        .metrics
        .record_request(&method, &path, start.elapsed().as_secs_f64());
    response
}
