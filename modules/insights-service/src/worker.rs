//! Background analyzer: drains the work queue and derives insights.
//!
//! Per item: load thread, pre-filter, cache check, rate limit, circuit
//! breaker, LLM call, persist. The loop is the top-level error boundary;
//! nothing thrown by a single item stops the drain.

use std::sync::Arc;
use std::time::Duration;

use crate::db::InsightWrite;
use crate::normalize::{canonical_thread, thread_hash};
use crate::pre_filter::{pre_filter, PreFilterResult};
use crate::routes::AppState;

pub async fn run_worker(state: Arc<AppState>) {
    log::info!("[WORKER] analyzer started");
    while let Some(conversation_id) = state.queue.take().await {
        process_one(&state, &conversation_id).await;
        state.metrics.record_processed();
    }
    log::info!("[WORKER] queue closed and drained, analyzer exiting");
}

/// Periodic recovery sweep: re-offer conversations that still lack an
/// insight (crash loss, or deferred while the circuit was open).
pub async fn run_sweeper(state: Arc<AppState>) {
    let interval = state.config.sweep_interval_seconds;
    if interval == 0 {
        return;
    }
    loop {
        tokio::time::sleep(Duration::from_secs(interval)).await;
        sweep_pending(&state);
    }
}

/// Offer every insight-less conversation to the queue; stops at the first
/// refusal (queue full or closed) and leaves the rest to the next sweep.
pub fn sweep_pending(state: &AppState) -> usize {
    let ids = match state
        .db
        .conversations_without_insight(state.config.max_queue_depth)
    {
        Ok(ids) => ids,
        Err(e) => {
            log::error!("[WORKER] recovery scan failed: {}", e);
            return 0;
        }
    };
    let mut enqueued = 0;
    for id in &ids {
        if !state.queue.offer(id) {
            break;
        }
        enqueued += 1;
    }
    if enqueued > 0 {
        log::info!(
            "[WORKER] recovery sweep re-enqueued {}/{} pending conversations",
            enqueued,
            ids.len()
        );
    }
    enqueued
}

async fn process_one(state: &AppState, conversation_id: &str) {
    let thread = match state.db.load_thread(conversation_id) {
        Ok(t) => t,
        Err(e) => {
            log::error!("[WORKER] load_thread failed for {}: {}", conversation_id, e);
            return;
        }
    };

    // Guards double-enqueue races and stale recovery rescans.
    if thread.is_empty() {
        log::warn!("[WORKER] empty thread for {}", conversation_id);
        write_skip(state, conversation_id, "empty_thread");
        return;
    }

    if let PreFilterResult::Skip(reason) = pre_filter(
        &thread,
        state.config.pre_filter_min_messages,
        state.config.pre_filter_min_total_chars,
    ) {
        log::debug!("[WORKER] pre-filter skipped {}: {}", conversation_id, reason);
        write_skip(state, conversation_id, &reason);
        return;
    }

    let canonical = canonical_thread(&thread);
    let hash = thread_hash(&canonical);

    // Identical content already analyzed under another conversation: copy
    // the insight by value, no LLM spend.
    match state.db.cache_get(&hash) {
        Ok(Some(cached_cid)) if cached_cid != conversation_id => {
            if copy_cached_insight(state, conversation_id, &cached_cid) {
                return;
            }
        }
        Ok(_) => {}
        Err(e) => log::warn!("[WORKER] cache_get failed for {}: {}", conversation_id, e),
    }

    // Re-processing a conversation that already has a real insight only
    // needs the cache entry backfilled.
    match state.db.get_insight(conversation_id) {
        Ok(Some(existing)) if existing.skipped_reason.is_none() => {
            if let Err(e) = state.db.cache_put(&hash, conversation_id) {
                log::warn!("[WORKER] cache_put failed for {}: {}", conversation_id, e);
            }
            return;
        }
        Ok(_) => {}
        Err(e) => log::warn!("[WORKER] get_insight failed for {}: {}", conversation_id, e),
    }

    if !state.rate_limiter.acquire().await {
        // Shutdown cancelled the wait; leave the conversation pending.
        return;
    }

    if !state.breaker.begin_call() {
        // Circuit open: no insight written, the sweeper retries later.
        log::debug!("[WORKER] circuit open, deferring {}", conversation_id);
        return;
    }

    match state.llm.analyze(&canonical).await {
        Ok(analysis) => {
            state.breaker.record_success();
            let total_tokens = analysis.prompt_tokens + analysis.completion_tokens;
            state.rate_limiter.debit_tokens(total_tokens);
            state
                .metrics
                .record_llm_success(total_tokens, analysis.cost_estimate);

            let write = InsightWrite::Analyzed {
                llm_output: analysis.llm_output.to_string(),
                sentiment: analysis.sentiment.as_str().to_string(),
                topics: analysis.topics,
                gaps: analysis.gaps,
                prompt_tokens: analysis.prompt_tokens,
                completion_tokens: analysis.completion_tokens,
                cost_estimate: analysis.cost_estimate,
            };
            if let Err(e) = state.db.put_insight(conversation_id, &write) {
                log::error!("[WORKER] put_insight failed for {}: {}", conversation_id, e);
                return;
            }
            if let Err(e) = state.db.cache_put(&hash, conversation_id) {
                log::warn!("[WORKER] cache_put failed for {}: {}", conversation_id, e);
            }
            state.metrics.record_insight_analyzed();
        }
        Err(e) => {
            state.breaker.record_failure();
            state.metrics.record_llm_error();
            log::warn!("[WORKER] analysis failed for {}: {}", conversation_id, e);
            write_skip(state, conversation_id, &format!("llm_error:{}", e.class()));
        }
    }
}

/// Copy a cached conversation's insight by value. False when the cache
/// entry turned out to be unusable (skipped or vanished), which the caller
/// treats as a miss.
fn copy_cached_insight(state: &AppState, conversation_id: &str, cached_cid: &str) -> bool {
    let prior = match state.db.get_insight(cached_cid) {
        Ok(Some(p)) => p,
        Ok(None) => return false,
        Err(e) => {
            log::warn!("[WORKER] cached insight load failed: {}", e);
            return false;
        }
    };
    let llm_output = match (&prior.skipped_reason, prior.llm_output) {
        (None, Some(output)) => output,
        _ => return false,
    };
    let topics: Vec<String> = prior
        .topics_json
        .as_deref()
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default();
    let gaps: Vec<String> = prior
        .gaps_json
        .as_deref()
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default();
    let write = InsightWrite::Analyzed {
        llm_output,
        sentiment: prior.sentiment.unwrap_or_else(|| "unknown".to_string()),
        topics,
        gaps,
        prompt_tokens: 0,
        completion_tokens: 0,
        cost_estimate: 0.0,
    };
    match state.db.put_insight(conversation_id, &write) {
        Ok(()) => {
            log::debug!(
                "[WORKER] cache hit: copied insight from {} to {}",
                cached_cid,
                conversation_id
            );
            state.metrics.record_insight_cached();
            true
        }
        Err(e) => {
            log::error!("[WORKER] cached copy failed for {}: {}", conversation_id, e);
            false
        }
    }
}

fn write_skip(state: &AppState, conversation_id: &str, reason: &str) {
    let write = InsightWrite::Skipped {
        reason: reason.to_string(),
    };
    match state.db.put_insight(conversation_id, &write) {
        Ok(()) => state.metrics.record_insight_skipped(),
        Err(e) => log::error!("[WORKER] skip write failed for {}: {}", conversation_id, e),
    }
}
