//! Cheap heuristic gate: only threads worth LLM spend proceed to analysis.

use crate::db::TweetRow;

/// Outcome of the pre-filter check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreFilterResult {
    Proceed,
    /// Skip with the tag persisted as the insight's skipped_reason.
    Skip(String),
}

/// Reject threads below the message-count or total-character thresholds.
pub fn pre_filter(
    tweets: &[TweetRow],
    min_messages: usize,
    min_total_chars: usize,
) -> PreFilterResult {
    let message_count = tweets.len();
    if message_count < min_messages {
        return PreFilterResult::Skip(format!(
            "message_count_{}_lt_{}",
            message_count, min_messages
        ));
    }
    let total_chars: usize = tweets.iter().map(|t| t.text.chars().count()).sum();
    if total_chars < min_total_chars {
        return PreFilterResult::Skip(format!("total_chars_{}_lt_{}", total_chars, min_total_chars));
    }
    PreFilterResult::Proceed
}
