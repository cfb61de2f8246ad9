//! Shared types for the conversation insights service and its API clients.

use serde::{Deserialize, Serialize};

// =====================================================
// Ingest Payloads
// =====================================================

/// A single message (tweet or reply) as submitted by a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageIn {
    pub tweet_id: String,
    pub author_id: String,
    pub text: String,
    #[serde(default)]
    pub in_reply_to_id: Option<String>,
    /// True = customer, false = brand/support, absent = unknown.
    #[serde(default)]
    pub inbound: Option<bool>,
    /// RFC 3339 timestamp; defaults to ingest time when absent.
    #[serde(default)]
    pub created_at: Option<String>,
}

/// One conversation: the root message plus replies, in any order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationIn {
    pub messages: Vec<MessageIn>,
}

/// Bulk ingest: an array of conversations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkConversationsIn {
    pub conversations: Vec<ConversationIn>,
}

// =====================================================
// Ingest Responses
// =====================================================

/// Outcome for one ingested conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestResult {
    pub conversation_id: String,
    pub root_tweet_id: String,
    pub message_count: usize,
    /// True when this request allocated the conversation (vs. extended it).
    pub created: bool,
    pub enqueued: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BulkIngestResponse {
    pub accepted: usize,
    pub rejected: usize,
    /// Number of items persisted but not enqueued (queue full).
    pub backpressure: usize,
    pub results: Vec<IngestResult>,
}

/// Per-line result emitted on the NDJSON stream ingest path.
#[derive(Debug, Serialize, Deserialize)]
pub struct StreamLineResult {
    pub line: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub result: Option<IngestResult>,
}

/// Terminal summary line for the stream ingest path.
#[derive(Debug, Serialize, Deserialize)]
pub struct StreamSummary {
    pub accepted: usize,
    pub rejected: usize,
    pub backpressure: usize,
}

// =====================================================
// Sentiment
// =====================================================

/// Normalized sentiment label extracted from LLM output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
    Mixed,
    Unknown,
}

impl Sentiment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sentiment::Positive => "positive",
            Sentiment::Neutral => "neutral",
            Sentiment::Negative => "negative",
            Sentiment::Mixed => "mixed",
            Sentiment::Unknown => "unknown",
        }
    }

    /// Parse a raw model-supplied label; anything unrecognized maps to Unknown.
    pub fn from_raw(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "positive" => Sentiment::Positive,
            "neutral" => Sentiment::Neutral,
            "negative" => Sentiment::Negative,
            "mixed" => Sentiment::Mixed,
            _ => Sentiment::Unknown,
        }
    }

    /// Strict parse for query filters: only the five permitted values.
    pub fn parse_filter(raw: &str) -> Option<Self> {
        match raw {
            "positive" => Some(Sentiment::Positive),
            "neutral" => Some(Sentiment::Neutral),
            "negative" => Some(Sentiment::Negative),
            "mixed" => Some(Sentiment::Mixed),
            "unknown" => Some(Sentiment::Unknown),
            _ => None,
        }
    }
}

// =====================================================
// Insights
// =====================================================

/// One derived insight, joined with conversation metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsightRecord {
    pub conversation_id: String,
    pub root_tweet_id: String,
    pub message_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_output: Option<serde_json::Value>,
    pub sentiment: Option<String>,
    pub topics: Option<Vec<String>>,
    pub gaps: Option<Vec<String>>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub cost_estimate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped_reason: Option<String>,
    pub created_at: String,
}

/// Filters for listing insights.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct InsightFilter {
    pub conversation_id: Option<String>,
    pub sentiment: Option<String>,
    /// Exact membership in the topics set.
    pub topic: Option<String>,
    /// RFC 3339 lower bound (inclusive) on insight created_at.
    pub date_from: Option<String>,
    /// RFC 3339 upper bound (exclusive).
    pub date_to: Option<String>,
    /// Include rows that were skipped rather than analyzed.
    pub include_skipped: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InsightsPage {
    pub items: Vec<InsightRecord>,
    pub total: i64,
    pub limit: usize,
    pub offset: usize,
}

// =====================================================
// Trends
// =====================================================

/// Counts of insights per normalized sentiment over a window.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentimentCounts {
    pub positive: i64,
    pub neutral: i64,
    pub negative: i64,
    pub mixed: i64,
    pub unknown: i64,
}

/// One entry of a top-K ranking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicCount {
    pub value: String,
    pub count: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TrendsResponse {
    pub window: String,
    /// Non-skipped insights created inside the window.
    pub volume: i64,
    pub sentiment_counts: SentimentCounts,
    pub top_topics: Vec<TopicCount>,
    pub top_gaps: Vec<TopicCount>,
}

// =====================================================
// Service Status
// =====================================================

/// Store-level row counts for the health endpoint.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StoreStats {
    pub conversations: i64,
    pub tweets: i64,
    pub insights: i64,
    /// Conversations still awaiting analysis.
    pub pending: i64,
    pub cache_entries: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub status: String,
    pub queue_depth: usize,
    pub process_id: u32,
    pub uptime_secs: u64,
    pub stats: StoreStats,
}

// =====================================================
// Error Body
// =====================================================

/// JSON error body for non-2xx responses.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            detail: None,
        }
    }

    pub fn with_detail(error: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            detail: Some(detail.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentiment_from_raw_normalizes() {
        assert_eq!(Sentiment::from_raw("Positive"), Sentiment::Positive);
        assert_eq!(Sentiment::from_raw(" NEGATIVE "), Sentiment::Negative);
        assert_eq!(Sentiment::from_raw("meh"), Sentiment::Unknown);
        assert_eq!(Sentiment::from_raw(""), Sentiment::Unknown);
    }

    #[test]
    fn sentiment_filter_is_strict() {
        assert_eq!(Sentiment::parse_filter("mixed"), Some(Sentiment::Mixed));
        assert_eq!(Sentiment::parse_filter("Mixed"), None);
        assert_eq!(Sentiment::parse_filter("angry"), None);
    }

    #[test]
    fn stream_line_result_flattens_ingest_fields() {
        let line = StreamLineResult {
            line: 3,
            error: None,
            result: Some(IngestResult {
                conversation_id: "c1".into(),
                root_tweet_id: "t1".into(),
                message_count: 2,
                created: true,
                enqueued: true,
            }),
        };
        let v = serde_json::to_value(&line).unwrap();
        assert_eq!(v["line"], 3);
        assert_eq!(v["conversation_id"], "c1");
        assert!(v.get("error").is_none());
    }
}
