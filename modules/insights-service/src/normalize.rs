//! Payload validation/normalization and the content-addressed thread hash.
//!
//! Normalization is idempotent: running it over already-normalized input
//! yields the same output. The thread hash depends only on the normalized
//! (author_id, text) tuples in canonical thread order.

use chrono::{DateTime, Utc};
use insights_types::{ConversationIn, MessageIn};
use sha2::{Digest, Sha256};

use crate::db::TweetRow;

/// Folded into the hash input so a future prompt-contract change can
/// invalidate the cache by bumping the tag.
const HASH_VERSION: &str = "v1";

/// A message after validation and normalization, ready for the store.
#[derive(Debug, Clone)]
pub struct NormalizedMessage {
    pub tweet_id: String,
    pub author_id: String,
    pub text: String,
    pub in_reply_to_id: Option<String>,
    pub inbound: Option<bool>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NormalizedConversation {
    pub messages: Vec<NormalizedMessage>,
}

/// Collapse any run of whitespace to a single space and trim the ends.
pub fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Validate and normalize one submitted conversation.
///
/// Rejects empty conversations, empty `tweet_id`/`author_id`/`text`, and
/// unparseable timestamps. Missing `created_at` defaults to now.
pub fn normalize_conversation(conv: &ConversationIn) -> Result<NormalizedConversation, String> {
    if conv.messages.is_empty() {
        return Err("conversation has no messages".to_string());
    }
    let now = Utc::now().to_rfc3339();
    let mut messages = Vec::with_capacity(conv.messages.len());
    for (i, m) in conv.messages.iter().enumerate() {
        messages.push(normalize_message(m, &now).map_err(|e| format!("message {}: {}", i, e))?);
    }
    Ok(NormalizedConversation { messages })
}

fn normalize_message(m: &MessageIn, now: &str) -> Result<NormalizedMessage, String> {
    let tweet_id = m.tweet_id.trim().to_string();
    if tweet_id.is_empty() {
        return Err("tweet_id is required".to_string());
    }
    let author_id = m.author_id.trim().to_string();
    if author_id.is_empty() {
        return Err("author_id is required".to_string());
    }
    let text = collapse_whitespace(&m.text);
    if text.is_empty() {
        return Err("text is empty".to_string());
    }
    let in_reply_to_id = m
        .in_reply_to_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let created_at = match m.created_at.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map_err(|_| format!("created_at '{}' is not RFC 3339", raw))?
            .with_timezone(&Utc)
            .to_rfc3339(),
        None => now.to_string(),
    };
    Ok(NormalizedMessage {
        tweet_id,
        author_id,
        text,
        in_reply_to_id,
        inbound: m.inbound,
        created_at,
    })
}

/// Render a loaded thread in canonical form: one `author\ttext` line per
/// tweet in store order, author lowercased. Used both as the hash input
/// and as the thread text shown to the LLM.
pub fn canonical_thread(tweets: &[TweetRow]) -> String {
    let mut out = String::new();
    for t in tweets {
        out.push_str(&t.author_id.to_lowercase());
        out.push('\t');
        out.push_str(&t.text);
        out.push('\n');
    }
    out
}

/// Hex SHA-256 over the version tag and the canonical rendering.
pub fn thread_hash(canonical: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(HASH_VERSION.as_bytes());
    hasher.update(b"\n");
    hasher.update(canonical.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(tweet_id: &str, text: &str) -> MessageIn {
        MessageIn {
            tweet_id: tweet_id.to_string(),
            author_id: "user".to_string(),
            text: text.to_string(),
            in_reply_to_id: None,
            inbound: None,
            created_at: Some("2024-01-15T10:00:00Z".to_string()),
        }
    }

    fn tweet(author: &str, text: &str) -> TweetRow {
        TweetRow {
            tweet_id: "t".to_string(),
            conversation_id: "c".to_string(),
            author_id: author.to_string(),
            text: text.to_string(),
            in_reply_to_id: None,
            inbound: None,
            created_at: "2024-01-15T10:00:00+00:00".to_string(),
        }
    }

    #[test]
    fn collapse_is_idempotent() {
        let raw = "  hello \t\n  world  ";
        let once = collapse_whitespace(raw);
        assert_eq!(once, "hello world");
        assert_eq!(collapse_whitespace(&once), once);
    }

    #[test]
    fn normalize_is_idempotent() {
        let conv = ConversationIn {
            messages: vec![msg("1", "  some \n text ")],
        };
        let first = normalize_conversation(&conv).unwrap();
        let again = ConversationIn {
            messages: vec![MessageIn {
                tweet_id: first.messages[0].tweet_id.clone(),
                author_id: first.messages[0].author_id.clone(),
                text: first.messages[0].text.clone(),
                in_reply_to_id: first.messages[0].in_reply_to_id.clone(),
                inbound: first.messages[0].inbound,
                created_at: Some(first.messages[0].created_at.clone()),
            }],
        };
        let second = normalize_conversation(&again).unwrap();
        assert_eq!(second.messages[0].text, first.messages[0].text);
        assert_eq!(second.messages[0].created_at, first.messages[0].created_at);
    }

    #[test]
    fn rejects_blank_fields() {
        let conv = ConversationIn { messages: vec![] };
        assert!(normalize_conversation(&conv).is_err());

        let conv = ConversationIn {
            messages: vec![msg("", "hi")],
        };
        assert!(normalize_conversation(&conv).is_err());

        let conv = ConversationIn {
            messages: vec![msg("1", "   \n  ")],
        };
        assert!(normalize_conversation(&conv).is_err());
    }

    #[test]
    fn rejects_bad_timestamp() {
        let mut m = msg("1", "hi");
        m.created_at = Some("Tue Oct 31 22:10:47 2017".to_string());
        let conv = ConversationIn { messages: vec![m] };
        assert!(normalize_conversation(&conv).is_err());
    }

    #[test]
    fn empty_reply_id_becomes_none() {
        let mut m = msg("1", "hi");
        m.in_reply_to_id = Some("  ".to_string());
        let conv = ConversationIn { messages: vec![m] };
        let norm = normalize_conversation(&conv).unwrap();
        assert!(norm.messages[0].in_reply_to_id.is_none());
    }

    #[test]
    fn hash_depends_only_on_author_and_text() {
        let a = vec![tweet("User", "hello  there"), tweet("brand", "hi")];
        let mut b = vec![tweet("user", "hello  there"), tweet("Brand", "hi")];
        b[0].tweet_id = "other".to_string();
        b[1].created_at = "2020-01-01T00:00:00+00:00".to_string();
        assert_eq!(
            thread_hash(&canonical_thread(&a)),
            thread_hash(&canonical_thread(&b))
        );
    }

    #[test]
    fn hash_changes_with_order() {
        let a = vec![tweet("u", "first"), tweet("u", "second")];
        let b = vec![tweet("u", "second"), tweet("u", "first")];
        assert_ne!(
            thread_hash(&canonical_thread(&a)),
            thread_hash(&canonical_thread(&b))
        );
    }
}
