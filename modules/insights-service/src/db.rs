//! SQLite thread store: conversations, tweets, insights, analysis cache.

use insights_types::{InsightFilter, InsightRecord, SentimentCounts, StoreStats, TopicCount};
use rusqlite::{Connection, OptionalExtension, Result as SqliteResult};
use std::sync::Mutex;

use crate::normalize::{NormalizedConversation, NormalizedMessage};

pub struct Db {
    conn: Mutex<Connection>,
}

/// One tweet as stored, in load_thread order.
#[derive(Debug, Clone)]
pub struct TweetRow {
    pub tweet_id: String,
    pub conversation_id: String,
    pub author_id: String,
    pub text: String,
    pub in_reply_to_id: Option<String>,
    pub inbound: Option<bool>,
    pub created_at: String,
}

/// Result of upserting one conversation payload.
#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub conversation_id: String,
    pub root_tweet_id: String,
    pub created: bool,
    pub message_count: usize,
}

/// Insight write payload. A row is either an analysis or a skip, never both.
#[derive(Debug, Clone)]
pub enum InsightWrite {
    Analyzed {
        llm_output: String,
        sentiment: String,
        topics: Vec<String>,
        gaps: Vec<String>,
        prompt_tokens: i64,
        completion_tokens: i64,
        cost_estimate: f64,
    },
    Skipped {
        reason: String,
    },
}

/// A stored insight row, as the analyzer reads it back (cache copies).
#[derive(Debug, Clone)]
pub struct StoredInsight {
    pub conversation_id: String,
    pub llm_output: Option<String>,
    pub sentiment: Option<String>,
    pub topics_json: Option<String>,
    pub gaps_json: Option<String>,
    pub skipped_reason: Option<String>,
}

/// Windowed aggregate over non-skipped insights.
#[derive(Debug)]
pub struct WindowAggregate {
    pub volume: i64,
    pub sentiment_counts: SentimentCounts,
    pub top_topics: Vec<TopicCount>,
    pub top_gaps: Vec<TopicCount>,
}

const TOP_K: usize = 20;

impl Db {
    pub fn open(path: &str) -> SqliteResult<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.create_tables()?;
        Ok(db)
    }

    fn create_tables(&self) -> SqliteResult<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                root_tweet_id TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS tweets (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                author_id TEXT NOT NULL,
                text TEXT NOT NULL,
                in_reply_to_id TEXT,
                inbound INTEGER,
                created_at TEXT NOT NULL,
                FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tweets_conversation ON tweets(conversation_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tweets_reply ON tweets(in_reply_to_id)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS insights (
                conversation_id TEXT PRIMARY KEY,
                llm_output TEXT,
                sentiment TEXT,
                topics TEXT,
                gaps TEXT,
                prompt_tokens INTEGER,
                completion_tokens INTEGER,
                cost_estimate REAL,
                skipped_reason TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_insights_created ON insights(created_at DESC)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_insights_sentiment ON insights(sentiment)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS analysis_cache (
                thread_hash TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
            )",
            [],
        )?;

        Ok(())
    }

    // =====================================================
    // Conversations and Tweets
    // =====================================================

    /// Upsert a batch of conversations in one transaction.
    ///
    /// Conversation identity is resolved per payload: a reply target already
    /// in the store wins, then a root_tweet_id match, else a new conversation
    /// is allocated with the earliest no-parent tweet as root.
    pub fn upsert_batch(
        &self,
        batch: &[NormalizedConversation],
    ) -> SqliteResult<Vec<UpsertOutcome>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let now = chrono::Utc::now().to_rfc3339();
        let mut outcomes = Vec::with_capacity(batch.len());
        for conv in batch {
            outcomes.push(upsert_one(&tx, conv, &now)?);
        }
        tx.commit()?;
        Ok(outcomes)
    }

    /// All tweets of a conversation ordered by (created_at, tweet_id).
    pub fn load_thread(&self, conversation_id: &str) -> SqliteResult<Vec<TweetRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, author_id, text, in_reply_to_id, inbound, created_at
             FROM tweets
             WHERE conversation_id = ?1
             ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt
            .query_map([conversation_id], row_to_tweet)?
            .collect::<SqliteResult<Vec<_>>>()?;
        Ok(rows)
    }

    // =====================================================
    // Insights
    // =====================================================

    /// Upsert the insight for a conversation. Re-analysis overwrites the
    /// fields; the row itself is never deleted.
    pub fn put_insight(&self, conversation_id: &str, write: &InsightWrite) -> SqliteResult<()> {
        let conn = self.conn.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        match write {
            InsightWrite::Analyzed {
                llm_output,
                sentiment,
                topics,
                gaps,
                prompt_tokens,
                completion_tokens,
                cost_estimate,
            } => {
                let topics_json = serde_json::to_string(topics).unwrap_or_else(|_| "[]".into());
                let gaps_json = serde_json::to_string(gaps).unwrap_or_else(|_| "[]".into());
                conn.execute(
                    "INSERT INTO insights (conversation_id, llm_output, sentiment, topics, gaps,
                        prompt_tokens, completion_tokens, cost_estimate, skipped_reason, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, ?9)
                     ON CONFLICT(conversation_id) DO UPDATE SET
                        llm_output = excluded.llm_output,
                        sentiment = excluded.sentiment,
                        topics = excluded.topics,
                        gaps = excluded.gaps,
                        prompt_tokens = excluded.prompt_tokens,
                        completion_tokens = excluded.completion_tokens,
                        cost_estimate = excluded.cost_estimate,
                        skipped_reason = NULL,
                        created_at = excluded.created_at",
                    rusqlite::params![
                        conversation_id,
                        llm_output,
                        sentiment,
                        topics_json,
                        gaps_json,
                        prompt_tokens,
                        completion_tokens,
                        cost_estimate,
                        now
                    ],
                )?;
            }
            InsightWrite::Skipped { reason } => {
                conn.execute(
                    "INSERT INTO insights (conversation_id, llm_output, sentiment, topics, gaps,
                        prompt_tokens, completion_tokens, cost_estimate, skipped_reason, created_at)
                     VALUES (?1, NULL, NULL, NULL, NULL, NULL, NULL, NULL, ?2, ?3)
                     ON CONFLICT(conversation_id) DO UPDATE SET
                        llm_output = NULL,
                        sentiment = NULL,
                        topics = NULL,
                        gaps = NULL,
                        prompt_tokens = NULL,
                        completion_tokens = NULL,
                        cost_estimate = NULL,
                        skipped_reason = excluded.skipped_reason,
                        created_at = excluded.created_at",
                    rusqlite::params![conversation_id, reason, now],
                )?;
            }
        }
        Ok(())
    }

    pub fn get_insight(&self, conversation_id: &str) -> SqliteResult<Option<StoredInsight>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT conversation_id, llm_output, sentiment, topics, gaps, skipped_reason
             FROM insights WHERE conversation_id = ?1",
            [conversation_id],
            |row| {
                Ok(StoredInsight {
                    conversation_id: row.get(0)?,
                    llm_output: row.get(1)?,
                    sentiment: row.get(2)?,
                    topics_json: row.get(3)?,
                    gaps_json: row.get(4)?,
                    skipped_reason: row.get(5)?,
                })
            },
        )
        .optional()
    }

    /// Filtered, paginated insight listing joined with conversation metadata.
    /// Total order: created_at DESC, conversation_id ASC.
    pub fn list_insights(
        &self,
        filter: &InsightFilter,
        limit: usize,
        offset: usize,
    ) -> SqliteResult<(Vec<InsightRecord>, i64)> {
        let conn = self.conn.lock().unwrap();
        let mut conditions = vec!["1=1".to_string()];
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        let mut param_idx = 1u32;

        if !filter.include_skipped {
            conditions.push("i.skipped_reason IS NULL".to_string());
        }
        if let Some(ref cid) = filter.conversation_id {
            conditions.push(format!("i.conversation_id = ?{}", param_idx));
            params.push(Box::new(cid.clone()));
            param_idx += 1;
        }
        if let Some(ref s) = filter.sentiment {
            conditions.push(format!("i.sentiment = ?{}", param_idx));
            params.push(Box::new(s.clone()));
            param_idx += 1;
        }
        if let Some(ref topic) = filter.topic {
            conditions.push(format!(
                "i.topics IS NOT NULL AND EXISTS (
                    SELECT 1 FROM json_each(i.topics) je WHERE je.value = ?{}
                )",
                param_idx
            ));
            params.push(Box::new(topic.clone()));
            param_idx += 1;
        }
        if let Some(ref from) = filter.date_from {
            conditions.push(format!("i.created_at >= ?{}", param_idx));
            params.push(Box::new(from.clone()));
            param_idx += 1;
        }
        if let Some(ref to) = filter.date_to {
            conditions.push(format!("i.created_at < ?{}", param_idx));
            params.push(Box::new(to.clone()));
            param_idx += 1;
        }
        let _ = param_idx;

        let where_clause = conditions.join(" AND ");
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM insights i WHERE {}", where_clause),
            param_refs.as_slice(),
            |row| row.get(0),
        )?;

        let sql = format!(
            "SELECT i.conversation_id, i.llm_output, i.sentiment, i.topics, i.gaps,
                    i.prompt_tokens, i.completion_tokens, i.cost_estimate, i.skipped_reason,
                    i.created_at, c.root_tweet_id,
                    (SELECT COUNT(*) FROM tweets t WHERE t.conversation_id = i.conversation_id)
             FROM insights i
             JOIN conversations c ON c.id = i.conversation_id
             WHERE {}
             ORDER BY i.created_at DESC, i.conversation_id ASC
             LIMIT {} OFFSET {}",
            where_clause, limit, offset
        );
        let mut stmt = conn.prepare(&sql)?;
        let items = stmt
            .query_map(param_refs.as_slice(), row_to_insight_record)?
            .collect::<SqliteResult<Vec<_>>>()?;
        Ok((items, total))
    }

    /// Counts over non-skipped insights created in the last `window_days`
    /// days, grouped by sentiment, plus top-K topics and gaps. Top-K order:
    /// count descending, value ascending.
    pub fn aggregate(&self, window_days: i64) -> SqliteResult<WindowAggregate> {
        let conn = self.conn.lock().unwrap();
        let since = (chrono::Utc::now() - chrono::Duration::days(window_days)).to_rfc3339();

        let volume: i64 = conn.query_row(
            "SELECT COUNT(*) FROM insights WHERE skipped_reason IS NULL AND created_at >= ?1",
            [&since],
            |row| row.get(0),
        )?;

        let mut sentiment_counts = SentimentCounts::default();
        {
            let mut stmt = conn.prepare(
                "SELECT sentiment, COUNT(*) FROM insights
                 WHERE skipped_reason IS NULL AND created_at >= ?1
                 GROUP BY sentiment",
            )?;
            let rows = stmt.query_map([&since], |row| {
                Ok((row.get::<_, Option<String>>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (sentiment, count) = row?;
                match sentiment.as_deref() {
                    Some("positive") => sentiment_counts.positive += count,
                    Some("neutral") => sentiment_counts.neutral += count,
                    Some("negative") => sentiment_counts.negative += count,
                    Some("mixed") => sentiment_counts.mixed += count,
                    _ => sentiment_counts.unknown += count,
                }
            }
        }

        let top_topics = top_values(&conn, "topics", &since)?;
        let top_gaps = top_values(&conn, "gaps", &since)?;

        Ok(WindowAggregate {
            volume,
            sentiment_counts,
            top_topics,
            top_gaps,
        })
    }

    // =====================================================
    // Analysis Cache
    // =====================================================

    pub fn cache_get(&self, thread_hash: &str) -> SqliteResult<Option<String>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT conversation_id FROM analysis_cache WHERE thread_hash = ?1",
            [thread_hash],
            |row| row.get(0),
        )
        .optional()
    }

    /// Idempotent: a duplicate thread_hash is a no-op.
    pub fn cache_put(&self, thread_hash: &str, conversation_id: &str) -> SqliteResult<()> {
        let conn = self.conn.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        conn.execute(
            "INSERT OR IGNORE INTO analysis_cache (thread_hash, conversation_id, created_at)
             VALUES (?1, ?2, ?3)",
            rusqlite::params![thread_hash, conversation_id, now],
        )?;
        Ok(())
    }

    // =====================================================
    // Recovery and Stats
    // =====================================================

    /// Conversations with no insight row, oldest first. Used by the
    /// boot-time rescan and the periodic recovery sweep.
    pub fn conversations_without_insight(&self, limit: usize) -> SqliteResult<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT c.id FROM conversations c
             LEFT JOIN insights i ON i.conversation_id = c.id
             WHERE i.conversation_id IS NULL
             ORDER BY c.created_at ASC, c.id ASC
             LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit as i64], |row| row.get(0))?
            .collect::<SqliteResult<Vec<String>>>()?;
        Ok(rows)
    }

    /// Backdate an insight row so window tests can build fixtures.
    #[cfg(test)]
    pub fn set_insight_created_at(&self, conversation_id: &str, created_at: &str) -> SqliteResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE insights SET created_at = ?1 WHERE conversation_id = ?2",
            rusqlite::params![created_at, conversation_id],
        )?;
        Ok(())
    }

    pub fn stats(&self) -> SqliteResult<StoreStats> {
        let conn = self.conn.lock().unwrap();
        let count = |sql: &str| -> SqliteResult<i64> { conn.query_row(sql, [], |row| row.get(0)) };
        Ok(StoreStats {
            conversations: count("SELECT COUNT(*) FROM conversations")?,
            tweets: count("SELECT COUNT(*) FROM tweets")?,
            insights: count("SELECT COUNT(*) FROM insights")?,
            pending: count(
                "SELECT COUNT(*) FROM conversations c
                 LEFT JOIN insights i ON i.conversation_id = c.id
                 WHERE i.conversation_id IS NULL",
            )?,
            cache_entries: count("SELECT COUNT(*) FROM analysis_cache")?,
        })
    }
}

fn upsert_one(
    tx: &rusqlite::Transaction,
    conv: &NormalizedConversation,
    now: &str,
) -> SqliteResult<UpsertOutcome> {
    // A reply pointing into an existing thread wins the identity resolution.
    let mut resolved: Option<(String, String)> = None;
    for m in &conv.messages {
        if let Some(ref parent) = m.in_reply_to_id {
            resolved = tx
                .query_row(
                    "SELECT c.id, c.root_tweet_id FROM tweets t
                     JOIN conversations c ON c.id = t.conversation_id
                     WHERE t.id = ?1",
                    [parent],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            if resolved.is_some() {
                break;
            }
        }
    }
    // Otherwise a submitted tweet that is some conversation's root.
    if resolved.is_none() {
        for m in &conv.messages {
            resolved = tx
                .query_row(
                    "SELECT id, root_tweet_id FROM conversations WHERE root_tweet_id = ?1",
                    [&m.tweet_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            if resolved.is_some() {
                break;
            }
        }
    }

    let (conversation_id, root_tweet_id, created) = match resolved {
        Some((id, root)) => (id, root, false),
        None => {
            let root = pick_root(&conv.messages);
            let id = uuid::Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO conversations (id, root_tweet_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)",
                rusqlite::params![id, root, now],
            )?;
            (id, root, true)
        }
    };

    for m in &conv.messages {
        tx.execute(
            "INSERT OR IGNORE INTO tweets (id, conversation_id, author_id, text, in_reply_to_id, inbound, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                m.tweet_id,
                conversation_id,
                m.author_id,
                m.text,
                m.in_reply_to_id,
                m.inbound,
                m.created_at
            ],
        )?;
    }
    tx.execute(
        "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
        rusqlite::params![now, conversation_id],
    )?;

    Ok(UpsertOutcome {
        conversation_id,
        root_tweet_id,
        created,
        message_count: conv.messages.len(),
    })
}

/// Earliest submitted tweet without a parent; ties by lexicographic
/// tweet_id. Cyclic payloads where every tweet has a parent fall back to
/// the earliest tweet overall.
fn pick_root(messages: &[NormalizedMessage]) -> String {
    let mut candidates: Vec<&NormalizedMessage> = messages
        .iter()
        .filter(|m| m.in_reply_to_id.is_none())
        .collect();
    if candidates.is_empty() {
        candidates = messages.iter().collect();
    }
    candidates.sort_by(|a, b| {
        (a.created_at.as_str(), a.tweet_id.as_str()).cmp(&(b.created_at.as_str(), b.tweet_id.as_str()))
    });
    candidates[0].tweet_id.clone()
}

/// Flatten a JSON-array column over the window and rank values by count.
fn top_values(conn: &Connection, column: &str, since: &str) -> SqliteResult<Vec<TopicCount>> {
    let sql = format!(
        "SELECT {} FROM insights
         WHERE skipped_reason IS NULL AND created_at >= ?1 AND {} IS NOT NULL",
        column, column
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([since], |row| row.get::<_, String>(0))?
        .collect::<SqliteResult<Vec<_>>>()?;

    let mut counts: std::collections::HashMap<String, i64> = std::collections::HashMap::new();
    for raw in rows {
        if let Ok(values) = serde_json::from_str::<Vec<String>>(&raw) {
            for v in values {
                *counts.entry(v).or_insert(0) += 1;
            }
        }
    }
    let mut ranked: Vec<TopicCount> = counts
        .into_iter()
        .map(|(value, count)| TopicCount { value, count })
        .collect();
    ranked.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.value.cmp(&b.value)));
    ranked.truncate(TOP_K);
    Ok(ranked)
}

// =====================================================
// Row Mapping Functions
// =====================================================

fn row_to_tweet(row: &rusqlite::Row) -> rusqlite::Result<TweetRow> {
    Ok(TweetRow {
        tweet_id: row.get(0)?,
        conversation_id: row.get(1)?,
        author_id: row.get(2)?,
        text: row.get(3)?,
        in_reply_to_id: row.get(4)?,
        inbound: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn row_to_insight_record(row: &rusqlite::Row) -> rusqlite::Result<InsightRecord> {
    let llm_output: Option<String> = row.get(1)?;
    let topics_json: Option<String> = row.get(3)?;
    let gaps_json: Option<String> = row.get(4)?;
    Ok(InsightRecord {
        conversation_id: row.get(0)?,
        llm_output: llm_output.and_then(|s| serde_json::from_str(&s).ok()),
        sentiment: row.get(2)?,
        topics: topics_json.and_then(|s| serde_json::from_str(&s).ok()),
        gaps: gaps_json.and_then(|s| serde_json::from_str(&s).ok()),
        prompt_tokens: row.get(5)?,
        completion_tokens: row.get(6)?,
        cost_estimate: row.get(7)?,
        skipped_reason: row.get(8)?,
        created_at: row.get(9)?,
        root_tweet_id: row.get(10)?,
        message_count: row.get(11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use insights_types::ConversationIn;

    fn conv(messages: Vec<(&str, Option<&str>, &str)>) -> NormalizedConversation {
        // (tweet_id, in_reply_to_id, created_at minute)
        crate::normalize::normalize_conversation(&ConversationIn {
            messages: messages
                .into_iter()
                .map(|(id, parent, minute)| insights_types::MessageIn {
                    tweet_id: id.to_string(),
                    author_id: "user".to_string(),
                    text: format!("text of {}", id),
                    in_reply_to_id: parent.map(|p| p.to_string()),
                    inbound: Some(true),
                    created_at: Some(format!("2024-01-15T10:{}:00Z", minute)),
                })
                .collect(),
        })
        .unwrap()
    }

    fn analyzed(sentiment: &str, topics: &[&str]) -> InsightWrite {
        InsightWrite::Analyzed {
            llm_output: "{\"summary\":\"s\"}".to_string(),
            sentiment: sentiment.to_string(),
            topics: topics.iter().map(|s| s.to_string()).collect(),
            gaps: vec![],
            prompt_tokens: 10,
            completion_tokens: 5,
            cost_estimate: 0.0,
        }
    }

    #[test]
    fn upsert_allocates_and_picks_root() {
        let db = Db::open(":memory:").unwrap();
        let out = db
            .upsert_batch(&[conv(vec![
                ("b", Some("a"), "05"),
                ("a", None, "01"),
            ])])
            .unwrap();
        assert_eq!(out.len(), 1);
        assert!(out[0].created);
        assert_eq!(out[0].root_tweet_id, "a");

        let thread = db.load_thread(&out[0].conversation_id).unwrap();
        assert_eq!(thread.len(), 2);
        assert_eq!(thread[0].tweet_id, "a");
        assert_eq!(thread[1].tweet_id, "b");
    }

    #[test]
    fn root_tie_breaks_lexicographically() {
        let db = Db::open(":memory:").unwrap();
        let out = db
            .upsert_batch(&[conv(vec![("z", None, "01"), ("a", None, "01")])])
            .unwrap();
        assert_eq!(out[0].root_tweet_id, "a");
    }

    #[test]
    fn reply_into_existing_thread_reuses_conversation() {
        let db = Db::open(":memory:").unwrap();
        let first = db.upsert_batch(&[conv(vec![("a", None, "01")])]).unwrap();
        let second = db
            .upsert_batch(&[conv(vec![("b", Some("a"), "02")])])
            .unwrap();
        assert!(!second[0].created);
        assert_eq!(second[0].conversation_id, first[0].conversation_id);
        assert_eq!(db.load_thread(&first[0].conversation_id).unwrap().len(), 2);
    }

    #[test]
    fn root_match_reuses_conversation() {
        let db = Db::open(":memory:").unwrap();
        let first = db.upsert_batch(&[conv(vec![("a", None, "01")])]).unwrap();
        // Re-submitting the root tweet alongside a new parentless message
        // matches on root_tweet_id, not on any reply link.
        let second = db
            .upsert_batch(&[conv(vec![("a", None, "01"), ("c", None, "03")])])
            .unwrap();
        assert!(!second[0].created);
        assert_eq!(second[0].conversation_id, first[0].conversation_id);
    }

    #[test]
    fn duplicate_tweet_insert_is_noop() {
        let db = Db::open(":memory:").unwrap();
        db.upsert_batch(&[conv(vec![("a", None, "01")])]).unwrap();
        db.upsert_batch(&[conv(vec![("a", None, "01")])]).unwrap();
        let stats = db.stats().unwrap();
        assert_eq!(stats.conversations, 1);
        assert_eq!(stats.tweets, 1);
    }

    #[test]
    fn cyclic_payload_still_gets_a_root() {
        let db = Db::open(":memory:").unwrap();
        let out = db
            .upsert_batch(&[conv(vec![
                ("x", Some("y"), "02"),
                ("y", Some("x"), "01"),
            ])])
            .unwrap();
        assert_eq!(out[0].root_tweet_id, "y");
    }

    #[test]
    fn insight_upsert_is_exclusive_between_output_and_skip() {
        let db = Db::open(":memory:").unwrap();
        let out = db.upsert_batch(&[conv(vec![("a", None, "01")])]).unwrap();
        let cid = &out[0].conversation_id;

        db.put_insight(cid, &InsightWrite::Skipped { reason: "empty_thread".into() })
            .unwrap();
        let row = db.get_insight(cid).unwrap().unwrap();
        assert!(row.llm_output.is_none());
        assert_eq!(row.skipped_reason.as_deref(), Some("empty_thread"));

        db.put_insight(cid, &analyzed("positive", &["billing"])).unwrap();
        let row = db.get_insight(cid).unwrap().unwrap();
        assert!(row.llm_output.is_some());
        assert!(row.skipped_reason.is_none());

        // Overwriting back to skipped clears the analysis fields.
        db.put_insight(cid, &InsightWrite::Skipped { reason: "llm_error:timeout".into() })
            .unwrap();
        let row = db.get_insight(cid).unwrap().unwrap();
        assert!(row.llm_output.is_none());
        assert!(row.sentiment.is_none());
    }

    #[test]
    fn list_insights_filters_and_pages() {
        let db = Db::open(":memory:").unwrap();
        let mut cids = Vec::new();
        for i in 0..5 {
            let tid = format!("t{}", i);
            let out = db
                .upsert_batch(&[conv(vec![(tid.as_str(), None, "01")])])
                .unwrap();
            cids.push(out[0].conversation_id.clone());
        }
        for (i, cid) in cids.iter().enumerate() {
            let sentiment = if i % 2 == 0 { "positive" } else { "negative" };
            db.put_insight(cid, &analyzed(sentiment, &["billing"])).unwrap();
        }

        let all = InsightFilter::default();
        let (items, total) = db.list_insights(&all, 100, 0).unwrap();
        assert_eq!(total, 5);
        assert_eq!(items.len(), 5);

        let positive = InsightFilter {
            sentiment: Some("positive".to_string()),
            ..Default::default()
        };
        let (items, total) = db.list_insights(&positive, 100, 0).unwrap();
        assert_eq!(total, 3);
        assert!(items.iter().all(|i| i.sentiment.as_deref() == Some("positive")));

        let by_topic = InsightFilter {
            topic: Some("billing".to_string()),
            ..Default::default()
        };
        let (_, total) = db.list_insights(&by_topic, 100, 0).unwrap();
        assert_eq!(total, 5);

        let no_topic = InsightFilter {
            topic: Some("bill".to_string()),
            ..Default::default()
        };
        let (_, total) = db.list_insights(&no_topic, 100, 0).unwrap();
        assert_eq!(total, 0, "topic filter is exact membership, not substring");

        // Paging covers every row exactly once under the total order.
        let (page1, _) = db.list_insights(&all, 2, 0).unwrap();
        let (page2, _) = db.list_insights(&all, 2, 2).unwrap();
        let (page3, _) = db.list_insights(&all, 2, 4).unwrap();
        let mut seen: Vec<String> = page1
            .iter()
            .chain(page2.iter())
            .chain(page3.iter())
            .map(|i| i.conversation_id.clone())
            .collect();
        assert_eq!(seen.len(), 5);
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 5);
    }

    #[test]
    fn skipped_rows_hidden_unless_requested() {
        let db = Db::open(":memory:").unwrap();
        let out = db.upsert_batch(&[conv(vec![("a", None, "01")])]).unwrap();
        db.put_insight(
            &out[0].conversation_id,
            &InsightWrite::Skipped { reason: "message_count_1_lt_2".into() },
        )
        .unwrap();

        let (_, total) = db.list_insights(&InsightFilter::default(), 100, 0).unwrap();
        assert_eq!(total, 0);

        let with_skipped = InsightFilter {
            include_skipped: true,
            ..Default::default()
        };
        let (items, total) = db.list_insights(&with_skipped, 100, 0).unwrap();
        assert_eq!(total, 1);
        assert_eq!(
            items[0].skipped_reason.as_deref(),
            Some("message_count_1_lt_2")
        );
    }

    #[test]
    fn aggregate_counts_and_ranks() {
        let db = Db::open(":memory:").unwrap();
        let mut cids = Vec::new();
        for i in 0..4 {
            let tid = format!("t{}", i);
            let out = db
                .upsert_batch(&[conv(vec![(tid.as_str(), None, "01")])])
                .unwrap();
            cids.push(out[0].conversation_id.clone());
        }
        db.put_insight(&cids[0], &analyzed("positive", &["billing", "delay"])).unwrap();
        db.put_insight(&cids[1], &analyzed("positive", &["billing"])).unwrap();
        db.put_insight(&cids[2], &analyzed("negative", &["refund"])).unwrap();
        db.put_insight(&cids[3], &InsightWrite::Skipped { reason: "x".into() })
            .unwrap();

        let agg = db.aggregate(1).unwrap();
        assert_eq!(agg.volume, 3);
        assert_eq!(agg.sentiment_counts.positive, 2);
        assert_eq!(agg.sentiment_counts.negative, 1);
        assert_eq!(agg.top_topics[0].value, "billing");
        assert_eq!(agg.top_topics[0].count, 2);
        // Tie between delay and refund breaks lexicographically.
        assert_eq!(agg.top_topics[1].value, "delay");
        assert_eq!(agg.top_topics[2].value, "refund");
    }

    #[test]
    fn aggregate_honors_the_window() {
        let db = Db::open(":memory:").unwrap();
        let mut cids = Vec::new();
        for i in 0..10 {
            let tid = format!("t{}", i);
            let out = db
                .upsert_batch(&[conv(vec![(tid.as_str(), None, "01")])])
                .unwrap();
            db.put_insight(&out[0].conversation_id, &analyzed("neutral", &["topic"]))
                .unwrap();
            cids.push(out[0].conversation_id.clone());
        }
        // Backdate half the fixture past the 1-day window (48h ago).
        let old = (chrono::Utc::now() - chrono::Duration::hours(48)).to_rfc3339();
        for cid in cids.iter().take(5) {
            db.set_insight_created_at(cid, &old).unwrap();
        }

        let day = db.aggregate(1).unwrap();
        assert_eq!(day.volume, 5);
        assert_eq!(day.sentiment_counts.neutral, 5);
        assert_eq!(day.top_topics[0].count, 5);

        let month = db.aggregate(30).unwrap();
        assert_eq!(month.volume, 10);
    }

    #[test]
    fn top_k_truncates_at_twenty() {
        let db = Db::open(":memory:").unwrap();
        let mut topics: Vec<String> = (0..25).map(|i| format!("topic{:02}", i)).collect();
        topics.sort();
        let out = db.upsert_batch(&[conv(vec![("a", None, "01")])]).unwrap();
        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        db.put_insight(&out[0].conversation_id, &analyzed("neutral", &topic_refs))
            .unwrap();

        let agg = db.aggregate(1).unwrap();
        assert_eq!(agg.top_topics.len(), 20);
        // All counts tie at 1, so the lexicographic tie-break decides the cut.
        assert_eq!(agg.top_topics[0].value, "topic00");
        assert_eq!(agg.top_topics[19].value, "topic19");
    }

    #[test]
    fn cache_roundtrip_and_idempotence() {
        let db = Db::open(":memory:").unwrap();
        let out = db.upsert_batch(&[conv(vec![("a", None, "01")])]).unwrap();
        let cid = &out[0].conversation_id;

        assert!(db.cache_get("h1").unwrap().is_none());
        db.cache_put("h1", cid).unwrap();
        assert_eq!(db.cache_get("h1").unwrap().as_deref(), Some(cid.as_str()));
        // Second put for the same hash is a no-op.
        db.cache_put("h1", "other").unwrap();
        assert_eq!(db.cache_get("h1").unwrap().as_deref(), Some(cid.as_str()));
    }

    #[test]
    fn recovery_scan_finds_pending_conversations() {
        let db = Db::open(":memory:").unwrap();
        let a = db.upsert_batch(&[conv(vec![("a", None, "01")])]).unwrap();
        let b = db.upsert_batch(&[conv(vec![("b", None, "02")])]).unwrap();
        db.put_insight(&a[0].conversation_id, &analyzed("neutral", &[])).unwrap();

        let pending = db.conversations_without_insight(100).unwrap();
        assert_eq!(pending, vec![b[0].conversation_id.clone()]);
    }
}
