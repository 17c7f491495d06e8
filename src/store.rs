//! Authoritative record store
//!
//! SQLite-backed storage for transactions, events, journal entries,
//! rules, preferences, chat threads and operational logs. Owns the
//! enrichment-status field and the graph sync flag for every record.
//! Graph data is derived; everything here is the source of truth.

use crate::models::{
    ChatMessage, Clarification, EnrichmentStatus, Entry, Event, MessageRole, Rule, SimilarRecord,
    StoredMessage, Transaction,
};
use crate::Result;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::warn;
use uuid::Uuid;

//
// ================= Ingestion payloads =================
//

/// Raw transaction as produced by a bank adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTransaction {
    pub txn_id: String,
    pub user_id: String,
    pub merchant: String,
    pub amount: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
    pub date_posted: String,
}

fn default_currency() -> String {
    "USD".to_string()
}

/// Raw event as produced by a calendar adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEvent {
    pub event_id: String,
    pub user_id: String,
    pub summary: String,
    pub start_iso: String,
    #[serde(default)]
    pub end_iso: Option<String>,
    #[serde(default)]
    pub series_id: Option<String>,
}

/// Free-text journal entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEntry {
    pub user_id: String,
    pub entry_type: String,
    pub content: String,
}

/// One row of the mixed recent-activity feed
#[derive(Debug, Clone, Serialize)]
pub struct ActivityItem {
    pub kind: String,
    pub id: String,
    pub title: String,
    pub subtitle: String,
    pub timestamp: String,
}

//
// ================= Store =================
//

#[derive(Clone)]
pub struct RecordStore {
    pool: SqlitePool,
}

impl RecordStore {
    /// Connect to the given SQLite URL and initialize the schema.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// In-memory store for tests and demos. A single connection keeps
    /// every query on the same in-memory database.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS transactions (
                txn_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                merchant TEXT NOT NULL,
                amount REAL NOT NULL,
                currency TEXT NOT NULL DEFAULT 'USD',
                category TEXT,
                date_posted TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'PENDING',
                clarification_question TEXT,
                suggested_options TEXT,
                embedding BLOB,
                synced_to_graph INTEGER NOT NULL DEFAULT 0
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_txn_date ON transactions(date_posted)",
            "CREATE INDEX IF NOT EXISTS idx_txn_status ON transactions(status)",
            r#"
            CREATE TABLE IF NOT EXISTS events (
                event_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                summary TEXT NOT NULL,
                start_iso TEXT NOT NULL,
                end_iso TEXT,
                series_id TEXT,
                status TEXT NOT NULL DEFAULT 'PENDING',
                synced_to_graph INTEGER NOT NULL DEFAULT 0
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_event_start ON events(start_iso)",
            r#"
            CREATE TABLE IF NOT EXISTS entries (
                entry_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                entry_type TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'PENDING',
                synced_to_graph INTEGER NOT NULL DEFAULT 0
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS rules (
                user_id TEXT NOT NULL,
                pattern TEXT NOT NULL,
                category TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (user_id, pattern)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS preferences (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS threads (
                thread_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                summary TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id TEXT NOT NULL UNIQUE,
                thread_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY(thread_id) REFERENCES threads(thread_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                level TEXT NOT NULL,
                component TEXT NOT NULL,
                message TEXT NOT NULL,
                metadata TEXT
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_log_time ON logs(timestamp)",
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }

    //
    // ================= Ingestion (idempotent) =================
    //

    /// Idempotent insert keyed by the provider transaction id.
    /// Re-ingesting an already-enriched record refreshes domain fields
    /// without resetting its enrichment state.
    pub async fn upsert_transaction(&self, txn: &NewTransaction) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO transactions (txn_id, user_id, merchant, amount, currency, date_posted, status)
            VALUES (?, ?, ?, ?, ?, ?, 'PENDING')
            ON CONFLICT(txn_id) DO UPDATE SET
                merchant = excluded.merchant,
                amount = excluded.amount,
                currency = excluded.currency,
                date_posted = excluded.date_posted
            "#,
        )
        .bind(&txn.txn_id)
        .bind(&txn.user_id)
        .bind(&txn.merchant)
        .bind(txn.amount)
        .bind(&txn.currency)
        .bind(&txn.date_posted)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn upsert_event(&self, event: &NewEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO events (event_id, user_id, summary, start_iso, end_iso, series_id, status)
            VALUES (?, ?, ?, ?, ?, ?, 'PENDING')
            ON CONFLICT(event_id) DO UPDATE SET
                summary = excluded.summary,
                start_iso = excluded.start_iso,
                end_iso = excluded.end_iso,
                series_id = excluded.series_id
            "#,
        )
        .bind(&event.event_id)
        .bind(&event.user_id)
        .bind(&event.summary)
        .bind(&event.start_iso)
        .bind(&event.end_iso)
        .bind(&event.series_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Entries get a content-derived natural key so re-posting the same
    /// payload is a no-op. Returns the entry id.
    pub async fn add_entry(&self, entry: &NewEntry) -> Result<String> {
        let entry_id =
            crate::models::stable_key(&[&entry.user_id, &entry.entry_type, &entry.content]);

        sqlx::query(
            r#"
            INSERT INTO entries (entry_id, user_id, entry_type, content, created_at, status)
            VALUES (?, ?, ?, ?, datetime('now'), 'PENDING')
            ON CONFLICT(entry_id) DO NOTHING
            "#,
        )
        .bind(&entry_id)
        .bind(&entry.user_id)
        .bind(&entry.entry_type)
        .bind(&entry.content)
        .execute(&self.pool)
        .await?;

        Ok(entry_id)
    }

    //
    // ================= Record access =================
    //

    pub async fn get_transaction(&self, txn_id: &str) -> Result<Option<Transaction>> {
        let row = sqlx::query("SELECT * FROM transactions WHERE txn_id = ?")
            .bind(txn_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| txn_from_row(&r)).transpose()
    }

    pub async fn pending_transactions(&self) -> Result<Vec<Transaction>> {
        let rows = sqlx::query("SELECT * FROM transactions WHERE status = 'PENDING'")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(txn_from_row).collect()
    }

    pub async fn pending_events(&self) -> Result<Vec<Event>> {
        let rows = sqlx::query("SELECT * FROM events WHERE status = 'PENDING'")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(event_from_row).collect()
    }

    pub async fn needs_user_transactions(&self, user_id: &str) -> Result<Vec<Transaction>> {
        let rows =
            sqlx::query("SELECT * FROM transactions WHERE user_id = ? AND status = 'NEEDS_USER'")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?;

        rows.iter().map(txn_from_row).collect()
    }

    pub async fn all_transactions(&self) -> Result<Vec<Transaction>> {
        let rows = sqlx::query("SELECT * FROM transactions")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(txn_from_row).collect()
    }

    //
    // ================= Enrichment state =================
    //

    /// Flip a transaction to COMPLETE with the decided category.
    /// Clears any clarification payload. Returns false if no such record
    /// exists (a no-op, not an error).
    pub async fn set_transaction_complete(&self, txn_id: &str, category: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE transactions
            SET status = 'COMPLETE', category = ?,
                clarification_question = NULL, suggested_options = NULL
            WHERE txn_id = ?
            "#,
        )
        .bind(category)
        .bind(txn_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn set_transaction_needs_user(
        &self,
        txn_id: &str,
        category: Option<&str>,
        clarification: &Clarification,
    ) -> Result<bool> {
        let options = serde_json::to_string(&clarification.options)?;

        let result = sqlx::query(
            r#"
            UPDATE transactions
            SET status = 'NEEDS_USER', category = ?,
                clarification_question = ?, suggested_options = ?
            WHERE txn_id = ?
            "#,
        )
        .bind(category)
        .bind(&clarification.question)
        .bind(options)
        .bind(txn_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn set_event_complete(&self, event_id: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE events SET status = 'COMPLETE' WHERE event_id = ?")
            .bind(event_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Global reset: every record back to PENDING with the sync flag
    /// cleared, enabling a full idempotent re-run. Categories and
    /// clarifications are wiped so the PENDING ⇔ category-null invariant
    /// holds immediately after the reset.
    pub async fn reset_enrichment(&self) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE transactions
            SET status = 'PENDING', category = NULL, synced_to_graph = 0,
                clarification_question = NULL, suggested_options = NULL
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("UPDATE events SET status = 'PENDING', synced_to_graph = 0")
            .execute(&self.pool)
            .await?;

        sqlx::query("UPDATE entries SET status = 'PENDING', synced_to_graph = 0")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    //
    // ================= Embeddings & similarity =================
    //

    pub async fn store_embedding(&self, txn_id: &str, embedding: &[f32]) -> Result<()> {
        sqlx::query("UPDATE transactions SET embedding = ? WHERE txn_id = ?")
            .bind(encode_embedding(embedding))
            .bind(txn_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// K nearest already-labeled transactions by cosine similarity,
    /// scoped to the user. Used as few-shot context for classification.
    pub async fn find_similar(
        &self,
        user_id: &str,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<SimilarRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT merchant, category, embedding FROM transactions
            WHERE user_id = ? AND status = 'COMPLETE'
              AND category IS NOT NULL AND embedding IS NOT NULL
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut scored: Vec<SimilarRecord> = Vec::with_capacity(rows.len());
        for row in &rows {
            let merchant: String = row.try_get("merchant")?;
            let category: String = row.try_get("category")?;
            let blob: Vec<u8> = row.try_get("embedding")?;
            let candidate = decode_embedding(&blob);

            scored.push(SimilarRecord {
                merchant,
                category,
                similarity: cosine_similarity(query, &candidate),
            });
        }

        scored.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(k);
        Ok(scored)
    }

    //
    // ================= Graph sync flags =================
    //

    pub async fn unsynced_transactions(&self) -> Result<Vec<Transaction>> {
        let rows = sqlx::query("SELECT * FROM transactions WHERE synced_to_graph = 0")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(txn_from_row).collect()
    }

    pub async fn unsynced_events(&self) -> Result<Vec<Event>> {
        let rows = sqlx::query("SELECT * FROM events WHERE synced_to_graph = 0")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(event_from_row).collect()
    }

    pub async fn unsynced_entries(&self) -> Result<Vec<Entry>> {
        let rows = sqlx::query("SELECT * FROM entries WHERE synced_to_graph = 0")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(entry_from_row).collect()
    }

    pub async fn mark_transactions_synced(&self, ids: &[String]) -> Result<()> {
        self.mark_synced("transactions", "txn_id", ids).await
    }

    pub async fn mark_events_synced(&self, ids: &[String]) -> Result<()> {
        self.mark_synced("events", "event_id", ids).await
    }

    pub async fn mark_entries_synced(&self, ids: &[String]) -> Result<()> {
        self.mark_synced("entries", "entry_id", ids).await
    }

    async fn mark_synced(&self, table: &str, id_column: &str, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        // table/id_column are internal constants, never caller input
        let placeholders = vec!["?"; ids.len()].join(",");
        let sql = format!(
            "UPDATE {} SET synced_to_graph = 1 WHERE {} IN ({})",
            table, id_column, placeholders
        );

        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        query.execute(&self.pool).await?;

        Ok(())
    }

    //
    // ================= Rules =================
    //

    /// Insert or replace the rule keyed by (user, pattern), then
    /// retroactively re-label every matching transaction whose category
    /// differs. Both steps are individually idempotent; they are not
    /// atomic together (no cross-step transaction, each is re-runnable).
    /// Returns the number of records re-labeled.
    pub async fn add_rule(&self, user_id: &str, pattern: &str, category: &str) -> Result<u64> {
        sqlx::query(
            r#"
            INSERT INTO rules (user_id, pattern, category, created_at)
            VALUES (?, ?, ?, datetime('now'))
            ON CONFLICT(user_id, pattern) DO UPDATE SET category = excluded.category
            "#,
        )
        .bind(user_id)
        .bind(pattern)
        .bind(category)
        .execute(&self.pool)
        .await?;

        let result = sqlx::query(
            r#"
            UPDATE transactions
            SET category = ?, status = 'COMPLETE',
                clarification_question = NULL, suggested_options = NULL
            WHERE user_id = ? AND instr(lower(merchant), ?) > 0
              AND (category IS NULL OR category != ?)
            "#,
        )
        .bind(category)
        .bind(user_id)
        .bind(pattern.to_lowercase())
        .bind(category)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn rules_for_user(&self, user_id: &str) -> Result<Vec<Rule>> {
        let rows = sqlx::query("SELECT user_id, pattern, category FROM rules WHERE user_id = ?")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                Ok(Rule {
                    user_id: row.try_get("user_id")?,
                    pattern: row.try_get("pattern")?,
                    category: row.try_get("category")?,
                })
            })
            .collect()
    }

    //
    // ================= Preferences =================
    //

    pub async fn set_preference(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO preferences (key, value, updated_at) VALUES (?, ?, datetime('now'))
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = datetime('now')
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_preference(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM preferences WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.try_get("value")).transpose()?)
    }

    //
    // ================= Chat threads =================
    //

    pub async fn create_thread(&self, user_id: &str) -> Result<String> {
        let thread_id = Uuid::new_v4().to_string();

        sqlx::query(
            r#"
            INSERT INTO threads (thread_id, user_id, created_at, updated_at, is_active)
            VALUES (?, ?, datetime('now'), datetime('now'), 1)
            "#,
        )
        .bind(&thread_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(thread_id)
    }

    pub async fn save_message(
        &self,
        thread_id: &str,
        role: MessageRole,
        content: &str,
    ) -> Result<String> {
        let message_id = Uuid::new_v4().to_string();

        sqlx::query(
            r#"
            INSERT INTO messages (message_id, thread_id, role, content, created_at)
            VALUES (?, ?, ?, ?, datetime('now'))
            "#,
        )
        .bind(&message_id)
        .bind(thread_id)
        .bind(role.as_str())
        .bind(content)
        .execute(&self.pool)
        .await?;

        sqlx::query("UPDATE threads SET updated_at = datetime('now') WHERE thread_id = ?")
            .bind(thread_id)
            .execute(&self.pool)
            .await?;

        Ok(message_id)
    }

    pub async fn thread_messages(&self, thread_id: &str, limit: i64) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT message_id, thread_id, role, content, created_at
            FROM messages WHERE thread_id = ?
            ORDER BY seq ASC
            LIMIT ?
            "#,
        )
        .bind(thread_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let role: String = row.try_get("role")?;
                Ok(StoredMessage {
                    message_id: row.try_get("message_id")?,
                    thread_id: row.try_get("thread_id")?,
                    role: MessageRole::parse(&role),
                    content: row.try_get("content")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    /// Bounded recent history in the shape the router consumes.
    pub async fn thread_history(&self, thread_id: &str, limit: usize) -> Result<Vec<ChatMessage>> {
        let messages = self.thread_messages(thread_id, 200).await?;
        let skip = messages.len().saturating_sub(limit);

        Ok(messages
            .into_iter()
            .skip(skip)
            .map(|m| ChatMessage {
                role: m.role,
                content: m.content,
            })
            .collect())
    }

    pub async fn update_thread_summary(&self, thread_id: &str, summary: &str) -> Result<()> {
        sqlx::query(
            "UPDATE threads SET summary = ?, updated_at = datetime('now') WHERE thread_id = ?",
        )
        .bind(summary)
        .bind(thread_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn active_thread(&self, user_id: &str) -> Result<Option<String>> {
        let row = sqlx::query(
            r#"
            SELECT thread_id FROM threads
            WHERE user_id = ? AND is_active = 1
            ORDER BY updated_at DESC LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.try_get("thread_id")).transpose()?)
    }

    //
    // ================= Operational log =================
    //

    /// Persist an operational event. A logging failure is swallowed
    /// with a warning; it must never fail the calling batch.
    pub async fn log_event(&self, component: &str, message: &str, level: &str) {
        let result = sqlx::query(
            r#"
            INSERT INTO logs (timestamp, level, component, message)
            VALUES (datetime('now'), ?, ?, ?)
            "#,
        )
        .bind(level)
        .bind(component)
        .bind(message)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            warn!(component, "failed to persist log event: {}", e);
        }
    }

    //
    // ================= Activity feed =================
    //

    /// Mixed stream of recent transactions, events and entries,
    /// newest first.
    pub async fn recent_activity(&self, user_id: &str, limit: usize) -> Result<Vec<ActivityItem>> {
        let mut items = Vec::new();

        let txns = sqlx::query(
            r#"
            SELECT txn_id, merchant, amount, date_posted FROM transactions
            WHERE user_id = ? ORDER BY date_posted DESC LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        for row in &txns {
            let amount: f64 = row.try_get("amount")?;
            items.push(ActivityItem {
                kind: "transaction".to_string(),
                id: row.try_get("txn_id")?,
                title: row.try_get("merchant")?,
                subtitle: format!("{:.2}", amount),
                timestamp: row.try_get("date_posted")?,
            });
        }

        let events = sqlx::query(
            r#"
            SELECT event_id, summary, start_iso FROM events
            WHERE user_id = ? ORDER BY start_iso DESC LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        for row in &events {
            let start: String = row.try_get("start_iso")?;
            items.push(ActivityItem {
                kind: "event".to_string(),
                id: row.try_get("event_id")?,
                title: row.try_get("summary")?,
                subtitle: start.clone(),
                timestamp: start,
            });
        }

        let entries = sqlx::query(
            r#"
            SELECT entry_id, entry_type, content, created_at FROM entries
            WHERE user_id = ? ORDER BY created_at DESC LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        for row in &entries {
            items.push(ActivityItem {
                kind: "entry".to_string(),
                id: row.try_get("entry_id")?,
                title: row.try_get("content")?,
                subtitle: row.try_get("entry_type")?,
                timestamp: row.try_get("created_at")?,
            });
        }

        items.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        items.truncate(limit);
        Ok(items)
    }
}

//
// ================= Row mapping =================
//

fn txn_from_row(row: &SqliteRow) -> Result<Transaction> {
    let status: String = row.try_get("status")?;
    let question: Option<String> = row.try_get("clarification_question")?;
    let options_json: Option<String> = row.try_get("suggested_options")?;
    let embedding_blob: Option<Vec<u8>> = row.try_get("embedding")?;

    let clarification = match question {
        Some(question) => {
            let options = options_json
                .as_deref()
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or_default();
            Some(Clarification { question, options })
        }
        None => None,
    };

    Ok(Transaction {
        txn_id: row.try_get("txn_id")?,
        user_id: row.try_get("user_id")?,
        merchant: row.try_get("merchant")?,
        amount: row.try_get("amount")?,
        currency: row.try_get("currency")?,
        category: row.try_get("category")?,
        date_posted: row.try_get("date_posted")?,
        status: EnrichmentStatus::parse(&status),
        clarification,
        synced_to_graph: row.try_get("synced_to_graph")?,
        embedding: embedding_blob.map(|b| decode_embedding(&b)),
    })
}

fn event_from_row(row: &SqliteRow) -> Result<Event> {
    let status: String = row.try_get("status")?;

    Ok(Event {
        event_id: row.try_get("event_id")?,
        user_id: row.try_get("user_id")?,
        summary: row.try_get("summary")?,
        start_iso: row.try_get("start_iso")?,
        end_iso: row.try_get("end_iso")?,
        series_id: row.try_get("series_id")?,
        status: EnrichmentStatus::parse(&status),
        synced_to_graph: row.try_get("synced_to_graph")?,
    })
}

fn entry_from_row(row: &SqliteRow) -> Result<Entry> {
    let status: String = row.try_get("status")?;

    Ok(Entry {
        entry_id: row.try_get("entry_id")?,
        user_id: row.try_get("user_id")?,
        entry_type: row.try_get("entry_type")?,
        content: row.try_get("content")?,
        created_at: row.try_get("created_at")?,
        status: EnrichmentStatus::parse(&status),
        synced_to_graph: row.try_get("synced_to_graph")?,
    })
}

//
// ================= Embedding codec =================
//

pub fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn decode_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txn(id: &str, merchant: &str, amount: f64) -> NewTransaction {
        NewTransaction {
            txn_id: id.to_string(),
            user_id: "u1".to_string(),
            merchant: merchant.to_string(),
            amount,
            currency: "USD".to_string(),
            date_posted: "2026-08-01".to_string(),
        }
    }

    #[tokio::test]
    async fn test_upsert_transaction_is_idempotent() {
        let store = RecordStore::open_in_memory().await.unwrap();

        store.upsert_transaction(&txn("t1", "Uber", -15.5)).await.unwrap();
        store.upsert_transaction(&txn("t1", "Uber", -15.5)).await.unwrap();

        let all = store.all_transactions().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, EnrichmentStatus::Pending);
        assert!(all[0].category.is_none());
    }

    #[tokio::test]
    async fn test_reingest_preserves_enrichment_state() {
        let store = RecordStore::open_in_memory().await.unwrap();

        store.upsert_transaction(&txn("t1", "Uber", -15.5)).await.unwrap();
        store.set_transaction_complete("t1", "Transport").await.unwrap();

        // Same record arrives again from the bank adapter
        store.upsert_transaction(&txn("t1", "Uber", -15.5)).await.unwrap();

        let record = store.get_transaction("t1").await.unwrap().unwrap();
        assert_eq!(record.status, EnrichmentStatus::Complete);
        assert_eq!(record.category.as_deref(), Some("Transport"));
    }

    #[tokio::test]
    async fn test_rule_promotion_relabels_matching_records() {
        let store = RecordStore::open_in_memory().await.unwrap();

        store.upsert_transaction(&txn("t1", "Uber Eats", -22.0)).await.unwrap();
        store.set_transaction_complete("t1", "Shopping").await.unwrap();

        let relabeled = store.add_rule("u1", "uber", "Transport").await.unwrap();
        assert_eq!(relabeled, 1);

        let record = store.get_transaction("t1").await.unwrap().unwrap();
        assert_eq!(record.category.as_deref(), Some("Transport"));
        assert_eq!(record.status, EnrichmentStatus::Complete);

        // Second promotion of the same rule changes nothing
        let relabeled = store.add_rule("u1", "uber", "Transport").await.unwrap();
        assert_eq!(relabeled, 0);
    }

    #[tokio::test]
    async fn test_rule_promotion_scoped_to_user() {
        let store = RecordStore::open_in_memory().await.unwrap();

        let mut other = txn("t2", "Uber", -10.0);
        other.user_id = "u2".to_string();
        store.upsert_transaction(&other).await.unwrap();

        let relabeled = store.add_rule("u1", "uber", "Transport").await.unwrap();
        assert_eq!(relabeled, 0);
    }

    #[tokio::test]
    async fn test_reset_clears_category_and_sync_flag() {
        let store = RecordStore::open_in_memory().await.unwrap();

        store.upsert_transaction(&txn("t1", "Uber", -15.5)).await.unwrap();
        store.set_transaction_complete("t1", "Transport").await.unwrap();
        store
            .mark_transactions_synced(&["t1".to_string()])
            .await
            .unwrap();

        store.reset_enrichment().await.unwrap();

        let record = store.get_transaction("t1").await.unwrap().unwrap();
        assert_eq!(record.status, EnrichmentStatus::Pending);
        assert!(record.category.is_none());
        assert!(!record.synced_to_graph);
    }

    #[tokio::test]
    async fn test_needs_user_round_trip() {
        let store = RecordStore::open_in_memory().await.unwrap();

        store.upsert_transaction(&txn("t1", "ACME", -9.0)).await.unwrap();
        store
            .set_transaction_needs_user(
                "t1",
                Some("Shopping"),
                &Clarification {
                    question: "Is this groceries or household?".to_string(),
                    options: vec!["Groceries".to_string(), "Household".to_string()],
                },
            )
            .await
            .unwrap();

        let flagged = store.needs_user_transactions("u1").await.unwrap();
        assert_eq!(flagged.len(), 1);
        let clarification = flagged[0].clarification.as_ref().unwrap();
        assert_eq!(clarification.options.len(), 2);

        // Feedback completes the record and clears the clarification
        store.set_transaction_complete("t1", "Groceries").await.unwrap();
        let record = store.get_transaction("t1").await.unwrap().unwrap();
        assert!(record.clarification.is_none());
        assert_eq!(record.status, EnrichmentStatus::Complete);
    }

    #[tokio::test]
    async fn test_find_similar_orders_by_cosine() {
        let store = RecordStore::open_in_memory().await.unwrap();

        for (id, merchant, category, vector) in [
            ("t1", "Uber", "Transport", vec![1.0f32, 0.0, 0.0]),
            ("t2", "Whole Foods", "Groceries", vec![0.0f32, 1.0, 0.0]),
            ("t3", "Lyft", "Transport", vec![0.9f32, 0.1, 0.0]),
        ] {
            store.upsert_transaction(&txn(id, merchant, -10.0)).await.unwrap();
            store.set_transaction_complete(id, category).await.unwrap();
            store.store_embedding(id, &vector).await.unwrap();
        }

        let similar = store
            .find_similar("u1", &[1.0, 0.0, 0.0], 2)
            .await
            .unwrap();

        assert_eq!(similar.len(), 2);
        assert_eq!(similar[0].merchant, "Uber");
        assert_eq!(similar[1].merchant, "Lyft");
    }

    #[tokio::test]
    async fn test_embedding_codec_round_trip() {
        let vector = vec![0.25f32, -1.5, 3.75];
        assert_eq!(decode_embedding(&encode_embedding(&vector)), vector);
    }

    #[tokio::test]
    async fn test_thread_messages_and_history() {
        let store = RecordStore::open_in_memory().await.unwrap();

        let thread_id = store.create_thread("u1").await.unwrap();
        store
            .save_message(&thread_id, MessageRole::User, "How much on Food?")
            .await
            .unwrap();
        store
            .save_message(&thread_id, MessageRole::Assistant, "You spent $120.")
            .await
            .unwrap();

        let history = store.thread_history(&thread_id, 5).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, MessageRole::User);
        assert_eq!(history[1].role, MessageRole::Assistant);

        assert_eq!(
            store.active_thread("u1").await.unwrap().as_deref(),
            Some(thread_id.as_str())
        );
    }

    #[tokio::test]
    async fn test_messages_keep_insertion_order_within_one_second() {
        let store = RecordStore::open_in_memory().await.unwrap();
        let thread_id = store.create_thread("u1").await.unwrap();

        // All of these land on the same datetime('now') tick; the
        // sequence column, not the timestamp, must decide the order.
        for i in 0..10 {
            store
                .save_message(&thread_id, MessageRole::User, &format!("m{}", i))
                .await
                .unwrap();
        }

        let messages = store.thread_messages(&thread_id, 20).await.unwrap();
        let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        let expected: Vec<String> = (0..10).map(|i| format!("m{}", i)).collect();
        assert_eq!(contents, expected);
    }

    #[tokio::test]
    async fn test_preferences() {
        let store = RecordStore::open_in_memory().await.unwrap();

        assert!(store.get_preference("tone").await.unwrap().is_none());
        store.set_preference("tone", "casual").await.unwrap();
        store.set_preference("tone", "formal").await.unwrap();
        assert_eq!(
            store.get_preference("tone").await.unwrap().as_deref(),
            Some("formal")
        );
    }

    #[tokio::test]
    async fn test_entry_natural_key_is_stable() {
        let store = RecordStore::open_in_memory().await.unwrap();

        let entry = NewEntry {
            user_id: "u1".to_string(),
            entry_type: "thought".to_string(),
            content: "plan the trip".to_string(),
        };

        let first = store.add_entry(&entry).await.unwrap();
        let second = store.add_entry(&entry).await.unwrap();
        assert_eq!(first, second);

        let unsynced = store.unsynced_entries().await.unwrap();
        assert_eq!(unsynced.len(), 1);
    }
}
