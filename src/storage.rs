//! Single-table persistence for cards, valuation snapshots, and idempotency
//! tokens, plus the execution-record table.
//!
//! Layout mirrors a wide-column single-table design keyed by (pk, sk):
//!   Card     pk = USER#{subject}  sk = CARD#{cardId}
//!   Snapshot pk = USER#{subject}  sk = PRICE#{timestamp}#{cardId}
//!   Token    pk = USER#{subject}  sk = IDEMPOTENCY#{key}
//! Two partial indexes stand in for the BY_CREATED and BY_SET_RARITY
//! secondary indexes. Snapshot timestamps are rendered fixed-width so
//! lexicographic sk order is chronological order.

use crate::error::AppError;
use crate::models::{Card, ExecutionRecord, ExecutionState, Subject, ValuationSnapshot};
use anyhow::{Context, Result};
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -32000;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS items (
    pk TEXT NOT NULL,
    sk TEXT NOT NULL,
    entity TEXT NOT NULL,
    subject TEXT NOT NULL,
    card_id TEXT,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL,
    value_median REAL,
    set_rarity TEXT,
    token_status TEXT,
    expires_at INTEGER,
    PRIMARY KEY (pk, sk)
) WITHOUT ROWID;

-- BY_CREATED: per-subject card listing in creation order.
CREATE INDEX IF NOT EXISTS idx_items_by_created
    ON items(subject, created_at, sk) WHERE entity = 'CARD';

-- BY_SET_RARITY: analytics partition ordered by cached median value.
CREATE INDEX IF NOT EXISTS idx_items_by_set_rarity
    ON items(set_rarity, value_median DESC) WHERE entity = 'CARD';

CREATE INDEX IF NOT EXISTS idx_items_token_expiry
    ON items(expires_at) WHERE entity = 'TOKEN';

CREATE TABLE IF NOT EXISTS executions (
    execution_id TEXT PRIMARY KEY,
    card_id TEXT NOT NULL,
    subject TEXT NOT NULL,
    state TEXT NOT NULL,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    last_error TEXT
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_executions_subject
    ON executions(subject, started_at DESC);
"#;

/// Fixed-width RFC-3339 rendering (millisecond precision, Z suffix).
pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn card_pk(subject: &Subject) -> String {
    format!("USER#{}", subject.as_str())
}

fn card_sk(card_id: Uuid) -> String {
    format!("CARD#{card_id}")
}

fn snapshot_sk(timestamp: DateTime<Utc>, card_id: Uuid) -> String {
    format!("PRICE#{}#{card_id}", fmt_ts(timestamp))
}

fn token_sk(key: &str) -> String {
    format!("IDEMPOTENCY#{key}")
}

fn set_rarity_partition(card: &Card) -> Option<String> {
    match (&card.descriptors.set, &card.descriptors.rarity) {
        (Some(set), Some(rarity)) => Some(format!(
            "{}#{}",
            set.trim().to_lowercase(),
            rarity.trim().to_lowercase()
        )),
        _ => None,
    }
}

fn encode_cursor(created_at: &str, sk: &str) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(format!("{created_at}|{sk}"))
}

fn decode_cursor(cursor: &str) -> Result<(String, String), AppError> {
    let raw = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(cursor)
        .map_err(|_| AppError::Validation("malformed cursor".to_string()))?;
    let raw = String::from_utf8(raw)
        .map_err(|_| AppError::Validation("malformed cursor".to_string()))?;
    let (created_at, sk) = raw
        .split_once('|')
        .ok_or_else(|| AppError::Validation("malformed cursor".to_string()))?;
    Ok((created_at.to_string(), sk.to_string()))
}

/// Outcome of a conditional idempotency-token create.
#[derive(Debug, Clone)]
pub enum TokenBegin {
    /// The caller holds a fresh in-progress token.
    Created,
    /// Another request holds the token.
    InProgress,
    /// A completed token exists; replay the stored response verbatim.
    Completed { status: u16, body: String },
}

#[derive(serde::Serialize, serde::Deserialize)]
struct TokenPayload {
    operation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_body: Option<String>,
}

/// Single-table store shared across the gateway and the pipeline.
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn new(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open database at {db_path}"))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize database schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {journal_mode}");
        }

        info!(path = %db_path, "database initialized");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory database")?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize database schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ---- Cards -----------------------------------------------------------

    pub fn put_card(&self, card: &Card) -> Result<(), AppError> {
        let conn = self.conn.lock();
        let payload = serde_json::to_string(card)?;
        conn.execute(
            "INSERT INTO items (pk, sk, entity, subject, card_id, payload, created_at, value_median, set_rarity) \
             VALUES (?1, ?2, 'CARD', ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                card_pk(&card.subject),
                card_sk(card.card_id),
                card.subject.as_str(),
                card.card_id.to_string(),
                payload,
                fmt_ts(card.created_at),
                card.value_median,
                set_rarity_partition(card),
            ],
        )?;
        Ok(())
    }

    pub fn get_card(&self, subject: &Subject, card_id: Uuid) -> Result<Option<Card>, AppError> {
        let conn = self.conn.lock();
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload FROM items WHERE pk = ?1 AND sk = ?2 AND entity = 'CARD'",
                params![card_pk(subject), card_sk(card_id)],
                |row| row.get(0),
            )
            .optional()?;
        payload
            .map(|p| serde_json::from_str(&p).map_err(AppError::from))
            .transpose()
    }

    /// Owner-scoped listing in creation order (BY_CREATED).
    pub fn list_cards(
        &self,
        subject: &Subject,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<(Vec<Card>, Option<String>), AppError> {
        let conn = self.conn.lock();
        let (after_created, after_sk) = match cursor {
            Some(c) => decode_cursor(c)?,
            None => (String::new(), String::new()),
        };

        let mut stmt = conn.prepare_cached(
            "SELECT payload, created_at, sk FROM items \
             WHERE entity = 'CARD' AND subject = ?1 \
               AND (created_at > ?2 OR (created_at = ?2 AND sk > ?3)) \
             ORDER BY created_at, sk LIMIT ?4",
        )?;
        let rows: Vec<(String, String, String)> = stmt
            .query_map(
                params![subject.as_str(), after_created, after_sk, limit as i64 + 1],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?
            .filter_map(|r| r.ok())
            .collect();

        let next_cursor = if rows.len() > limit {
            rows.get(limit.saturating_sub(1))
                .map(|(_, created_at, sk)| encode_cursor(created_at, sk))
        } else {
            None
        };

        let cards = rows
            .into_iter()
            .take(limit)
            .filter_map(|(payload, _, _)| serde_json::from_str(&payload).ok())
            .collect();
        Ok((cards, next_cursor))
    }

    /// Owner-initiated edit; refreshes the indexed columns alongside payload.
    pub fn update_card(&self, card: &Card) -> Result<(), AppError> {
        let conn = self.conn.lock();
        let payload = serde_json::to_string(card)?;
        let changed = conn.execute(
            "UPDATE items SET payload = ?3, value_median = ?4, set_rarity = ?5 \
             WHERE pk = ?1 AND sk = ?2 AND entity = 'CARD'",
            params![
                card_pk(&card.subject),
                card_sk(card.card_id),
                payload,
                card.value_median,
                set_rarity_partition(card),
            ],
        )?;
        if changed == 0 {
            return Err(AppError::NotFound("card".to_string()));
        }
        Ok(())
    }

    pub fn delete_card(&self, subject: &Subject, card_id: Uuid) -> Result<bool, AppError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "DELETE FROM items WHERE pk = ?1 AND sk = ?2 AND entity = 'CARD'",
            params![card_pk(subject), card_sk(card_id)],
        )?;
        Ok(changed > 0)
    }

    /// Analytics partition: cards of a set/rarity ordered by cached median,
    /// scoped to the owning subject (BY_SET_RARITY).
    pub fn cards_by_set_rarity(
        &self,
        subject: &Subject,
        set: &str,
        rarity: &str,
        limit: usize,
    ) -> Result<Vec<Card>, AppError> {
        let conn = self.conn.lock();
        let partition = format!("{}#{}", set.trim().to_lowercase(), rarity.trim().to_lowercase());
        let mut stmt = conn.prepare_cached(
            "SELECT payload FROM items \
             WHERE entity = 'CARD' AND set_rarity = ?1 AND subject = ?2 \
             ORDER BY value_median DESC, sk LIMIT ?3",
        )?;
        let cards = stmt
            .query_map(params![partition, subject.as_str(), limit as i64], |row| {
                row.get::<_, String>(0)
            })?
            .filter_map(|r| r.ok())
            .filter_map(|p| serde_json::from_str(&p).ok())
            .collect();
        Ok(cards)
    }

    // ---- Snapshots -------------------------------------------------------

    /// Writes the immutable snapshot and the owning card's cached-latest
    /// fields in one atomic write group.
    pub fn write_snapshot_and_update_card(
        &self,
        snapshot: &ValuationSnapshot,
    ) -> Result<Card, AppError> {
        let conn = self.conn.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;
        let result = Self::write_snapshot_tx(&conn, snapshot);
        match result {
            Ok(card) => {
                conn.execute("COMMIT", [])?;
                Ok(card)
            }
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(e)
            }
        }
    }

    fn write_snapshot_tx(conn: &Connection, snapshot: &ValuationSnapshot) -> Result<Card, AppError> {
        let card_payload: Option<String> = conn
            .query_row(
                "SELECT payload FROM items WHERE pk = ?1 AND sk = ?2 AND entity = 'CARD'",
                params![card_pk(&snapshot.subject), card_sk(snapshot.card_id)],
                |row| row.get(0),
            )
            .optional()?;
        let mut card: Card = match card_payload {
            Some(p) => serde_json::from_str(&p)?,
            None => return Err(AppError::NotFound("card".to_string())),
        };

        let snapshot_payload = serde_json::to_string(snapshot)?;
        let inserted = conn.execute(
            "INSERT INTO items (pk, sk, entity, subject, card_id, payload, created_at) \
             VALUES (?1, ?2, 'SNAPSHOT', ?3, ?4, ?5, ?6) \
             ON CONFLICT (pk, sk) DO NOTHING",
            params![
                card_pk(&snapshot.subject),
                snapshot_sk(snapshot.timestamp, snapshot.card_id),
                snapshot.subject.as_str(),
                snapshot.card_id.to_string(),
                snapshot_payload,
                fmt_ts(snapshot.timestamp),
            ],
        )?;
        if inserted == 0 {
            // Snapshots are immutable; a key collision means a duplicate write.
            return Err(AppError::Conflict("snapshot already exists".to_string()));
        }

        card.value_low = snapshot.value_low;
        card.value_median = snapshot.value_median;
        card.value_high = snapshot.value_high;
        card.authenticity_score = Some(snapshot.authenticity_score);
        card.authenticity_signals = Some(snapshot.authenticity_signals);
        card.updated_at = snapshot.timestamp;

        let card_payload = serde_json::to_string(&card)?;
        conn.execute(
            "UPDATE items SET payload = ?3, value_median = ?4, set_rarity = ?5 \
             WHERE pk = ?1 AND sk = ?2 AND entity = 'CARD'",
            params![
                card_pk(&card.subject),
                card_sk(card.card_id),
                card_payload,
                card.value_median,
                set_rarity_partition(&card),
            ],
        )?;
        Ok(card)
    }

    /// Newest-first snapshot history for a card.
    pub fn list_snapshots(
        &self,
        subject: &Subject,
        card_id: Uuid,
        limit: usize,
        before: Option<&str>,
    ) -> Result<(Vec<ValuationSnapshot>, Option<String>), AppError> {
        let conn = self.conn.lock();
        let upper = match before {
            Some(cursor) => decode_cursor(cursor)?.1,
            None => format!("PRICE#\u{10FFFF}"),
        };
        let suffix = format!("%#{card_id}");

        let mut stmt = conn.prepare_cached(
            "SELECT payload, created_at, sk FROM items \
             WHERE entity = 'SNAPSHOT' AND pk = ?1 AND card_id = ?2 \
               AND sk LIKE ?3 AND sk < ?4 \
             ORDER BY sk DESC LIMIT ?5",
        )?;
        let rows: Vec<(String, String, String)> = stmt
            .query_map(
                params![
                    card_pk(subject),
                    card_id.to_string(),
                    suffix,
                    upper,
                    limit as i64 + 1
                ],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?
            .filter_map(|r| r.ok())
            .collect();

        let next_cursor = if rows.len() > limit {
            rows.get(limit.saturating_sub(1))
                .map(|(_, created_at, sk)| encode_cursor(created_at, sk))
        } else {
            None
        };

        let snapshots = rows
            .into_iter()
            .take(limit)
            .filter_map(|(payload, _, _)| serde_json::from_str(&payload).ok())
            .collect();
        Ok((snapshots, next_cursor))
    }

    pub fn latest_snapshot(
        &self,
        subject: &Subject,
        card_id: Uuid,
    ) -> Result<Option<ValuationSnapshot>, AppError> {
        let (mut snapshots, _) = self.list_snapshots(subject, card_id, 1, None)?;
        Ok(snapshots.pop())
    }

    // ---- Idempotency tokens ----------------------------------------------

    /// Conditional token create. Expired rows are treated as absent.
    pub fn try_begin_token(
        &self,
        subject: &Subject,
        key: &str,
        operation: &str,
        ttl_seconds: i64,
    ) -> Result<TokenBegin, AppError> {
        let conn = self.conn.lock();
        let now = Utc::now().timestamp();

        conn.execute(
            "DELETE FROM items WHERE pk = ?1 AND sk = ?2 AND entity = 'TOKEN' AND expires_at <= ?3",
            params![card_pk(subject), token_sk(key), now],
        )?;

        let payload = serde_json::to_string(&TokenPayload {
            operation: operation.to_string(),
            response_status: None,
            response_body: None,
        })?;
        let inserted = conn.execute(
            "INSERT INTO items (pk, sk, entity, subject, payload, created_at, token_status, expires_at) \
             VALUES (?1, ?2, 'TOKEN', ?3, ?4, ?5, 'in-progress', ?6) \
             ON CONFLICT (pk, sk) DO NOTHING",
            params![
                card_pk(subject),
                token_sk(key),
                subject.as_str(),
                payload,
                fmt_ts(Utc::now()),
                now + ttl_seconds,
            ],
        )?;
        if inserted == 1 {
            return Ok(TokenBegin::Created);
        }

        // Lost the race or a token already exists: inspect it.
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT token_status, payload FROM items \
                 WHERE pk = ?1 AND sk = ?2 AND entity = 'TOKEN'",
                params![card_pk(subject), token_sk(key)],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match row {
            Some((status, payload)) if status == "completed" => {
                let stored: TokenPayload = serde_json::from_str(&payload)?;
                Ok(TokenBegin::Completed {
                    status: stored.response_status.unwrap_or(200),
                    body: stored.response_body.unwrap_or_default(),
                })
            }
            Some(_) => Ok(TokenBegin::InProgress),
            // Deleted between insert and read; caller retries.
            None => Ok(TokenBegin::InProgress),
        }
    }

    /// Marks a token completed, storing the response for verbatim replay.
    pub fn complete_token(
        &self,
        subject: &Subject,
        key: &str,
        operation: &str,
        status: u16,
        body: &str,
    ) -> Result<(), AppError> {
        let conn = self.conn.lock();
        let payload = serde_json::to_string(&TokenPayload {
            operation: operation.to_string(),
            response_status: Some(status),
            response_body: Some(body.to_string()),
        })?;
        conn.execute(
            "UPDATE items SET token_status = 'completed', payload = ?3 \
             WHERE pk = ?1 AND sk = ?2 AND entity = 'TOKEN'",
            params![card_pk(subject), token_sk(key), payload],
        )?;
        Ok(())
    }

    /// Drops a placeholder so the caller may retry with the same key.
    pub fn delete_token(&self, subject: &Subject, key: &str) -> Result<(), AppError> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM items WHERE pk = ?1 AND sk = ?2 AND entity = 'TOKEN'",
            params![card_pk(subject), token_sk(key)],
        )?;
        Ok(())
    }

    /// Removes expired tokens. Run periodically from a background task.
    pub fn sweep_expired_tokens(&self) -> Result<usize, AppError> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM items WHERE entity = 'TOKEN' AND expires_at <= ?1",
            params![Utc::now().timestamp()],
        )?;
        Ok(deleted)
    }

    // ---- Execution records -----------------------------------------------

    pub fn put_execution(&self, record: &ExecutionRecord) -> Result<(), AppError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO executions (execution_id, card_id, subject, state, started_at, ended_at, last_error) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.execution_id.to_string(),
                record.card_id.to_string(),
                record.subject.as_str(),
                record.state.as_str(),
                fmt_ts(record.started_at),
                record.ended_at.map(fmt_ts),
                record.last_error,
            ],
        )?;
        Ok(())
    }

    pub fn update_execution(
        &self,
        execution_id: Uuid,
        state: ExecutionState,
        ended_at: Option<DateTime<Utc>>,
        last_error: Option<&str>,
    ) -> Result<(), AppError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE executions SET state = ?2, \
                 ended_at = COALESCE(?3, ended_at), \
                 last_error = COALESCE(?4, last_error) \
             WHERE execution_id = ?1",
            params![
                execution_id.to_string(),
                state.as_str(),
                ended_at.map(fmt_ts),
                last_error,
            ],
        )?;
        Ok(())
    }

    pub fn get_execution(
        &self,
        subject: &Subject,
        execution_id: Uuid,
    ) -> Result<Option<ExecutionRecord>, AppError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT execution_id, card_id, subject, state, started_at, ended_at, last_error \
             FROM executions WHERE execution_id = ?1 AND subject = ?2",
            params![execution_id.to_string(), subject.as_str()],
            |row| {
                Ok(ExecutionRecord {
                    execution_id: row
                        .get::<_, String>(0)?
                        .parse()
                        .unwrap_or_else(|_| Uuid::nil()),
                    card_id: row
                        .get::<_, String>(1)?
                        .parse()
                        .unwrap_or_else(|_| Uuid::nil()),
                    subject: Subject(row.get(2)?),
                    state: ExecutionState::parse(&row.get::<_, String>(3)?)
                        .unwrap_or(ExecutionState::Error),
                    started_at: row
                        .get::<_, String>(4)?
                        .parse()
                        .unwrap_or_else(|_| Utc::now()),
                    ended_at: row
                        .get::<_, Option<String>>(5)?
                        .and_then(|s| s.parse().ok()),
                    last_error: row.get(6)?,
                })
            },
        )
        .optional()
        .map_err(AppError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AuthenticitySignals, CardDescriptors};
    use chrono::Duration;

    fn signals() -> AuthenticitySignals {
        AuthenticitySignals {
            visual_hash_confidence: 0.9,
            text_match_confidence: 0.8,
            holo_pattern_confidence: 0.7,
            border_consistency: 0.85,
            font_validation: 0.75,
        }
    }

    fn card(subject: &str, name: &str) -> Card {
        Card::new(
            Subject(subject.to_string()),
            format!("uploads/{subject}/front.jpg"),
            None,
            CardDescriptors {
                name: Some(name.to_string()),
                set: Some("Base Set".to_string()),
                rarity: Some("Holo Rare".to_string()),
                ..Default::default()
            },
        )
    }

    fn snapshot(card: &Card, at: DateTime<Utc>, median: f64) -> ValuationSnapshot {
        ValuationSnapshot {
            subject: card.subject.clone(),
            card_id: card.card_id,
            timestamp: at,
            value_low: Some(median - 50.0),
            value_median: Some(median),
            value_high: Some(median + 100.0),
            comps_count: 12,
            window_days: 30,
            confidence: 0.6,
            authenticity_score: 0.92,
            authenticity_signals: signals(),
            sources: vec!["ebay".to_string()],
            rationale: Some("strong match".to_string()),
            degraded: false,
        }
    }

    #[test]
    fn card_round_trip() {
        let store = Store::in_memory().unwrap();
        let card = card("sub-a", "Charizard");
        store.put_card(&card).unwrap();

        let got = store.get_card(&card.subject, card.card_id).unwrap().unwrap();
        assert_eq!(got.card_id, card.card_id);
        assert_eq!(got.descriptors.name.as_deref(), Some("Charizard"));
    }

    #[test]
    fn cross_subject_lookup_is_none() {
        let store = Store::in_memory().unwrap();
        let card = card("sub-a", "Charizard");
        store.put_card(&card).unwrap();

        let other = Subject("sub-b".to_string());
        assert!(store.get_card(&other, card.card_id).unwrap().is_none());
    }

    #[test]
    fn list_cards_paginates_in_creation_order() {
        let store = Store::in_memory().unwrap();
        let subject = Subject("sub-a".to_string());
        for i in 0..5 {
            let mut c = card("sub-a", &format!("Card {i}"));
            c.created_at = Utc::now() + Duration::milliseconds(i);
            store.put_card(&c).unwrap();
        }

        let (page1, cursor) = store.list_cards(&subject, 3, None).unwrap();
        assert_eq!(page1.len(), 3);
        let cursor = cursor.expect("more pages");

        let (page2, cursor2) = store.list_cards(&subject, 3, Some(&cursor)).unwrap();
        assert_eq!(page2.len(), 2);
        assert!(cursor2.is_none());

        let mut names: Vec<_> = page1
            .iter()
            .chain(page2.iter())
            .filter_map(|c| c.descriptors.name.clone())
            .collect();
        names.sort();
        assert_eq!(names, vec!["Card 0", "Card 1", "Card 2", "Card 3", "Card 4"]);

        // First page precedes the second in creation order.
        assert!(page1.last().unwrap().created_at <= page2.first().unwrap().created_at);
    }

    #[test]
    fn snapshot_write_updates_card_cache_atomically() {
        let store = Store::in_memory().unwrap();
        let card = card("sub-a", "Charizard");
        store.put_card(&card).unwrap();

        let t1 = Utc::now();
        let updated = store
            .write_snapshot_and_update_card(&snapshot(&card, t1, 450.0))
            .unwrap();
        assert_eq!(updated.value_median, Some(450.0));
        assert_eq!(fmt_ts(updated.updated_at), fmt_ts(t1));

        let t2 = t1 + Duration::seconds(5);
        store
            .write_snapshot_and_update_card(&snapshot(&card, t2, 475.0))
            .unwrap();

        let cached = store.get_card(&card.subject, card.card_id).unwrap().unwrap();
        let latest = store
            .latest_snapshot(&card.subject, card.card_id)
            .unwrap()
            .unwrap();
        assert_eq!(cached.value_median, latest.value_median);
        assert_eq!(fmt_ts(cached.updated_at), fmt_ts(latest.timestamp));

        let (history, _) = store
            .list_snapshots(&card.subject, card.card_id, 10, None)
            .unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].timestamp > history[1].timestamp);
    }

    #[test]
    fn snapshot_write_missing_card_rolls_back() {
        let store = Store::in_memory().unwrap();
        let card = card("sub-a", "Charizard");
        // Card never stored.
        let err = store
            .write_snapshot_and_update_card(&snapshot(&card, Utc::now(), 450.0))
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        assert!(store
            .latest_snapshot(&card.subject, card.card_id)
            .unwrap()
            .is_none());
    }

    #[test]
    fn duplicate_snapshot_rejected() {
        let store = Store::in_memory().unwrap();
        let card = card("sub-a", "Charizard");
        store.put_card(&card).unwrap();
        let at = Utc::now();
        store
            .write_snapshot_and_update_card(&snapshot(&card, at, 450.0))
            .unwrap();
        let err = store
            .write_snapshot_and_update_card(&snapshot(&card, at, 999.0))
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[test]
    fn token_lifecycle_create_complete_replay() {
        let store = Store::in_memory().unwrap();
        let subject = Subject("sub-a".to_string());

        let begin = store
            .try_begin_token(&subject, "ik-1", "createCard", 600)
            .unwrap();
        assert!(matches!(begin, TokenBegin::Created));

        // Same key while in progress conflicts.
        let second = store
            .try_begin_token(&subject, "ik-1", "createCard", 600)
            .unwrap();
        assert!(matches!(second, TokenBegin::InProgress));

        store
            .complete_token(&subject, "ik-1", "createCard", 201, r#"{"cardId":"c-1"}"#)
            .unwrap();
        match store
            .try_begin_token(&subject, "ik-1", "createCard", 600)
            .unwrap()
        {
            TokenBegin::Completed { status, body } => {
                assert_eq!(status, 201);
                assert_eq!(body, r#"{"cardId":"c-1"}"#);
            }
            other => panic!("expected completed replay, got {other:?}"),
        }
    }

    #[test]
    fn token_keys_are_subject_scoped() {
        let store = Store::in_memory().unwrap();
        let a = Subject("sub-a".to_string());
        let b = Subject("sub-b".to_string());

        assert!(matches!(
            store.try_begin_token(&a, "ik-1", "createCard", 600).unwrap(),
            TokenBegin::Created
        ));
        // The same key under a different subject is independent.
        assert!(matches!(
            store.try_begin_token(&b, "ik-1", "createCard", 600).unwrap(),
            TokenBegin::Created
        ));
    }

    #[test]
    fn expired_token_treated_as_absent() {
        let store = Store::in_memory().unwrap();
        let subject = Subject("sub-a".to_string());

        assert!(matches!(
            store.try_begin_token(&subject, "ik-1", "revalue", -1).unwrap(),
            TokenBegin::Created
        ));
        // TTL already elapsed, so the next create wins.
        assert!(matches!(
            store.try_begin_token(&subject, "ik-1", "revalue", 600).unwrap(),
            TokenBegin::Created
        ));
    }

    #[test]
    fn deleted_token_allows_retry() {
        let store = Store::in_memory().unwrap();
        let subject = Subject("sub-a".to_string());
        store.try_begin_token(&subject, "ik-1", "createCard", 600).unwrap();
        store.delete_token(&subject, "ik-1").unwrap();
        assert!(matches!(
            store.try_begin_token(&subject, "ik-1", "createCard", 600).unwrap(),
            TokenBegin::Created
        ));
    }

    #[test]
    fn sweep_removes_expired_tokens_only() {
        let store = Store::in_memory().unwrap();
        let subject = Subject("sub-a".to_string());
        store.try_begin_token(&subject, "old", "createCard", -10).unwrap();
        store.try_begin_token(&subject, "new", "createCard", 600).unwrap();

        assert_eq!(store.sweep_expired_tokens().unwrap(), 1);
        assert!(matches!(
            store.try_begin_token(&subject, "new", "createCard", 600).unwrap(),
            TokenBegin::InProgress
        ));
    }

    #[test]
    fn execution_record_round_trip() {
        let store = Store::in_memory().unwrap();
        let subject = Subject("sub-a".to_string());
        let record = ExecutionRecord {
            execution_id: Uuid::new_v4(),
            card_id: Uuid::new_v4(),
            subject: subject.clone(),
            state: ExecutionState::Queued,
            started_at: Utc::now(),
            ended_at: None,
            last_error: None,
        };
        store.put_execution(&record).unwrap();

        store
            .update_execution(record.execution_id, ExecutionState::Done, Some(Utc::now()), None)
            .unwrap();

        let got = store
            .get_execution(&subject, record.execution_id)
            .unwrap()
            .unwrap();
        assert_eq!(got.state, ExecutionState::Done);
        assert!(got.ended_at.is_some());

        // Not visible to another subject.
        let other = Subject("sub-b".to_string());
        assert!(store
            .get_execution(&other, record.execution_id)
            .unwrap()
            .is_none());
    }

    #[test]
    fn set_rarity_partition_scoped_by_subject() {
        let store = Store::in_memory().unwrap();
        let mut a = card("sub-a", "Charizard");
        a.value_median = Some(450.0);
        let mut b = card("sub-b", "Charizard");
        b.value_median = Some(900.0);
        store.put_card(&a).unwrap();
        store.put_card(&b).unwrap();

        let got = store
            .cards_by_set_rarity(&a.subject, "Base Set", "Holo Rare", 10)
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].card_id, a.card_id);
    }
}
