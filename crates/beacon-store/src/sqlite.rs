use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, instrument, warn};

use beacon_core::{EventRecord, RequestBlob, RequestId, RequestKind};

use crate::database::Database;
use crate::error::StoreError;
use crate::ledger::{AppendOutcome, EventStore, FlushOutcome, Peek, RequestLedger, StateStore};
use crate::row_helpers;

/// A raw ledger row before payload decoding.
struct RawRow {
    id: String,
    payload: String,
}

/// Production storage: requests, buffered events and state in one SQLite file.
#[derive(Clone)]
pub struct SqliteStorage {
    db: Database,
}

impl SqliteStorage {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self::new(Database::open(path)?))
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Ok(Self::new(Database::in_memory()?))
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

fn raw_requests(conn: &Connection) -> Result<Vec<RawRow>, StoreError> {
    let mut stmt = conn.prepare("SELECT id, payload FROM requests ORDER BY position")?;
    let rows = stmt.query_map([], |row| {
        Ok(RawRow {
            id: row.get(0)?,
            payload: row.get(1)?,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn decode(raw: &RawRow) -> Result<RequestBlob, StoreError> {
    row_helpers::parse_json(&raw.payload, "requests", "payload")
}

/// Decode every row; undecodable ones are skipped with a warning.
fn decoded_requests(conn: &Connection) -> Result<Vec<RequestBlob>, StoreError> {
    Ok(split_requests(conn)?.0)
}

/// Decoded blobs plus the tokens of rows that failed to decode.
fn split_requests(conn: &Connection) -> Result<(Vec<RequestBlob>, Vec<RequestId>), StoreError> {
    let mut blobs = Vec::new();
    let mut corrupt = Vec::new();
    for raw in raw_requests(conn)? {
        match decode(&raw) {
            Ok(blob) => blobs.push(blob),
            Err(e) => {
                warn!(request_id = %raw.id, error = %e, "skipping undecodable ledger row");
                corrupt.push(RequestId::from_raw(raw.id));
            }
        }
    }
    Ok((blobs, corrupt))
}

fn next_position(conn: &Connection, table: &str) -> Result<i64, StoreError> {
    let sql = format!("SELECT COALESCE(MAX(position), 0) + 1 FROM {table}");
    Ok(conn.query_row(&sql, [], |row| row.get(0))?)
}

fn count(conn: &Connection, table: &str) -> Result<usize, StoreError> {
    let sql = format!("SELECT COUNT(*) FROM {table}");
    let n: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
    Ok(n as usize)
}

fn insert_request(conn: &Connection, blob: &RequestBlob, position: i64) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO requests (id, position, kind, created_at, payload) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            blob.id.as_str(),
            position,
            blob.kind.as_str(),
            blob.created_at,
            serde_json::to_string(blob)?,
        ],
    )?;
    Ok(())
}

/// Evict oldest rows until one more fits under `capacity`, then insert.
fn append_bounded(conn: &Connection, blob: &RequestBlob, capacity: usize) -> Result<AppendOutcome, StoreError> {
    let mut outcome = AppendOutcome::default();
    let capacity = capacity.max(1);
    let len = count(conn, "requests")?;
    if len >= capacity {
        let excess = (len + 1 - capacity) as i64;
        let victims: Vec<RawRow> = {
            let mut stmt = conn.prepare("SELECT id, payload FROM requests ORDER BY position LIMIT ?1")?;
            let rows = stmt.query_map([excess], |row| {
                Ok(RawRow {
                    id: row.get(0)?,
                    payload: row.get(1)?,
                })
            })?;
            rows.collect::<Result<_, _>>()?
        };
        for raw in victims {
            conn.execute("DELETE FROM requests WHERE id = ?1", [&raw.id])?;
            match decode(&raw) {
                Ok(evicted) => outcome.evicted.push(evicted),
                Err(e) => {
                    warn!(request_id = %raw.id, error = %e, "evicted corrupt ledger row");
                    outcome.discarded.push(RequestId::from_raw(raw.id));
                }
            }
        }
    }
    let position = next_position(conn, "requests")?;
    insert_request(conn, blob, position)?;
    Ok(outcome)
}

impl RequestLedger for SqliteStorage {
    #[instrument(skip(self, blob), fields(request_id = %blob.id, kind = %blob.kind))]
    fn append(&self, blob: &RequestBlob, capacity: usize) -> Result<AppendOutcome, StoreError> {
        let outcome = self.db.with_tx(|conn| append_bounded(conn, blob, capacity))?;
        if !outcome.evicted.is_empty() {
            debug!(evicted = outcome.evicted.len(), "ledger at capacity, evicted oldest");
        }
        Ok(outcome)
    }

    #[instrument(skip(self), fields(request_id = %id))]
    fn remove(&self, id: &RequestId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute("DELETE FROM requests WHERE id = ?1", [id.as_str()])?;
            Ok(n > 0)
        })
    }

    fn peek(&self, sendable: &dyn Fn(&RequestBlob) -> bool) -> Result<Peek, StoreError> {
        self.db.with_tx(|conn| {
            let mut peek = Peek::default();
            for raw in raw_requests(conn)? {
                match decode(&raw) {
                    Ok(blob) => {
                        if sendable(&blob) {
                            peek.entry = Some(blob);
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(request_id = %raw.id, error = %e, "discarding corrupt ledger row");
                        conn.execute("DELETE FROM requests WHERE id = ?1", [&raw.id])?;
                        peek.discarded.push(RequestId::from_raw(raw.id));
                    }
                }
            }
            Ok(peek)
        })
    }

    fn remove_matching(&self, doomed: &dyn Fn(&RequestBlob) -> bool) -> Result<Vec<RequestBlob>, StoreError> {
        self.db.with_tx(|conn| {
            let mut removed = Vec::new();
            for blob in decoded_requests(conn)? {
                if doomed(&blob) {
                    conn.execute("DELETE FROM requests WHERE id = ?1", [blob.id.as_str()])?;
                    removed.push(blob);
                }
            }
            Ok(removed)
        })
    }

    #[instrument(skip_all, fields(state_entries = state.len()))]
    fn replace_all(
        &self,
        rewrite: &mut dyn FnMut(Vec<RequestBlob>) -> Vec<RequestBlob>,
        state: &[(String, String)],
    ) -> Result<Vec<RequestId>, StoreError> {
        self.db.with_tx(|conn| {
            let (current, corrupt) = split_requests(conn)?;
            let next = rewrite(current);
            conn.execute("DELETE FROM requests", [])?;
            for (i, blob) in next.iter().enumerate() {
                insert_request(conn, blob, i as i64 + 1)?;
            }
            for (key, value) in state {
                put_state(conn, key, value)?;
            }
            debug!(len = next.len(), discarded = corrupt.len(), "ledger rewritten");
            Ok(corrupt)
        })
    }

    fn len(&self) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| count(conn, "requests"))
    }

    fn contains_identity_change(&self) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM requests WHERE kind = ?1 LIMIT 1",
                    [RequestKind::IdentityChange.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    fn list(&self) -> Result<Vec<RequestBlob>, StoreError> {
        self.db.with_conn(decoded_requests)
    }
}

fn load_events(conn: &Connection) -> Result<Vec<EventRecord>, StoreError> {
    let mut stmt = conn.prepare("SELECT id, payload FROM event_records ORDER BY position")?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
    let mut out = Vec::new();
    for row in rows {
        let (id, payload) = row?;
        match row_helpers::parse_json::<EventRecord>(&payload, "event_records", "payload") {
            Ok(ev) => out.push(ev),
            Err(e) => warn!(event_id = %id, error = %e, "skipping corrupt buffered event"),
        }
    }
    Ok(out)
}

impl EventStore for SqliteStorage {
    #[instrument(skip(self, event), fields(event_key = %event.key))]
    fn push_event(&self, event: &EventRecord, capacity: usize) -> Result<Vec<EventRecord>, StoreError> {
        self.db.with_tx(|conn| {
            let capacity = capacity.max(1);
            let mut evicted = Vec::new();
            let len = count(conn, "event_records")?;
            if len >= capacity {
                let excess = len + 1 - capacity;
                let oldest = load_events(conn)?;
                let ids: Vec<String> = {
                    let mut stmt =
                        conn.prepare("SELECT id FROM event_records ORDER BY position LIMIT ?1")?;
                    let rows = stmt.query_map([excess as i64], |row| row.get(0))?;
                    rows.collect::<Result<_, _>>()?
                };
                for id in &ids {
                    conn.execute("DELETE FROM event_records WHERE id = ?1", [id])?;
                    if let Some(ev) = oldest.iter().find(|e| e.id.as_str() == id.as_str()) {
                        evicted.push(ev.clone());
                    }
                }
            }
            let position = next_position(conn, "event_records")?;
            conn.execute(
                "INSERT INTO event_records (id, position, payload) VALUES (?1, ?2, ?3)",
                params![event.id.as_str(), position, serde_json::to_string(event)?],
            )?;
            Ok(evicted)
        })
    }

    fn event_count(&self) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| count(conn, "event_records"))
    }

    fn list_events(&self) -> Result<Vec<EventRecord>, StoreError> {
        self.db.with_conn(load_events)
    }

    #[instrument(skip_all)]
    fn flush_events(
        &self,
        build: &mut dyn FnMut(&[EventRecord]) -> Option<RequestBlob>,
        ledger_capacity: usize,
    ) -> Result<FlushOutcome, StoreError> {
        self.db.with_tx(|conn| {
            let events = load_events(conn)?;
            if events.is_empty() {
                // Rows that failed to decode are dropped with the (empty) batch.
                conn.execute("DELETE FROM event_records", [])?;
                return Ok(FlushOutcome::default());
            }
            let Some(blob) = build(&events) else {
                return Ok(FlushOutcome::default());
            };
            let appended = append_bounded(conn, &blob, ledger_capacity)?;
            conn.execute("DELETE FROM event_records", [])?;
            Ok(FlushOutcome {
                blob: Some(blob),
                flushed_events: events.len(),
                evicted: appended.evicted,
                discarded: appended.discarded,
            })
        })
    }
}

fn put_state(conn: &Connection, key: &str, value: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO state (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

impl StateStore for SqliteStorage {
    fn get_state(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row("SELECT value FROM state WHERE key = ?1", [key], |row| {
                    row.get(0)
                })
                .optional()?)
        })
    }

    fn set_state(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| put_state(conn, key, value))
    }

    fn remove_state(&self, key: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM state WHERE key = ?1", [key])?;
            Ok(())
        })
    }
}
