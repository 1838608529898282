//! Pending-event storage for the dispatcher.
//!
//! Events sit in the outbox until the sink accepts them. Both stores are
//! bounded: when full, the oldest pending event is discarded to make room.

use std::collections::VecDeque;
use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::DispatchError;

use super::event::EventRecord;

pub trait Outbox: Send {
    /// Append an event. Returns how many older events were discarded.
    fn push(&mut self, event: EventRecord) -> Result<usize, DispatchError>;

    /// Oldest pending event with its outbox id.
    fn peek(&mut self) -> Result<Option<(u64, EventRecord)>, DispatchError>;

    /// Mark an event delivered.
    fn ack(&mut self, id: u64) -> Result<(), DispatchError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct InMemoryOutbox {
    capacity: usize,
    next_id: u64,
    events: VecDeque<(u64, EventRecord)>,
}

impl InMemoryOutbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_id: 1,
            events: VecDeque::new(),
        }
    }
}

impl Outbox for InMemoryOutbox {
    fn push(&mut self, event: EventRecord) -> Result<usize, DispatchError> {
        let mut dropped = 0;
        while self.events.len() >= self.capacity {
            self.events.pop_front();
            dropped += 1;
        }
        self.events.push_back((self.next_id, event));
        self.next_id += 1;
        Ok(dropped)
    }

    fn peek(&mut self) -> Result<Option<(u64, EventRecord)>, DispatchError> {
        Ok(self.events.front().cloned())
    }

    fn ack(&mut self, id: u64) -> Result<(), DispatchError> {
        if let Some(pos) = self.events.iter().position(|(event_id, _)| *event_id == id) {
            self.events.remove(pos);
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.events.len()
    }
}

/// SQLite-backed outbox; pending events survive restarts.
pub struct SqliteOutbox {
    conn: Connection,
    capacity: usize,
    len: usize,
}

impl SqliteOutbox {
    pub fn open(path: impl AsRef<Path>, capacity: usize) -> Result<Self, DispatchError> {
        let conn = Connection::open(path.as_ref()).map_err(sql_err)?;
        Self::with_connection(conn, capacity)
    }

    pub fn open_in_memory(capacity: usize) -> Result<Self, DispatchError> {
        let conn = Connection::open_in_memory().map_err(sql_err)?;
        Self::with_connection(conn, capacity)
    }

    fn with_connection(conn: Connection, capacity: usize) -> Result<Self, DispatchError> {
        ensure_schema(&conn)?;
        let len: i64 = conn
            .query_row("SELECT COUNT(*) FROM outbox", [], |row| row.get(0))
            .map_err(sql_err)?;
        let mut outbox = Self {
            conn,
            capacity: capacity.max(1),
            len: len as usize,
        };
        if outbox.len > outbox.capacity {
            let excess = outbox.len - outbox.capacity;
            outbox.drop_oldest(excess)?;
        }
        if outbox.len > 0 {
            log::info!("outbox: {} pending events from previous run", outbox.len);
        }
        Ok(outbox)
    }

    fn drop_oldest(&mut self, count: usize) -> Result<usize, DispatchError> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM outbox WHERE id IN (SELECT id FROM outbox ORDER BY id ASC LIMIT ?1)",
                params![count as i64],
            )
            .map_err(sql_err)?;
        self.len = self.len.saturating_sub(removed);
        Ok(removed)
    }
}

fn ensure_schema(conn: &Connection) -> Result<(), DispatchError> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS outbox (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            created_at INTEGER NOT NULL,
            event_json TEXT NOT NULL
        );
        "#,
    )
    .map_err(sql_err)
}

fn sql_err(err: rusqlite::Error) -> DispatchError {
    DispatchError(format!("outbox: {err}"))
}

impl Outbox for SqliteOutbox {
    fn push(&mut self, event: EventRecord) -> Result<usize, DispatchError> {
        let dropped = if self.len >= self.capacity {
            self.drop_oldest(self.len + 1 - self.capacity)?
        } else {
            0
        };
        let json = serde_json::to_string(&event)
            .map_err(|err| DispatchError(format!("outbox: encode event: {err}")))?;
        self.conn
            .execute(
                "INSERT INTO outbox (created_at, event_json) VALUES (?1, ?2)",
                params![event.timestamp_ms as i64, json],
            )
            .map_err(sql_err)?;
        self.len += 1;
        Ok(dropped)
    }

    fn peek(&mut self) -> Result<Option<(u64, EventRecord)>, DispatchError> {
        loop {
            let row: Option<(i64, String)> = self
                .conn
                .query_row(
                    "SELECT id, event_json FROM outbox ORDER BY id ASC LIMIT 1",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(sql_err)?;
            let Some((id, json)) = row else {
                return Ok(None);
            };
            match serde_json::from_str::<EventRecord>(&json) {
                Ok(event) => return Ok(Some((id as u64, event))),
                Err(err) => {
                    log::warn!("outbox: discarding unreadable event {}: {}", id, err);
                    self.ack(id as u64)?;
                }
            }
        }
    }

    fn ack(&mut self, id: u64) -> Result<(), DispatchError> {
        let removed = self
            .conn
            .execute("DELETE FROM outbox WHERE id = ?1", params![id as i64])
            .map_err(sql_err)?;
        self.len = self.len.saturating_sub(removed);
        Ok(())
    }

    fn len(&self) -> usize {
        self.len
    }
}
