//! The event log and its room indexes.

use std::collections::HashMap;

use braid_event::Event;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::StoreError;
use crate::pool::DbPool;
use crate::txn::{Delta, Txn};

/// The present-state entry for one `(type, state_key)` of a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateEntry {
    pub kind: String,
    pub state_key: String,
    pub event_id: String,
    pub event_idx: u64,
    pub depth: i64,
}

/// One forward extremity of a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadEntry {
    pub event_id: String,
    pub event_idx: u64,
    pub depth: i64,
}

/// Room metadata recorded from the room's create event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomInfo {
    pub room_id: String,
    pub version: String,
    pub creator: String,
    pub internal: bool,
    pub create_idx: u64,
}

/// Handle to the event log. Cheap to clone.
///
/// Every method checks out a pooled connection and blocks on SQLite.
#[derive(Clone)]
pub struct EventStore {
    pool: DbPool,
}

impl std::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStore")
            .field("max_size", &self.pool.max_size())
            .finish()
    }
}

impl EventStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Opens an empty write batch.
    ///
    /// `reserve_bytes` sizes the batch up front; `max_bytes` of zero leaves
    /// it unbounded.
    pub fn begin_transaction(&self, reserve_bytes: usize, max_bytes: usize) -> Txn {
        Txn::new(reserve_bytes, max_bytes)
    }

    /// Applies a batch atomically and durably. Returns the number of events
    /// written.
    ///
    /// An event already in the log keeps its row and position; the batch's
    /// other rows for it are written against that existing position.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if any row fails to apply; the database is then
    /// left exactly as it was before the call.
    pub fn commit(&self, txn: Txn) -> Result<usize, StoreError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let mut written = 0;
        let mut existing = HashMap::new();

        for delta in txn.deltas() {
            let changed = apply(&tx, delta, &existing)?;
            if let Delta::Event { idx, event_id, .. } = delta {
                if changed == 0 {
                    let at: i64 = tx.query_row(
                        "SELECT idx FROM events WHERE event_id = ?1",
                        [event_id],
                        |row| row.get(0),
                    )?;
                    existing.insert(*idx, to_idx(at));
                } else {
                    written += 1;
                }
            }
        }

        tx.commit()?;
        tracing::debug!(events = written, bytes = txn.bytes(), "write batch committed");
        Ok(written)
    }

    pub fn event_exists(&self, event_id: &str) -> Result<bool, StoreError> {
        let conn = self.pool.get()?;
        let exists = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM events WHERE event_id = ?1)",
            [event_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    pub fn get_event(&self, event_id: &str) -> Result<Option<Event>, StoreError> {
        let conn = self.pool.get()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT json FROM events WHERE event_id = ?1",
                [event_id],
                |row| row.get(0),
            )
            .optional()?;

        Ok(json.map(|json| Event::from_json(&json)).transpose()?)
    }

    /// Log position of a durable event.
    pub fn event_idx(&self, event_id: &str) -> Result<Option<u64>, StoreError> {
        let conn = self.pool.get()?;
        let idx: Option<i64> = conn
            .query_row(
                "SELECT idx FROM events WHERE event_id = ?1",
                [event_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(idx.map(to_idx))
    }

    /// Highest log position written so far, or zero for an empty log.
    pub fn max_event_idx(&self) -> Result<u64, StoreError> {
        let conn = self.pool.get()?;
        let idx: i64 = conn.query_row("SELECT COALESCE(MAX(idx), 0) FROM events", [], |row| {
            row.get(0)
        })?;
        Ok(to_idx(idx))
    }

    /// Event ids in log order, starting after `after`.
    pub fn events_since(&self, after: u64, limit: usize) -> Result<Vec<(u64, String)>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt =
            conn.prepare("SELECT idx, event_id FROM events WHERE idx > ?1 ORDER BY idx LIMIT ?2")?;
        let rows = stmt.query_map(params![from_idx(after), limit as i64], |row| {
            Ok((to_idx(row.get(0)?), row.get(1)?))
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn state_get(
        &self,
        room_id: &str,
        kind: &str,
        state_key: &str,
    ) -> Result<Option<StateEntry>, StoreError> {
        let conn = self.pool.get()?;
        let entry = conn
            .query_row(
                "SELECT type, state_key, event_id, event_idx, depth FROM room_state
                 WHERE room_id = ?1 AND type = ?2 AND state_key = ?3",
                params![room_id, kind, state_key],
                state_entry,
            )
            .optional()?;
        Ok(entry)
    }

    /// The full present state of a room, ordered by `(type, state_key)`.
    pub fn room_state(&self, room_id: &str) -> Result<Vec<StateEntry>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT type, state_key, event_id, event_idx, depth FROM room_state
             WHERE room_id = ?1 ORDER BY type, state_key",
        )?;
        let rows = stmt.query_map([room_id], state_entry)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Number of state events ever recorded for `(type, state_key)`.
    pub fn state_history_len(
        &self,
        room_id: &str,
        kind: &str,
        state_key: &str,
    ) -> Result<usize, StoreError> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM room_state_space
             WHERE room_id = ?1 AND type = ?2 AND state_key = ?3",
            params![room_id, kind, state_key],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// The room's forward extremities, deepest first.
    pub fn room_head(&self, room_id: &str) -> Result<Vec<HeadEntry>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT event_id, event_idx, depth FROM room_head
             WHERE room_id = ?1 ORDER BY depth DESC, event_idx DESC",
        )?;
        let rows = stmt.query_map([room_id], |row| {
            Ok(HeadEntry {
                event_id: row.get(0)?,
                event_idx: to_idx(row.get(1)?),
                depth: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn room_info(&self, room_id: &str) -> Result<Option<RoomInfo>, StoreError> {
        let conn = self.pool.get()?;
        let info = conn
            .query_row(
                "SELECT room_id, version, creator, internal, create_idx FROM rooms
                 WHERE room_id = ?1",
                [room_id],
                |row| {
                    Ok(RoomInfo {
                        room_id: row.get(0)?,
                        version: row.get(1)?,
                        creator: row.get(2)?,
                        internal: row.get::<_, i64>(3)? != 0,
                        create_idx: to_idx(row.get(4)?),
                    })
                },
            )
            .optional()?;
        Ok(info)
    }

    /// Current membership of a user in a room (`join`, `leave`, ...).
    pub fn membership(&self, room_id: &str, user_id: &str) -> Result<Option<String>, StoreError> {
        let conn = self.pool.get()?;
        let membership = conn
            .query_row(
                "SELECT membership FROM room_joined WHERE room_id = ?1 AND user_id = ?2",
                [room_id, user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(membership)
    }

    pub fn joined_members(&self, room_id: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT user_id FROM room_joined
             WHERE room_id = ?1 AND membership = 'join' ORDER BY user_id",
        )?;
        let rows = stmt.query_map([room_id], |row| row.get(0))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }
}

/// Applies one row, with staged positions of already-logged events mapped
/// to their existing ones. Returns the number of rows changed.
fn apply(conn: &Connection, delta: &Delta, existing: &HashMap<u64, u64>) -> rusqlite::Result<usize> {
    let at = |idx: &u64| from_idx(existing.get(idx).copied().unwrap_or(*idx));
    let changed = match delta {
        Delta::Event {
            idx,
            event_id,
            room_id,
            kind,
            sender,
            state_key,
            depth,
            json,
        } => conn.execute(
            "INSERT INTO events (idx, event_id, room_id, type, sender, state_key, depth, json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT (event_id) DO NOTHING",
            params![at(idx), event_id, room_id, kind, sender, state_key, depth, json],
        )?,
        Delta::Room {
            room_id,
            version,
            creator,
            internal,
            idx,
        } => conn.execute(
            "INSERT OR IGNORE INTO rooms (room_id, version, creator, internal, create_idx)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![room_id, version, creator, *internal as i64, at(idx)],
        )?,
        Delta::State {
            room_id,
            kind,
            state_key,
            event_id,
            idx,
            depth,
        } => conn.execute(
            "INSERT INTO room_state (room_id, type, state_key, event_id, event_idx, depth)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (room_id, type, state_key) DO UPDATE SET
                event_id = excluded.event_id,
                event_idx = excluded.event_idx,
                depth = excluded.depth
             WHERE excluded.depth >= room_state.depth",
            params![room_id, kind, state_key, event_id, at(idx), depth],
        )?,
        Delta::StateSpace {
            room_id,
            kind,
            state_key,
            depth,
            idx,
        } => conn.execute(
            "INSERT OR IGNORE INTO room_state_space (room_id, type, state_key, depth, event_idx)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![room_id, kind, state_key, depth, at(idx)],
        )?,
        Delta::HeadAdd {
            room_id,
            event_id,
            idx,
            depth,
        } => conn.execute(
            "INSERT OR REPLACE INTO room_head (room_id, event_id, event_idx, depth)
             VALUES (?1, ?2, ?3, ?4)",
            params![room_id, event_id, at(idx), depth],
        )?,
        Delta::HeadRemove { room_id, event_id } => conn.execute(
            "DELETE FROM room_head WHERE room_id = ?1 AND event_id = ?2",
            [room_id, event_id],
        )?,
        Delta::Joined {
            room_id,
            user_id,
            membership,
            idx,
        } => conn.execute(
            "INSERT OR REPLACE INTO room_joined (room_id, user_id, membership, event_idx)
             VALUES (?1, ?2, ?3, ?4)",
            params![room_id, user_id, membership, at(idx)],
        )?,
    };
    Ok(changed)
}

fn state_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<StateEntry> {
    Ok(StateEntry {
        kind: row.get(0)?,
        state_key: row.get(1)?,
        event_id: row.get(2)?,
        event_idx: to_idx(row.get(3)?),
        depth: row.get(4)?,
    })
}

// SQLite integers are signed; log positions never go negative.
fn to_idx(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn from_idx(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
