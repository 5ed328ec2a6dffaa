//! Request store interface and its SQLite implementation.
//!
//! The store is the durable record of every submitted work item. It knows
//! nothing about slots being busy or free; it only keeps what the scheduler
//! and reconciler tell it.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use slotq_id::WorkItemId;
use thiserror::Error;
use tracing::debug;

use super::item::{WorkItem, WorkItemState};
use crate::slot::Slot;

/// Errors from request store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Work item not found: {0}")]
    NotFound(String),

    #[error("Invalid stored record: {0}")]
    Invalid(String),

    #[error("Request store is closed")]
    Closed,
}

/// Durable storage for work items.
///
/// Implementations only need to be `Send`: callers serialize access.
pub trait RequestStore: Send {
    /// Insert or update an item by its ID.
    fn save(&self, item: &WorkItem) -> Result<(), StoreError>;

    /// Fetch one item.
    fn get(&self, id: &WorkItemId) -> Result<Option<WorkItem>, StoreError>;

    /// Items in the given state, oldest first.
    fn find_by_state(&self, state: WorkItemState) -> Result<Vec<WorkItem>, StoreError>;

    /// All items, oldest first.
    fn list(&self) -> Result<Vec<WorkItem>, StoreError>;

    /// The item that has waited longest, if any.
    fn oldest_waiting(&self) -> Result<Option<WorkItem>, StoreError> {
        Ok(self
            .find_by_state(WorkItemState::Waiting)?
            .into_iter()
            .next())
    }

    fn count_by_state(&self, state: WorkItemState) -> Result<usize, StoreError> {
        Ok(self.find_by_state(state)?.len())
    }
}

const SELECT_COLUMNS: &str = "SELECT item_id, payload_path, collection_name, state, slot, created_at, last_state_change_at FROM work_items";

/// SQLite request store.
pub struct StateStore {
    conn: Connection,
}

impl StateStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self { conn };
        store.init_schema()?;

        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        // `seq` keeps insertion order for items created in the same millisecond.
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS work_items (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                item_id TEXT NOT NULL UNIQUE,
                payload_path TEXT NOT NULL,
                collection_name TEXT NOT NULL,
                state TEXT NOT NULL,
                slot INTEGER,
                created_at INTEGER NOT NULL,
                last_state_change_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_work_items_state ON work_items(state, created_at);
            "#,
        )?;

        debug!("Request store schema initialized");
        Ok(())
    }

    fn query_items(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, StoredRow::read)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(WorkItem::try_from).collect()
    }
}

impl RequestStore for StateStore {
    fn save(&self, item: &WorkItem) -> Result<(), StoreError> {
        self.conn.execute(
            r#"
            INSERT INTO work_items (item_id, payload_path, collection_name, state, slot, created_at, last_state_change_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(item_id) DO UPDATE SET
                payload_path = excluded.payload_path,
                collection_name = excluded.collection_name,
                state = excluded.state,
                slot = excluded.slot,
                last_state_change_at = excluded.last_state_change_at
            "#,
            params![
                item.id.to_string(),
                item.payload_path,
                item.collection_name,
                item.state.as_str(),
                item.slot.map(Slot::port),
                item.created_at.timestamp_millis(),
                item.last_state_change_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    fn get(&self, id: &WorkItemId) -> Result<Option<WorkItem>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(&format!("{SELECT_COLUMNS} WHERE item_id = ?1"))?;

        stmt.query_row(params![id.to_string()], StoredRow::read)
            .optional()?
            .map(WorkItem::try_from)
            .transpose()
    }

    fn find_by_state(&self, state: WorkItemState) -> Result<Vec<WorkItem>, StoreError> {
        self.query_items(
            &format!("{SELECT_COLUMNS} WHERE state = ?1 ORDER BY created_at, seq"),
            params![state.as_str()],
        )
    }

    fn list(&self) -> Result<Vec<WorkItem>, StoreError> {
        self.query_items(&format!("{SELECT_COLUMNS} ORDER BY created_at, seq"), [])
    }

    fn oldest_waiting(&self) -> Result<Option<WorkItem>, StoreError> {
        Ok(self
            .query_items(
                &format!("{SELECT_COLUMNS} WHERE state = ?1 ORDER BY created_at, seq LIMIT 1"),
                params![WorkItemState::Waiting.as_str()],
            )?
            .into_iter()
            .next())
    }

    fn count_by_state(&self, state: WorkItemState) -> Result<usize, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM work_items WHERE state = ?1",
            params![state.as_str()],
            |row| row.get(0),
        )?;
        usize::try_from(count).map_err(|_| StoreError::Invalid(format!("row count {count}")))
    }
}

/// Raw column values, validated when converted into a `WorkItem`.
struct StoredRow {
    item_id: String,
    payload_path: String,
    collection_name: String,
    state: String,
    slot: Option<i64>,
    created_at: i64,
    last_state_change_at: i64,
}

impl StoredRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            item_id: row.get(0)?,
            payload_path: row.get(1)?,
            collection_name: row.get(2)?,
            state: row.get(3)?,
            slot: row.get(4)?,
            created_at: row.get(5)?,
            last_state_change_at: row.get(6)?,
        })
    }
}

impl TryFrom<StoredRow> for WorkItem {
    type Error = StoreError;

    fn try_from(row: StoredRow) -> Result<Self, Self::Error> {
        let id = WorkItemId::parse(&row.item_id)
            .map_err(|e| StoreError::Invalid(format!("item id '{}': {e}", row.item_id)))?;
        let state = row
            .state
            .parse()
            .map_err(|e| StoreError::Invalid(format!("{id}: {e}")))?;
        let slot = row
            .slot
            .map(|port| {
                u16::try_from(port)
                    .ok()
                    .and_then(|port| Slot::new(port).ok())
                    .ok_or_else(|| StoreError::Invalid(format!("{id}: slot {port}")))
            })
            .transpose()?;

        Ok(WorkItem {
            id,
            payload_path: row.payload_path,
            collection_name: row.collection_name,
            state,
            slot,
            created_at: from_millis(row.created_at)?,
            last_state_change_at: from_millis(row.last_state_change_at)?,
        })
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Invalid(format!("timestamp {ms} out of range")))
}
