//! SQLite-backed order store with an append-only audit trail.
//!
//! Records are keyed by client order id, with secondary indexes on venue
//! order id and symbol. Writes are idempotent with respect to the client
//! id; state changes append transitions instead of rewriting history.

use std::path::Path;
use std::sync::Mutex;

use bulwark_core::{ClientOrderId, OrderRecord, OrderStatus, OrderTransition};
use rusqlite::{params, Connection, OptionalExtension};

use crate::JournalResult;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS orders (
    client_order_id TEXT PRIMARY KEY,
    venue_order_id TEXT,
    symbol TEXT NOT NULL,
    status TEXT NOT NULL,
    payload TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_orders_venue_id ON orders(venue_order_id);
CREATE INDEX IF NOT EXISTS idx_orders_symbol ON orders(symbol);

CREATE TABLE IF NOT EXISTS transitions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    client_order_id TEXT NOT NULL,
    status TEXT NOT NULL,
    note TEXT,
    at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_transitions_client_id ON transitions(client_order_id);
"#;

/// Durable store of order records. A single connection serializes
/// concurrent updaters, which also serializes per-client-id writes.
pub struct OrderStore {
    conn: Mutex<Connection>,
}

impl OrderStore {
    /// Open (or create) the store at the given path.
    pub fn open(path: &Path) -> JournalResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory store, used by tests and the paper session.
    pub fn open_in_memory() -> JournalResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Upsert a record snapshot. The audit trail is not touched here; use
    /// [`OrderStore::append_transition`] for that.
    pub fn put(&self, record: &OrderRecord) -> JournalResult<()> {
        let mut snapshot = record.clone();
        snapshot.transitions.clear();
        let payload = serde_json::to_string(&snapshot)?;
        let status = serde_json::to_string(&record.status)?;
        let conn = self.conn.lock().expect("order store lock poisoned");
        conn.execute(
            r#"
            INSERT INTO orders (client_order_id, venue_order_id, symbol, status, payload)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(client_order_id) DO UPDATE SET
                venue_order_id = excluded.venue_order_id,
                status = excluded.status,
                payload = excluded.payload,
                updated_at = CURRENT_TIMESTAMP
            "#,
            params![
                record.client_order_id,
                record.venue_order_id,
                record.symbol,
                status,
                payload
            ],
        )?;
        Ok(())
    }

    /// Append one audit entry for an order. Earlier entries are never
    /// modified.
    pub fn append_transition(
        &self,
        client_order_id: &str,
        transition: &OrderTransition,
    ) -> JournalResult<()> {
        let status = serde_json::to_string(&transition.status)?;
        let conn = self.conn.lock().expect("order store lock poisoned");
        conn.execute(
            "INSERT INTO transitions (client_order_id, status, note, at) VALUES (?1, ?2, ?3, ?4)",
            params![
                client_order_id,
                status,
                transition.note,
                transition.at.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    /// Fetch a record by client order id, audit trail included.
    pub fn get_by_client_id(&self, client_order_id: &str) -> JournalResult<Option<OrderRecord>> {
        let conn = self.conn.lock().expect("order store lock poisoned");
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload FROM orders WHERE client_order_id = ?1",
                params![client_order_id],
                |row| row.get(0),
            )
            .optional()?;
        match payload {
            Some(json) => {
                let mut record: OrderRecord = serde_json::from_str(&json)?;
                record.transitions = load_transitions(&conn, client_order_id)?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Fetch a record by the venue-assigned order id.
    pub fn get_by_venue_id(&self, venue_order_id: &str) -> JournalResult<Option<OrderRecord>> {
        let client_id: Option<ClientOrderId> = {
            let conn = self.conn.lock().expect("order store lock poisoned");
            conn.query_row(
                "SELECT client_order_id FROM orders WHERE venue_order_id = ?1",
                params![venue_order_id],
                |row| row.get(0),
            )
            .optional()?
        };
        match client_id {
            Some(id) => self.get_by_client_id(&id),
            None => Ok(None),
        }
    }

    /// All records whose status is not terminal.
    pub fn list_in_flight(&self) -> JournalResult<Vec<OrderRecord>> {
        self.filtered(|record| !record.is_terminal())
    }

    /// All records touching a symbol, any status.
    pub fn list_for_symbol(&self, symbol: &str) -> JournalResult<Vec<OrderRecord>> {
        let ids: Vec<ClientOrderId> = {
            let conn = self.conn.lock().expect("order store lock poisoned");
            let mut stmt =
                conn.prepare("SELECT client_order_id FROM orders WHERE symbol = ?1")?;
            let rows = stmt.query_map(params![symbol], |row| row.get(0))?;
            rows.collect::<Result<_, _>>()?
        };
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.get_by_client_id(&id)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// All records currently in the given status.
    pub fn list_by_status(&self, status: OrderStatus) -> JournalResult<Vec<OrderRecord>> {
        self.filtered(|record| record.status == status)
    }

    /// Ordered audit trail for an order.
    pub fn transitions(&self, client_order_id: &str) -> JournalResult<Vec<OrderTransition>> {
        let conn = self.conn.lock().expect("order store lock poisoned");
        load_transitions(&conn, client_order_id)
    }

    /// Number of stored records.
    pub fn count(&self) -> JournalResult<usize> {
        let conn = self.conn.lock().expect("order store lock poisoned");
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM orders", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn filtered(&self, keep: impl Fn(&OrderRecord) -> bool) -> JournalResult<Vec<OrderRecord>> {
        let ids: Vec<ClientOrderId> = {
            let conn = self.conn.lock().expect("order store lock poisoned");
            let mut stmt = conn.prepare("SELECT client_order_id FROM orders")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<Result<_, _>>()?
        };
        let mut records = Vec::new();
        for id in ids {
            if let Some(record) = self.get_by_client_id(&id)? {
                if keep(&record) {
                    records.push(record);
                }
            }
        }
        Ok(records)
    }
}

fn load_transitions(
    conn: &Connection,
    client_order_id: &str,
) -> JournalResult<Vec<OrderTransition>> {
    let mut stmt = conn.prepare(
        "SELECT status, note, at FROM transitions WHERE client_order_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![client_order_id], |row| {
        let status: String = row.get(0)?;
        let note: Option<String> = row.get(1)?;
        let at: String = row.get(2)?;
        Ok((status, note, at))
    })?;
    let mut transitions = Vec::new();
    for row in rows {
        let (status, note, at) = row?;
        let status: OrderStatus = serde_json::from_str(&status)?;
        let at = chrono::DateTime::parse_from_rfc3339(&at)
            .map(|ts| ts.with_timezone(&chrono::Utc))
            .unwrap_or_else(|_| chrono::Utc::now());
        transitions.push(OrderTransition { status, at, note });
    }
    Ok(transitions)
}
