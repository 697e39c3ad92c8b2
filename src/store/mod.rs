//! Trade Store
//!
//! SQLite-backed tick archive with idempotent writes and paged reads.
//! Writers tolerate duplicate and out-of-order delivery (reconnect replays,
//! overlapping backfills); readers page through history on a strict
//! `(trade_time, trade_id)` cursor so replay never skips or duplicates rows.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use tracing::{error, info};

use crate::models::{Millis, Side, Trade};
use crate::source::{SourceError, TradeHandler};

const TRADE_STORE_SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS instruments (
    instrument_id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS trades (
    instrument_id INTEGER NOT NULL,
    trade_id INTEGER NOT NULL,
    trade_time INTEGER NOT NULL,
    price REAL NOT NULL,
    quantity REAL NOT NULL,
    side TEXT NOT NULL,
    PRIMARY KEY (instrument_id, trade_id)
);

-- Primary replay index: instrument + time + id cursor order
CREATE INDEX IF NOT EXISTS idx_trades_replay
    ON trades(instrument_id, trade_time, trade_id);
"#;

/// One stored trade row. `trade_id` is unique per instrument and breaks
/// ties between rows sharing a `trade_time`.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeRow {
    pub trade_id: i64,
    pub time: Millis,
    pub price: f64,
    pub size: f64,
    pub side: Side,
}

impl TradeRow {
    pub fn to_trade(&self) -> Trade {
        Trade {
            time: self.time,
            price: self.price,
            size: self.size,
            side: self.side,
        }
    }
}

/// Persistent trade archive. Owns its connection; opened and closed
/// explicitly by the caller, never a process-wide singleton.
pub struct TradeStore {
    conn: Mutex<Connection>,
}

impl TradeStore {
    /// Open or create the store at the given path.
    pub fn open(db_path: &str) -> Result<Self> {
        let path = Path::new(db_path);
        if let Some(parent) = path.parent() {
            if !parent.exists() && !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open trade store: {}", db_path))?;
        conn.execute_batch(TRADE_STORE_SCHEMA)?;

        info!(path = %db_path, "Trade store opened");

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory store (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(TRADE_STORE_SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Get or create the numeric id for a symbol.
    pub fn instrument_id(&self, symbol: &str) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO instruments (symbol) VALUES (?1)",
            params![symbol],
        )?;
        let id = conn.query_row(
            "SELECT instrument_id FROM instruments WHERE symbol = ?1",
            params![symbol],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Insert a batch of rows in one transaction. Idempotent: rows whose
    /// `trade_id` already exists are ignored. Returns the number of rows
    /// actually inserted.
    pub fn insert_trades(&self, instrument_id: i64, rows: &[TradeRow]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }

        let conn = self.conn.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;

        let mut inserted = 0;
        let result: Result<()> = (|| {
            let mut stmt = conn.prepare_cached(
                r#"
                INSERT OR IGNORE INTO trades
                    (instrument_id, trade_id, trade_time, price, quantity, side)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
            )?;
            for row in rows {
                inserted += stmt.execute(params![
                    instrument_id,
                    row.trade_id,
                    row.time,
                    row.price,
                    row.size,
                    row.side.as_str(),
                ])?;
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                conn.execute("COMMIT", [])?;
                Ok(inserted)
            }
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(e)
            }
        }
    }

    /// Fetch up to `limit` rows strictly after the `(trade_time, trade_id)`
    /// cursor and before `before`, ascending in cursor order.
    ///
    /// The strict row-value comparison is what makes paging exact: re-running
    /// with the last row of the previous page as the cursor never skips and
    /// never duplicates, even while writers append concurrently.
    pub fn fetch_after(
        &self,
        instrument_id: i64,
        after: (Millis, i64),
        before: Millis,
        limit: usize,
    ) -> Result<Vec<TradeRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            r#"
            SELECT trade_id, trade_time, price, quantity, side
            FROM trades
            WHERE instrument_id = ?1
              AND (trade_time, trade_id) > (?2, ?3)
              AND trade_time < ?4
            ORDER BY trade_time ASC, trade_id ASC
            LIMIT ?5
            "#,
        )?;

        let rows = stmt
            .query_map(
                params![instrument_id, after.0, after.1, before, limit as i64],
                |row| {
                    let side_str: String = row.get(4)?;
                    Ok(TradeRow {
                        trade_id: row.get(0)?,
                        time: row.get(1)?,
                        price: row.get(2)?,
                        size: row.get(3)?,
                        side: Side::from_wire(&side_str).unwrap_or(Side::Buy),
                    })
                },
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows)
    }

    /// Number of stored rows for an instrument.
    pub fn trade_count(&self, instrument_id: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM trades WHERE instrument_id = ?1",
            params![instrument_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Stored time coverage `(min, max)` for an instrument, if any rows exist.
    pub fn time_coverage(&self, instrument_id: i64) -> Result<Option<(Millis, Millis)>> {
        let conn = self.conn.lock();
        let (min, max): (Option<i64>, Option<i64>) = conn.query_row(
            "SELECT MIN(trade_time), MAX(trade_time) FROM trades WHERE instrument_id = ?1",
            params![instrument_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(match (min, max) {
            (Some(min), Some(max)) => Some((min, max)),
            _ => None,
        })
    }
}

/// Trade handler that records every live batch into the store.
///
/// Live prints carry no venue trade id, so a content-derived id is
/// synthesized; re-delivery of the same print after a reconnect hashes to
/// the same id and is absorbed by the store's idempotent upsert.
pub struct RecordingHandler {
    store: Arc<TradeStore>,
    instrument_id: i64,
    recorded: u64,
}

impl RecordingHandler {
    pub fn new(store: Arc<TradeStore>, instrument_id: i64) -> Self {
        Self {
            store,
            instrument_id,
            recorded: 0,
        }
    }

    pub fn recorded(&self) -> u64 {
        self.recorded
    }

    fn rows_for(batch: &[Trade]) -> Vec<TradeRow> {
        batch
            .iter()
            .enumerate()
            .map(|(idx, trade)| {
                // Disambiguate identical prints within one batch by index.
                let occurrence = batch[..idx]
                    .iter()
                    .filter(|prev| *prev == trade)
                    .count() as u64;
                TradeRow {
                    trade_id: synthetic_trade_id(trade, occurrence),
                    time: trade.time,
                    price: trade.price,
                    size: trade.size,
                    side: trade.side,
                }
            })
            .collect()
    }
}

#[async_trait]
impl TradeHandler for RecordingHandler {
    async fn on_trades(&mut self, batch: &[Trade]) -> Result<(), SourceError> {
        let rows = Self::rows_for(batch);
        match self.store.insert_trades(self.instrument_id, &rows) {
            Ok(inserted) => {
                self.recorded += inserted as u64;
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Recording batch failed");
                Err(SourceError::Unavailable {
                    context: format!("trade store write failed: {}", e),
                })
            }
        }
    }
}

/// Deterministic content hash of a trade print, for feeds that do not
/// provide a venue trade id. FNV-1a over the print fields.
fn synthetic_trade_id(trade: &Trade, occurrence: u64) -> i64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET;
    let mut mix = |value: u64| {
        for byte in value.to_le_bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
    };
    mix(trade.time as u64);
    mix(trade.price.to_bits());
    mix(trade.size.to_bits());
    mix(match trade.side {
        Side::Buy => 0,
        Side::Sell => 1,
    });
    mix(occurrence);
    hash as i64
}
