//! Durable mirror of the candle cache: one sqlite row per cache key.

use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

use crate::candle::{CacheKey, Candle};
use crate::timeframe::parse_timeframe;

pub const STORE_FILE_NAME: &str = "cache.sqlite";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("payload serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// One persisted cache entry, as read back from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntry {
    pub key: CacheKey,
    pub stored_at_ms: i64,
    pub candles: Vec<Candle>,
    pub payload_bytes: u64,
}

#[derive(Debug, Default)]
pub struct WarmLoad {
    pub entries: Vec<StoredEntry>,
    /// Record names removed because their checksum, key or payload did not verify.
    pub discarded: Vec<String>,
}

pub struct SqliteCacheStore {
    conn: Connection,
    path: PathBuf,
}

impl SqliteCacheStore {
    /// Opens (creating if needed) `<dir>/cache.sqlite`.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(STORE_FILE_NAME);

        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA temp_store=MEMORY;
            ",
        )?;
        ensure_schema(&conn)?;

        Ok(Self { conn, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes one entry, replacing any previous record for the key. Returns payload size.
    pub fn upsert(
        &mut self,
        key: &CacheKey,
        candles: &[Candle],
        stored_at_ms: i64,
    ) -> Result<u64, StoreError> {
        let payload = serde_json::to_string(candles)?;
        let checksum = payload_sha256_hex(payload.as_bytes());

        let tx = self.conn.transaction()?;
        tx.execute(
            "
            INSERT INTO cache_entries (
                cache_key,
                symbol,
                timeframe,
                start_ms,
                end_ms,
                stored_at_ms,
                candle_count,
                payload,
                payload_sha256
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(cache_key) DO UPDATE SET
                stored_at_ms = excluded.stored_at_ms,
                candle_count = excluded.candle_count,
                payload = excluded.payload,
                payload_sha256 = excluded.payload_sha256
            ",
            params![
                key.as_string(),
                key.symbol,
                key.timeframe.as_str(),
                key.start_ms,
                key.end_ms,
                stored_at_ms,
                candles.len() as i64,
                payload,
                checksum,
            ],
        )?;
        tx.commit()?;

        Ok(payload.len() as u64)
    }

    /// Returns whether a record existed.
    pub fn delete(&mut self, record: &str) -> Result<bool, StoreError> {
        let removed = self
            .conn
            .execute("DELETE FROM cache_entries WHERE cache_key = ?1", params![record])?;
        Ok(removed > 0)
    }

    /// Deletes the record only while it is still the write made at `stored_at_ms`.
    pub fn delete_if_stored_at(&mut self, record: &str, stored_at_ms: i64) -> Result<bool, StoreError> {
        let removed = self.conn.execute(
            "DELETE FROM cache_entries WHERE cache_key = ?1 AND stored_at_ms = ?2",
            params![record, stored_at_ms],
        )?;
        Ok(removed > 0)
    }

    pub fn stored_at(&self, record: &str) -> Result<Option<i64>, StoreError> {
        let stored_at = self
            .conn
            .query_row(
                "SELECT stored_at_ms FROM cache_entries WHERE cache_key = ?1",
                params![record],
                |row| row.get(0),
            )
            .optional()?;
        Ok(stored_at)
    }

    pub fn count(&self) -> Result<u64, StoreError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Reads every record, verifying checksums. Records that fail verification
    /// are deleted from disk and reported in `discarded`.
    pub fn load_all(&mut self) -> Result<WarmLoad, StoreError> {
        let rows = {
            let mut stmt = self.conn.prepare(
                "
                SELECT cache_key, symbol, timeframe, start_ms, end_ms, stored_at_ms, payload, payload_sha256
                FROM cache_entries
                ORDER BY cache_key
                ",
            )?;
            let mapped = stmt.query_map([], |row| {
                Ok(RawRecord {
                    record: row.get(0)?,
                    symbol: row.get(1)?,
                    timeframe: row.get(2)?,
                    start_ms: row.get(3)?,
                    end_ms: row.get(4)?,
                    stored_at_ms: row.get(5)?,
                    payload: row.get(6)?,
                    payload_sha256: row.get(7)?,
                })
            })?;
            let rows = mapped.collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let mut out = WarmLoad::default();
        for raw in rows {
            match decode_record(&raw) {
                Ok(entry) => out.entries.push(entry),
                Err(reason) => {
                    warn!(
                        component = "store",
                        event = "store.record.discarded",
                        record = %raw.record,
                        reason
                    );
                    self.delete(&raw.record)?;
                    out.discarded.push(raw.record);
                }
            }
        }

        info!(
            component = "store",
            event = "store.load.complete",
            path = %self.path.display(),
            entries = out.entries.len(),
            discarded = out.discarded.len()
        );
        Ok(out)
    }
}

struct RawRecord {
    record: String,
    symbol: String,
    timeframe: String,
    start_ms: i64,
    end_ms: i64,
    stored_at_ms: i64,
    payload: String,
    payload_sha256: String,
}

fn decode_record(raw: &RawRecord) -> Result<StoredEntry, &'static str> {
    if payload_sha256_hex(raw.payload.as_bytes()) != raw.payload_sha256 {
        return Err("checksum mismatch");
    }
    let timeframe = parse_timeframe(&raw.timeframe).map_err(|_| "unknown timeframe")?;
    let key = CacheKey::new(raw.symbol.clone(), timeframe, raw.start_ms, raw.end_ms);
    if key.as_string() != raw.record {
        return Err("record name does not match key columns");
    }
    let candles: Vec<Candle> =
        serde_json::from_str(&raw.payload).map_err(|_| "payload is not a candle array")?;

    Ok(StoredEntry {
        key,
        stored_at_ms: raw.stored_at_ms,
        candles,
        payload_bytes: raw.payload.len() as u64,
    })
}

fn ensure_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS cache_entries (
            cache_key TEXT NOT NULL PRIMARY KEY,
            symbol TEXT NOT NULL,
            timeframe TEXT NOT NULL,
            start_ms INTEGER NOT NULL,
            end_ms INTEGER NOT NULL,
            stored_at_ms INTEGER NOT NULL,
            candle_count INTEGER NOT NULL,
            payload TEXT NOT NULL,
            payload_sha256 TEXT NOT NULL
        ) WITHOUT ROWID;
        ",
    )?;
    Ok(())
}

fn payload_sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
