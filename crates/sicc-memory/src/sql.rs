//! Row encoding helpers shared by the stores.

use chrono::{DateTime, NaiveDate, SecondsFormat, SubsecRound, Utc};
use rusqlite::types::Type;
use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sicc_types::error::{SiccError, SiccResult};
use sicc_types::memory::normalize_content;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// Lock the shared connection.
pub(crate) fn lock(conn: &Mutex<Connection>) -> SiccResult<MutexGuard<'_, Connection>> {
    conn.lock().map_err(|e| SiccError::Internal(e.to_string()))
}

/// Map a SQLite error into the storage error kind.
pub(crate) fn storage(e: rusqlite::Error) -> SiccError {
    SiccError::Storage(e.to_string())
}

/// Current time at the microsecond precision timestamp columns keep, so a
/// value returned by a write equals the value read back later.
pub(crate) fn now_utc() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Fixed-width timestamp text; text ordering equals time ordering.
pub(crate) fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn day(date: &NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn bad_column(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

pub(crate) fn parse_uuid(idx: usize, raw: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| bad_column(idx, format!("invalid uuid '{raw}': {e}")))
}

pub(crate) fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| bad_column(idx, format!("invalid timestamp '{raw}': {e}")))
}

pub(crate) fn parse_day(idx: usize, raw: &str) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| bad_column(idx, format!("invalid date '{raw}': {e}")))
}

/// Parse one of the closed `snake_case` labels (chunk type, status, ...).
pub(crate) fn parse_label<T>(idx: usize, raw: &str) -> rusqlite::Result<T>
where
    T: FromStr<Err = String>,
{
    raw.parse::<T>().map_err(|e| bad_column(idx, e))
}

pub(crate) fn parse_json<T: DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|e| bad_column(idx, format!("invalid json: {e}")))
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> SiccResult<String> {
    serde_json::to_string(value).map_err(|e| SiccError::Serialization(e.to_string()))
}

/// Serialize embedding to bytes for SQLite BLOB storage.
pub(crate) fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for &val in embedding {
        bytes.extend_from_slice(&val.to_le_bytes());
    }
    bytes
}

/// Deserialize embedding from bytes.
pub(crate) fn embedding_from_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Hex SHA-256 of the normalized content; equal for texts that differ only
/// in case or whitespace.
pub(crate) fn content_hash(content: &str) -> String {
    hex::encode(Sha256::digest(normalize_content(content).as_bytes()))
}

/// Whether a niche version row exists.
pub(crate) fn version_exists(conn: &Connection, version_id: &str) -> SiccResult<bool> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM niche_versions WHERE id = ?1",
            rusqlite::params![version_id],
            |row| row.get(0),
        )
        .map_err(storage)?;
    Ok(count > 0)
}
