// src/db/mod.rs
// SQLite storage layer: pooled connections, schema, per-entity operations

pub mod conversation;
pub mod device;
pub mod knowledge;
pub mod memory;
pub mod pool;
pub mod schema;
pub mod sync;

pub use pool::DatabasePool;

use chrono::{DateTime, Utc};
use std::str::FromStr;

/// Parse an RFC-3339 timestamp column. A malformed value is a schema
/// violation, surfaced as a fatal conversion error.
pub(crate) fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

/// Parse an enum column stored as its snake_case string.
pub(crate) fn parse_enum<T>(idx: usize, raw: &str) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.parse().map_err(|e: T::Err| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Epoch seconds (fractional) for the redundant `created_at` index column.
pub(crate) fn epoch_seconds(ts: &DateTime<Utc>) -> f64 {
    ts.timestamp_micros() as f64 / 1_000_000.0
}

/// JSON-decode a nullable text column, falling back to the default on
/// missing or malformed content.
pub(crate) fn json_or_default<T: serde::de::DeserializeOwned + Default>(
    raw: Option<String>,
) -> T {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}
