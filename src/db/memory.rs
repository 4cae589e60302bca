// src/db/memory.rs
// Memory CRUD and candidate-scan similarity retrieval

use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, params};

use super::{epoch_seconds, json_or_default, parse_timestamp};
use crate::types::MemoryItem;
use crate::vector::{bytes_to_embedding, cosine_similarity, embedding_to_bytes};

/// Upsert a memory by id. Idempotent; the embedding round-trips bit-exactly.
pub fn store_memory_sync(conn: &Connection, memory: &MemoryItem) -> rusqlite::Result<()> {
    let embedding_bytes = embedding_to_bytes(&memory.embedding);
    let tags_json = serde_json::to_string(&memory.tags).unwrap_or_default();
    let metadata_json = serde_json::to_string(&memory.metadata).unwrap_or_default();

    conn.execute(
        "INSERT OR REPLACE INTO memories
         (id, user_message, bot_response, embedding, device_id, context,
          timestamp, relevance_score, tags, metadata, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            memory.id,
            memory.user_message,
            memory.bot_response,
            embedding_bytes,
            memory.device_id,
            memory.context,
            memory.timestamp.to_rfc3339(),
            memory.relevance_score.unwrap_or(0.0),
            tags_json,
            metadata_json,
            epoch_seconds(&memory.timestamp),
        ],
    )?;
    Ok(())
}

/// Retrieve memories similar to `query_embedding`.
///
/// Scans a candidate set of the newest `10 * top_k` rows (optionally filtered
/// by device), reranks by normalized cosine similarity, and returns the first
/// `top_k`. Ties break by `created_at` descending, then id lexicographic.
pub fn retrieve_memories_sync(
    conn: &Connection,
    query_embedding: &[f32],
    top_k: usize,
    device_filter: Option<&str>,
) -> Result<Vec<MemoryItem>> {
    let candidate_limit = (top_k * 10) as i64;

    let mut stmt = conn.prepare(
        "SELECT id, user_message, bot_response, embedding, device_id, context,
                timestamp, tags, metadata, created_at
         FROM memories
         WHERE (?1 IS NULL OR device_id = ?1)
         ORDER BY created_at DESC
         LIMIT ?2",
    )?;

    let candidates: Vec<(MemoryItem, f64)> = stmt
        .query_map(params![device_filter, candidate_limit], |row| {
            Ok((row_to_memory(row)?, row.get::<_, f64>(9)?))
        })?
        .collect::<rusqlite::Result<_>>()?;

    let mut scored = Vec::with_capacity(candidates.len());
    for (mut memory, created_at) in candidates {
        let similarity = cosine_similarity(query_embedding, &memory.embedding)?;
        memory.relevance_score = Some(similarity);
        scored.push((memory, created_at));
    }

    scored.sort_by(|(a, a_created), (b, b_created)| {
        b.relevance_score
            .partial_cmp(&a.relevance_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(
                b_created
                    .partial_cmp(a_created)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
            .then(a.id.cmp(&b.id))
    });
    scored.truncate(top_k);

    Ok(scored.into_iter().map(|(memory, _)| memory).collect())
}

/// Get a specific memory by id.
pub fn get_memory_by_id_sync(
    conn: &Connection,
    memory_id: &str,
) -> rusqlite::Result<Option<MemoryItem>> {
    conn.query_row(
        "SELECT id, user_message, bot_response, embedding, device_id, context,
                timestamp, tags, metadata, created_at
         FROM memories WHERE id = ?1",
        [memory_id],
        row_to_memory,
    )
    .optional()
}

/// Delete a memory. Returns whether a row was removed.
pub fn delete_memory_sync(conn: &Connection, memory_id: &str) -> rusqlite::Result<bool> {
    let affected = conn.execute("DELETE FROM memories WHERE id = ?1", [memory_id])?;
    Ok(affected > 0)
}

/// Total number of stored memories.
pub fn get_memory_count_sync(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0))
}

fn row_to_memory(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryItem> {
    let embedding_blob: Vec<u8> = row.get(3)?;
    let embedding = bytes_to_embedding(&embedding_blob).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Blob, Box::new(e))
    })?;
    let timestamp_raw: String = row.get(6)?;

    Ok(MemoryItem {
        id: row.get(0)?,
        user_message: row.get(1)?,
        bot_response: row.get(2)?,
        embedding,
        device_id: row.get(4)?,
        context: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
        timestamp: parse_timestamp(6, &timestamp_raw)?,
        relevance_score: None,
        tags: json_or_default(row.get(7)?),
        metadata: json_or_default(row.get(8)?),
    })
}
