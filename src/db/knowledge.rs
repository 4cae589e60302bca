// src/db/knowledge.rs
// Knowledge chunk CRUD and candidate-scan similarity retrieval

use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, params};

use super::{epoch_seconds, json_or_default, parse_timestamp};
use crate::types::KnowledgeItem;
use crate::vector::{bytes_to_embedding, cosine_similarity, embedding_to_bytes};

/// Upsert a knowledge chunk by id.
pub fn store_knowledge_sync(conn: &Connection, knowledge: &KnowledgeItem) -> rusqlite::Result<()> {
    let embedding_bytes = embedding_to_bytes(&knowledge.embedding);
    let tags_json = serde_json::to_string(&knowledge.tags).unwrap_or_default();
    let metadata_json = serde_json::to_string(&knowledge.metadata).unwrap_or_default();

    conn.execute(
        "INSERT OR REPLACE INTO knowledge
         (id, content, embedding, source, device_id, chunk_index, total_chunks,
          timestamp, relevance_score, tags, metadata, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            knowledge.id,
            knowledge.content,
            embedding_bytes,
            knowledge.source,
            knowledge.device_id,
            knowledge.chunk_index,
            knowledge.total_chunks,
            knowledge.timestamp.to_rfc3339(),
            knowledge.relevance_score.unwrap_or(0.0),
            tags_json,
            metadata_json,
            epoch_seconds(&knowledge.timestamp),
        ],
    )?;
    Ok(())
}

/// Retrieve knowledge similar to `query_embedding`, optionally filtered by
/// source. Same candidate-scan-then-rerank rule as memories.
pub fn retrieve_knowledge_sync(
    conn: &Connection,
    query_embedding: &[f32],
    top_k: usize,
    source_filter: Option<&str>,
) -> Result<Vec<KnowledgeItem>> {
    let candidate_limit = (top_k * 10) as i64;

    let mut stmt = conn.prepare(
        "SELECT id, content, embedding, source, device_id, chunk_index, total_chunks,
                timestamp, tags, metadata, created_at
         FROM knowledge
         WHERE (?1 IS NULL OR source = ?1)
         ORDER BY created_at DESC
         LIMIT ?2",
    )?;

    let candidates: Vec<(KnowledgeItem, f64)> = stmt
        .query_map(params![source_filter, candidate_limit], |row| {
            Ok((row_to_knowledge(row)?, row.get::<_, f64>(10)?))
        })?
        .collect::<rusqlite::Result<_>>()?;

    let mut scored = Vec::with_capacity(candidates.len());
    for (mut item, created_at) in candidates {
        let similarity = cosine_similarity(query_embedding, &item.embedding)?;
        item.relevance_score = Some(similarity);
        scored.push((item, created_at));
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

    Ok(scored.into_iter().map(|(item, _)| item).collect())
}

/// Get a specific knowledge chunk by id.
pub fn get_knowledge_by_id_sync(
    conn: &Connection,
    knowledge_id: &str,
) -> rusqlite::Result<Option<KnowledgeItem>> {
    conn.query_row(
        "SELECT id, content, embedding, source, device_id, chunk_index, total_chunks,
                timestamp, tags, metadata, created_at
         FROM knowledge WHERE id = ?1",
        [knowledge_id],
        row_to_knowledge,
    )
    .optional()
}

/// Delete a knowledge chunk. Returns whether a row was removed.
pub fn delete_knowledge_sync(conn: &Connection, knowledge_id: &str) -> rusqlite::Result<bool> {
    let affected = conn.execute("DELETE FROM knowledge WHERE id = ?1", [knowledge_id])?;
    Ok(affected > 0)
}

/// Total number of stored knowledge chunks.
pub fn get_knowledge_count_sync(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row("SELECT COUNT(*) FROM knowledge", [], |row| row.get(0))
}

fn row_to_knowledge(row: &rusqlite::Row<'_>) -> rusqlite::Result<KnowledgeItem> {
    let embedding_blob: Vec<u8> = row.get(2)?;
    let embedding = bytes_to_embedding(&embedding_blob).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Blob, Box::new(e))
    })?;
    let timestamp_raw: String = row.get(7)?;

    Ok(KnowledgeItem {
        id: row.get(0)?,
        content: row.get(1)?,
        embedding,
        source: row.get(3)?,
        device_id: row.get(4)?,
        chunk_index: row.get(5)?,
        total_chunks: row.get(6)?,
        timestamp: parse_timestamp(7, &timestamp_raw)?,
        relevance_score: None,
        tags: json_or_default(row.get(8)?),
        metadata: json_or_default(row.get(9)?),
    })
}
