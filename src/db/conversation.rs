// src/db/conversation.rs
// Conversation blob storage (whole session upserted per write, turns included)

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};

use super::{json_or_default, parse_enum, parse_timestamp};
use crate::types::Conversation;

/// Upsert the entire conversation blob. `created_at`/`updated_at` are both
/// "now at time of write".
pub fn store_conversation_sync(
    conn: &Connection,
    conversation: &Conversation,
) -> rusqlite::Result<()> {
    let metadata_json = serde_json::to_string(&conversation.metadata).unwrap_or_default();
    let turns_json = serde_json::to_string(&conversation.turns).unwrap_or_default();
    let now = super::epoch_seconds(&Utc::now());

    conn.execute(
        "INSERT OR REPLACE INTO conversations
         (session_id, chatbot_name, device_id, start_time, end_time, status,
          metadata, turns, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            conversation.session_id,
            conversation.chatbot_name,
            conversation.device_id,
            conversation.start_time.to_rfc3339(),
            conversation.end_time.map(|t| t.to_rfc3339()),
            conversation.status.to_string(),
            metadata_json,
            turns_json,
            now,
            now,
        ],
    )?;
    Ok(())
}

/// Load a conversation by session id.
pub fn load_conversation_sync(
    conn: &Connection,
    session_id: &str,
) -> rusqlite::Result<Option<Conversation>> {
    conn.query_row(
        "SELECT session_id, chatbot_name, device_id, start_time, end_time,
                status, metadata, turns
         FROM conversations WHERE session_id = ?1",
        [session_id],
        row_to_conversation,
    )
    .optional()
}

/// List recent conversations, newest write first.
pub fn list_conversations_sync(
    conn: &Connection,
    limit: usize,
) -> rusqlite::Result<Vec<Conversation>> {
    let mut stmt = conn.prepare(
        "SELECT session_id, chatbot_name, device_id, start_time, end_time,
                status, metadata, turns
         FROM conversations ORDER BY created_at DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map([limit as i64], row_to_conversation)?;
    rows.collect()
}

/// Delete a conversation. Returns whether a row was removed.
pub fn delete_conversation_sync(conn: &Connection, session_id: &str) -> rusqlite::Result<bool> {
    let affected = conn.execute(
        "DELETE FROM conversations WHERE session_id = ?1",
        [session_id],
    )?;
    Ok(affected > 0)
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let start_raw: String = row.get(3)?;
    let end_raw: Option<String> = row.get(4)?;
    let status_raw: String = row.get(5)?;

    let end_time = match end_raw {
        Some(raw) => Some(parse_timestamp(4, &raw)?),
        None => None,
    };

    Ok(Conversation {
        session_id: row.get(0)?,
        chatbot_name: row.get(1)?,
        device_id: row.get(2)?,
        start_time: parse_timestamp(3, &start_raw)?,
        end_time,
        status: parse_enum(5, &status_raw)?,
        metadata: json_or_default(row.get(6)?),
        turns: json_or_default(row.get(7)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::run_migrations;
    use crate::types::{ConversationStatus, ConversationTurn, Metadata};

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    #[test]
    fn test_store_load_round_trip() {
        let conn = test_conn();
        let mut conv = Conversation::new("nano_12345678", "nano", "dev-a");
        conv.turns
            .push(ConversationTurn::new("u1", "b1", 10, Metadata::new()));
        conv.turns
            .push(ConversationTurn::new("u2", "b2", 20, Metadata::new()));

        store_conversation_sync(&conn, &conv).unwrap();

        let loaded = load_conversation_sync(&conn, "nano_12345678")
            .unwrap()
            .unwrap();
        assert_eq!(loaded.chatbot_name, "nano");
        assert_eq!(loaded.turns.len(), 2);
        assert_eq!(loaded.turns[1].tokens_used, 20);
        assert_eq!(loaded.status, ConversationStatus::Active);
        assert!(loaded.end_time.is_none());
    }

    #[test]
    fn test_upsert_replaces_turns() {
        let conn = test_conn();
        let mut conv = Conversation::new("s1", "mini", "dev-a");
        store_conversation_sync(&conn, &conv).unwrap();

        conv.turns
            .push(ConversationTurn::new("u", "b", 5, Metadata::new()));
        conv.status = ConversationStatus::Completed;
        conv.end_time = Some(Utc::now());
        store_conversation_sync(&conn, &conv).unwrap();

        let loaded = load_conversation_sync(&conn, "s1").unwrap().unwrap();
        assert_eq!(loaded.turns.len(), 1);
        assert_eq!(loaded.status, ConversationStatus::Completed);
        assert!(loaded.end_time.is_some());
    }

    #[test]
    fn test_list_with_limit() {
        let conn = test_conn();
        for i in 0..5 {
            let conv = Conversation::new(format!("s{i}"), "nano", "dev-a");
            store_conversation_sync(&conn, &conv).unwrap();
        }

        let listed = list_conversations_sync(&conn, 3).unwrap();
        assert_eq!(listed.len(), 3);
    }

    #[test]
    fn test_delete() {
        let conn = test_conn();
        let conv = Conversation::new("gone", "nano", "dev-a");
        store_conversation_sync(&conn, &conv).unwrap();

        assert!(delete_conversation_sync(&conn, "gone").unwrap());
        assert!(!delete_conversation_sync(&conn, "gone").unwrap());
        assert!(load_conversation_sync(&conn, "gone").unwrap().is_none());
    }
}
