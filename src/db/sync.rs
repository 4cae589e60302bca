// src/db/sync.rs
// Pending change-record queue for cross-device sync

use rusqlite::{Connection, params};

use super::{epoch_seconds, parse_enum, parse_timestamp};
use crate::types::SyncOperation;

/// Store a sync operation for later delivery. Upsert by operation id.
pub fn store_sync_operation_sync(
    conn: &Connection,
    operation: &SyncOperation,
) -> rusqlite::Result<()> {
    let data_json = serde_json::to_string(&operation.data).unwrap_or_default();

    conn.execute(
        "INSERT OR REPLACE INTO sync_operations
         (operation_id, operation_type, item_type, item_id, device_id,
          timestamp, data, resolved, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            operation.operation_id,
            operation.operation_type.to_string(),
            operation.item_type.to_string(),
            operation.item_id,
            operation.device_id,
            operation.timestamp.to_rfc3339(),
            data_json,
            operation.resolved as i64,
            epoch_seconds(&operation.timestamp),
        ],
    )?;
    Ok(())
}

/// Get unresolved operations for a device in insertion order
/// (`created_at`, then `operation_id` for same-instant records).
pub fn get_pending_sync_operations_sync(
    conn: &Connection,
    device_id: &str,
) -> rusqlite::Result<Vec<SyncOperation>> {
    let mut stmt = conn.prepare(
        "SELECT operation_id, operation_type, item_type, item_id, device_id,
                timestamp, data, resolved
         FROM sync_operations
         WHERE device_id = ?1 AND resolved = 0
         ORDER BY created_at ASC, operation_id ASC",
    )?;
    let rows = stmt.query_map([device_id], row_to_operation)?;
    rows.collect()
}

/// Mark an operation delivered. Returns whether the id was known.
pub fn mark_sync_operation_resolved_sync(
    conn: &Connection,
    operation_id: &str,
) -> rusqlite::Result<bool> {
    let affected = conn.execute(
        "UPDATE sync_operations SET resolved = 1 WHERE operation_id = ?1",
        [operation_id],
    )?;
    Ok(affected > 0)
}

fn row_to_operation(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncOperation> {
    let op_type_raw: String = row.get(1)?;
    let item_type_raw: String = row.get(2)?;
    let timestamp_raw: String = row.get(5)?;
    let data_raw: Option<String> = row.get(6)?;

    Ok(SyncOperation {
        operation_id: row.get(0)?,
        operation_type: parse_enum(1, &op_type_raw)?,
        item_type: parse_enum(2, &item_type_raw)?,
        item_id: row.get(3)?,
        device_id: row.get(4)?,
        timestamp: parse_timestamp(5, &timestamp_raw)?,
        data: data_raw
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or(serde_json::Value::Null),
        resolved: row.get::<_, i64>(7)? != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::run_migrations;
    use crate::types::{SyncItemType, SyncOperationType};

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    fn op_for(device_id: &str, item_id: &str) -> SyncOperation {
        SyncOperation::new(
            SyncOperationType::Create,
            SyncItemType::Memory,
            item_id,
            device_id,
            serde_json::json!({"item": item_id}),
        )
    }

    #[test]
    fn test_pending_queue_order_and_resolution() {
        let conn = test_conn();
        let mut ops = Vec::new();
        for i in 0..3i64 {
            let mut op = op_for("A", &format!("item-{i}"));
            // Spread insertion times so ordering is deterministic
            op.timestamp = chrono::Utc::now() + chrono::Duration::milliseconds(i);
            store_sync_operation_sync(&conn, &op).unwrap();
            ops.push(op);
        }

        let pending = get_pending_sync_operations_sync(&conn, "A").unwrap();
        assert_eq!(pending.len(), 3);
        for (stored, original) in pending.iter().zip(&ops) {
            assert_eq!(stored.operation_id, original.operation_id);
            assert!(!stored.resolved);
        }

        assert!(mark_sync_operation_resolved_sync(&conn, &ops[1].operation_id).unwrap());

        let remaining = get_pending_sync_operations_sync(&conn, "A").unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].operation_id, ops[0].operation_id);
        assert_eq!(remaining[1].operation_id, ops[2].operation_id);
    }

    #[test]
    fn test_resolve_unknown_id_reports_missing() {
        let conn = test_conn();
        assert!(!mark_sync_operation_resolved_sync(&conn, "ghost").unwrap());
    }

    #[test]
    fn test_pending_is_per_device() {
        let conn = test_conn();
        store_sync_operation_sync(&conn, &op_for("A", "item-a")).unwrap();
        store_sync_operation_sync(&conn, &op_for("B", "item-b")).unwrap();

        let pending = get_pending_sync_operations_sync(&conn, "A").unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].device_id, "A");
        assert_eq!(pending[0].data["item"], "item-a");
    }
}
