// src/db/device.rs
// Device registry rows

use rusqlite::{Connection, OptionalExtension, params};

use super::{epoch_seconds, json_or_default, parse_enum, parse_timestamp};
use crate::types::DeviceContext;

/// Register or update a device. Also refreshes `last_seen` ordering data.
pub fn register_device_sync(conn: &Connection, device: &DeviceContext) -> rusqlite::Result<()> {
    let capabilities_json = serde_json::to_string(&device.capabilities).unwrap_or_default();
    let metadata_json = serde_json::to_string(&device.metadata).unwrap_or_default();

    conn.execute(
        "INSERT OR REPLACE INTO devices
         (device_id, hardware_tier, capabilities, specialization, location,
          ip_address, hostname, last_seen, status, version, metadata, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            device.device_id,
            device.hardware_tier.to_string(),
            capabilities_json,
            device.specialization,
            device.location,
            device.ip_address,
            device.hostname,
            device.last_seen.to_rfc3339(),
            device.status.to_string(),
            device.version,
            metadata_json,
            epoch_seconds(&device.last_seen),
        ],
    )?;
    Ok(())
}

/// Get device information by id.
pub fn get_device_sync(
    conn: &Connection,
    device_id: &str,
) -> rusqlite::Result<Option<DeviceContext>> {
    conn.query_row(
        "SELECT device_id, hardware_tier, capabilities, specialization, location,
                ip_address, hostname, last_seen, status, version, metadata
         FROM devices WHERE device_id = ?1",
        [device_id],
        row_to_device,
    )
    .optional()
}

/// List all registered devices, most recently seen first.
pub fn list_devices_sync(conn: &Connection) -> rusqlite::Result<Vec<DeviceContext>> {
    let mut stmt = conn.prepare(
        "SELECT device_id, hardware_tier, capabilities, specialization, location,
                ip_address, hostname, last_seen, status, version, metadata
         FROM devices ORDER BY last_seen DESC",
    )?;
    let rows = stmt.query_map([], row_to_device)?;
    rows.collect()
}

fn row_to_device(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeviceContext> {
    let tier_raw: String = row.get(1)?;
    let last_seen_raw: String = row.get(7)?;
    let status_raw: String = row.get(8)?;

    Ok(DeviceContext {
        device_id: row.get(0)?,
        hardware_tier: parse_enum(1, &tier_raw)?,
        capabilities: json_or_default(row.get(2)?),
        specialization: row.get(3)?,
        location: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
        ip_address: row.get(5)?,
        hostname: row.get(6)?,
        last_seen: parse_timestamp(7, &last_seen_raw)?,
        status: parse_enum(8, &status_raw)?,
        version: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
        metadata: json_or_default(row.get(10)?),
    })
}
