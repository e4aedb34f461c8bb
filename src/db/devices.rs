use anyhow::{Result, anyhow};
use tokio_rusqlite::rusqlite::OptionalExtension;
use tokio_rusqlite::{Connection, params, rusqlite};

use super::{parse_optional_time, parse_text, parse_time};
use crate::core::models::Device;

const DEVICE_COLUMNS: &str = "mac_address, customer_id, device_class, sequence_number, name,
     state, job_id, bound_at, imaged_at";

fn device_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Device> {
    Ok(Device {
        mac_address: row.get(0)?,
        customer_id: row.get(1)?,
        device_class: parse_text(row, 2)?,
        sequence_number: row.get(3)?,
        name: row.get(4)?,
        state: parse_text(row, 5)?,
        job_id: row.get(6)?,
        bound_at: parse_time(row, 7)?,
        imaged_at: parse_optional_time(row, 8)?,
    })
}

pub async fn get_by_mac(conn: &Connection, mac: String) -> Result<Option<Device>> {
    conn.call(move |c| {
        c.query_row(
            &format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE mac_address = ?1"),
            params![mac],
            device_from_row,
        )
        .optional()
    })
    .await
    .map_err(|e| anyhow!("Failed to get device: {}", e))
}

/// Every device that ever had a name committed.
pub async fn list(conn: &Connection) -> Result<Vec<Device>> {
    conn.call(|c| {
        let mut stmt = c.prepare(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices ORDER BY customer_id, device_class, sequence_number"
        ))?;
        let devices = stmt
            .query_map([], device_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok::<_, rusqlite::Error>(devices)
    })
    .await
    .map_err(|e| anyhow!("Failed to list devices: {}", e))
}
