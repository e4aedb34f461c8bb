use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use tokio_rusqlite::rusqlite::OptionalExtension;
use tokio_rusqlite::{Connection, params, rusqlite};
use uuid::Uuid;

use super::{parse_optional_time, parse_text, parse_time, timestamp};
use crate::core::models::{Device, Job, JobStatus, JobStatusEntry, JobWithHistory};

const JOB_COLUMNS: &str = "id, customer_id, device_class, image_ref, vpn_profile_id, interface_id,
     status, mac_address, ip_address, sequence_number, device_name, naming_committed,
     failure_reason, version, created_at, status_changed_at, completed_at";

/// Side effect on the device registry committed with a job transition.
#[derive(Debug, Clone)]
pub enum DeviceWrite {
    None,
    /// First binding of a device.
    Bind(Device),
    /// Point a known device at this job. Its name and state are kept.
    Adopt { mac: String },
    /// The job reached DONE.
    MarkImaged { mac: String, at: DateTime<Utc> },
    /// The job ended before imaging: drop the record it created.
    Unbind { mac: String },
}

fn job_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    Ok(Job {
        id: row.get(0)?,
        customer_id: row.get(1)?,
        device_class: parse_text(row, 2)?,
        image_ref: row.get(3)?,
        vpn_profile_id: row.get(4)?,
        interface_id: row.get(5)?,
        status: parse_text(row, 6)?,
        mac_address: row.get(7)?,
        ip_address: row.get(8)?,
        sequence_number: row.get(9)?,
        name: row.get(10)?,
        naming_committed: row.get(11)?,
        failure_reason: row.get(12)?,
        version: row.get::<_, i64>(13)? as u64,
        created_at: parse_time(row, 14)?,
        status_changed_at: parse_time(row, 15)?,
        completed_at: parse_optional_time(row, 16)?,
    })
}

fn insert_log(
    tx: &rusqlite::Transaction<'_>,
    job_id: &str,
    status: JobStatus,
    description: Option<&str>,
    at: &DateTime<Utc>,
) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO job_status_log (id, job_id, status, description, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            Uuid::now_v7().to_string(),
            job_id,
            status.as_str(),
            description,
            timestamp(at)
        ],
    )?;
    Ok(())
}

pub async fn create(conn: &Connection, job: Job) -> Result<()> {
    conn.call(move |c| {
        let tx = c.transaction()?;

        tx.execute(
            &format!("INSERT INTO jobs ({JOB_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"),
            params![
                &job.id,
                &job.customer_id,
                job.device_class.as_str(),
                &job.image_ref,
                &job.vpn_profile_id,
                &job.interface_id,
                job.status.as_str(),
                &job.mac_address,
                &job.ip_address,
                job.sequence_number,
                &job.name,
                job.naming_committed,
                &job.failure_reason,
                job.version as i64,
                timestamp(&job.created_at),
                timestamp(&job.status_changed_at),
                job.completed_at.as_ref().map(timestamp),
            ],
        )?;

        insert_log(
            &tx,
            &job.id,
            job.status,
            Some("Job created, waiting for device"),
            &job.created_at,
        )?;

        tx.commit()?;
        Ok::<(), rusqlite::Error>(())
    })
    .await?;

    Ok(())
}

pub async fn get(conn: &Connection, job_id: String) -> Result<Option<Job>> {
    conn.call(move |c| {
        c.query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
            params![job_id],
            job_from_row,
        )
        .optional()
    })
    .await
    .map_err(|e| anyhow!("Failed to get job: {}", e))
}

pub async fn get_with_history(conn: &Connection, job_id: String) -> Result<Option<JobWithHistory>> {
    let Some(job) = get(conn, job_id.clone()).await? else {
        return Ok(None);
    };

    let history = conn
        .call(move |c| {
            let mut stmt = c.prepare(
                "SELECT status, description, created_at FROM job_status_log
                 WHERE job_id = ?1 ORDER BY created_at ASC, rowid ASC",
            )?;
            let entries = stmt
                .query_map(params![job_id], |row| {
                    Ok(JobStatusEntry {
                        status: row.get(0)?,
                        description: row.get(1)?,
                        created_at: row.get(2)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok::<_, rusqlite::Error>(entries)
        })
        .await
        .map_err(|e| anyhow!("Failed to get job history: {}", e))?;

    Ok(Some(JobWithHistory { job, history }))
}

pub async fn list(
    conn: &Connection,
    limit: u32,
    offset: u32,
    status: Option<JobStatus>,
) -> Result<Vec<Job>> {
    conn.call(move |c| {
        let mut stmt = c.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY created_at DESC, id DESC
             LIMIT ?2 OFFSET ?3"
        ))?;
        let jobs = stmt
            .query_map(params![status.map(|s| s.as_str()), limit, offset], job_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok::<_, rusqlite::Error>(jobs)
    })
    .await
    .map_err(|e| anyhow!("Failed to list jobs: {}", e))
}

/// Jobs that have not reached a terminal state, oldest first.
pub async fn list_active(conn: &Connection) -> Result<Vec<Job>> {
    conn.call(|c| {
        let mut stmt = c.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE status NOT IN ('DONE', 'FAILED', 'CANCELLED')
             ORDER BY created_at ASC, id ASC"
        ))?;
        let jobs = stmt
            .query_map([], job_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok::<_, rusqlite::Error>(jobs)
    })
    .await
    .map_err(|e| anyhow!("Failed to load active jobs: {}", e))
}

/// Persist `job` as the successor of `expected_version`.
///
/// Runs as one transaction: the job row, the status log entry and the
/// device write either all land or none do. Returns `false` without writing
/// anything when the stored version has moved on.
pub async fn transition(
    conn: &Connection,
    job: Job,
    expected_version: u64,
    description: Option<String>,
    device: DeviceWrite,
) -> Result<bool> {
    conn.call(move |c| {
        let tx = c.transaction()?;

        let updated = tx.execute(
            "UPDATE jobs SET
                status = ?1, mac_address = ?2, sequence_number = ?3, device_name = ?4,
                naming_committed = ?5, failure_reason = ?6, version = ?7,
                status_changed_at = ?8, completed_at = ?9
             WHERE id = ?10 AND version = ?11",
            params![
                job.status.as_str(),
                &job.mac_address,
                job.sequence_number,
                &job.name,
                job.naming_committed,
                &job.failure_reason,
                job.version as i64,
                timestamp(&job.status_changed_at),
                job.completed_at.as_ref().map(timestamp),
                &job.id,
                expected_version as i64,
            ],
        )?;

        if updated != 1 {
            // Dropping the transaction rolls it back.
            return Ok::<bool, rusqlite::Error>(false);
        }

        match &device {
            DeviceWrite::None => {}
            DeviceWrite::Bind(d) => {
                tx.execute(
                    "INSERT INTO devices (mac_address, customer_id, device_class, sequence_number,
                                          name, state, job_id, bound_at, imaged_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        &d.mac_address,
                        &d.customer_id,
                        d.device_class.as_str(),
                        d.sequence_number,
                        &d.name,
                        d.state.as_str(),
                        &d.job_id,
                        timestamp(&d.bound_at),
                        d.imaged_at.as_ref().map(timestamp),
                    ],
                )?;
            }
            DeviceWrite::Adopt { mac } => {
                tx.execute(
                    "UPDATE devices SET job_id = ?1 WHERE mac_address = ?2",
                    params![&job.id, mac],
                )?;
            }
            DeviceWrite::MarkImaged { mac, at } => {
                tx.execute(
                    "UPDATE devices SET state = 'imaged', imaged_at = ?1
                     WHERE mac_address = ?2 AND job_id = ?3",
                    params![timestamp(at), mac, &job.id],
                )?;
            }
            DeviceWrite::Unbind { mac } => {
                tx.execute(
                    "DELETE FROM devices WHERE mac_address = ?1 AND job_id = ?2 AND state = 'bound'",
                    params![mac, &job.id],
                )?;
            }
        }

        insert_log(
            &tx,
            &job.id,
            job.status,
            description.as_deref(),
            &job.status_changed_at,
        )?;

        tx.commit()?;
        Ok(true)
    })
    .await
    .map_err(|e| anyhow!("Failed to persist transition: {}", e))
}

/// Diagnostic only; does not advance the version.
pub async fn record_ip(conn: &Connection, job_id: String, ip: String) -> Result<()> {
    conn.call(move |c| {
        c.execute(
            "UPDATE jobs SET ip_address = ?1 WHERE id = ?2",
            params![ip, job_id],
        )?;
        Ok::<(), rusqlite::Error>(())
    })
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::{DeviceClass, DeviceState};
    use crate::db::{devices, init_in_memory};

    fn new_job(id: &str, seq: u32) -> Job {
        let now = Utc::now();
        Job {
            id: id.to_string(),
            customer_id: "exc".into(),
            device_class: DeviceClass::Nb,
            image_ref: "win11".into(),
            vpn_profile_id: None,
            interface_id: "eth1".into(),
            status: JobStatus::Preparing,
            mac_address: None,
            ip_address: None,
            sequence_number: seq,
            name: None,
            naming_committed: false,
            failure_reason: None,
            version: 0,
            created_at: now,
            status_changed_at: now,
            completed_at: None,
        }
    }

    fn advance(job: &Job, status: JobStatus) -> Job {
        let mut next = job.clone();
        next.status = status;
        next.version += 1;
        next.status_changed_at = Utc::now();
        next
    }

    #[tokio::test]
    async fn create_and_read_back() {
        let conn = init_in_memory().await.unwrap();
        create(&conn, new_job("job-1", 1)).await.unwrap();

        let job = get(&conn, "job-1".into()).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Preparing);
        assert_eq!(job.device_class, DeviceClass::Nb);
        assert_eq!(job.sequence_number, 1);
        assert!(get(&conn, "nope".into()).await.unwrap().is_none());

        let with_history = get_with_history(&conn, "job-1".into()).await.unwrap().unwrap();
        assert_eq!(with_history.history.len(), 1);
        assert_eq!(with_history.history[0].status, "PREPARING");
    }

    #[tokio::test]
    async fn stale_version_is_rejected() {
        let conn = init_in_memory().await.unwrap();
        let job = new_job("job-1", 1);
        create(&conn, job.clone()).await.unwrap();

        let next = advance(&job, JobStatus::Cancelled);
        assert!(transition(&conn, next.clone(), 0, None, DeviceWrite::None).await.unwrap());

        let late = advance(&job, JobStatus::PxeSelection);
        assert!(!transition(&conn, late, 0, None, DeviceWrite::None).await.unwrap());

        let stored = get(&conn, "job-1".into()).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn live_sequence_numbers_are_unique() {
        let conn = init_in_memory().await.unwrap();
        create(&conn, new_job("job-1", 1)).await.unwrap();
        assert!(create(&conn, new_job("job-2", 1)).await.is_err());

        // A terminal job no longer holds its number.
        let job = get(&conn, "job-1".into()).await.unwrap().unwrap();
        transition(&conn, advance(&job, JobStatus::Failed), 0, None, DeviceWrite::None)
            .await
            .unwrap();
        create(&conn, new_job("job-3", 1)).await.unwrap();
    }

    #[tokio::test]
    async fn binding_writes_device_in_the_same_transaction() {
        let conn = init_in_memory().await.unwrap();
        let job = new_job("job-1", 7);
        create(&conn, job.clone()).await.unwrap();

        let mut bound = advance(&job, JobStatus::PxeSelection);
        bound.mac_address = Some("aa:bb:cc:dd:ee:01".into());
        bound.name = Some("EXC-NB-007".into());
        bound.naming_committed = true;
        let device = Device {
            mac_address: "aa:bb:cc:dd:ee:01".into(),
            customer_id: "exc".into(),
            device_class: DeviceClass::Nb,
            sequence_number: 7,
            name: "EXC-NB-007".into(),
            state: DeviceState::Bound,
            job_id: "job-1".into(),
            bound_at: Utc::now(),
            imaged_at: None,
        };
        assert!(
            transition(&conn, bound.clone(), 0, Some("Bound".into()), DeviceWrite::Bind(device))
                .await
                .unwrap()
        );

        let stored = devices::get_by_mac(&conn, "aa:bb:cc:dd:ee:01".into())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.name, "EXC-NB-007");
        assert_eq!(stored.state, DeviceState::Bound);

        let done = advance(&bound, JobStatus::Done);
        transition(
            &conn,
            done,
            1,
            None,
            DeviceWrite::MarkImaged {
                mac: "aa:bb:cc:dd:ee:01".into(),
                at: Utc::now(),
            },
        )
        .await
        .unwrap();
        let stored = devices::get_by_mac(&conn, "aa:bb:cc:dd:ee:01".into())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.state, DeviceState::Imaged);
        assert!(stored.imaged_at.is_some());
    }

    #[tokio::test]
    async fn failed_binding_is_unbound_but_imaged_device_survives() {
        let conn = init_in_memory().await.unwrap();
        let mac = "aa:bb:cc:dd:ee:02";
        let device = |job_id: &str| Device {
            mac_address: mac.into(),
            customer_id: "exc".into(),
            device_class: DeviceClass::Nb,
            sequence_number: 1,
            name: "EXC-NB-001".into(),
            state: DeviceState::Bound,
            job_id: job_id.into(),
            bound_at: Utc::now(),
            imaged_at: None,
        };

        let job = new_job("job-1", 1);
        create(&conn, job.clone()).await.unwrap();
        let mut bound = advance(&job, JobStatus::PxeSelection);
        bound.mac_address = Some(mac.into());
        transition(&conn, bound.clone(), 0, None, DeviceWrite::Bind(device("job-1")))
            .await
            .unwrap();
        transition(
            &conn,
            advance(&bound, JobStatus::Failed),
            1,
            None,
            DeviceWrite::Unbind { mac: mac.into() },
        )
        .await
        .unwrap();
        assert!(devices::get_by_mac(&conn, mac.into()).await.unwrap().is_none());

        // Imaged by job-2, then re-provisioned and failed by job-3.
        let job = new_job("job-2", 1);
        create(&conn, job.clone()).await.unwrap();
        let mut bound = advance(&job, JobStatus::PxeSelection);
        bound.mac_address = Some(mac.into());
        transition(&conn, bound.clone(), 0, None, DeviceWrite::Bind(device("job-2")))
            .await
            .unwrap();
        transition(
            &conn,
            advance(&bound, JobStatus::Done),
            1,
            None,
            DeviceWrite::MarkImaged {
                mac: mac.into(),
                at: Utc::now(),
            },
        )
        .await
        .unwrap();

        let job = new_job("job-3", 2);
        create(&conn, job.clone()).await.unwrap();
        let mut bound = advance(&job, JobStatus::PxeSelection);
        bound.mac_address = Some(mac.into());
        transition(&conn, bound.clone(), 0, None, DeviceWrite::Adopt { mac: mac.into() })
            .await
            .unwrap();
        transition(
            &conn,
            advance(&bound, JobStatus::Failed),
            1,
            None,
            DeviceWrite::Unbind { mac: mac.into() },
        )
        .await
        .unwrap();

        let stored = devices::get_by_mac(&conn, mac.into()).await.unwrap().unwrap();
        assert_eq!(stored.state, DeviceState::Imaged);
        assert_eq!(stored.job_id, "job-3");
        assert_eq!(stored.name, "EXC-NB-001");
    }

    #[tokio::test]
    async fn list_filters_by_status_and_active() {
        let conn = init_in_memory().await.unwrap();
        create(&conn, new_job("job-1", 1)).await.unwrap();
        create(&conn, new_job("job-2", 2)).await.unwrap();
        let job = get(&conn, "job-2".into()).await.unwrap().unwrap();
        transition(&conn, advance(&job, JobStatus::Cancelled), 0, None, DeviceWrite::None)
            .await
            .unwrap();

        assert_eq!(list(&conn, 10, 0, None).await.unwrap().len(), 2);
        let cancelled = list(&conn, 10, 0, Some(JobStatus::Cancelled)).await.unwrap();
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].id, "job-2");

        let active = list_active(&conn).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "job-1");
    }
}
