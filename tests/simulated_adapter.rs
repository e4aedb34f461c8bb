mod common;

use common::start;
use provd::adapters::SimulatedCommand;
use provd::core::models::JobStatus;

async fn feed(h: &common::Harness, lines: &[&str]) {
    for line in lines {
        let cmd = SimulatedCommand::parse(line).unwrap();
        cmd.send(&h.gateway).await.unwrap();
    }
}

#[tokio::test]
async fn test_simulator_script_provisions_device() {
    let h = start().await;
    let job_id = h.create("exc", "eth2", None).await;

    feed(&h, &["discover AA:BB:CC:DD:EE:21 eth2"]).await;
    let job = h.wait_for(&job_id, JobStatus::PxeSelection).await;
    assert_eq!(job.name.as_deref(), Some("EXC-NB-001"));

    feed(
        &h,
        &[
            "lease aa:bb:cc:dd:ee:21 10.0.0.21",
            "image aa:bb:cc:dd:ee:21",
            "install-start aa:bb:cc:dd:ee:21",
            "install aa:bb:cc:dd:ee:21 ok",
            "verify aa:bb:cc:dd:ee:21 ok",
        ],
    )
    .await;

    let job = h.wait_for(&job_id, JobStatus::Ready).await;
    assert_eq!(job.ip_address.as_deref(), Some("10.0.0.21"));
    assert_eq!(h.boot.staged("aa:bb:cc:dd:ee:21").as_deref(), Some("win11"));
}

#[tokio::test]
async fn test_simulator_failure_detail_is_recorded() {
    let h = start().await;
    let job_id = h.create("exc", "eth1", None).await;

    feed(
        &h,
        &[
            "discover aa:bb:cc:dd:ee:22 eth1",
            "lease aa:bb:cc:dd:ee:22 10.0.0.22",
            "image aa:bb:cc:dd:ee:22",
            "install-start aa:bb:cc:dd:ee:22",
        ],
    )
    .await;
    h.wait_for(&job_id, JobStatus::Installing).await;

    feed(&h, &["install aa:bb:cc:dd:ee:22 fail disk not found"]).await;
    let job = h.wait_for(&job_id, JobStatus::Failed).await;
    assert!(job.failure_reason.unwrap_or_default().contains("disk not found"));
}

#[tokio::test]
async fn test_simulator_rejects_malformed_mac() {
    let h = start().await;
    let cmd = SimulatedCommand::parse("lease nonsense 10.0.0.1").unwrap();
    assert!(cmd.send(&h.gateway).await.is_err());
}
