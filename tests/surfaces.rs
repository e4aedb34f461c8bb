mod common;

use std::sync::Arc;

use common::start;
use provd::core::models::{Job, JobCreated, JobStatus, JobWithHistory};
use provd::core::vpn::VpnSession;
use provd::rpc::{ClientError, RpcClient, RpcServer};
use provd::web::WebServer;
use serde_json::{Value, json};

async fn serve_rpc(h: &common::Harness) -> (Arc<RpcServer>, RpcClient) {
    let server = Arc::new(
        RpcServer::bind(h.orchestrator.clone(), "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap(),
    );
    let client = RpcClient::new(server.local_addr().unwrap());
    let running = server.clone();
    tokio::spawn(async move { running.start().await });
    (server, client)
}

async fn serve_http(h: &common::Harness) -> String {
    let server = WebServer::bind(h.orchestrator.clone(), "127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let base = format!("http://{}", server.local_addr().unwrap());
    tokio::spawn(server.start());
    base
}

#[tokio::test]
async fn test_rpc_job_lifecycle() {
    let h = start().await;
    let (server, client) = serve_rpc(&h).await;

    let created: JobCreated = client
        .call(
            "jobs.create",
            Some(json!({
                "customer_id": "exc",
                "device_class": "NB",
                "image_ref": "win11",
                "interface_id": "eth1"
            })),
        )
        .await
        .unwrap();
    assert_eq!(created.status, JobStatus::Preparing);

    let job: Job = client
        .call("jobs.get", Some(json!({ "id": created.job_id })))
        .await
        .unwrap();
    assert_eq!(job.sequence_number, 1);

    let listed: Vec<Job> = client
        .call("jobs.list", Some(json!({ "status": "PREPARING" })))
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);

    let cancelled: Job = client
        .call("jobs.cancel", Some(json!({ "id": created.job_id })))
        .await
        .unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);

    let history: JobWithHistory = client
        .call("jobs.history", Some(json!({ "id": created.job_id })))
        .await
        .unwrap();
    assert_eq!(history.job.status, JobStatus::Cancelled);
    assert_eq!(history.history.len(), 2);

    let status: Value = client.call_no_params("daemon.status").await.unwrap();
    assert_eq!(status["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(status["vpn"]["state"], "DOWN");

    let session: VpnSession = client.call_no_params("vpn.session").await.unwrap();
    assert!(session.holder_job_ids.is_empty());

    server.shutdown();
}

#[tokio::test]
async fn test_rpc_errors_carry_codes() {
    let h = start().await;
    let (server, client) = serve_rpc(&h).await;

    let err = client
        .call::<Job>("jobs.get", Some(json!({ "id": "missing" })))
        .await
        .unwrap_err();
    match err {
        ClientError::Rpc(e) => assert_eq!(e.code, -32001),
        other => panic!("expected RPC error, got {}", other),
    }

    let err = client
        .call::<JobCreated>(
            "jobs.create",
            Some(json!({
                "customer_id": "nobody",
                "device_class": "NB",
                "image_ref": "win11",
                "interface_id": "eth1"
            })),
        )
        .await
        .unwrap_err();
    match err {
        ClientError::Rpc(e) => assert_eq!(e.code, -32002),
        other => panic!("expected RPC error, got {}", other),
    }

    let err = client
        .call::<Job>("jobs.get", Some(json!({ "job": 1 })))
        .await
        .unwrap_err();
    match err {
        ClientError::Rpc(e) => assert_eq!(e.code, -32602),
        other => panic!("expected RPC error, got {}", other),
    }

    let err = client.call_no_params::<Value>("jobs.explode").await.unwrap_err();
    match err {
        ClientError::Rpc(e) => assert_eq!(e.code, -32601),
        other => panic!("expected RPC error, got {}", other),
    }

    server.shutdown();
}

#[tokio::test]
async fn test_http_callbacks_drive_job() {
    let h = start().await;
    let base = serve_http(&h).await;
    let http = reqwest::Client::new();

    let job_id = h.create("exc", "eth1", None).await;

    let health = http.get(format!("{}/healthz", base)).send().await.unwrap();
    assert!(health.status().is_success());

    let post = |path: &str, body: Value| {
        let request = http.post(format!("{}{}", base, path)).json(&body);
        async move { request.send().await.unwrap().status().as_u16() }
    };

    assert_eq!(
        post("/boot/discover", json!({ "mac": "AABB.CCDD.EE01", "interface_id": "eth1" })).await,
        202
    );
    let job = h.wait_for(&job_id, JobStatus::PxeSelection).await;
    assert_eq!(job.mac_address.as_deref(), Some("aa:bb:cc:dd:ee:01"));

    let mac = "aa:bb:cc:dd:ee:01";
    assert_eq!(post("/boot/lease", json!({ "mac": mac, "ip": "10.0.0.9" })).await, 202);
    assert_eq!(post("/boot/image-delivered", json!({ "mac": mac })).await, 202);
    assert_eq!(post("/agent/install-started", json!({ "mac": mac })).await, 202);
    assert_eq!(
        post("/agent/install-result", json!({ "mac": mac, "success": true })).await,
        202
    );
    assert_eq!(
        post(
            "/agent/verify-result",
            json!({ "mac": mac, "success": true, "detail": "all checks passed" })
        )
        .await,
        202
    );

    let job = h.wait_for(&job_id, JobStatus::Ready).await;
    assert_eq!(job.ip_address.as_deref(), Some("10.0.0.9"));
}

#[tokio::test]
async fn test_http_rejects_malformed_callbacks() {
    let h = start().await;
    let base = serve_http(&h).await;
    let http = reqwest::Client::new();

    let response = http
        .post(format!("{}/boot/discover", base))
        .json(&json!({ "mac": "not-a-mac", "interface_id": "eth1" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
    let body: Value = response.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("not-a-mac"));

    let response = http
        .post(format!("{}/boot/lease", base))
        .json(&json!({ "mac": "aa:bb:cc:dd:ee:01", "ip": "10.0.0" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);

    let response = http
        .post(format!("{}/boot/discover", base))
        .json(&json!({ "mac": "aa:bb:cc:dd:ee:01", "interface_id": "  " }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
}
