#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use provd::adapters::SimulatedBootService;
use provd::config::AppConfig;
use provd::context::AppContext;
use provd::core::catalog::ConfigCatalog;
use provd::core::gateway::BootEventGateway;
use provd::core::models::{DeviceClass, Job, JobStatus, NewJobRequest};
use provd::core::naming::NamingAllocator;
use provd::core::vpn::{SimulatedDriver, TunnelManager};
use provd::core::Orchestrator;
use provd::db;
use tokio::time::timeout;
use tokio_rusqlite::Connection;

pub const WAIT: Duration = Duration::from_secs(5);

/// Time given to the dispatcher to act on an event that should change nothing.
pub const SETTLE: Duration = Duration::from_millis(150);

pub const CONFIG: &str = r#"
simulation = true

[[customers]]
id = "exc"
short_code = "EXC"
interfaces = ["eth1", "eth2", "eth3"]

[customers.vpn_profiles.lan]
type = "local"

[customers.vpn_profiles.wg]
type = "wireguard"
private_key_ref = "env:PROVD_TEST_WG_KEY"
public_key = "c2VydmVyLXB1YmxpYy1rZXk="
endpoint = "vpn.exc.example:51820"
address = "10.20.0.2/32"
allowed_ips = ["10.20.0.0/16"]

[[customers]]
id = "acme"
short_code = "ACM"

[customers.vpn_profiles.office]
type = "client"
protocol = "openconnect"
hostname = "vpn.acme.example"
username = "provisioner"
secret_ref = "env:PROVD_TEST_ACME_PASSWORD"

[[images]]
id = "win11"
description = "Windows 11 Enterprise"
"#;

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub gateway: BootEventGateway,
    pub boot: Arc<SimulatedBootService>,
    pub driver: Arc<SimulatedDriver>,
}

pub fn config() -> AppConfig {
    AppConfig::from_toml(CONFIG).unwrap()
}

pub async fn start() -> Harness {
    start_with(config(), db::init_in_memory().await.unwrap()).await
}

pub async fn start_with(config: AppConfig, db: Connection) -> Harness {
    let boot = Arc::new(SimulatedBootService::new());
    let driver = Arc::new(SimulatedDriver::new());

    let ctx = AppContext {
        catalog: Arc::new(ConfigCatalog::new(&config.customers, &config.images)),
        boot: boot.clone(),
        tunnels: TunnelManager::new(driver.clone()),
        naming: Arc::new(NamingAllocator::new(config.naming_ceiling)),
        notifier: None,
        config: Arc::new(config),
        db,
    };

    let orchestrator = Orchestrator::new(ctx);
    orchestrator.start().await.unwrap();

    Harness {
        gateway: orchestrator.gateway(),
        orchestrator,
        boot,
        driver,
    }
}

pub fn request(customer: &str, interface: &str, profile: Option<&str>) -> NewJobRequest {
    NewJobRequest {
        customer_id: customer.to_string(),
        device_class: DeviceClass::Nb,
        image_ref: "win11".to_string(),
        vpn_profile_id: profile.map(String::from),
        interface_id: interface.to_string(),
    }
}

impl Harness {
    pub async fn create(&self, customer: &str, interface: &str, profile: Option<&str>) -> String {
        self.orchestrator
            .create_job(request(customer, interface, profile))
            .await
            .unwrap()
            .job_id
    }

    pub async fn job(&self, job_id: &str) -> Job {
        self.orchestrator.job(job_id).await.unwrap()
    }

    /// Poll the registry until the job reaches `status`.
    pub async fn wait_for(&self, job_id: &str, status: JobStatus) -> Job {
        let result = timeout(WAIT, async {
            loop {
                let job = self.job(job_id).await;
                if job.status == status {
                    return job;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;

        match result {
            Ok(job) => job,
            Err(_) => panic!(
                "job {} never reached {}, stuck in {}",
                job_id,
                status,
                self.job(job_id).await.status
            ),
        }
    }

    pub async fn history(&self, job_id: &str) -> Vec<String> {
        self.orchestrator
            .job_history(job_id)
            .await
            .unwrap()
            .history
            .into_iter()
            .map(|entry| entry.status)
            .collect()
    }

    /// Drive a bound device from PXE_SELECTION to READY.
    pub async fn run_to_ready(&self, mac: &str) {
        self.gateway.on_lease_assigned(mac, "10.0.0.50", None).await.unwrap();
        self.gateway.on_image_delivered(mac).await.unwrap();
        self.gateway.on_install_started(mac).await.unwrap();
        self.gateway.on_install_result(mac, true, None).await.unwrap();
        self.gateway.on_verify_result(mac, true, None).await.unwrap();
    }
}

/// Poll `check` until it holds.
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    let result = timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {}", what);
}
