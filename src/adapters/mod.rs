use std::sync::Arc;

use anyhow::{Result, bail};
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::core::boot::BootService;
use crate::core::gateway::BootEventGateway;
use crate::core::vpn::{CommandDriver, SimulatedDriver, TunnelDriver};

mod http;
mod simulated;

pub use http::HttpBootService;
pub use simulated::{SimulatedBootService, SimulatedCommand};

pub fn get_boot_service(config: &AppConfig) -> Result<Arc<dyn BootService>> {
    if config.simulation {
        return Ok(Arc::new(SimulatedBootService::new()));
    }

    match &config.boot_service.base_url {
        Some(url) => Ok(Arc::new(HttpBootService::new(
            url,
            config.boot_service.request_timeout,
        )?)),
        None => bail!("boot_service.base_url must be set outside simulation mode"),
    }
}

pub fn get_tunnel_driver(config: &AppConfig) -> Arc<dyn TunnelDriver> {
    if config.simulation {
        return Arc::new(SimulatedDriver::new());
    }
    Arc::new(CommandDriver::new(config.runtime_dir.clone()))
}

/// Feed simulator commands from stdin into the gateway.
pub fn start_simulator(gateway: BootEventGateway) {
    info!("(Simulator) Reading commands from stdin: {}", simulated::USAGE);
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lines().map_while(Result::ok) {
            match SimulatedCommand::parse(&line) {
                Some(cmd) => {
                    if tx.send(cmd).is_err() {
                        break;
                    }
                }
                None if line.trim().is_empty() => {}
                None => println!("(Simulator) Use: {}", simulated::USAGE),
            }
        }
    });

    tokio::spawn(async move {
        while let Some(cmd) = rx.recv().await {
            if let Err(e) = cmd.send(&gateway).await {
                warn!(error = %e, "(Simulator) Command rejected");
            }
        }
    });
}
