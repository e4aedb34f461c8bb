use std::sync::Arc;

use anyhow::Result;
use tokio_rusqlite::Connection;

use crate::adapters;
use crate::config::AppConfig;
use crate::core::boot::BootService;
use crate::core::catalog::{Catalog, ConfigCatalog};
use crate::core::naming::NamingAllocator;
use crate::core::notifications::{NotificationChannel, create_notifier};
use crate::core::vpn::TunnelManager;

/// Shared collaborators of the orchestrator and its servers.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub db: Connection,
    pub catalog: Arc<dyn Catalog>,
    pub boot: Arc<dyn BootService>,
    pub tunnels: TunnelManager,
    pub naming: Arc<NamingAllocator>,
    pub notifier: Option<Arc<dyn NotificationChannel>>,
}

impl AppContext {
    pub fn new(config: AppConfig, db: Connection) -> Result<Self> {
        let catalog = Arc::new(ConfigCatalog::new(&config.customers, &config.images));
        let boot = adapters::get_boot_service(&config)?;
        let tunnels = TunnelManager::new(adapters::get_tunnel_driver(&config));
        let naming = Arc::new(NamingAllocator::new(config.naming_ceiling));
        let notifier = create_notifier(&config.notifications);

        Ok(Self {
            config: Arc::new(config),
            db,
            catalog,
            boot,
            tunnels,
            naming,
            notifier,
        })
    }
}
