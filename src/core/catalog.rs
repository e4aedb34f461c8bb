//! Customer and image references.
//!
//! The admin application owns customers and images; the orchestrator only
//! resolves references against it. This deployment reads them from config.

use std::collections::HashMap;

use async_trait::async_trait;

use super::vpn::VpnProfile;
use crate::config::{CustomerConfig, ImageConfig};

#[derive(Debug, Clone)]
pub struct Customer {
    pub id: String,
    pub short_code: String,
    pub interfaces: Vec<String>,
    pub vpn_profiles: Vec<VpnProfile>,
}

impl Customer {
    pub fn profile(&self, profile_id: &str) -> Option<&VpnProfile> {
        self.vpn_profiles.iter().find(|p| p.id == profile_id)
    }

    pub fn allows_interface(&self, interface_id: &str) -> bool {
        self.interfaces.is_empty() || self.interfaces.iter().any(|i| i == interface_id)
    }
}

#[derive(Debug, Clone)]
pub struct Image {
    pub id: String,
    pub description: String,
}

#[async_trait]
pub trait Catalog: Send + Sync {
    async fn customer(&self, customer_id: &str) -> anyhow::Result<Option<Customer>>;

    async fn image(&self, image_ref: &str) -> anyhow::Result<Option<Image>>;
}

pub struct ConfigCatalog {
    customers: HashMap<String, Customer>,
    images: HashMap<String, Image>,
}

impl ConfigCatalog {
    pub fn new(customers: &[CustomerConfig], images: &[ImageConfig]) -> Self {
        let customers = customers
            .iter()
            .map(|c| {
                let customer = Customer {
                    id: c.id.clone(),
                    short_code: c.short_code.clone(),
                    interfaces: c.interfaces.clone(),
                    vpn_profiles: c
                        .vpn_profiles
                        .iter()
                        .map(|(id, kind)| VpnProfile::new(id.clone(), kind.clone()))
                        .collect(),
                };
                (c.id.clone(), customer)
            })
            .collect();

        let images = images
            .iter()
            .map(|i| {
                (
                    i.id.clone(),
                    Image {
                        id: i.id.clone(),
                        description: i.description.clone(),
                    },
                )
            })
            .collect();

        Self { customers, images }
    }
}

#[async_trait]
impl Catalog for ConfigCatalog {
    async fn customer(&self, customer_id: &str) -> anyhow::Result<Option<Customer>> {
        Ok(self.customers.get(customer_id).cloned())
    }

    async fn image(&self, image_ref: &str) -> anyhow::Result<Option<Image>> {
        Ok(self.images.get(image_ref).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::vpn::ProfileKind;
    use std::collections::BTreeMap;

    fn catalog() -> ConfigCatalog {
        ConfigCatalog::new(
            &[CustomerConfig {
                id: "exc".into(),
                short_code: "EXC".into(),
                interfaces: vec!["eth1".into()],
                vpn_profiles: BTreeMap::from([("lan".to_string(), ProfileKind::Local)]),
            }],
            &[ImageConfig {
                id: "win11".into(),
                description: String::new(),
            }],
        )
    }

    #[tokio::test]
    async fn resolves_known_references() {
        let catalog = catalog();
        let exc = catalog.customer("exc").await.unwrap().unwrap();
        assert_eq!(exc.short_code, "EXC");
        assert!(exc.profile("lan").unwrap().is_local());
        assert!(exc.profile("office").is_none());
        assert!(catalog.image("win11").await.unwrap().is_some());
        assert!(catalog.customer("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn interface_allow_list() {
        let exc = catalog().customer("exc").await.unwrap().unwrap();
        assert!(exc.allows_interface("eth1"));
        assert!(!exc.allows_interface("eth2"));

        let open = Customer {
            interfaces: Vec::new(),
            ..exc
        };
        assert!(open.allows_interface("eth9"));
    }
}
