pub mod boot;
pub mod catalog;
pub mod correlation;
pub mod error;
pub mod gateway;
pub mod models;
pub mod naming;
pub mod notifications;
pub mod orchestrator;
pub mod redact;
mod runner;
pub mod vpn;

pub use boot::{AgentEvent, BootEvent, BootService, ProvisioningEvent};
pub use error::ProvisionError;
pub use gateway::{BootEventGateway, GatewayError};
pub use models::{Device, DeviceClass, Job, JobCreated, JobStatus, JobWithHistory, NewJobRequest};
pub use orchestrator::Orchestrator;
