use async_trait::async_trait;

/// Callbacks from the external DHCP/PXE boot service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootEvent {
    DiscoverReceived {
        mac: String,
        interface_id: String,
    },
    LeaseAssigned {
        mac: String,
        ip: String,
        interface_id: Option<String>,
    },
    BootImageDelivered {
        mac: String,
    },
}

/// Callbacks from the install/verify agent running on the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    InstallStarted {
        mac: String,
    },
    InstallResult {
        mac: String,
        success: bool,
        detail: Option<String>,
    },
    VerifyResult {
        mac: String,
        success: bool,
        detail: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningEvent {
    Boot(BootEvent),
    Agent(AgentEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Discover,
    Lease,
    ImageDelivered,
    InstallStarted,
    InstallResult,
    VerifyResult,
}

impl ProvisioningEvent {
    pub fn mac(&self) -> &str {
        match self {
            Self::Boot(BootEvent::DiscoverReceived { mac, .. })
            | Self::Boot(BootEvent::LeaseAssigned { mac, .. })
            | Self::Boot(BootEvent::BootImageDelivered { mac })
            | Self::Agent(AgentEvent::InstallStarted { mac })
            | Self::Agent(AgentEvent::InstallResult { mac, .. })
            | Self::Agent(AgentEvent::VerifyResult { mac, .. }) => mac,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::Boot(BootEvent::DiscoverReceived { .. }) => EventKind::Discover,
            Self::Boot(BootEvent::LeaseAssigned { .. }) => EventKind::Lease,
            Self::Boot(BootEvent::BootImageDelivered { .. }) => EventKind::ImageDelivered,
            Self::Agent(AgentEvent::InstallStarted { .. }) => EventKind::InstallStarted,
            Self::Agent(AgentEvent::InstallResult { .. }) => EventKind::InstallResult,
            Self::Agent(AgentEvent::VerifyResult { .. }) => EventKind::VerifyResult,
        }
    }
}

impl From<BootEvent> for ProvisioningEvent {
    fn from(event: BootEvent) -> Self {
        Self::Boot(event)
    }
}

impl From<AgentEvent> for ProvisioningEvent {
    fn from(event: AgentEvent) -> Self {
        Self::Agent(event)
    }
}

/// Outbound hand-off to the external boot service.
#[async_trait]
pub trait BootService: Send + Sync {
    /// Point the device's next PXE request at `image_ref`.
    async fn stage_image(&self, mac: &str, image_ref: &str, job_id: &str) -> anyhow::Result<()>;

    /// Forget any staged image for the device.
    async fn clear(&self, mac: &str) -> anyhow::Result<()>;
}
