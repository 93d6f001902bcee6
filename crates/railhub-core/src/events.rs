//! Fleet-wide event broadcast.
//!
//! Components publish what happened to hubs here: discovery, registration,
//! connection state changes, link loss, scanner health, finished commands
//! and self-drive transitions. Events are serializable so the layer above
//! the core can forward them as-is.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use railhub_types::{ConnectionState, HubRole, MotorKind, MotorPort};

use crate::selfdrive::SelfDriveState;

/// Identity of a hub as learned from its advertisement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubInfo {
    /// Stable identifier (address, or platform peripheral id).
    pub id: String,
    /// Advertised name, if any.
    pub name: Option<String>,
    pub role: HubRole,
}

impl HubInfo {
    pub fn new(id: impl Into<String>, role: HubRole) -> Self {
        Self {
            id: id.into(),
            name: None,
            role,
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Events emitted by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum FleetEvent {
    /// A hub advertisement was classified.
    Discovered { hub: HubInfo, rssi: Option<i16> },
    /// A newly discovered hub was added to the registry.
    Registered { hub: HubInfo },
    /// A discovered hub was not registered because its role is at capacity.
    RegistrationRefused { hub: HubInfo, limit: usize },
    /// Connection state of a hub changed.
    StateChanged {
        hub_id: String,
        from: ConnectionState,
        to: ConnectionState,
    },
    /// An open session was lost.
    LinkLost {
        hub_id: String,
        reason: LinkLossReason,
    },
    /// Scanner recovery failed repeatedly; a Bluetooth stack reset may be needed.
    ScannerDegraded { consecutive_failures: u32 },
    /// Scanner is running normally again after being degraded.
    ScannerRecovered,
    /// An operator reset was performed. `None` means every hub.
    Reset { hub_id: Option<String> },
    /// A command delivery cycle ended.
    CommandFinished {
        hub_id: String,
        correlation: u64,
        attempts: u32,
        confirmed: bool,
    },
    /// Motor kinds on a switch hub were detected.
    MotorsDetected {
        hub_id: String,
        ports: Vec<(MotorPort, MotorKind)>,
    },
    /// Self-drive state of a train changed.
    SelfDriveChanged {
        hub_id: String,
        from: SelfDriveState,
        to: SelfDriveState,
    },
}

/// Why a session was considered lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum LinkLossReason {
    /// The platform reported a disconnect or the notification stream ended.
    Disconnected,
    /// No notification arrived within the configured window.
    NotificationTimeout,
    /// A write failed and the session no longer reports connected.
    WriteFailure,
}

pub type EventSender = broadcast::Sender<FleetEvent>;

pub type EventReceiver = broadcast::Receiver<FleetEvent>;

/// Broadcasts [`FleetEvent`]s to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: EventSender,
}

impl EventDispatcher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    pub fn send(&self, event: FleetEvent) {
        // no receivers is fine
        let _ = self.sender.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(256)
    }
}
