//! Host-side control of LEGO train and switch hubs over Bluetooth LE.
//!
//! Hubs run small programs that accept packed commands on the LEGO hub
//! characteristic and push status as notifications. This crate finds them,
//! keeps a session open to each, delivers commands with confirmation and
//! retries, and drives trains autonomously from their color sensor.
//!
//! # Features
//!
//! - **Discovery**: continuous scanning with role classification and
//!   adapter self-recovery
//! - **Supervision**: one session per hub, reconnected with capped
//!   exponential backoff, scanning paused while connecting
//! - **Confirmed delivery**: per-hub serialized commands, verification
//!   against pushed feedback, reliability counters per hub and port
//! - **Switches**: one-time motor detection, verified positions
//! - **Trains**: power and direction, self-drive stopping or reversing at
//!   color markers
//! - **Status**: periodic serializable snapshots with inactivity detection
//!
//! # Components
//!
//! | Module | Role |
//! |--------|------|
//! | [`scan`] | Device scanner |
//! | [`device`] | Transport session over btleplug |
//! | [`supervisor`] | Connection supervisor and hub registry |
//! | [`protocol`] | Command protocol engine |
//! | [`switch`] | Switch controller |
//! | [`train`], [`selfdrive`] | Train controller and self-drive state machine |
//! | [`monitor`] | Status monitor |
//! | [`fleet`] | Facade tying the above together |
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use railhub_core::{BleConnector, BleRadio, ConnectionConfig, Fleet, FleetConfig};
//! use railhub_types::SwitchPosition;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let radio = Arc::new(BleRadio::new().await?);
//!     let connector = Arc::new(BleConnector::new(Arc::clone(&radio), ConnectionConfig::default()));
//!     let fleet = Fleet::new(FleetConfig::default(), radio, connector)?;
//!     fleet.start().await;
//!
//!     // once the hubs are connected
//!     fleet.set_train_power("90:84:2B:00:00:01", 50).await?;
//!     fleet.set_switch_position("90:84:2B:00:00:02", 'A', SwitchPosition::Diverging).await?;
//!
//!     let snapshot = fleet.snapshot().await;
//!     println!("{}", serde_json::to_string_pretty(&snapshot)?);
//!     fleet.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod clock;
pub mod codec;
pub mod device;
pub mod error;
pub mod events;
pub mod fleet;
pub mod mock;
pub mod monitor;
pub mod protocol;
pub mod reliability;
pub mod scan;
pub mod selfdrive;
pub mod supervisor;
pub mod switch;
pub mod traits;
pub mod train;
pub mod util;

#[cfg(test)]
mod testing;

pub use backoff::{Backoff, BackoffPolicy};
pub use clock::{Clock, TokioClock};
pub use codec::{Codecs, HubCodec, PybricksSwitchCodec, PybricksTrainCodec, SwitchCodec, TrainCodec};
pub use device::{BleConnector, BleSession, ConnectionConfig};
pub use error::{Error, InvalidCommandReason, Result, TransportFailure};
pub use events::{EventDispatcher, EventReceiver, EventSender, FleetEvent, HubInfo, LinkLossReason};
pub use fleet::{Fleet, FleetConfig};
pub use monitor::{
    FleetSnapshot, HubLink, MonitorConfig, StatusMonitor, SwitchHubSnapshot, SwitchPortSnapshot,
    TrainSnapshot,
};
pub use protocol::{
    Command, CommandEngine, DeliveryOutcome, EngineConfig, FailureReason, SendPolicy, StateSlot,
    Verification, VerifiedValue,
};
pub use reliability::{ReliabilityBook, ReliabilityStats, StatsKey};
pub use scan::{
    Advertisement, BleRadio, ClassifierConfig, DiscoveryEvent, RadioGate, ScanEvent, ScanOptions,
    Scanner, classify,
};
pub use selfdrive::{SelfDriveConfig, SelfDriveState};
pub use supervisor::{ConnectionSupervisor, HubRecord, LiveSession, SupervisorConfig};
pub use switch::{SwitchConfig, SwitchController, SwitchView};
pub use traits::{Connector, Radio, Session};
pub use train::{TrainConfig, TrainController, TrainView};
pub use util::{create_identifier, format_peripheral_id};

// Re-export from railhub-types
pub use railhub_types::ble;
pub use railhub_types::{
    Color, ConnectionState, Direction, HubRole, MotorKind, MotorPort, Notification, PortSet,
    SignalQuality, SwitchPosition,
};
