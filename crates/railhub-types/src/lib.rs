//! Platform-agnostic types for LEGO train and switch hubs.
//!
//! This crate holds the domain vocabulary shared by the host side of the
//! system: hub roles, switch ports and positions, sensor colors, and the
//! packed value format the hub programs use on the wire. Nothing here
//! touches Bluetooth or async code.
//!
//! # Example
//!
//! ```
//! use railhub_types::{wire, MotorPort, SwitchPosition};
//!
//! // Command for switch B to diverge.
//! let port = MotorPort::B;
//! let value = port.switch_number() * 1000 + SwitchPosition::Diverging.code();
//! let payload = wire::encode_int16(value);
//! assert_eq!(&payload[..], &[0x00, 0x62, 0xd1, 0x07]);
//! ```

pub mod error;
pub mod status;
pub mod types;
pub mod uuid;
pub mod wire;

pub use error::{ParseError, ParseResult};
pub use status::{ColorReading, HubIdentity, Notification, PortIdentity, SwitchStatus, TrainStatus};
pub use types::{
    Color, ConnectionState, Direction, HubRole, MotorKind, MotorPort, PortSet, SignalQuality,
    SwitchPosition,
};
pub use uuid as ble;
