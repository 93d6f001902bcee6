//! Bluetooth identifiers for LEGO hubs.
//!
//! Hubs running the train and switch programs expose the LEGO hub service
//! with a single characteristic used for both command writes and status
//! notifications.

use uuid::{Uuid, uuid};

/// LEGO hub GATT service.
pub const LEGO_HUB_SERVICE: Uuid = uuid!("00001623-1212-efde-1623-785feabcd123");

/// Command/notification characteristic of the LEGO hub service.
pub const LEGO_HUB_CHARACTERISTIC: Uuid = uuid!("00001624-1212-efde-1623-785feabcd123");

/// LEGO System A/S company identifier in manufacturer-specific advertising data.
pub const LEGO_MANUFACTURER_ID: u16 = 0x0397;

/// Broadcast channel the train program listens on for commands.
pub const TRAIN_COMMAND_CHANNEL: u8 = 21;

/// Broadcast channel the switch program listens on for commands.
pub const SWITCH_COMMAND_CHANNEL: u8 = 1;
