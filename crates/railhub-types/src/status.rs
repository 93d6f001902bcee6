//! Messages pushed by hubs as GATT notifications.
//!
//! Each message is a tuple of packed values (see [`crate::wire`]). The
//! constructors here check the tuple shape; picking which constructor to
//! apply is up to the role's codec.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{ParseError, ParseResult};
use crate::types::{Color, MotorKind, MotorPort, PortSet, SwitchPosition};
use crate::wire::Value;

fn expect_len(values: &[Value], len: usize, message: &str) -> ParseResult<()> {
    if values.len() == len {
        Ok(())
    } else {
        Err(ParseError::invalid_data(format!(
            "{message} requires {len} values, got {}",
            values.len()
        )))
    }
}

fn int_at(values: &[Value], index: usize, field: &str) -> ParseResult<i32> {
    values[index].as_int().ok_or_else(|| {
        ParseError::invalid_data(format!(
            "{field} must be an int, got {}",
            values[index].kind()
        ))
    })
}

fn channel_at(values: &[Value], index: usize) -> ParseResult<u8> {
    let raw = int_at(values, index, "channel")?;
    u8::try_from(raw).map_err(|_| ParseError::invalid_data(format!("channel {raw} out of range")))
}

/// Periodic status from a train hub.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TrainStatus {
    pub channel: u8,
    pub name: String,
    pub running: bool,
    pub power: i8,
}

impl TrainStatus {
    /// Parse `(channel, name, running, power)`.
    pub fn from_values(values: &[Value]) -> ParseResult<Self> {
        expect_len(values, 4, "train status")?;
        let name = values[1]
            .as_str()
            .ok_or_else(|| ParseError::invalid_data("train name must be a string"))?
            .to_string();
        let power = int_at(values, 3, "power")?;
        let power = i8::try_from(power)
            .ok()
            .filter(|p| (-100..=100).contains(p))
            .ok_or_else(|| ParseError::invalid_data(format!("power {power} out of range")))?;
        Ok(Self {
            channel: channel_at(values, 0)?,
            name,
            running: int_at(values, 2, "status")? == 1,
            power,
        })
    }
}

/// A single color-sensor sample from a train hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ColorReading {
    pub channel: u8,
    pub color: Color,
}

impl ColorReading {
    /// Parse `(channel, color_code)`.
    pub fn from_values(values: &[Value]) -> ParseResult<Self> {
        expect_len(values, 2, "color reading")?;
        let code = int_at(values, 1, "color")?;
        let color = Color::from_code(code)
            .ok_or_else(|| ParseError::invalid_data(format!("unknown color code {code}")))?;
        Ok(Self {
            channel: channel_at(values, 0)?,
            color,
        })
    }
}

/// Position feedback from a switch hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SwitchStatus {
    pub channel: u8,
    pub status_channel: u8,
    /// Ports whose switch is DIVERGING.
    pub diverging: PortSet,
    /// Ports with a motor attached.
    pub connected: PortSet,
}

impl SwitchStatus {
    /// Parse `(channel, status_channel, positions, ports)`.
    pub fn from_values(values: &[Value]) -> ParseResult<Self> {
        expect_len(values, 4, "switch status")?;
        Ok(Self {
            channel: channel_at(values, 0)?,
            status_channel: channel_at(values, 1)?,
            diverging: PortSet::from_bits(int_at(values, 2, "positions")?)?,
            connected: PortSet::from_bits(int_at(values, 3, "ports")?)?,
        })
    }

    /// Reported position of a port, `None` if no motor is attached there.
    #[must_use]
    pub fn position(&self, port: MotorPort) -> Option<SwitchPosition> {
        self.connected
            .contains(port)
            .then(|| SwitchPosition::from_bit(self.diverging.contains(port)))
    }
}

/// Identity announcement a switch hub sends after startup.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HubIdentity {
    pub channel: u8,
    pub name: String,
    pub ready: bool,
    pub connected: PortSet,
}

impl HubIdentity {
    /// Parse `(channel, name, ready, ports)`.
    pub fn from_values(values: &[Value]) -> ParseResult<Self> {
        expect_len(values, 4, "hub identity")?;
        let name = values[1]
            .as_str()
            .ok_or_else(|| ParseError::invalid_data("hub name must be a string"))?
            .to_string();
        Ok(Self {
            channel: channel_at(values, 0)?,
            name,
            ready: int_at(values, 2, "ready")? == 1,
            connected: PortSet::from_bits(int_at(values, 3, "ports")?)?,
        })
    }
}

/// Reply to a motor-kind probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PortIdentity {
    pub channel: u8,
    pub motors: PortSet,
    pub dc_motors: PortSet,
}

impl PortIdentity {
    /// Parse `(channel, motor_ports, dc_motor_ports)`.
    pub fn from_values(values: &[Value]) -> ParseResult<Self> {
        expect_len(values, 3, "port identity")?;
        Ok(Self {
            channel: channel_at(values, 0)?,
            motors: PortSet::from_bits(int_at(values, 1, "motor ports")?)?,
            dc_motors: PortSet::from_bits(int_at(values, 2, "dc motor ports")?)?,
        })
    }

    /// Kind of motor on `port`, `None` if nothing is attached.
    ///
    /// A port the hub lists under both kinds is reported as `Unknown`.
    #[must_use]
    pub fn kind(&self, port: MotorPort) -> Option<MotorKind> {
        match (self.motors.contains(port), self.dc_motors.contains(port)) {
            (true, true) => Some(MotorKind::Unknown),
            (true, false) => Some(MotorKind::Motor),
            (false, true) => Some(MotorKind::DcMotor),
            (false, false) => None,
        }
    }
}

/// Any message a hub can push.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "type", rename_all = "snake_case"))]
pub enum Notification {
    Train(TrainStatus),
    Color(ColorReading),
    Switch(SwitchStatus),
    Identity(HubIdentity),
    Ports(PortIdentity),
}
