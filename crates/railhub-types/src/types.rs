//! Core domain types for train and switch hubs.

use core::fmt;
use core::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// Role a hub plays on the layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum HubRole {
    /// Train motor controller with a color sensor.
    Train,
    /// Track switch actuator driving up to four motors.
    Switch,
}

impl fmt::Display for HubRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HubRole::Train => write!(f, "train"),
            HubRole::Switch => write!(f, "switch"),
        }
    }
}

/// Link state of a hub as tracked by the connection supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

/// Motor port on a switch hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum MotorPort {
    A,
    B,
    C,
    D,
}

impl MotorPort {
    pub const ALL: [MotorPort; 4] = [MotorPort::A, MotorPort::B, MotorPort::C, MotorPort::D];

    /// Parse a port from its letter, case-insensitive.
    ///
    /// ```
    /// use railhub_types::MotorPort;
    ///
    /// assert_eq!(MotorPort::from_letter('b'), Some(MotorPort::B));
    /// assert_eq!(MotorPort::from_letter('E'), None);
    /// ```
    #[must_use]
    pub fn from_letter(letter: char) -> Option<Self> {
        match letter.to_ascii_uppercase() {
            'A' => Some(MotorPort::A),
            'B' => Some(MotorPort::B),
            'C' => Some(MotorPort::C),
            'D' => Some(MotorPort::D),
            _ => None,
        }
    }

    #[must_use]
    pub fn letter(self) -> char {
        match self {
            MotorPort::A => 'A',
            MotorPort::B => 'B',
            MotorPort::C => 'C',
            MotorPort::D => 'D',
        }
    }

    /// Switch number used in commands: A = 1 through D = 4.
    #[must_use]
    pub fn switch_number(self) -> i16 {
        self.index() as i16 + 1
    }

    /// Bit of this port in hub bitmaps. A is the most significant of the
    /// four (`0b1000`), D the least (`0b0001`).
    #[must_use]
    pub fn bit(self) -> u8 {
        1 << (3 - self.index())
    }

    fn index(self) -> u8 {
        match self {
            MotorPort::A => 0,
            MotorPort::B => 1,
            MotorPort::C => 2,
            MotorPort::D => 3,
        }
    }
}

impl fmt::Display for MotorPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

impl FromStr for MotorPort {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.trim().chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => MotorPort::from_letter(c),
            _ => None,
        }
        .ok_or_else(|| ParseError::invalid_data(format!("unknown switch port '{s}'")))
    }
}

/// Set of motor ports, stored as the hub's four-bit bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct PortSet(u8);

impl PortSet {
    pub const EMPTY: PortSet = PortSet(0);

    /// Build from a hub bitmap. Bits above port A are rejected.
    pub fn from_bits(bits: i32) -> Result<Self, ParseError> {
        u8::try_from(bits)
            .ok()
            .filter(|b| *b <= 0x0f)
            .map(PortSet)
            .ok_or_else(|| ParseError::invalid_data(format!("port bitmap {bits} out of range")))
    }

    #[must_use]
    pub fn bits(self) -> u8 {
        self.0
    }

    #[must_use]
    pub fn contains(self, port: MotorPort) -> bool {
        self.0 & port.bit() != 0
    }

    #[must_use]
    pub fn with(self, port: MotorPort) -> Self {
        PortSet(self.0 | port.bit())
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = MotorPort> {
        MotorPort::ALL.into_iter().filter(move |p| self.contains(*p))
    }
}

impl FromIterator<MotorPort> for PortSet {
    fn from_iter<I: IntoIterator<Item = MotorPort>>(iter: I) -> Self {
        iter.into_iter().fold(PortSet::EMPTY, PortSet::with)
    }
}

/// Position of a track switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum SwitchPosition {
    Straight = 0,
    Diverging = 1,
}

impl SwitchPosition {
    #[must_use]
    pub fn code(self) -> i16 {
        self as i16
    }

    /// Position encoded by a port's bit in a positions bitmap.
    #[must_use]
    pub fn from_bit(set: bool) -> Self {
        if set {
            SwitchPosition::Diverging
        } else {
            SwitchPosition::Straight
        }
    }
}

impl fmt::Display for SwitchPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwitchPosition::Straight => write!(f, "STRAIGHT"),
            SwitchPosition::Diverging => write!(f, "DIVERGING"),
        }
    }
}

impl FromStr for SwitchPosition {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "STRAIGHT" => Ok(SwitchPosition::Straight),
            "DIVERGING" => Ok(SwitchPosition::Diverging),
            _ => Err(ParseError::invalid_data(format!(
                "unknown switch position '{s}'"
            ))),
        }
    }
}

/// Kind of motor attached to a switch port, detected by probing the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum MotorKind {
    /// Motor with rotation sensor.
    Motor,
    /// Plain DC motor without feedback.
    DcMotor,
    /// Not yet detected. Blocks position commands.
    #[default]
    Unknown,
}

/// Colors reported by the train's color sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
#[repr(u8)]
pub enum Color {
    /// Nothing detected.
    #[default]
    None = 0,
    Red = 1,
    Yellow = 2,
    Green = 3,
    Blue = 4,
    Gray = 5,
    White = 6,
}

impl Color {
    /// Decode a color code as sent by the train program.
    ///
    /// ```
    /// use railhub_types::Color;
    ///
    /// assert_eq!(Color::from_code(1), Some(Color::Red));
    /// assert_eq!(Color::from_code(9), None);
    /// ```
    #[must_use]
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Color::None),
            1 => Some(Color::Red),
            2 => Some(Color::Yellow),
            3 => Some(Color::Green),
            4 => Some(Color::Blue),
            5 => Some(Color::Gray),
            6 => Some(Color::White),
            _ => None,
        }
    }

    #[must_use]
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Whether the color can be used as a track marker. Gray and white
    /// are too close to the track and sleepers to be told apart reliably.
    #[must_use]
    pub fn is_marker(self) -> bool {
        matches!(
            self,
            Color::Red | Color::Yellow | Color::Green | Color::Blue
        )
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Color::None => "NONE",
            Color::Red => "RED",
            Color::Yellow => "YELLOW",
            Color::Green => "GREEN",
            Color::Blue => "BLUE",
            Color::Gray => "GRAY",
            Color::White => "WHITE",
        };
        f.write_str(s)
    }
}

impl FromStr for Color {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NONE" => Ok(Color::None),
            "RED" => Ok(Color::Red),
            "YELLOW" => Ok(Color::Yellow),
            "GREEN" => Ok(Color::Green),
            "BLUE" => Ok(Color::Blue),
            "GRAY" | "GREY" => Ok(Color::Gray),
            "WHITE" => Ok(Color::White),
            _ => Err(ParseError::invalid_data(format!("unknown color '{s}'"))),
        }
    }
}

/// Travel direction, derived from the sign of the motor power.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Direction {
    Forward,
    Backward,
    #[default]
    Stopped,
}

impl Direction {
    #[must_use]
    pub fn from_power(power: i8) -> Self {
        match power.signum() {
            1 => Direction::Forward,
            -1 => Direction::Backward,
            _ => Direction::Stopped,
        }
    }
}

/// Signal quality bucket derived from RSSI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum SignalQuality {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl SignalQuality {
    #[must_use]
    pub fn from_rssi(rssi: i16) -> Self {
        match rssi {
            r if r > -60 => SignalQuality::Excellent,
            r if r > -75 => SignalQuality::Good,
            r if r > -85 => SignalQuality::Fair,
            _ => SignalQuality::Poor,
        }
    }
}
