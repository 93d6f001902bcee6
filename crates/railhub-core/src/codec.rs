//! Per-role payload codecs.
//!
//! The engine and state machines treat payloads as opaque bytes. A codec
//! turns role-level commands into payloads and pushed notifications into
//! [`Notification`]s. The shipped codecs speak the packed value format of
//! the hub programs (see [`railhub_types::wire`]).

use std::fmt::Debug;
use std::sync::Arc;

use bytes::Bytes;

use railhub_types::wire::{self, Value};
use railhub_types::{
    ColorReading, HubIdentity, HubRole, MotorPort, Notification, ParseError, ParseResult,
    PortIdentity, SwitchPosition, SwitchStatus, TrainStatus,
};

/// Mode value that turns self-drive on in the train program.
pub const SELF_DRIVE_ON: i8 = 101;
/// Mode value that turns self-drive off in the train program.
pub const SELF_DRIVE_OFF: i8 = 102;

/// Decoding side shared by every role.
pub trait HubCodec: Send + Sync + Debug {
    fn role(&self) -> HubRole;

    fn decode(&self, payload: &[u8]) -> ParseResult<Notification>;
}

pub trait TrainCodec: HubCodec {
    fn encode_power(&self, power: i8) -> Bytes;

    fn encode_self_drive(&self, enabled: bool) -> Bytes;
}

pub trait SwitchCodec: HubCodec {
    fn encode_position(&self, port: MotorPort, position: SwitchPosition) -> Bytes;

    /// Request asking the hub to report which motor kinds are attached.
    fn encode_probe(&self) -> Bytes;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PybricksTrainCodec;

impl HubCodec for PybricksTrainCodec {
    fn role(&self) -> HubRole {
        HubRole::Train
    }

    fn decode(&self, payload: &[u8]) -> ParseResult<Notification> {
        let values = wire::decode(payload)?;
        match values.len() {
            4 => TrainStatus::from_values(&values).map(Notification::Train),
            2 => ColorReading::from_values(&values).map(Notification::Color),
            n => Err(ParseError::invalid_data(format!(
                "unexpected {n}-value train message"
            ))),
        }
    }
}

impl TrainCodec for PybricksTrainCodec {
    fn encode_power(&self, power: i8) -> Bytes {
        wire::encode_int8(power)
    }

    fn encode_self_drive(&self, enabled: bool) -> Bytes {
        wire::encode_int8(if enabled { SELF_DRIVE_ON } else { SELF_DRIVE_OFF })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PybricksSwitchCodec;

impl HubCodec for PybricksSwitchCodec {
    fn role(&self) -> HubRole {
        HubRole::Switch
    }

    fn decode(&self, payload: &[u8]) -> ParseResult<Notification> {
        let values = wire::decode(payload)?;
        match (values.len(), values.get(1)) {
            (4, Some(Value::Str(_))) => HubIdentity::from_values(&values).map(Notification::Identity),
            (4, _) => SwitchStatus::from_values(&values).map(Notification::Switch),
            (3, _) => PortIdentity::from_values(&values).map(Notification::Ports),
            (n, _) => Err(ParseError::invalid_data(format!(
                "unexpected {n}-value switch message"
            ))),
        }
    }
}

impl SwitchCodec for PybricksSwitchCodec {
    fn encode_position(&self, port: MotorPort, position: SwitchPosition) -> Bytes {
        wire::encode_int16(port.switch_number() * 1000 + position.code())
    }

    fn encode_probe(&self) -> Bytes {
        wire::encode_int16(0)
    }
}

/// The codec in use for each role.
#[derive(Debug, Clone)]
pub struct Codecs {
    pub train: Arc<dyn TrainCodec>,
    pub switch: Arc<dyn SwitchCodec>,
}

impl Codecs {
    /// Decoder for hubs of `role`.
    pub fn for_role(&self, role: HubRole) -> Arc<dyn HubCodec> {
        match role {
            HubRole::Train => self.train.clone(),
            HubRole::Switch => self.switch.clone(),
        }
    }
}

impl Default for Codecs {
    fn default() -> Self {
        Self {
            train: Arc::new(PybricksTrainCodec),
            switch: Arc::new(PybricksSwitchCodec),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use railhub_types::{Color, PortSet};

    #[test]
    fn test_train_commands() {
        let codec = PybricksTrainCodec;
        assert_eq!(&codec.encode_power(-50)[..], &[0x00, 0x61, 0xce]);
        assert_eq!(&codec.encode_power(0)[..], &[0x00, 0x61, 0x00]);
        assert_eq!(&codec.encode_self_drive(true)[..], &[0x00, 0x61, 101]);
        assert_eq!(&codec.encode_self_drive(false)[..], &[0x00, 0x61, 102]);
    }

    #[test]
    fn test_switch_commands() {
        let codec = PybricksSwitchCodec;
        // 1001 = 0x03e9
        assert_eq!(
            &codec.encode_position(MotorPort::A, SwitchPosition::Diverging)[..],
            &[0x00, 0x62, 0xe9, 0x03]
        );
        // 4000 = 0x0fa0
        assert_eq!(
            &codec.encode_position(MotorPort::D, SwitchPosition::Straight)[..],
            &[0x00, 0x62, 0xa0, 0x0f]
        );
        assert_eq!(&codec.encode_probe()[..], &[0x00, 0x62, 0x00, 0x00]);
    }

    #[test]
    fn test_train_decode_dispatch() {
        let codec = PybricksTrainCodec;
        let color = wire::encode_tuple(&[21.into(), 1.into()]);
        assert_eq!(
            codec.decode(&color).unwrap(),
            Notification::Color(ColorReading {
                channel: 21,
                color: Color::Red
            })
        );

        let status = wire::encode_tuple(&[21.into(), "T1".into(), 1.into(), 30.into()]);
        assert!(matches!(codec.decode(&status).unwrap(), Notification::Train(s) if s.power == 30));

        let odd = wire::encode_tuple(&[21.into(), 1.into(), 2.into()]);
        assert!(codec.decode(&odd).is_err());
    }

    #[test]
    fn test_switch_decode_dispatch() {
        let codec = PybricksSwitchCodec;

        let identity = wire::encode_tuple(&[1.into(), "Technic Hub".into(), 1.into(), 0b1100.into()]);
        assert!(matches!(codec.decode(&identity).unwrap(), Notification::Identity(_)));

        let status = wire::encode_tuple(&[1.into(), 11.into(), 0b1000.into(), 0b1100.into()]);
        match codec.decode(&status).unwrap() {
            Notification::Switch(s) => {
                assert_eq!(s.position(MotorPort::A), Some(SwitchPosition::Diverging));
                assert_eq!(s.connected, PortSet::from_bits(0b1100).unwrap());
            }
            other => panic!("unexpected {other:?}"),
        }

        let ports = wire::encode_tuple(&[1.into(), 0b1000.into(), 0b0100.into()]);
        assert!(matches!(codec.decode(&ports).unwrap(), Notification::Ports(_)));
    }

    #[test]
    fn test_codecs_for_role() {
        let codecs = Codecs::default();
        assert_eq!(codecs.for_role(HubRole::Train).role(), HubRole::Train);
        assert_eq!(codecs.for_role(HubRole::Switch).role(), HubRole::Switch);
    }
}
