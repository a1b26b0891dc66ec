use super::{Codec, DeviceEvent, OutboundCommand};
use crate::{
    action::{Readiness, Transaction},
    error::{Result, WearlinkError},
    frame,
    prefs::Preferences,
    types::{BatteryState, DeviceFamily},
};
use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, warn};
use uuid::Uuid;

/// Characteristic packets are written to
pub const COMMAND_CHAR: Uuid = Uuid::from_u128(0x0000_1101_D102_11E1_9B23_0002_5B00_A5A5);
/// Characteristic packets arrive on
pub const RESPONSE_CHAR: Uuid = Uuid::from_u128(0x0000_1102_D102_11E1_9B23_0002_5B00_A5A5);

/// Preference: noise control mode, 0 off, 1 cancelling, 2 transparency
pub const PREF_ANC_MODE: &str = "headphones_anc_mode";

const SOF: u8 = 0xFF;
const PROTOCOL_VERSION: u8 = 0x03;
const FLAG_CRC: u8 = 0x01;
const HEADER_LEN: usize = 9;
/// Vendor id the headphones answer to
pub const VENDOR_ID: u16 = 0x000A;

/// Packet kinds carried in bits 7..9 of the command word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PduType {
    /// Host command
    Command = 0,
    /// Unsolicited device message
    Notification = 1,
    /// Successful reply
    Response = 2,
    /// Failed reply
    Error = 3,
}

impl PduType {
    const fn from_bits(bits: u16) -> Self {
        match bits & 0x03 {
            0 => Self::Command,
            1 => Self::Notification,
            2 => Self::Response,
            _ => Self::Error,
        }
    }
}

/// Feature ids
pub mod feature {
    /// Device information
    pub const CORE: u8 = 0x00;
    /// Battery
    pub const BATTERY: u8 = 0x01;
    /// Noise control
    pub const ANC: u8 = 0x02;
    /// Locate
    pub const FIND: u8 = 0x03;
}

mod id {
    pub const GET_VERSION: u8 = 0x01;
    pub const LEVEL_CHANGED: u8 = 0x00;
    pub const GET_LEVELS: u8 = 0x01;
    pub const MODE_CHANGED: u8 = 0x00;
    pub const SET_MODE: u8 = 0x01;
    pub const RING: u8 = 0x01;
}

/// One vendor packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Feature id, 7 bits
    pub feature: u8,
    /// Packet kind
    pub pdu: PduType,
    /// Command id within the feature, 7 bits
    pub id: u8,
    /// Payload
    pub payload: Bytes,
}

impl Packet {
    /// Compose the 16-bit command word
    #[must_use]
    pub fn command_word(&self) -> u16 {
        (u16::from(self.feature & 0x7F) << 9) | ((self.pdu as u16) << 7) | u16::from(self.id & 0x7F)
    }

    /// Serialize with a trailing CRC
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let len = u16::try_from(self.payload.len()).unwrap_or(u16::MAX);
        let mut buf = BytesMut::with_capacity(HEADER_LEN + usize::from(len) + 2);
        buf.put_u8(SOF);
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(FLAG_CRC);
        buf.put_u16(len);
        buf.put_u16(VENDOR_ID);
        buf.put_u16(self.command_word());
        buf.put_slice(&self.payload[..usize::from(len)]);
        let crc = frame::crc16_modbus(&buf[1..]);
        buf.put_u16_le(crc);
        buf.freeze()
    }
}

/// Split a chunk into packets
///
/// A malformed header or an unknown protocol version ends decoding; a packet claiming more bytes than remain
/// is dropped along with the rest of the chunk; CRC failures skip one packet.
#[must_use]
pub fn decode_packets(data: &[u8]) -> Vec<Packet> {
    let mut packets = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        if rest.len() < HEADER_LEN || rest[0] != SOF || rest[1] != PROTOCOL_VERSION {
            warn!("Malformed packet header, dropping {:02X?}", rest);
            break;
        }
        let flags = rest[2];
        let payload_len = usize::from(frame::u16_be(rest, 3).unwrap_or_default());
        let crc_len = if flags & FLAG_CRC != 0 { 2 } else { 0 };
        let total = HEADER_LEN + payload_len + crc_len;
        if total > rest.len() {
            warn!(
                "Packet declares {} bytes but only {} arrived, dropping tail",
                total,
                rest.len()
            );
            break;
        }

        let (raw, tail) = rest.split_at(total);
        rest = tail;
        let body_end = HEADER_LEN + payload_len;
        if crc_len > 0 {
            let expected = frame::crc16_modbus(&raw[1..body_end]);
            let received = frame::u16_le(raw, body_end).unwrap_or_default();
            if let Err(e) = frame::verify("CRC", received, expected) {
                warn!("{} in {:02X?}", e, raw);
                continue;
            }
        }

        let vendor = frame::u16_be(raw, 5).unwrap_or_default();
        if vendor != VENDOR_ID {
            debug!("Ignoring packet for vendor {:04X}", vendor);
            continue;
        }
        let word = frame::u16_be(raw, 7).unwrap_or_default();
        packets.push(Packet {
            feature: u8::try_from(word >> 9).unwrap_or_default(),
            pdu: PduType::from_bits(word >> 7),
            id: u8::try_from(word & 0x7F).unwrap_or_default(),
            payload: Bytes::copy_from_slice(&raw[HEADER_LEN..body_end]),
        });
    }
    packets
}

/// Codec for headphones speaking vendor-framed feature packets
#[derive(Debug, Default)]
pub struct HeadphonesCodec;

impl HeadphonesCodec {
    /// New codec
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn command(feature: u8, id: u8, payload: &[u8]) -> Bytes {
        Packet {
            feature,
            pdu: PduType::Command,
            id,
            payload: Bytes::copy_from_slice(payload),
        }
        .encode()
    }

    fn packet_events(packet: &Packet) -> Vec<DeviceEvent> {
        let payload = packet.payload.as_ref();
        match packet.pdu {
            PduType::Error => {
                warn!(
                    "Device rejected feature {:02X} command {:02X}: {:02X?}",
                    packet.feature, packet.id, payload
                );
                return Vec::new();
            }
            PduType::Command => {
                debug!("Ignoring command PDU from device");
                return Vec::new();
            }
            PduType::Notification | PduType::Response => {}
        }

        match (packet.feature, packet.id) {
            (feature::CORE, id::GET_VERSION) if packet.pdu == PduType::Response => {
                let text = String::from_utf8_lossy(payload);
                vec![DeviceEvent::VersionInfo {
                    firmware: text.trim_end_matches('\0').to_string(),
                    hardware: None,
                }]
            }
            (feature::BATTERY, id::GET_LEVELS | id::LEVEL_CHANGED) => payload
                .chunks_exact(2)
                .map(|pair| {
                    let (level, state) = match pair[1] {
                        0xFF => (None, BatteryState::Unknown),
                        level if level & 0x80 != 0 => {
                            (Some((level & 0x7F).min(100)), BatteryState::Charging)
                        }
                        level => (Some(level.min(100)), BatteryState::Normal),
                    };
                    DeviceEvent::BatteryInfo {
                        index: pair[0],
                        level,
                        state,
                    }
                })
                .collect(),
            (feature::ANC, id::MODE_CHANGED) if packet.pdu == PduType::Notification => payload
                .first()
                .map(|mode| {
                    DeviceEvent::UpdatePreferences(
                        Preferences::new().with(PREF_ANC_MODE, i64::from(*mode)),
                    )
                })
                .into_iter()
                .collect(),
            (feature, id) => {
                debug!("No events for feature {:02X} id {:02X}", feature, id);
                Vec::new()
            }
        }
    }
}

impl Codec for HeadphonesCodec {
    fn family(&self) -> DeviceFamily {
        DeviceFamily::Headphones
    }

    fn write_characteristic(&self) -> Uuid {
        COMMAND_CHAR
    }

    fn notify_characteristics(&self) -> Vec<Uuid> {
        vec![RESPONSE_CHAR]
    }

    fn initialize(&mut self, _prefs: &Preferences) -> Result<Transaction> {
        Ok(Transaction::builder("initialize headphones")
            .requires(Readiness::Link)
            .notify(RESPONSE_CHAR, true)
            .write(COMMAND_CHAR, Self::command(feature::CORE, id::GET_VERSION, &[]))
            .write(COMMAND_CHAR, Self::command(feature::BATTERY, id::GET_LEVELS, &[]))
            .build())
    }

    fn encode(&mut self, command: &OutboundCommand, prefs: &Preferences) -> Result<Option<Bytes>> {
        match command {
            OutboundCommand::FindDevice(start) => Ok(Some(Self::command(
                feature::FIND,
                id::RING,
                &[u8::from(*start)],
            ))),
            OutboundCommand::SendConfiguration(key) if key == PREF_ANC_MODE => {
                let mode = prefs.int(PREF_ANC_MODE).unwrap_or(0);
                let mode = u8::try_from(mode).ok().filter(|mode| *mode <= 2).ok_or_else(|| {
                    WearlinkError::InvalidConfiguration {
                        key: PREF_ANC_MODE.to_string(),
                        reason: format!("mode {mode} outside 0..=2"),
                    }
                })?;
                Ok(Some(Self::command(feature::ANC, id::SET_MODE, &[mode])))
            }
            _ => Ok(None),
        }
    }

    fn decode(&mut self, characteristic: Uuid, data: &[u8]) -> Vec<DeviceEvent> {
        if characteristic != RESPONSE_CHAR {
            return Vec::new();
        }
        decode_packets(data)
            .iter()
            .flat_map(Self::packet_events)
            .collect()
    }

    fn max_write_size(&self) -> usize {
        64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device_packet(feature: u8, pdu: PduType, id: u8, payload: &[u8]) -> Vec<u8> {
        Packet {
            feature,
            pdu,
            id,
            payload: Bytes::copy_from_slice(payload),
        }
        .encode()
        .to_vec()
    }

    #[test]
    fn test_command_word_layout() {
        let packet = Packet {
            feature: feature::ANC,
            pdu: PduType::Response,
            id: 0x05,
            payload: Bytes::new(),
        };
        assert_eq!(packet.command_word(), 0x0505);

        let bytes = packet.encode();
        assert_eq!(&bytes[..HEADER_LEN], &[0xFF, 0x03, 0x01, 0x00, 0x00, 0x00, 0x0A, 0x05, 0x05]);
        assert_eq!(bytes.len(), HEADER_LEN + 2);
        let crc = frame::crc16_modbus(&bytes[1..HEADER_LEN]);
        assert_eq!(&bytes[HEADER_LEN..], &crc.to_le_bytes());
    }

    #[test]
    fn test_battery_levels() {
        let mut codec = HeadphonesCodec::new();
        let data = device_packet(
            feature::BATTERY,
            PduType::Notification,
            id::LEVEL_CHANGED,
            &[0x00, 0x80 | 55, 0x01, 0xFF],
        );
        assert_eq!(
            codec.decode(RESPONSE_CHAR, &data),
            vec![
                DeviceEvent::BatteryInfo {
                    index: 0,
                    level: Some(55),
                    state: BatteryState::Charging
                },
                DeviceEvent::BatteryInfo {
                    index: 1,
                    level: None,
                    state: BatteryState::Unknown
                },
            ]
        );
    }

    #[test]
    fn test_packet_without_crc() {
        let mut codec = HeadphonesCodec::new();
        let mut data = vec![0xFF, 0x03, 0x00, 0x00, 0x03, 0x00, 0x0A];
        data.extend_from_slice(&0x0101u16.to_be_bytes());
        data.extend_from_slice(b"1.9");
        assert_eq!(
            codec.decode(RESPONSE_CHAR, &data),
            vec![DeviceEvent::VersionInfo {
                firmware: "1.9".to_string(),
                hardware: None
            }]
        );
    }

    #[test]
    fn test_corrupted_crc_yields_no_events() {
        let mut codec = HeadphonesCodec::new();
        let mut data = device_packet(feature::BATTERY, PduType::Response, id::GET_LEVELS, &[0, 40]);
        let last = data.len() - 1;
        data[last] ^= 0x01;
        assert!(codec.decode(RESPONSE_CHAR, &data).is_empty());
    }

    #[test]
    fn test_loop_decode_drops_truncated_tail() {
        let mut codec = HeadphonesCodec::new();
        let mut data = device_packet(feature::ANC, PduType::Notification, id::MODE_CHANGED, &[1]);
        data.extend(device_packet(feature::BATTERY, PduType::Response, id::GET_LEVELS, &[0, 70]));
        let partial = device_packet(feature::BATTERY, PduType::Response, id::GET_LEVELS, &[0, 10]);
        data.extend_from_slice(&partial[..partial.len() - 3]);

        let events = codec.decode(RESPONSE_CHAR, &data);
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            DeviceEvent::UpdatePreferences(Preferences::new().with(PREF_ANC_MODE, 1i64))
        );
        assert!(matches!(
            events[1],
            DeviceEvent::BatteryInfo {
                level: Some(70),
                ..
            }
        ));
    }

    #[test]
    fn test_error_pdu_and_bad_header() {
        let mut codec = HeadphonesCodec::new();
        let error = device_packet(feature::FIND, PduType::Error, id::RING, &[0x02]);
        assert!(codec.decode(RESPONSE_CHAR, &error).is_empty());
        assert!(codec.decode(RESPONSE_CHAR, &[0xFE, 0x03, 0x00]).is_empty());
    }

    #[test]
    fn test_unknown_protocol_version_is_rejected() {
        let mut codec = HeadphonesCodec::new();
        let mut data = device_packet(feature::BATTERY, PduType::Response, id::GET_LEVELS, &[0, 40]);
        data[1] = 0x04;
        let crc = frame::crc16_modbus(&data[1..data.len() - 2]);
        let crc_at = data.len() - 2;
        data[crc_at..].copy_from_slice(&crc.to_le_bytes());

        assert!(decode_packets(&data).is_empty());
        assert!(codec.decode(RESPONSE_CHAR, &data).is_empty());
    }

    #[test]
    fn test_round_trip_is_noop_or_intent() {
        let mut codec = HeadphonesCodec::new();
        let mut cases = vec![
            (OutboundCommand::FindDevice(true), Preferences::new(), feature::FIND, vec![1]),
            (OutboundCommand::FindDevice(false), Preferences::new(), feature::FIND, vec![0]),
        ];
        for mode in 0..=2u8 {
            cases.push((
                OutboundCommand::SendConfiguration(PREF_ANC_MODE.to_string()),
                Preferences::new().with(PREF_ANC_MODE, i64::from(mode)),
                feature::ANC,
                vec![mode],
            ));
        }

        for (command, prefs, expected_feature, expected_payload) in cases {
            let bytes = codec.encode(&command, &prefs).unwrap().unwrap();
            assert!(codec.decode(RESPONSE_CHAR, &bytes).is_empty(), "{command:?}");
            assert!(codec.decode(COMMAND_CHAR, &bytes).is_empty(), "{command:?}");

            let packets = decode_packets(&bytes);
            assert_eq!(packets.len(), 1, "{command:?}");
            assert_eq!(packets[0].feature, expected_feature);
            assert_eq!(packets[0].pdu, PduType::Command);
            assert_eq!(packets[0].payload.as_ref(), expected_payload.as_slice());
        }
    }

    #[test]
    fn test_encode_commands() {
        let mut codec = HeadphonesCodec::new();
        let ring = codec
            .encode(&OutboundCommand::FindDevice(true), &Preferences::new())
            .unwrap()
            .unwrap();
        let packets = decode_packets(&ring);
        assert_eq!(packets[0].feature, feature::FIND);
        assert_eq!(packets[0].pdu, PduType::Command);
        assert_eq!(packets[0].payload.as_ref(), &[1]);

        let anc = OutboundCommand::SendConfiguration(PREF_ANC_MODE.to_string());
        let prefs = Preferences::new().with(PREF_ANC_MODE, 7i64);
        assert!(matches!(
            codec.encode(&anc, &prefs),
            Err(WearlinkError::InvalidConfiguration { .. })
        ));
        assert!(codec
            .encode(&OutboundCommand::EnableRealtime(true), &Preferences::new())
            .unwrap()
            .is_none());
    }
}
