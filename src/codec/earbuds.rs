use super::{
    msgpack::{self, Value},
    Codec, DeviceEvent, OutboundCommand,
};
use crate::{
    action::{Readiness, Transaction},
    error::{Result, WearlinkError},
    frame,
    prefs::Preferences,
    types::{BatteryState, DeviceFamily},
};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashSet;
use tracing::{debug, warn};
use uuid::Uuid;

/// Characteristic requests are written to
pub const RPC_WRITE_CHAR: Uuid = Uuid::from_u128(0x2BEE_0001_4E49_4F4E_8A1C_3E30_5245_4254);
/// Characteristic responses and notifications arrive on
pub const RPC_NOTIFY_CHAR: Uuid = Uuid::from_u128(0x2BEE_0002_4E49_4F4E_8A1C_3E30_5245_4254);

/// Preference: noise control mode, one of `off`, `anc`, `ambient`
pub const PREF_NOISE_MODE: &str = "earbuds_noise_mode";
/// Preference: advertised device name
pub const PREF_DEVICE_NAME: &str = "earbuds_name";

const MAX_NAME_LEN: usize = 30;

/// Bits of the message type field
pub mod message_type {
    /// Host request
    pub const REQUEST: u16 = 0x0001;
    /// Reply to a request
    pub const RESPONSE: u16 = 0x0002;
    /// Unsolicited device message
    pub const NOTIFICATION: u16 = 0x0004;
    /// A msgpack payload follows the header
    pub const HAS_PAYLOAD: u16 = 0x0100;
}

/// RPC namespaces
pub mod namespace {
    /// Firmware information
    pub const FIRMWARE: u8 = 0x02;
    /// Noise control
    pub const NOISE: u8 = 0x03;
    /// Device name
    pub const NAME: u8 = 0x05;
    /// Battery levels
    pub const BATTERY: u8 = 0x08;
}

/// Command ids, scoped by namespace
pub mod command {
    /// Firmware: get version strings
    pub const GET_VERSION: u8 = 0x01;
    /// Noise: set mode
    pub const SET_NOISE_MODE: u8 = 0x01;
    /// Noise: get mode
    pub const GET_NOISE_MODE: u8 = 0x02;
    /// Noise: mode changed on the device
    pub const NOISE_MODE_CHANGED: u8 = 0x03;
    /// Name: set name
    pub const SET_NAME: u8 = 0x01;
    /// Battery: get levels
    pub const GET_BATTERY: u8 = 0x01;
    /// Battery: levels changed
    pub const BATTERY_CHANGED: u8 = 0x02;
}

const NOISE_MODES: [&str; 3] = ["off", "anc", "ambient"];

/// Header plus optional payload of one RPC message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcMessage {
    /// Message type bits
    pub message_type: u16,
    /// Command id
    pub command: u8,
    /// Namespace
    pub namespace: u8,
    /// Error code, responses only
    pub error_code: Option<u8>,
    /// Decoded payload
    pub payload: Option<Value>,
}

impl RpcMessage {
    /// Serialize to wire bytes
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16);
        let mut message_type = self.message_type;
        if self.payload.is_some() {
            message_type |= message_type::HAS_PAYLOAD;
        }
        buf.put_u16_le(message_type);
        buf.put_u8(self.command);
        buf.put_u8(self.namespace);
        if message_type & message_type::RESPONSE != 0 {
            buf.put_u8(self.error_code.unwrap_or(0));
        }
        if let Some(payload) = &self.payload {
            msgpack::encode(payload, &mut buf);
        }
        buf.freeze()
    }

    /// Parse wire bytes, `None` on truncation or a malformed payload
    #[must_use]
    pub fn decode(data: &[u8]) -> Option<Self> {
        let message_type = frame::u16_le(data, 0)?;
        let command = *data.get(2)?;
        let namespace = *data.get(3)?;
        let mut offset = 4;
        let error_code = if message_type & message_type::RESPONSE != 0 {
            offset += 1;
            Some(*data.get(4)?)
        } else {
            None
        };
        let payload = if message_type & message_type::HAS_PAYLOAD != 0 {
            let (value, used) = msgpack::decode(data.get(offset..)?)?;
            if offset + used != data.len() {
                debug!("{} trailing bytes after RPC payload", data.len() - offset - used);
            }
            Some(value)
        } else {
            None
        };
        Some(Self {
            message_type,
            command,
            namespace,
            error_code,
            payload,
        })
    }

    const fn is(&self, bit: u16) -> bool {
        self.message_type & bit != 0
    }
}

fn battery_events(payload: Option<&Value>) -> Vec<DeviceEvent> {
    let Some(levels) = payload.and_then(Value::as_array) else {
        warn!("Battery payload is not an array: {:?}", payload);
        return Vec::new();
    };
    levels
        .iter()
        .take(3)
        .zip(0u8..)
        .map(|(value, index)| {
            let level = value
                .as_int()
                .filter(|raw| *raw != 0xFF)
                .and_then(|raw| u8::try_from(raw).ok())
                .map(|raw| raw.min(100));
            DeviceEvent::BatteryInfo {
                index,
                level,
                state: if level.is_some() {
                    BatteryState::Normal
                } else {
                    BatteryState::Unknown
                },
            }
        })
        .collect()
}

fn version_event(payload: Option<&Value>) -> Option<DeviceEvent> {
    match payload? {
        Value::Str(firmware) => Some(DeviceEvent::VersionInfo {
            firmware: firmware.clone(),
            hardware: None,
        }),
        Value::Array(parts) => Some(DeviceEvent::VersionInfo {
            firmware: parts.first()?.as_str()?.to_string(),
            hardware: parts.get(1).and_then(Value::as_str).map(str::to_string),
        }),
        other => {
            warn!("Unexpected version payload {:?}", other);
            None
        }
    }
}

fn noise_mode_event(payload: Option<&Value>) -> Option<DeviceEvent> {
    let mode = payload?.as_int()?;
    let name = usize::try_from(mode).ok().and_then(|i| NOISE_MODES.get(i))?;
    Some(DeviceEvent::UpdatePreferences(
        Preferences::new().with(PREF_NOISE_MODE, *name),
    ))
}

/// Codec for earbuds speaking a request/response RPC with msgpack payloads
#[derive(Debug, Default)]
pub struct EarbudsCodec {
    pending: HashSet<(u8, u8)>,
}

impl EarbudsCodec {
    /// New codec with no outstanding requests
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of requests still waiting for a response
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    fn request(&mut self, namespace: u8, command: u8, payload: Option<Value>) -> Bytes {
        self.pending.insert((namespace, command));
        RpcMessage {
            message_type: message_type::REQUEST,
            command,
            namespace,
            error_code: None,
            payload,
        }
        .encode()
    }

    fn encode_configuration(&mut self, key: &str, prefs: &Preferences) -> Result<Option<Bytes>> {
        match key {
            PREF_NOISE_MODE => {
                let mode = prefs.string(PREF_NOISE_MODE).unwrap_or("off");
                let index = NOISE_MODES
                    .iter()
                    .position(|known| *known == mode)
                    .ok_or_else(|| WearlinkError::InvalidConfiguration {
                        key: PREF_NOISE_MODE.to_string(),
                        reason: format!("unknown noise mode '{mode}'"),
                    })?;
                Ok(Some(self.request(
                    namespace::NOISE,
                    command::SET_NOISE_MODE,
                    Some(Value::Int(i64::try_from(index).unwrap_or(0))),
                )))
            }
            PREF_DEVICE_NAME => {
                let name = prefs.string(PREF_DEVICE_NAME).unwrap_or_default();
                if name.is_empty() || name.len() > MAX_NAME_LEN {
                    return Err(WearlinkError::InvalidConfiguration {
                        key: PREF_DEVICE_NAME.to_string(),
                        reason: format!("name must be 1 to {MAX_NAME_LEN} bytes"),
                    });
                }
                Ok(Some(self.request(
                    namespace::NAME,
                    command::SET_NAME,
                    Some(Value::Str(name.to_string())),
                )))
            }
            _ => Ok(None),
        }
    }

    fn handle(&mut self, message: &RpcMessage) -> Vec<DeviceEvent> {
        let key = (message.namespace, message.command);
        if message.is(message_type::RESPONSE) {
            if !self.pending.remove(&key) {
                warn!(
                    "Unsolicited response ns={:02X} cmd={:02X}, dropping",
                    message.namespace, message.command
                );
                return Vec::new();
            }
            if let Some(code) = message.error_code.filter(|code| *code != 0) {
                warn!(
                    "Request ns={:02X} cmd={:02X} failed with code {:02X}",
                    message.namespace, message.command, code
                );
                return Vec::new();
            }
        } else if !message.is(message_type::NOTIFICATION) {
            debug!("Ignoring RPC message type {:04X}", message.message_type);
            return Vec::new();
        }

        let payload = message.payload.as_ref();
        match key {
            (namespace::BATTERY, command::GET_BATTERY | command::BATTERY_CHANGED) => {
                battery_events(payload)
            }
            (namespace::FIRMWARE, command::GET_VERSION) => {
                version_event(payload).into_iter().collect()
            }
            (namespace::NOISE, command::GET_NOISE_MODE | command::NOISE_MODE_CHANGED) => {
                noise_mode_event(payload).into_iter().collect()
            }
            (namespace, command) => {
                debug!(
                    "No events for ns={:02X} cmd={:02X} payload={:?}",
                    namespace, command, payload
                );
                Vec::new()
            }
        }
    }
}

impl Codec for EarbudsCodec {
    fn family(&self) -> DeviceFamily {
        DeviceFamily::Earbuds
    }

    fn write_characteristic(&self) -> Uuid {
        RPC_WRITE_CHAR
    }

    fn notify_characteristics(&self) -> Vec<Uuid> {
        vec![RPC_NOTIFY_CHAR]
    }

    fn initialize(&mut self, _prefs: &Preferences) -> Result<Transaction> {
        self.pending.clear();
        Ok(Transaction::builder("initialize earbuds")
            .requires(Readiness::Link)
            .notify(RPC_NOTIFY_CHAR, true)
            .write(
                RPC_WRITE_CHAR,
                self.request(namespace::FIRMWARE, command::GET_VERSION, None),
            )
            .write(
                RPC_WRITE_CHAR,
                self.request(namespace::BATTERY, command::GET_BATTERY, None),
            )
            .write(
                RPC_WRITE_CHAR,
                self.request(namespace::NOISE, command::GET_NOISE_MODE, None),
            )
            .build())
    }

    fn encode(&mut self, command: &OutboundCommand, prefs: &Preferences) -> Result<Option<Bytes>> {
        match command {
            OutboundCommand::SendConfiguration(key) => self.encode_configuration(key, prefs),
            _ => Ok(None),
        }
    }

    fn decode(&mut self, characteristic: Uuid, data: &[u8]) -> Vec<DeviceEvent> {
        if characteristic != RPC_NOTIFY_CHAR {
            return Vec::new();
        }
        match RpcMessage::decode(data) {
            Some(message) => self.handle(&message),
            None => {
                warn!("Malformed RPC message {:02X?}", data);
                Vec::new()
            }
        }
    }
}
