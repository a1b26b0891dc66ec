//! Key finder tags that gate their alert behind a challenge-response handshake.
//!
//! The tag notifies `[0x01, challenge..]` on the auth status characteristic and
//! expects `[0x02, response(16)]` back on the auth response characteristic.
//! The response is derived from the tag's address, the challenge and two
//! per-device keys. Keys can be recovered from one captured exchange.

use super::{Codec, DeviceEvent, OutboundCommand};
use crate::{
    action::{Continuation, Readiness, Transaction},
    error::{Result, WearlinkError},
    frame,
    prefs::{ConfigValue, Preferences},
    transport::{sig_uuid, BATTERY_LEVEL_CHAR},
    types::{BatteryState, DeviceFamily},
};
use bytes::Bytes;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Standard Alert Level characteristic, used for the audible alert
pub const ALERT_LEVEL_CHAR: Uuid = sig_uuid(0x2A06);
/// Challenges and auth results arrive here
pub const AUTH_STATUS_CHAR: Uuid = Uuid::from_u128(0x0000_FFF6_0000_1000_8000_0080_5F9B_34FB);
/// Responses are written here
pub const AUTH_RESPONSE_CHAR: Uuid = Uuid::from_u128(0x0000_FFF5_0000_1000_8000_0080_5F9B_34FB);
/// Button presses arrive here
pub const BUTTON_CHAR: Uuid = Uuid::from_u128(0x0000_FFE1_0000_1000_8000_0080_5F9B_34FB);

/// Preference: first authentication key, decimal string
pub const PREF_KEY_1: &str = "tag_key_1";
/// Preference: second authentication key, decimal string
pub const PREF_KEY_2: &str = "tag_key_2";
/// Preference: captured challenge, hex including preamble
pub const PREF_CAPTURED_CHALLENGE: &str = "tag_auth_challenge";
/// Preference: captured response, hex including preamble
pub const PREF_CAPTURED_RESPONSE: &str = "tag_auth_response";

const CHALLENGE_PREAMBLE: u8 = 0x01;
const RESPONSE_PREAMBLE: u8 = 0x02;
const AUTH_RESULT: u8 = 0x03;
const AUTH_OK: u8 = 0x55;
const KEY_WRITTEN: u8 = 0x05;
const ALERT_START: u8 = 0x04;
const ALERT_STOP: u8 = 0x03;
const LINK_LOSS_ALERT_OFF: u8 = 0x00;

/// Times the alert is re-triggered
pub const ALERT_REPEATS: usize = 3;
/// Pause between alert triggers
pub const ALERT_INTERVAL: Duration = Duration::from_secs(2);

const MAX64: i128 = u64::MAX as i128;

fn overflow() -> WearlinkError {
    WearlinkError::InvalidParameters("challenge value out of range".to_string())
}

/// Unsigned big-endian integer, `None` beyond `i128`
fn unsigned(bytes: &[u8]) -> Option<i128> {
    let mut value: u128 = 0;
    for byte in bytes {
        value = value.checked_mul(256)?.checked_add(u128::from(*byte))?;
    }
    i128::try_from(value).ok()
}

/// Shortest big-endian two's complement encoding, at least one byte
fn signed_bytes(value: i128) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < bytes.len() - 1 {
        let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
            || (bytes[start] == 0xFF && bytes[start + 1] & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    bytes[start..].to_vec()
}

/// Place the last 8 bytes of `second` reversed into the first half and the
/// last 8 bytes of `first` reversed into the second half
#[must_use]
pub fn concat_reverse_with_pad(first: &[u8], second: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    for (half, source) in [(0usize, second), (8, first)] {
        let used = source.len().min(8);
        let skip = source.len() - used;
        for i in 0..used {
            out[half + used - 1 - i] = source[skip + i];
        }
    }
    out
}

/// Inverse of [`concat_reverse_with_pad`], returning `(first, second)`
#[must_use]
pub fn deconcat_reverse_with_pad(input: &[u8; 16]) -> ([u8; 8], [u8; 8]) {
    let mut first = [0u8; 8];
    let mut second = [0u8; 8];
    for i in 0..8 {
        second[7 - i] = input[i];
        first[7 - i] = input[8 + i];
    }
    (first, second)
}

/// Compute the 16-byte response to `challenge` (preamble included)
///
/// # Errors
///
/// Returns [`WearlinkError::InvalidParameters`] if the challenge does not start
/// with `0x01` or is too large to process.
pub fn password_generation(
    mac: &[u8; 6],
    challenge: &[u8],
    key1: i128,
    key2: i128,
) -> Result<[u8; 16]> {
    let Some((&CHALLENGE_PREAMBLE, body)) = challenge.split_first() else {
        return Err(WearlinkError::InvalidParameters(
            "challenge must start with 0x01".to_string(),
        ));
    };
    let mut reversed = body.to_vec();
    reversed.reverse();
    let c = unsigned(mac)
        .zip(unsigned(&reversed))
        .and_then(|(mac, challenge)| mac.checked_add(challenge))
        .ok_or_else(overflow)?;

    let tmp1 = key2 ^ MAX64;
    let result1 = if c > tmp1 {
        c.checked_add(key1)
            .and_then(|sum| sum.checked_sub(tmp1))
            .ok_or_else(overflow)?
    } else {
        key1
    };
    let result2 = if key2 % 2 == 1 {
        key2.checked_add(c)
    } else {
        key2.checked_mul(2).and_then(|double| double.checked_add(c))
    }
    .ok_or_else(overflow)?;

    Ok(concat_reverse_with_pad(
        &signed_bytes(result1),
        &signed_bytes(result2),
    ))
}

/// Recover `(key1, key2)` from one observed exchange
///
/// `challenge` and `response` include their preambles. Returns `None` when no
/// candidate key pair reproduces the response.
#[must_use]
pub fn reverse_password_generation(
    challenge: &[u8],
    response: &[u8],
    mac: &[u8; 6],
) -> Option<(i128, i128)> {
    if response.first() != Some(&RESPONSE_PREAMBLE) {
        warn!("Response must start with 0x02");
        return None;
    }
    let clean: [u8; 16] = response.get(1..17)?.try_into().ok()?;
    let mut counter = challenge.get(1..5)?.to_vec();
    counter.reverse();

    let (original1, original2) = deconcat_reverse_with_pad(&clean);
    let original1 = unsigned(&original1)?;
    let original2 = unsigned(&original2)?;
    let c = unsigned(mac)?.checked_add(unsigned(&counter)?)?;

    let key1a = original1;
    let key2a = original2 - c;
    let key2b = original2.checked_mul(2)? - c;
    let candidates = [
        (key1a, key2a),
        (key1a, key2b),
        (c + (key2a ^ MAX64) + original1, key2a),
        (c + (key2b ^ MAX64) + original1, key2b),
    ];

    let found = candidates.into_iter().find(|(key1, key2)| {
        password_generation(mac, challenge, *key1, *key2).is_ok_and(|generated| generated == clean)
    });
    if found.is_none() {
        warn!("No key pair reproduces the captured response");
    }
    found
}

fn pref_key(prefs: &Preferences, key: &str) -> Option<i128> {
    match prefs.get(key)? {
        ConfigValue::Int(value) => Some(i128::from(*value)),
        ConfigValue::String(value) => value.trim().parse().ok(),
        _ => None,
    }
}

fn captured(prefs: &Preferences, key: &str) -> Option<Vec<u8>> {
    let hex = prefs.string(key)?;
    match frame::parse_hex(hex) {
        Ok(bytes) if bytes.iter().any(|b| *b != 0) => Some(bytes),
        Ok(_) => None,
        Err(e) => {
            warn!("Ignoring {}: {}", key, e);
            None
        }
    }
}

/// Codec for challenge-response key finder tags
#[derive(Debug)]
pub struct TagCodec {
    mac: [u8; 6],
    keys: Option<(i128, i128)>,
    capture: Option<(Vec<u8>, Vec<u8>)>,
    authenticated: bool,
    alerting: Arc<AtomicBool>,
}

impl TagCodec {
    /// Codec for the tag at `address`
    ///
    /// # Errors
    ///
    /// Returns [`WearlinkError::InvalidParameters`] if `address` is not a MAC address.
    pub fn new(address: &str) -> Result<Self> {
        Ok(Self {
            mac: frame::parse_mac(address)?,
            keys: None,
            capture: None,
            authenticated: false,
            alerting: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Whether the tag accepted our last response
    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    fn answer_challenge(&mut self, challenge: &[u8]) -> Vec<DeviceEvent> {
        let mut events = Vec::new();
        let (key1, key2) = match (self.keys, &self.capture) {
            (Some(keys), _) => keys,
            (None, Some((captured_challenge, captured_response))) => {
                match reverse_password_generation(captured_challenge, captured_response, &self.mac)
                {
                    Some(keys) => {
                        info!("Recovered tag keys from captured exchange");
                        self.keys = Some(keys);
                        events.push(DeviceEvent::UpdatePreferences(
                            Preferences::new()
                                .with(PREF_KEY_1, keys.0.to_string())
                                .with(PREF_KEY_2, keys.1.to_string()),
                        ));
                        keys
                    }
                    None => {
                        return vec![DeviceEvent::AuthenticationFailed {
                            reason: "captured challenge and response yield no keys".to_string(),
                        }];
                    }
                }
            }
            // Factory fresh tags accept the all-zero keys
            (None, None) => (0, 0),
        };

        match password_generation(&self.mac, challenge, key1, key2) {
            Ok(response) => {
                let mut payload = Vec::with_capacity(17);
                payload.push(RESPONSE_PREAMBLE);
                payload.extend_from_slice(&response);
                events.push(DeviceEvent::SendBytes {
                    characteristic: AUTH_RESPONSE_CHAR,
                    payload: Bytes::from(payload),
                });
            }
            Err(e) => events.push(DeviceEvent::AuthenticationFailed {
                reason: e.to_string(),
            }),
        }
        events
    }

    fn auth_status(&mut self, data: &[u8]) -> Vec<DeviceEvent> {
        match data {
            [CHALLENGE_PREAMBLE, ..] => self.answer_challenge(data),
            [AUTH_RESULT, AUTH_OK, ..] => {
                info!("Tag authenticated");
                self.authenticated = true;
                vec![DeviceEvent::SendBytes {
                    characteristic: ALERT_LEVEL_CHAR,
                    payload: Bytes::from_static(&[LINK_LOSS_ALERT_OFF]),
                }]
            }
            [AUTH_RESULT, ..] => {
                self.authenticated = false;
                vec![DeviceEvent::AuthenticationFailed {
                    reason: "tag rejected the response".to_string(),
                }]
            }
            [KEY_WRITTEN, ..] => {
                debug!("Tag confirmed new key");
                Vec::new()
            }
            _ => {
                warn!("Invalid auth status packet {:02X?}", data);
                Vec::new()
            }
        }
    }
}

impl Codec for TagCodec {
    fn family(&self) -> DeviceFamily {
        DeviceFamily::Tag
    }

    fn write_characteristic(&self) -> Uuid {
        ALERT_LEVEL_CHAR
    }

    fn notify_characteristics(&self) -> Vec<Uuid> {
        vec![AUTH_STATUS_CHAR, BUTTON_CHAR]
    }

    fn load_preferences(&mut self, prefs: &Preferences) {
        self.keys = pref_key(prefs, PREF_KEY_1)
            .zip(pref_key(prefs, PREF_KEY_2))
            .filter(|keys| *keys != (0, 0));
        self.capture = captured(prefs, PREF_CAPTURED_CHALLENGE)
            .zip(captured(prefs, PREF_CAPTURED_RESPONSE));
    }

    fn initialize(&mut self, prefs: &Preferences) -> Result<Transaction> {
        self.load_preferences(prefs);
        self.authenticated = false;
        self.alerting.store(false, Ordering::SeqCst);
        Ok(Transaction::builder("initialize tag")
            .requires(Readiness::Link)
            .read(BATTERY_LEVEL_CHAR)
            .notify(AUTH_STATUS_CHAR, true)
            .notify(BUTTON_CHAR, true)
            .build())
    }

    fn encode(&mut self, command: &OutboundCommand, _prefs: &Preferences) -> Result<Option<Bytes>> {
        Ok(match command {
            OutboundCommand::FindDevice(true) => Some(Bytes::from_static(&[ALERT_START])),
            OutboundCommand::FindDevice(false) => Some(Bytes::from_static(&[ALERT_STOP])),
            _ => None,
        })
    }

    fn build(
        &mut self,
        command: &OutboundCommand,
        prefs: &Preferences,
    ) -> Result<Option<Transaction>> {
        let Some(frame) = self.encode(command, prefs)? else {
            debug!("tag codec ignores {}", command.name());
            return Ok(None);
        };
        if !self.authenticated {
            warn!("Tag not authenticated, can't {}", command.name());
            return Ok(None);
        }

        if !matches!(command, OutboundCommand::FindDevice(true)) {
            self.alerting.store(false, Ordering::SeqCst);
            return Ok(Some(
                Transaction::builder(command.name())
                    .write(ALERT_LEVEL_CHAR, frame)
                    .build(),
            ));
        }

        self.alerting.store(true, Ordering::SeqCst);
        let mut builder = Transaction::builder(command.name());
        for round in 0..ALERT_REPEATS {
            if round > 0 {
                let alerting = Arc::clone(&self.alerting);
                builder = builder.callback(move |ctx| {
                    if alerting.load(Ordering::SeqCst) {
                        Continuation::Continue
                    } else {
                        debug!("{}: alert acknowledged, skipping repeats", ctx.address);
                        Continuation::Abort
                    }
                });
            }
            builder = builder
                .write(ALERT_LEVEL_CHAR, frame.clone())
                .wait(ALERT_INTERVAL);
        }
        let alerting = Arc::clone(&self.alerting);
        builder = builder.callback(move |_| {
            alerting.store(false, Ordering::SeqCst);
            Continuation::Continue
        });
        Ok(Some(builder.build()))
    }

    fn decode(&mut self, characteristic: Uuid, data: &[u8]) -> Vec<DeviceEvent> {
        match characteristic {
            AUTH_STATUS_CHAR => self.auth_status(data),
            BUTTON_CHAR => {
                if self.alerting.swap(false, Ordering::SeqCst) {
                    debug!("Button pressed during alert");
                    Vec::new()
                } else {
                    vec![DeviceEvent::FindPhone(true)]
                }
            }
            BATTERY_LEVEL_CHAR => data
                .first()
                .map(|level| DeviceEvent::BatteryInfo {
                    index: 0,
                    level: Some((*level).min(100)),
                    state: BatteryState::Normal,
                })
                .into_iter()
                .collect(),
            other => {
                debug!("Ignoring tag value on {}: {:02X?}", other, data);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Action, CallbackContext};

    const TAG_ADDRESS: &str = "ED:5A:94:CB:98:E4";
    const ZERO_MAC: [u8; 6] = [0; 6];
    const MAC: [u8; 6] = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06];

    fn hex(input: &str) -> Vec<u8> {
        frame::parse_hex(input).unwrap()
    }

    #[test]
    fn test_password_generation_vectors() {
        let zeros = [0u8; 16];
        assert_eq!(
            password_generation(&ZERO_MAC, &[1, 0, 0, 0, 0, 0, 0], 0, 0).unwrap(),
            zeros
        );

        let mut expected = zeros;
        expected[0] = 0x01;
        assert_eq!(
            password_generation(&ZERO_MAC, &[1, 1, 0, 0, 0, 0, 0], 0, 0).unwrap(),
            expected
        );

        let mut expected = zeros;
        expected[13] = 0x01;
        assert_eq!(
            password_generation(&ZERO_MAC, &[1, 0, 0, 0, 0, 0, 0], 0x0100_0000_0000, 0).unwrap(),
            expected
        );

        let chal = [1, 0, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(
            password_generation(&ZERO_MAC, &chal, 0, 0x0101_0101_0101_0000).unwrap(),
            [0, 0, 2, 2, 2, 2, 2, 2, 0, 0, 0, 0, 0, 0, 0, 0]
        );

        let chal = [1, 1, 2, 3, 4, 5, 6, 7, 8];
        assert_eq!(
            password_generation(&MAC, &chal, 0, 0).unwrap(),
            [7, 7, 7, 7, 7, 7, 7, 8, 0, 0, 0, 0, 0, 0, 0, 0]
        );
        assert_eq!(
            password_generation(&MAC, &chal, 0x0102_0304_0506_0708, 0x0102_0304_0506_0708)
                .unwrap(),
            [
                0x17, 0x15, 0x13, 0x11, 0x0F, 0x0D, 0x0B, 0x0A, 0x08, 0x07, 0x06, 0x05, 0x04,
                0x03, 0x02, 0x01
            ]
        );
    }

    #[test]
    fn test_password_generation_real_hardware() {
        let mac = frame::parse_mac(TAG_ADDRESS).unwrap();
        let challenge = hex("011a9b826c000000000000000000000000");
        let response = password_generation(&mac, &challenge, 851_420, 996_303).unwrap();
        assert_eq!(
            response.to_vec(),
            hex("02cd675d015bed0000dcfd0c0000000000")[1..].to_vec()
        );
    }

    #[test]
    fn test_challenge_without_preamble_is_rejected() {
        assert!(password_generation(&MAC, &[0x02, 0x00], 0, 0).is_err());
        assert!(password_generation(&MAC, &[], 0, 0).is_err());
    }

    #[test]
    fn test_reverse_password_generation() {
        let mac = frame::parse_mac(TAG_ADDRESS).unwrap();
        let challenge = hex("01e8f0340d000000000000000000000000");
        let response = hex("029bbd0fa25aed0000dcfd0c0000000000");
        assert_eq!(
            reverse_password_generation(&challenge, &response, &mac),
            Some((851_420, 996_303))
        );

        let mut wrong_preamble = response.clone();
        wrong_preamble[0] = 0x03;
        assert_eq!(
            reverse_password_generation(&challenge, &wrong_preamble, &mac),
            None
        );
    }

    #[test]
    fn test_concat_and_deconcat() {
        let first = [1, 2, 3, 4, 5, 6, 7, 8];
        let second = [9, 10, 11, 12, 13, 14, 15, 16];
        let joined = concat_reverse_with_pad(&first, &second);
        assert_eq!(
            joined,
            [16, 15, 14, 13, 12, 11, 10, 9, 8, 7, 6, 5, 4, 3, 2, 1]
        );
        assert_eq!(deconcat_reverse_with_pad(&joined), (first, second));
    }

    #[test]
    fn test_signed_bytes_matches_minimal_encoding() {
        assert_eq!(signed_bytes(0), vec![0x00]);
        assert_eq!(signed_bytes(0x80), vec![0x00, 0x80]);
        assert_eq!(signed_bytes(-1), vec![0xFF]);
        assert_eq!(signed_bytes(-129), vec![0xFF, 0x7F]);
    }

    #[test]
    fn test_challenge_answered_with_configured_keys() {
        let mut codec = TagCodec::new(TAG_ADDRESS).unwrap();
        codec.load_preferences(
            &Preferences::new()
                .with(PREF_KEY_1, "851420")
                .with(PREF_KEY_2, 996_303i64),
        );
        let events = codec.decode(AUTH_STATUS_CHAR, &hex("011a9b826c000000000000000000000000"));
        assert_eq!(
            events,
            vec![DeviceEvent::SendBytes {
                characteristic: AUTH_RESPONSE_CHAR,
                payload: Bytes::from(hex("02cd675d015bed0000dcfd0c0000000000")),
            }]
        );
    }

    #[test]
    fn test_keys_recovered_from_capture() {
        let mut codec = TagCodec::new(TAG_ADDRESS).unwrap();
        codec.load_preferences(
            &Preferences::new()
                .with(PREF_CAPTURED_CHALLENGE, "01e8f0340d000000000000000000000000")
                .with(PREF_CAPTURED_RESPONSE, "029bbd0fa25aed0000dcfd0c0000000000"),
        );
        let events = codec.decode(AUTH_STATUS_CHAR, &hex("011a9b826c000000000000000000000000"));
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            DeviceEvent::UpdatePreferences(
                Preferences::new()
                    .with(PREF_KEY_1, "851420")
                    .with(PREF_KEY_2, "996303")
            )
        );
        assert!(matches!(events[1], DeviceEvent::SendBytes { .. }));
    }

    #[test]
    fn test_unrecoverable_capture_reports_authentication_failure() {
        let mac = frame::parse_mac(TAG_ADDRESS).unwrap();
        let challenge = hex("011a9b826c000000000000000000000000");
        // An even second key is outside what the recovery candidates cover
        let response = password_generation(&mac, &challenge, 851_420, 996_302).unwrap();
        let mut captured_response = vec![RESPONSE_PREAMBLE];
        captured_response.extend_from_slice(&response);

        let mut codec = TagCodec::new(TAG_ADDRESS).unwrap();
        codec.load_preferences(
            &Preferences::new()
                .with(PREF_CAPTURED_CHALLENGE, "011a9b826c000000000000000000000000")
                .with(
                    PREF_CAPTURED_RESPONSE,
                    captured_response
                        .iter()
                        .map(|b| format!("{b:02x}"))
                        .collect::<String>(),
                ),
        );
        let events = codec.decode(AUTH_STATUS_CHAR, &challenge);
        assert!(matches!(
            events.as_slice(),
            [DeviceEvent::AuthenticationFailed { .. }]
        ));
    }

    #[test]
    fn test_auth_result_handling() {
        let mut codec = TagCodec::new(TAG_ADDRESS).unwrap();
        assert!(matches!(
            codec.decode(AUTH_STATUS_CHAR, &[0x03, 0x00]).as_slice(),
            [DeviceEvent::AuthenticationFailed { .. }]
        ));
        assert!(!codec.is_authenticated());

        let events = codec.decode(AUTH_STATUS_CHAR, &[0x03, 0x55]);
        assert!(codec.is_authenticated());
        assert_eq!(
            events,
            vec![DeviceEvent::SendBytes {
                characteristic: ALERT_LEVEL_CHAR,
                payload: Bytes::from_static(&[0x00]),
            }]
        );
        assert!(codec.decode(AUTH_STATUS_CHAR, &[0x05]).is_empty());
        assert!(codec.decode(AUTH_STATUS_CHAR, &[]).is_empty());
    }

    #[test]
    fn test_alert_requires_authentication() {
        let mut codec = TagCodec::new(TAG_ADDRESS).unwrap();
        let find = OutboundCommand::FindDevice(true);
        assert!(codec.build(&find, &Preferences::new()).unwrap().is_none());
    }

    #[test]
    fn test_alert_repeats_until_acknowledged() {
        let mut codec = TagCodec::new(TAG_ADDRESS).unwrap();
        codec.decode(AUTH_STATUS_CHAR, &[0x03, 0x55]);

        let transaction = codec
            .build(&OutboundCommand::FindDevice(true), &Preferences::new())
            .unwrap()
            .unwrap();
        let (_, actions, _) = transaction.into_parts();
        let writes = actions
            .iter()
            .filter(|action| matches!(action, Action::Write { payload, .. } if payload.as_ref() == [ALERT_START]))
            .count();
        assert_eq!(writes, ALERT_REPEATS);

        // Button press acknowledges the running alert instead of ringing the phone
        assert!(codec.decode(BUTTON_CHAR, &[0x01]).is_empty());
        let ctx = CallbackContext {
            address: TAG_ADDRESS,
            last_read: None,
        };
        let first_check = actions
            .into_iter()
            .find_map(|action| match action {
                Action::Callback(callback) => Some(callback),
                _ => None,
            })
            .unwrap();
        assert!(matches!(first_check(&ctx), Continuation::Abort));

        // No alert running: the button asks for the phone
        assert_eq!(
            codec.decode(BUTTON_CHAR, &[0x01]),
            vec![DeviceEvent::FindPhone(true)]
        );
    }

    #[test]
    fn test_round_trip_is_noop_or_intent() {
        let mut codec = TagCodec::new(TAG_ADDRESS).unwrap();
        codec.decode(AUTH_STATUS_CHAR, &[0x03, 0x55]);
        let prefs = Preferences::new();
        let written_to = codec.write_characteristic();
        for (command, expected) in [
            (OutboundCommand::FindDevice(true), ALERT_START),
            (OutboundCommand::FindDevice(false), ALERT_STOP),
        ] {
            let bytes = codec.encode(&command, &prefs).unwrap().unwrap();
            assert_eq!(bytes.as_ref(), [expected]);
            assert!(codec.decode(written_to, &bytes).is_empty(), "{command:?}");
            assert!(codec.is_authenticated());
        }
        assert!(codec
            .encode(&OutboundCommand::EnableRealtime(true), &prefs)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_stop_alert_and_battery_read() {
        let mut codec = TagCodec::new(TAG_ADDRESS).unwrap();
        codec.decode(AUTH_STATUS_CHAR, &[0x03, 0x55]);
        let stop = codec
            .build(&OutboundCommand::FindDevice(false), &Preferences::new())
            .unwrap()
            .unwrap();
        assert_eq!(stop.len(), 1);

        assert_eq!(
            codec.decode(BATTERY_LEVEL_CHAR, &[87]),
            vec![DeviceEvent::BatteryInfo {
                index: 0,
                level: Some(87),
                state: BatteryState::Normal
            }]
        );
    }
}
