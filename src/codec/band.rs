use super::{Codec, DeviceEvent, OutboundCommand};
use crate::{
    action::{Readiness, Transaction},
    error::{Result, WearlinkError},
    frame::{self, ChecksumKind},
    prefs::{Preferences, PREF_USER_ID},
    samples::{
        ActivityKind, ActivitySample, HeartRateSample, SampleProvider, SleepStageSample,
        SleepSummary, NOT_MEASURED,
    },
    types::{BatteryState, DeviceFamily, DEFAULT_MTU},
};
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{Datelike, Local, Timelike};
use std::{sync::Arc, time::Duration};
use tracing::{debug, warn};
use uuid::Uuid;

/// Nordic UART service the band exposes
pub const UART_SERVICE: Uuid = Uuid::from_u128(0x6E40_0001_B5A3_F393_E0A9_E50E_24DC_CA9E);
/// Host to band characteristic
pub const UART_RX_CHAR: Uuid = Uuid::from_u128(0x6E40_0002_B5A3_F393_E0A9_E50E_24DC_CA9E);
/// Band to host characteristic
pub const UART_TX_CHAR: Uuid = Uuid::from_u128(0x6E40_0003_B5A3_F393_E0A9_E50E_24DC_CA9E);

/// Preference: lower heart-rate alert bound in bpm
pub const PREF_HR_ALERT_LOW: &str = "heart_rate_alert_low";
/// Preference: upper heart-rate alert bound in bpm
pub const PREF_HR_ALERT_HIGH: &str = "heart_rate_alert_high";
/// Preference: whether heart-rate alerts are on
pub const PREF_HR_ALERT_ENABLED: &str = "heart_rate_alert_enabled";
/// Configuration key covering the three heart-rate alert preferences
pub const CONFIG_HR_ALERT_RANGE: &str = "heart_rate_alert_range";
/// Preference: metric units when true
pub const PREF_UNITS_METRIC: &str = "band_units_metric";

/// Wire opcodes
pub mod opcode {
    /// Set clock
    pub const SET_TIME: u8 = 0x01;
    /// Battery request / report
    pub const BATTERY: u8 = 0x02;
    /// Version request / report
    pub const VERSION: u8 = 0x03;
    /// Push notification
    pub const NOTIFICATION: u8 = 0x10;
    /// Call state
    pub const CALL: u8 = 0x11;
    /// Ring the band
    pub const FIND_DEVICE: u8 = 0x20;
    /// Band asks to ring the phone
    pub const FIND_PHONE: u8 = 0x21;
    /// Heart-rate alert range
    pub const HR_ALERT: u8 = 0x30;
    /// Display units
    pub const UNITS: u8 = 0x31;
    /// Toggle live streaming
    pub const REALTIME: u8 = 0x40;
    /// Live sample
    pub const REALTIME_SAMPLE: u8 = 0x41;
    /// Activity history records
    pub const ACTIVITY_HISTORY: u8 = 0x50;
    /// Heart-rate history records
    pub const HR_HISTORY: u8 = 0x51;
    /// Sleep stage records
    pub const SLEEP_HISTORY: u8 = 0x52;
    /// Sleep summary
    pub const SLEEP_SUMMARY: u8 = 0x53;
    /// App install / removal result
    pub const APP_RESULT: u8 = 0x60;
    /// Reboot / factory reset
    pub const RESET: u8 = 0x70;
}

/// Layout of a fixed-header frame: `[start, len, marker, opcode, payload.., checksum]`
///
/// `len` counts the whole frame including the checksum byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFormat {
    /// Start-of-frame byte
    pub start: u8,
    /// Constant byte after the length
    pub marker: u8,
    /// Trailing checksum flavour
    pub checksum: ChecksumKind,
}

/// Frames spoken by the band, additive checksum
pub const BAND_FORMAT: FrameFormat = FrameFormat {
    start: 0xAB,
    marker: 0x23,
    checksum: ChecksumKind::Sum,
};

/// Frames spoken by home battery power stations, XOR checksum
pub const POWER_STATION_FORMAT: FrameFormat = FrameFormat {
    start: 0x73,
    marker: 0x23,
    checksum: ChecksumKind::Xor,
};

const HEADER_LEN: usize = 4;
/// Largest payload one frame can carry
pub const MAX_PAYLOAD: usize = u8::MAX as usize - HEADER_LEN - 1;

/// One decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Opcode
    pub opcode: u8,
    /// Payload without header and checksum
    pub payload: Bytes,
}

impl FrameFormat {
    /// Build a frame; payloads beyond [`MAX_PAYLOAD`] are cut
    #[must_use]
    pub fn encode(&self, opcode: u8, payload: &[u8]) -> Bytes {
        let payload = &payload[..payload.len().min(MAX_PAYLOAD)];
        let total = HEADER_LEN + payload.len() + 1;
        let mut buf = BytesMut::with_capacity(total);
        buf.put_u8(self.start);
        buf.put_u8(u8::try_from(total).unwrap_or(u8::MAX));
        buf.put_u8(self.marker);
        buf.put_u8(opcode);
        buf.put_slice(payload);
        let checksum = self.checksum.compute(&buf);
        buf.put_u8(checksum);
        buf.freeze()
    }

    /// Split a chunk into frames
    ///
    /// Stops at the first malformed header. A frame that claims more bytes than
    /// remain is dropped with a warning; frames failing the checksum are skipped.
    #[must_use]
    pub fn decode(&self, data: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut rest = data;
        while !rest.is_empty() {
            if rest.len() < HEADER_LEN + 1 || rest[0] != self.start || rest[2] != self.marker {
                warn!("Malformed frame header, dropping {:02X?}", rest);
                break;
            }
            let total = usize::from(rest[1]);
            if total < HEADER_LEN + 1 {
                warn!("Frame length {} too small, dropping {:02X?}", total, rest);
                break;
            }
            if total > rest.len() {
                warn!(
                    "Frame declares {} bytes but only {} arrived, dropping tail",
                    total,
                    rest.len()
                );
                break;
            }

            let (raw, tail) = rest.split_at(total);
            rest = tail;
            let expected = self.checksum.compute(&raw[..total - 1]);
            if let Err(e) = frame::verify("Checksum", raw[total - 1], expected) {
                warn!("{} in {:02X?}", e, raw);
                continue;
            }
            frames.push(Frame {
                opcode: raw[3],
                payload: Bytes::copy_from_slice(&raw[HEADER_LEN..total - 1]),
            });
        }
        frames
    }
}

/// Raw activity kinds stored by the band
pub mod raw_kind {
    /// Generic activity
    pub const ACTIVITY: i32 = 1;
    /// Walking
    pub const WALKING: i32 = 2;
    /// Running
    pub const RUNNING: i32 = 3;
    /// Cycling
    pub const CYCLING: i32 = 4;
    /// Light sleep
    pub const LIGHT_SLEEP: i32 = 16;
    /// Deep sleep
    pub const DEEP_SLEEP: i32 = 17;
    /// REM sleep
    pub const REM_SLEEP: i32 = 18;
    /// Awake
    pub const AWAKE: i32 = 19;
    /// Not worn
    pub const NOT_WORN: i32 = 20;
}

/// Sample normalization for band history
#[derive(Debug, Clone, Copy, Default)]
pub struct BandSampleProvider;

impl SampleProvider for BandSampleProvider {
    fn normalize_type(&self, raw: i32) -> ActivityKind {
        match raw {
            raw_kind::ACTIVITY => ActivityKind::Activity,
            raw_kind::WALKING => ActivityKind::Walking,
            raw_kind::RUNNING => ActivityKind::Running,
            raw_kind::CYCLING => ActivityKind::Cycling,
            raw_kind::LIGHT_SLEEP => ActivityKind::LightSleep,
            raw_kind::DEEP_SLEEP => ActivityKind::DeepSleep,
            raw_kind::REM_SLEEP => ActivityKind::RemSleep,
            raw_kind::AWAKE => ActivityKind::Awake,
            raw_kind::NOT_WORN => ActivityKind::NotWorn,
            _ => ActivityKind::Unknown,
        }
    }

    fn to_raw_kind(&self, kind: ActivityKind) -> i32 {
        match kind {
            ActivityKind::Activity => raw_kind::ACTIVITY,
            ActivityKind::Walking => raw_kind::WALKING,
            ActivityKind::Running => raw_kind::RUNNING,
            ActivityKind::Cycling => raw_kind::CYCLING,
            ActivityKind::LightSleep => raw_kind::LIGHT_SLEEP,
            ActivityKind::DeepSleep => raw_kind::DEEP_SLEEP,
            ActivityKind::RemSleep => raw_kind::REM_SLEEP,
            ActivityKind::Awake => raw_kind::AWAKE,
            ActivityKind::NotWorn => raw_kind::NOT_WORN,
            ActivityKind::Unknown => NOT_MEASURED,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn normalize_intensity(&self, raw_intensity: i32) -> f32 {
        if raw_intensity == NOT_MEASURED {
            f32::NEG_INFINITY
        } else {
            (raw_intensity.clamp(0, 100) as f32) / 100.0
        }
    }

    fn reports_cumulative_steps(&self) -> bool {
        true
    }
}

fn sleep_stage(code: u8) -> Option<ActivityKind> {
    match code {
        1 => Some(ActivityKind::LightSleep),
        2 => Some(ActivityKind::DeepSleep),
        3 => Some(ActivityKind::RemSleep),
        4 => Some(ActivityKind::Awake),
        _ => None,
    }
}

fn truncate_utf8(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

const MAX_TITLE: usize = 32;

/// Codec for fitness bands speaking [`BAND_FORMAT`] frames over a UART service
pub struct BandCodec {
    address: String,
    user_id: u32,
    format: FrameFormat,
}

impl BandCodec {
    /// Codec for the band at `address`
    #[must_use]
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            user_id: 0,
            format: BAND_FORMAT,
        }
    }

    fn frame(&self, opcode: u8, payload: &[u8]) -> Bytes {
        self.format.encode(opcode, payload)
    }

    fn encode_time(&self, time: &chrono::DateTime<chrono::FixedOffset>) -> Bytes {
        let year = u8::try_from(time.year() - 2000).unwrap_or(0);
        let offset_minutes = i16::try_from(time.offset().local_minus_utc() / 60).unwrap_or(0);
        let mut payload = BytesMut::with_capacity(8);
        payload.put_u8(year);
        payload.put_u8(u8::try_from(time.month()).unwrap_or(1));
        payload.put_u8(u8::try_from(time.day()).unwrap_or(1));
        payload.put_u8(u8::try_from(time.hour()).unwrap_or(0));
        payload.put_u8(u8::try_from(time.minute()).unwrap_or(0));
        payload.put_u8(u8::try_from(time.second()).unwrap_or(0));
        payload.put_i16_le(offset_minutes);
        self.frame(opcode::SET_TIME, &payload)
    }

    fn encode_configuration(&self, key: &str, prefs: &Preferences) -> Result<Option<Bytes>> {
        match key {
            CONFIG_HR_ALERT_RANGE | PREF_HR_ALERT_LOW | PREF_HR_ALERT_HIGH | PREF_HR_ALERT_ENABLED => {
                let enabled = prefs.bool(PREF_HR_ALERT_ENABLED).unwrap_or(true);
                let low = prefs.int(PREF_HR_ALERT_LOW).unwrap_or(50);
                let high = prefs.int(PREF_HR_ALERT_HIGH).unwrap_or(150);
                let invalid = |reason: String| WearlinkError::InvalidConfiguration {
                    key: CONFIG_HR_ALERT_RANGE.to_string(),
                    reason,
                };
                let low = u8::try_from(low)
                    .ok()
                    .filter(|bpm| (30..=220).contains(bpm))
                    .ok_or_else(|| invalid(format!("lower bound {low} outside 30..=220")))?;
                let high = u8::try_from(high)
                    .ok()
                    .filter(|bpm| (30..=220).contains(bpm))
                    .ok_or_else(|| invalid(format!("upper bound {high} outside 30..=220")))?;
                if low >= high {
                    return Err(invalid(format!(
                        "lower bound {low} must be below upper bound {high}"
                    )));
                }
                Ok(Some(self.frame(
                    opcode::HR_ALERT,
                    &[u8::from(enabled), low, high],
                )))
            }
            PREF_UNITS_METRIC => {
                let metric = prefs.bool(PREF_UNITS_METRIC).unwrap_or(true);
                Ok(Some(self.frame(opcode::UNITS, &[u8::from(metric)])))
            }
            _ => Ok(None),
        }
    }

    fn decode_activity(&self, payload: &[u8]) -> Vec<ActivitySample> {
        payload
            .chunks_exact(10)
            .filter_map(|record| {
                let timestamp = frame::u32_le(record, 0)?;
                let steps = frame::u32_le(record, 4)?;
                Some(ActivitySample {
                    timestamp: i64::from(timestamp),
                    device_id: self.address.clone(),
                    user_id: self.user_id,
                    raw_kind: i32::from(record[8]),
                    raw_intensity: i32::from(record[9]),
                    steps: Some(steps),
                    heart_rate: None,
                })
            })
            .collect()
    }

    fn decode_heart_rate(&self, payload: &[u8]) -> Vec<HeartRateSample> {
        payload
            .chunks_exact(5)
            .filter_map(|record| {
                Some(HeartRateSample {
                    timestamp: i64::from(frame::u32_le(record, 0)?),
                    device_id: self.address.clone(),
                    heart_rate: record[4],
                })
            })
            .filter(|sample| sample.heart_rate > 0 && sample.heart_rate < 0xFF)
            .collect()
    }

    fn decode_sleep(&self, payload: &[u8]) -> Vec<SleepStageSample> {
        payload
            .chunks_exact(7)
            .filter_map(|record| {
                let stage = sleep_stage(record[6]);
                if stage.is_none() {
                    debug!("Unknown sleep stage code {:02X}", record[6]);
                }
                Some(SleepStageSample {
                    timestamp: i64::from(frame::u32_le(record, 0)?),
                    device_id: self.address.clone(),
                    duration_secs: u32::from(frame::u16_le(record, 4)?) * 60,
                    stage: stage?,
                })
            })
            .collect()
    }

    fn decode_frame(&self, frame: &Frame) -> Option<DeviceEvent> {
        let payload = frame.payload.as_ref();
        match frame.opcode {
            opcode::BATTERY => {
                let [level, charging, ..] = payload else {
                    warn!("Short battery payload {:02X?}", payload);
                    return None;
                };
                Some(DeviceEvent::BatteryInfo {
                    index: 0,
                    level: Some((*level).min(100)),
                    state: BatteryState::from(*charging),
                })
            }
            opcode::VERSION => {
                if payload.is_empty() {
                    return None;
                }
                let text = String::from_utf8_lossy(payload);
                let mut parts = text.split('\0');
                let firmware = parts.next().unwrap_or_default().to_string();
                let hardware = parts.next().filter(|hw| !hw.is_empty()).map(str::to_string);
                Some(DeviceEvent::VersionInfo { firmware, hardware })
            }
            opcode::FIND_PHONE => payload
                .first()
                .map(|start| DeviceEvent::FindPhone(*start != 0)),
            opcode::REALTIME_SAMPLE => {
                let heart_rate = payload.first().copied().filter(|bpm| *bpm != 0);
                let steps = frame::u32_le(payload, 1);
                Some(DeviceEvent::RealtimeSample { heart_rate, steps })
            }
            opcode::HR_ALERT => {
                let [enabled, low, high, ..] = payload else {
                    return None;
                };
                Some(DeviceEvent::UpdatePreferences(
                    Preferences::new()
                        .with(PREF_HR_ALERT_ENABLED, *enabled != 0)
                        .with(PREF_HR_ALERT_LOW, i64::from(*low))
                        .with(PREF_HR_ALERT_HIGH, i64::from(*high)),
                ))
            }
            opcode::ACTIVITY_HISTORY => {
                Some(DeviceEvent::ActivitySamples(self.decode_activity(payload)))
            }
            opcode::HR_HISTORY => {
                Some(DeviceEvent::HeartRateSamples(self.decode_heart_rate(payload)))
            }
            opcode::SLEEP_HISTORY => Some(DeviceEvent::SleepStages(self.decode_sleep(payload))),
            opcode::SLEEP_SUMMARY => {
                if payload.len() < 16 {
                    warn!("Short sleep summary {:02X?}", payload);
                    return None;
                }
                Some(DeviceEvent::SleepMonitorResult(SleepSummary {
                    start: i64::from(frame::u32_le(payload, 0)?),
                    end: i64::from(frame::u32_le(payload, 4)?),
                    deep_minutes: frame::u16_le(payload, 8)?,
                    light_minutes: frame::u16_le(payload, 10)?,
                    rem_minutes: frame::u16_le(payload, 12)?,
                    awake_minutes: frame::u16_le(payload, 14)?,
                }))
            }
            opcode::APP_RESULT => {
                let app_id = frame::u16_le(payload, 0)?;
                let status = *payload.get(2)?;
                Some(DeviceEvent::AppManagementResult {
                    app_id,
                    success: status == 0,
                })
            }
            other => {
                debug!("Ignoring band opcode {:02X}: {:02X?}", other, payload);
                None
            }
        }
    }
}

impl Codec for BandCodec {
    fn family(&self) -> DeviceFamily {
        DeviceFamily::Band
    }

    fn write_characteristic(&self) -> Uuid {
        UART_RX_CHAR
    }

    fn notify_characteristics(&self) -> Vec<Uuid> {
        vec![UART_TX_CHAR]
    }

    fn load_preferences(&mut self, prefs: &Preferences) {
        self.user_id = prefs
            .int(PREF_USER_ID)
            .and_then(|id| u32::try_from(id).ok())
            .unwrap_or(0);
    }

    fn initialize(&mut self, prefs: &Preferences) -> Result<Transaction> {
        self.load_preferences(prefs);
        let mut builder = Transaction::builder("initialize band")
            .requires(Readiness::Link)
            .notify(UART_TX_CHAR, true)
            .write(UART_RX_CHAR, self.frame(opcode::VERSION, &[]))
            .write(UART_RX_CHAR, self.frame(opcode::BATTERY, &[]))
            .write(UART_RX_CHAR, self.encode_time(&Local::now().fixed_offset()));

        for key in [PREF_UNITS_METRIC, CONFIG_HR_ALERT_RANGE] {
            match self.encode_configuration(key, prefs) {
                Ok(Some(frame)) => builder = builder.write(UART_RX_CHAR, frame),
                Ok(None) => {}
                Err(e) => warn!("{}: not pushing stored setting: {}", self.address, e),
            }
        }
        Ok(builder.build())
    }

    fn encode(&mut self, command: &OutboundCommand, prefs: &Preferences) -> Result<Option<Bytes>> {
        Ok(match command {
            OutboundCommand::SetTime(time) => Some(self.encode_time(time)),
            OutboundCommand::Notification(notification) => {
                let title = truncate_utf8(&notification.title, MAX_TITLE);
                let room = MAX_PAYLOAD - 6 - title.len();
                let body = truncate_utf8(&notification.body, room);
                let mut payload = BytesMut::with_capacity(6 + title.len() + body.len());
                payload.put_u8(notification.kind as u8);
                payload.put_u32_le(notification.id);
                payload.put_u8(u8::try_from(title.len()).unwrap_or(0));
                payload.put_slice(title.as_bytes());
                payload.put_slice(body.as_bytes());
                Some(self.frame(opcode::NOTIFICATION, &payload))
            }
            OutboundCommand::CallState(call) => {
                let caller = call.caller.as_deref().unwrap_or_default();
                let caller = truncate_utf8(caller, MAX_TITLE);
                let mut payload = BytesMut::with_capacity(1 + caller.len());
                payload.put_u8(call.state as u8);
                payload.put_slice(caller.as_bytes());
                Some(self.frame(opcode::CALL, &payload))
            }
            OutboundCommand::FindDevice(start) => {
                Some(self.frame(opcode::FIND_DEVICE, &[u8::from(*start)]))
            }
            OutboundCommand::EnableRealtime(enable) => {
                Some(self.frame(opcode::REALTIME, &[u8::from(*enable)]))
            }
            OutboundCommand::Reset(flags) => Some(self.frame(opcode::RESET, &[flags.bits()])),
            OutboundCommand::SendConfiguration(key) => return self.encode_configuration(key, prefs),
        })
    }

    fn decode(&mut self, characteristic: Uuid, data: &[u8]) -> Vec<DeviceEvent> {
        if characteristic != UART_TX_CHAR {
            debug!("Ignoring value on {}", characteristic);
            return Vec::new();
        }
        self.format
            .decode(data)
            .iter()
            .filter_map(|frame| self.decode_frame(frame))
            .collect()
    }

    fn max_write_size(&self) -> usize {
        DEFAULT_MTU
    }

    fn chunk_delay(&self) -> Duration {
        Duration::from_millis(20)
    }

    fn sample_provider(&self) -> Option<Arc<dyn SampleProvider>> {
        Some(Arc::new(BandSampleProvider))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        action::Action,
        codec::{CallSpec, CallState, NotificationKind, NotificationSpec, ResetFlags},
    };
    use chrono::{FixedOffset, TimeZone};

    const ADDRESS: &str = "C0:FF:EE:00:00:01";

    fn inbound(opcode: u8, payload: &[u8]) -> Vec<u8> {
        BAND_FORMAT.encode(opcode, payload).to_vec()
    }

    #[test]
    fn test_frame_layout() {
        let frame = BAND_FORMAT.encode(opcode::BATTERY, &[]);
        assert_eq!(frame.as_ref(), &[0xAB, 0x05, 0x23, 0x02, 0xD5]);

        let info = POWER_STATION_FORMAT.encode(0x03, &[0x01]);
        assert_eq!(info.as_ref(), &[0x73, 0x06, 0x23, 0x03, 0x01, 0x54]);
    }

    #[test]
    fn test_battery_report() {
        let mut codec = BandCodec::new(ADDRESS);
        let events = codec.decode(UART_TX_CHAR, &inbound(opcode::BATTERY, &[80, 1]));
        assert_eq!(
            events,
            vec![DeviceEvent::BatteryInfo {
                index: 0,
                level: Some(80),
                state: BatteryState::Charging
            }]
        );
    }

    #[test]
    fn test_flipped_checksum_yields_no_events() {
        let mut codec = BandCodec::new(ADDRESS);
        let mut data = inbound(opcode::BATTERY, &[80, 1]);
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        assert!(codec.decode(UART_TX_CHAR, &data).is_empty());
    }

    #[test]
    fn test_concatenated_frames_and_truncated_tail() {
        let mut codec = BandCodec::new(ADDRESS);
        let mut data = inbound(opcode::VERSION, b"2.1.0\0B1");
        data.extend(inbound(opcode::FIND_PHONE, &[1]));
        let partial = inbound(opcode::BATTERY, &[50, 0]);
        data.extend(&partial[..4]);

        let events = codec.decode(UART_TX_CHAR, &data);
        assert_eq!(
            events,
            vec![
                DeviceEvent::VersionInfo {
                    firmware: "2.1.0".to_string(),
                    hardware: Some("B1".to_string())
                },
                DeviceEvent::FindPhone(true),
            ]
        );
    }

    #[test]
    fn test_garbage_is_ignored() {
        let mut codec = BandCodec::new(ADDRESS);
        assert!(codec.decode(UART_TX_CHAR, &[0x00, 0x01, 0x02]).is_empty());
        assert!(codec.decode(UART_TX_CHAR, &[]).is_empty());
        assert!(codec.decode(UART_RX_CHAR, &inbound(opcode::BATTERY, &[1, 0])).is_empty());
    }

    #[test]
    fn test_history_records() {
        let mut codec = BandCodec::new(ADDRESS);
        codec.load_preferences(&Preferences::new().with(PREF_USER_ID, 3i64));

        let mut activity = Vec::new();
        activity.extend(60u32.to_le_bytes());
        activity.extend(120u32.to_le_bytes());
        activity.extend([raw_kind::WALKING as u8, 40]);
        let events = codec.decode(UART_TX_CHAR, &inbound(opcode::ACTIVITY_HISTORY, &activity));
        let DeviceEvent::ActivitySamples(samples) = &events[0] else {
            panic!("expected activity samples, got {events:?}");
        };
        assert_eq!(samples[0].timestamp, 60);
        assert_eq!(samples[0].steps, Some(120));
        assert_eq!(samples[0].user_id, 3);
        assert_eq!(samples[0].device_id, ADDRESS);

        let mut sleep = Vec::new();
        sleep.extend(3600u32.to_le_bytes());
        sleep.extend(45u16.to_le_bytes());
        sleep.push(2);
        let events = codec.decode(UART_TX_CHAR, &inbound(opcode::SLEEP_HISTORY, &sleep));
        assert_eq!(
            events,
            vec![DeviceEvent::SleepStages(vec![SleepStageSample {
                timestamp: 3600,
                device_id: ADDRESS.to_string(),
                duration_secs: 2700,
                stage: ActivityKind::DeepSleep,
            }])]
        );
    }

    #[test]
    fn test_heart_rate_alert_range_validation() {
        let mut codec = BandCodec::new(ADDRESS);
        let command = OutboundCommand::SendConfiguration(CONFIG_HR_ALERT_RANGE.to_string());

        let good = Preferences::new()
            .with(PREF_HR_ALERT_LOW, 60i64)
            .with(PREF_HR_ALERT_HIGH, 160i64);
        let frame = codec.encode(&command, &good).unwrap().unwrap();
        assert_eq!(&frame[3..7], &[opcode::HR_ALERT, 1, 60, 160]);

        let overlapping = Preferences::new()
            .with(PREF_HR_ALERT_LOW, 170i64)
            .with(PREF_HR_ALERT_HIGH, 160i64);
        let error = codec.build(&command, &overlapping).unwrap_err();
        assert!(matches!(error, WearlinkError::InvalidConfiguration { .. }));
    }

    #[test]
    fn test_long_notification_is_chunked_with_waits() {
        let mut codec = BandCodec::new(ADDRESS);
        let command = OutboundCommand::Notification(NotificationSpec {
            id: 7,
            kind: NotificationKind::Chat,
            title: "Alice".to_string(),
            body: "Are we still on for the run at six tomorrow morning?".to_string(),
        });
        let transaction = codec.build(&command, &Preferences::new()).unwrap().unwrap();

        let mut written = Vec::new();
        let mut saw_wait = false;
        for action in transaction.actions() {
            match action {
                Action::Write { payload, .. } => {
                    assert!(payload.len() <= DEFAULT_MTU);
                    written.extend_from_slice(payload);
                }
                Action::Wait(_) => saw_wait = true,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(saw_wait);
        assert_eq!(usize::from(written[1]), written.len());
        assert_eq!(frame::sum_checksum(&written[..written.len() - 1]), written[written.len() - 1]);
    }

    #[test]
    fn test_set_time_payload() {
        let mut codec = BandCodec::new(ADDRESS);
        let zone = FixedOffset::east_opt(3600).unwrap();
        let time = zone.with_ymd_and_hms(2024, 3, 9, 14, 5, 30).unwrap();
        let frame = codec
            .encode(&OutboundCommand::SetTime(time), &Preferences::new())
            .unwrap()
            .unwrap();
        assert_eq!(&frame[4..12], &[24, 3, 9, 14, 5, 30, 60, 0]);
    }

    #[test]
    fn test_round_trip_is_noop_or_intent() {
        let mut codec = BandCodec::new(ADDRESS);
        let prefs = Preferences::new();
        let commands = vec![
            OutboundCommand::FindDevice(true),
            OutboundCommand::EnableRealtime(true),
            OutboundCommand::Reset(ResetFlags::REBOOT),
            OutboundCommand::CallState(CallSpec {
                state: CallState::Incoming,
                caller: Some("Bob".to_string()),
            }),
            OutboundCommand::SendConfiguration(PREF_UNITS_METRIC.to_string()),
            OutboundCommand::SendConfiguration(CONFIG_HR_ALERT_RANGE.to_string()),
        ];
        for command in commands {
            let frame = codec.encode(&command, &prefs).unwrap().unwrap();
            let events = codec.decode(UART_TX_CHAR, &frame);
            match command {
                OutboundCommand::SendConfiguration(key) if key == CONFIG_HR_ALERT_RANGE => {
                    assert_eq!(
                        events,
                        vec![DeviceEvent::UpdatePreferences(
                            Preferences::new()
                                .with(PREF_HR_ALERT_ENABLED, true)
                                .with(PREF_HR_ALERT_LOW, 50i64)
                                .with(PREF_HR_ALERT_HIGH, 150i64)
                        )]
                    );
                }
                _ => assert!(events.is_empty(), "{command:?} decoded to {events:?}"),
            }
        }
    }

    #[test]
    fn test_sample_provider_normalization() {
        let provider = BandSampleProvider;
        assert_eq!(provider.normalize_type(raw_kind::DEEP_SLEEP), ActivityKind::DeepSleep);
        assert_eq!(provider.to_raw_kind(ActivityKind::RemSleep), raw_kind::REM_SLEEP);
        assert!(provider.normalize_intensity(NOT_MEASURED).is_infinite());
        assert!((provider.normalize_intensity(50) - 0.5).abs() < f32::EPSILON);
        assert!(provider.reports_cumulative_steps());
    }
}
