/// Fixed-header checksummed frames for fitness bands
pub mod band;
/// Structured RPC for true-wireless earbuds
pub mod earbuds;
/// Length-prefixed vendor packets for headphones
pub mod headphones;
/// Minimal msgpack encoder and decoder
pub mod msgpack;
/// Challenge-response key finder tags
pub mod tag;

use crate::{
    action::Transaction,
    error::Result,
    prefs::Preferences,
    samples::{ActivitySample, HeartRateSample, SampleProvider, SleepStageSample, SleepSummary},
    types::{BatteryState, DeviceFamily, DEFAULT_MTU},
};
use bytes::Bytes;
use chrono::{DateTime, FixedOffset};
use std::{sync::Arc, time::Duration};
use tracing::debug;
use uuid::Uuid;

/// Category of a pushed notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NotificationKind {
    /// Anything without a dedicated icon
    Generic = 0x00,
    /// Text message
    Sms = 0x01,
    /// Email
    Email = 0x02,
    /// Chat application
    Chat = 0x03,
    /// Calendar reminder
    Calendar = 0x04,
}

/// A notification to show on the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationSpec {
    /// Identifier assigned by the phone
    pub id: u32,
    /// Category
    pub kind: NotificationKind,
    /// Sender or title
    pub title: String,
    /// Message body
    pub body: String,
}

/// Phone call state changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CallState {
    /// Phone is ringing
    Incoming = 0x01,
    /// Call placed from the phone
    Outgoing = 0x02,
    /// Call picked up
    Start = 0x03,
    /// Call ended or rejected
    End = 0x04,
}

/// A call to mirror on the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSpec {
    /// New state
    pub state: CallState,
    /// Caller name or number
    pub caller: Option<String>,
}

/// Reset options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResetFlags(u8);

impl ResetFlags {
    /// Restart the device
    pub const REBOOT: Self = Self(0x01);
    /// Wipe user data
    pub const FACTORY_RESET: Self = Self(0x02);

    /// Raw bit value
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Whether every bit of `other` is set
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Device independent requests a codec may support
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundCommand {
    /// Show a notification
    Notification(NotificationSpec),
    /// Mirror a phone call
    CallState(CallSpec),
    /// Set the device clock
    SetTime(DateTime<FixedOffset>),
    /// Push the preference with this key
    SendConfiguration(String),
    /// Start or stop making the device ring
    FindDevice(bool),
    /// Reboot or factory reset
    Reset(ResetFlags),
    /// Start or stop live heart rate / step streaming
    EnableRealtime(bool),
}

impl OutboundCommand {
    /// Short name used as transaction name
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Notification(_) => "notification",
            Self::CallState(_) => "call state",
            Self::SetTime(_) => "set time",
            Self::SendConfiguration(_) => "send configuration",
            Self::FindDevice(_) => "find device",
            Self::Reset(_) => "reset",
            Self::EnableRealtime(_) => "realtime",
        }
    }
}

/// Outcome decoded from inbound bytes
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// Battery level of one of the device's batteries
    BatteryInfo {
        /// Battery index, 0 for single-battery devices
        index: u8,
        /// Percentage, `None` if unknown
        level: Option<u8>,
        /// Charging state
        state: BatteryState,
    },
    /// Firmware and hardware revision
    VersionInfo {
        /// Firmware version
        firmware: String,
        /// Hardware version
        hardware: Option<String>,
    },
    /// Result of installing or removing an app or watchface
    AppManagementResult {
        /// Device side app identifier
        app_id: u16,
        /// Whether the operation succeeded
        success: bool,
    },
    /// Bytes that must be written back to the device unchanged
    SendBytes {
        /// Target characteristic
        characteristic: Uuid,
        /// Payload
        payload: Bytes,
    },
    /// Device reported settings to store
    UpdatePreferences(Preferences),
    /// End-of-night sleep summary
    SleepMonitorResult(SleepSummary),
    /// Challenge-response authentication could not be completed
    AuthenticationFailed {
        /// Why it failed
        reason: String,
    },
    /// Device asks the phone to ring, or to stop
    FindPhone(bool),
    /// Live measurement
    RealtimeSample {
        /// Beats per minute
        heart_rate: Option<u8>,
        /// Steps today
        steps: Option<u32>,
    },
    /// Activity history rows
    ActivitySamples(Vec<ActivitySample>),
    /// Heart-rate history
    HeartRateSamples(Vec<HeartRateSample>),
    /// Sleep stage history
    SleepStages(Vec<SleepStageSample>),
}

/// Per-family translator between domain requests and wire bytes
///
/// Codecs never fail on inbound bytes: integrity problems are logged and the
/// offending chunk yields no events.
pub trait Codec: Send {
    /// Family this codec speaks
    fn family(&self) -> DeviceFamily;

    /// Characteristic commands are written to
    fn write_characteristic(&self) -> Uuid;

    /// Characteristics to subscribe to during initialization
    fn notify_characteristics(&self) -> Vec<Uuid>;

    /// Pick up device preferences the codec needs outside of `encode`
    fn load_preferences(&mut self, _prefs: &Preferences) {}

    /// Transaction that brings a freshly connected device to a usable state
    fn initialize(&mut self, prefs: &Preferences) -> Result<Transaction>;

    /// Frame for `command`, or `None` when unsupported
    ///
    /// # Errors
    ///
    /// Returns [`crate::WearlinkError::InvalidConfiguration`] when a preference
    /// read for the command fails validation.
    fn encode(&mut self, command: &OutboundCommand, prefs: &Preferences) -> Result<Option<Bytes>>;

    /// Events carried by one inbound chunk
    fn decode(&mut self, characteristic: Uuid, data: &[u8]) -> Vec<DeviceEvent>;

    /// Largest write the device accepts
    fn max_write_size(&self) -> usize {
        DEFAULT_MTU
    }

    /// Pause between chunks of one frame
    fn chunk_delay(&self) -> Duration {
        Duration::ZERO
    }

    /// Sample normalization for this family, if it records activity
    fn sample_provider(&self) -> Option<Arc<dyn SampleProvider>> {
        None
    }

    /// Transaction for `command`, or `None` when unsupported
    ///
    /// # Errors
    ///
    /// Same as [`Codec::encode`].
    fn build(
        &mut self,
        command: &OutboundCommand,
        prefs: &Preferences,
    ) -> Result<Option<Transaction>> {
        let Some(frame) = self.encode(command, prefs)? else {
            debug!("{} codec ignores {}", self.family(), command.name());
            return Ok(None);
        };
        Ok(Some(
            Transaction::builder(command.name())
                .write_chunked(
                    self.write_characteristic(),
                    &frame,
                    self.max_write_size(),
                    self.chunk_delay(),
                )
                .build(),
        ))
    }
}

/// Create the codec for `family`
///
/// # Errors
///
/// Returns [`crate::WearlinkError::InvalidParameters`] if `address` is not a
/// valid Bluetooth address and the family needs it.
pub fn codec_for(family: DeviceFamily, address: &str) -> Result<Box<dyn Codec>> {
    Ok(match family {
        DeviceFamily::Band => Box::new(band::BandCodec::new(address)),
        DeviceFamily::Earbuds => Box::new(earbuds::EarbudsCodec::new()),
        DeviceFamily::Headphones => Box::new(headphones::HeadphonesCodec::new()),
        DeviceFamily::Tag => Box::new(tag::TagCodec::new(address)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_flags() {
        let flags = ResetFlags::REBOOT;
        assert!(flags.contains(ResetFlags::REBOOT));
        assert!(!flags.contains(ResetFlags::FACTORY_RESET));
        assert_eq!(ResetFlags::FACTORY_RESET.bits(), 0x02);
    }

    #[test]
    fn test_codec_factory_matches_family() {
        for family in [
            DeviceFamily::Band,
            DeviceFamily::Earbuds,
            DeviceFamily::Headphones,
            DeviceFamily::Tag,
        ] {
            let codec = codec_for(family, "ED:5A:94:CB:98:E4").unwrap();
            assert_eq!(codec.family(), family);
        }
        assert!(codec_for(DeviceFamily::Tag, "not a mac").is_err());
    }

    #[test]
    fn test_unsupported_command_builds_nothing() {
        let mut codec = codec_for(DeviceFamily::Tag, "ED:5A:94:CB:98:E4").unwrap();
        let command = OutboundCommand::SendConfiguration("units".to_string());
        assert!(codec.build(&command, &Preferences::new()).unwrap().is_none());
    }
}
