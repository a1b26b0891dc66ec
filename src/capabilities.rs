use crate::types::DeviceFamily;
use serde::{Deserialize, Serialize};

/// What a device family can do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct DeviceCapabilities {
    /// Measures heart rate
    pub supports_heart_rate: bool,
    /// Records activity history
    pub supports_activity_tracking: bool,
    /// Shows weather
    pub supports_weather: bool,
    /// Can be made to ring
    pub supports_find_device: bool,
    /// Streams live samples
    pub supports_realtime: bool,
    /// Number of alarms the device stores
    pub alarm_slot_count: u8,
    /// Number of batteries reported
    pub battery_count: u8,
    /// Needs a challenge-response handshake before accepting commands
    pub requires_authentication: bool,
}

impl DeviceCapabilities {
    const NONE: Self = Self {
        supports_heart_rate: false,
        supports_activity_tracking: false,
        supports_weather: false,
        supports_find_device: false,
        supports_realtime: false,
        alarm_slot_count: 0,
        battery_count: 1,
        requires_authentication: false,
    };

    /// Capabilities of `family`
    #[must_use]
    pub const fn for_family(family: DeviceFamily) -> Self {
        match family {
            DeviceFamily::Band => Self {
                supports_heart_rate: true,
                supports_activity_tracking: true,
                supports_find_device: true,
                supports_realtime: true,
                alarm_slot_count: 3,
                ..Self::NONE
            },
            DeviceFamily::Earbuds => Self {
                battery_count: 3,
                ..Self::NONE
            },
            DeviceFamily::Headphones => Self {
                supports_find_device: true,
                battery_count: 2,
                ..Self::NONE
            },
            DeviceFamily::Tag => Self {
                supports_find_device: true,
                requires_authentication: true,
                ..Self::NONE
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_table() {
        let band = DeviceCapabilities::for_family(DeviceFamily::Band);
        assert!(band.supports_activity_tracking);
        assert_eq!(band.alarm_slot_count, 3);

        let earbuds = DeviceCapabilities::for_family(DeviceFamily::Earbuds);
        assert_eq!(earbuds.battery_count, 3);
        assert!(!earbuds.supports_find_device);

        assert!(DeviceCapabilities::for_family(DeviceFamily::Tag).requires_authentication);
        assert!(!DeviceCapabilities::for_family(DeviceFamily::Headphones).supports_heart_rate);
    }
}
