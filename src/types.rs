use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, time::Duration};

/// Lifecycle of one device connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No link and no reconnect scheduled
    NotConnected,
    /// Link establishment in progress
    Connecting,
    /// Link is up, device initialization transaction running
    Initializing,
    /// Device fully initialized and accepting work
    Initialized,
    /// Link lost, a reconnect attempt is scheduled
    WaitingForReconnect,
}

impl ConnectionState {
    /// Whether the transport link is currently usable
    #[must_use]
    pub const fn is_link_up(self) -> bool {
        matches!(self, Self::Initializing | Self::Initialized)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "Not connected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Initializing => write!(f, "Initializing"),
            Self::Initialized => write!(f, "Initialized"),
            Self::WaitingForReconnect => write!(f, "Waiting for reconnect"),
        }
    }
}

/// Device families with a codec in this crate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeviceFamily {
    /// Fitness band speaking fixed-header checksummed frames
    Band,
    /// True-wireless earbuds speaking a structured RPC
    Earbuds,
    /// Headphones speaking length-prefixed vendor packets
    Headphones,
    /// Key finder tag with challenge-response authentication
    Tag,
}

impl fmt::Display for DeviceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Band => write!(f, "band"),
            Self::Earbuds => write!(f, "earbuds"),
            Self::Headphones => write!(f, "headphones"),
            Self::Tag => write!(f, "tag"),
        }
    }
}

/// Charging state reported alongside a battery level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatteryState {
    /// Running on battery
    Normal,
    /// Connected to a charger
    Charging,
    /// Device did not report a state
    Unknown,
}

impl From<u8> for BatteryState {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Normal,
            1 => Self::Charging,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for BatteryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "Normal"),
            Self::Charging => write!(f, "Charging"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Last known state of one battery of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryStatus {
    /// Charge percentage, `None` when the device reports it as unknown
    pub level: Option<u8>,
    /// Charging state
    pub state: BatteryState,
}

/// A paired device as seen by its session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Bluetooth address, `XX:XX:XX:XX:XX:XX`
    pub address: String,
    /// Family tag selecting codec and capabilities
    pub family: DeviceFamily,
    /// Advertised name, if known
    pub name: Option<String>,
    /// Current connection state
    pub state: ConnectionState,
    /// Negotiated maximum write size
    pub mtu: usize,
    /// Battery levels keyed by battery index
    pub batteries: BTreeMap<u8, BatteryStatus>,
    /// Firmware version string
    pub firmware_version: Option<String>,
    /// Hardware version string
    pub hardware_version: Option<String>,
}

impl Device {
    /// Create a device record for a freshly paired address
    #[must_use]
    pub fn new(address: impl Into<String>, family: DeviceFamily) -> Self {
        Self {
            address: address.into(),
            family,
            name: None,
            state: ConnectionState::NotConnected,
            mtu: DEFAULT_MTU,
            batteries: BTreeMap::new(),
            firmware_version: None,
            hardware_version: None,
        }
    }
}

/// Default ATT payload size before MTU negotiation
pub const DEFAULT_MTU: usize = 20;

/// Transport timeout configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Link establishment timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Characteristic write timeout in milliseconds
    pub write_timeout_ms: u64,
    /// Characteristic read timeout in milliseconds
    pub read_timeout_ms: u64,
    /// Notification enable/disable timeout in milliseconds
    pub notify_timeout_ms: u64,
    /// Upper bound for the whole initialization transaction in milliseconds
    pub initialization_timeout_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 30_000,
            write_timeout_ms: 3_000,
            read_timeout_ms: 3_000,
            notify_timeout_ms: 2_000,
            initialization_timeout_ms: 20_000,
        }
    }
}

/// Automatic reconnect configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Reconnect after unexpected link loss
    pub enabled: bool,
    /// First reconnect delay in milliseconds
    pub initial_delay_ms: u64,
    /// Cap on the reconnect delay in milliseconds
    pub max_delay_ms: u64,
    /// Factor applied to the delay after each failed attempt
    pub multiplier: u32,
}

impl ReconnectConfig {
    /// First reconnect delay
    #[must_use]
    pub const fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    /// Largest reconnect delay
    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay_ms: 4_000,
            max_delay_ms: 64_000,
            multiplier: 2,
        }
    }
}

/// Settings for one device session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Transport timeouts
    pub timeouts: TimeoutConfig,
    /// Reconnect policy
    pub reconnect: ReconnectConfig,
}
