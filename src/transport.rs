use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Messages a transport pushes towards its session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Device pushed a notification
    Notification {
        /// Originating characteristic
        characteristic: Uuid,
        /// Raw value
        value: Bytes,
    },
    /// A read action returned a value
    ReadValue {
        /// Characteristic that was read
        characteristic: Uuid,
        /// Raw value
        value: Bytes,
    },
    /// The link dropped without being asked to
    Disconnected {
        /// Transport supplied reason
        reason: String,
    },
}

/// Sender half of the inbound event channel
pub type EventSink = mpsc::UnboundedSender<TransportEvent>;

/// Byte pipe to one physical device
///
/// Every call is transport-atomic: it either completes or fails as a whole.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Route inbound events into `sink`, replacing any previous sink
    async fn attach(&self, sink: EventSink);

    /// Establish the link and discover the characteristics
    async fn connect(&self) -> Result<()>;

    /// Tear the link down
    async fn disconnect(&self) -> Result<()>;

    /// Write `data` to `characteristic`
    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<()>;

    /// Read the current value of `characteristic`
    async fn read(&self, characteristic: Uuid) -> Result<Bytes>;

    /// Enable or disable notifications on `characteristic`
    async fn set_notify(&self, characteristic: Uuid, enabled: bool) -> Result<()>;

    /// Largest payload a single write may carry
    fn mtu(&self) -> usize {
        crate::types::DEFAULT_MTU
    }
}

/// Expand a 16-bit SIG-assigned UUID to the full Bluetooth base UUID
#[must_use]
pub const fn sig_uuid(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_0080_5F9B_34FB)
}

/// Standard Battery Level characteristic
pub const BATTERY_LEVEL_CHAR: Uuid = sig_uuid(0x2A19);
