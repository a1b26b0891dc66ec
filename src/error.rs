use thiserror::Error;

/// Errors that can occur while driving a wearable device session
#[derive(Error, Debug)]
pub enum WearlinkError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// Device not found on any adapter
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Device connection failed
    #[error("Failed to connect to device: {0}")]
    ConnectionFailed(String),

    /// Device disconnected unexpectedly
    #[error("Device disconnected")]
    Disconnected,

    /// A transport operation did not complete in time
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// Device is not ready for the requested work
    #[error("Device not ready: {reason}")]
    NotReady {
        /// Reason why device is not ready
        reason: String,
    },

    /// Requested state transition is not allowed from the current state
    #[error("Invalid connection state: {state}")]
    InvalidState {
        /// Description of the rejected transition
        state: String,
    },

    /// Configuration value rejected before anything was sent to the device
    #[error("Invalid configuration for '{key}': {reason}")]
    InvalidConfiguration {
        /// Preference key that failed validation
        key: String,
        /// Why the value was rejected
        reason: String,
    },

    /// Invalid parameters passed by the caller
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Inbound frame failed an integrity check
    #[error("Failed to parse frame: {0}")]
    ParseError(String),

    /// Challenge-response authentication could not be completed
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Transaction was dropped before or while running
    #[error("Transaction '{name}' aborted")]
    TransactionAborted {
        /// Name of the aborted transaction
        name: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for wearlink operations
pub type Result<T> = std::result::Result<T, WearlinkError>;

impl WearlinkError {
    /// Check if this error is a transport I/O failure that should tear the link down
    #[must_use]
    pub const fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::ConnectionFailed(_)
                | Self::Disconnected
                | Self::Timeout { .. }
                | Self::Io(_)
        )
    }

    /// Check if this error should surface to the user rather than only the log
    #[must_use]
    pub const fn is_user_visible(&self) -> bool {
        self.is_transport_failure() || matches!(self, Self::AuthenticationFailed(_))
    }

    /// Check if this error is recoverable without reconnecting
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NotReady { .. }
                | Self::InvalidParameters(_)
                | Self::InvalidConfiguration { .. }
                | Self::TransactionAborted { .. }
        )
    }
}
