#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Wearlink
//!
//! A device session engine for wearables that talk over Bluetooth Low Energy.
//!
//! Each paired device gets a [`DeviceSession`] which owns:
//!
//! - **Transport**: a byte pipe to the device ([`BleTransport`] for real
//!   hardware, [`MockTransport`] for tests and simulation)
//! - **Transaction queue**: strictly ordered reads, writes, waits and callbacks
//! - **Connection state machine**: reconnects with exponential backoff
//!   (4s, 8s, ... capped at 64s)
//! - **Codec**: translates requests into the device family's wire format and
//!   decodes inbound bytes into events
//! - **Event dispatcher**: applies decoded events to the device record and the
//!   preference and sample stores
//!
//! Four codec families ship with the crate: fitness bands (checksummed frames),
//! earbuds (msgpack RPC), headphones (CRC-protected vendor packets) and key
//! finder tags (challenge-response authentication).
//!
//! Recorded activity, heart-rate and sleep history is merged into a per-minute
//! timeline by [`TimelineMerger`].
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use wearlink::{
//!     BleTransport, Device, DeviceFamily, OutboundCommand, SessionRegistry,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = SessionRegistry::default();
//!     let address = "ED:5A:94:CB:98:E4";
//!     let transport = Arc::new(BleTransport::new(address).await?);
//!     let session = registry
//!         .add(Device::new(address, DeviceFamily::Tag), transport)
//!         .await?;
//!
//!     session.connect().await?;
//!     session.send(OutboundCommand::FindDevice(true)).await?;
//!     Ok(())
//! }
//! ```

/// Transaction building blocks
pub mod action;
/// Bluetooth Low Energy transport
pub mod ble;
/// Per-family feature table
pub mod capabilities;
/// Device family codecs
pub mod codec;
/// Routing of decoded device events
pub mod dispatch;
/// Error types and handling
pub mod error;
/// Checksums and byte helpers shared by the codecs
pub mod frame;
/// Console logging setup
pub mod logging;
/// Scripted in-memory transport
pub mod mock;
/// Per-device preferences
pub mod prefs;
/// Transaction queue and executor
pub mod queue;
/// Registry of device sessions
pub mod registry;
/// Activity, heart-rate and sleep samples
pub mod samples;
/// Device session wiring
pub mod session;
/// Connection state machine and reconnect backoff
pub mod state;
/// Per-minute activity timeline
pub mod timeline;
/// Transport abstraction
pub mod transport;
/// Type definitions and data structures
pub mod types;

// Re-export the main types for convenient usage
pub use ble::BleTransport;
pub use capabilities::DeviceCapabilities;
pub use codec::{codec_for, Codec, DeviceEvent, OutboundCommand};
pub use dispatch::SessionUpdate;
pub use error::{Result, WearlinkError};
pub use mock::MockTransport;
pub use prefs::{ConfigStore, ConfigValue, Preferences};
pub use registry::SessionRegistry;
pub use samples::{ActivitySample, MemorySampleStore, SampleStore};
pub use session::DeviceSession;
pub use timeline::TimelineMerger;
pub use transport::{Transport, TransportEvent};
pub use types::{
    BatteryState, BatteryStatus, ConnectionState, Device, DeviceFamily, ReconnectConfig,
    SessionConfig, TimeoutConfig,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
