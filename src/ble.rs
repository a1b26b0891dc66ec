use btleplug::{
    api::{
        BDAddr, CentralEvent, CharPropFlags, Central, Characteristic, Manager as _,
        Peripheral as _, ScanFilter, WriteType,
    },
    platform::{Adapter, Manager, Peripheral},
};
use bytes::Bytes;
use futures::stream::StreamExt;
use std::{collections::HashMap, time::Duration};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{Result, WearlinkError},
    transport::{EventSink, Transport, TransportEvent},
};
use async_trait::async_trait;

/// Default time spent scanning when the peripheral is not cached yet
pub const DEFAULT_SCAN_TIMEOUT_MS: u64 = 5_000;

/// A peripheral seen during a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    /// Bluetooth address
    pub address: String,
    /// Advertised name
    pub name: Option<String>,
    /// Signal strength
    pub rssi: Option<i16>,
}

/// Scan on the first adapter and list every peripheral seen
///
/// # Errors
///
/// Returns [`WearlinkError::DeviceNotFound`] if there is no Bluetooth adapter,
/// or [`WearlinkError::Ble`] for other Bluetooth-related errors.
pub async fn scan(scan_timeout_ms: u64) -> Result<Vec<ScanResult>> {
    let adapter = first_adapter().await?;
    info!("Scanning for {}ms", scan_timeout_ms);
    adapter.start_scan(ScanFilter::default()).await?;
    tokio::time::sleep(Duration::from_millis(scan_timeout_ms)).await;
    adapter.stop_scan().await?;

    let mut results = Vec::new();
    for peripheral in adapter.peripherals().await? {
        let properties = peripheral.properties().await?;
        results.push(ScanResult {
            address: peripheral.address().to_string(),
            name: properties.as_ref().and_then(|p| p.local_name.clone()),
            rssi: properties.and_then(|p| p.rssi),
        });
    }
    info!("Scan completed. Found {} device(s)", results.len());
    Ok(results)
}

async fn first_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| WearlinkError::DeviceNotFound("no Bluetooth adapter".to_string()))
}

/// Parse an `XX:XX:XX:XX:XX:XX` address
///
/// # Errors
///
/// Returns [`WearlinkError::InvalidParameters`] if `address` is malformed.
pub fn parse_address(address: &str) -> Result<BDAddr> {
    address
        .parse::<BDAddr>()
        .map_err(|e| WearlinkError::InvalidParameters(format!("bad address '{address}': {e}")))
}

/// Acknowledged writes unless the characteristic only takes unacknowledged ones
#[must_use]
pub fn write_type_for(properties: CharPropFlags) -> WriteType {
    if properties.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE)
        && !properties.contains(CharPropFlags::WRITE)
    {
        WriteType::WithoutResponse
    } else {
        WriteType::WithResponse
    }
}

struct Link {
    peripheral: Peripheral,
    characteristics: HashMap<Uuid, Characteristic>,
    forwarder: JoinHandle<()>,
}

impl Link {
    fn characteristic(&self, uuid: Uuid) -> Result<&Characteristic> {
        self.characteristics
            .get(&uuid)
            .ok_or_else(|| WearlinkError::Protocol(format!("Characteristic {uuid} not found")))
    }
}

/// [`Transport`] over a real Bluetooth Low Energy link
pub struct BleTransport {
    address: BDAddr,
    adapter: Adapter,
    scan_timeout_ms: u64,
    sink: Mutex<Option<EventSink>>,
    link: Mutex<Option<Link>>,
}

impl BleTransport {
    /// Transport for the peripheral at `address` on the first adapter
    ///
    /// # Errors
    ///
    /// Returns [`WearlinkError::InvalidParameters`] for a malformed address,
    /// [`WearlinkError::DeviceNotFound`] if there is no adapter.
    pub async fn new(address: &str) -> Result<Self> {
        Ok(Self {
            address: parse_address(address)?,
            adapter: first_adapter().await?,
            scan_timeout_ms: DEFAULT_SCAN_TIMEOUT_MS,
            sink: Mutex::new(None),
            link: Mutex::new(None),
        })
    }

    /// Scan this long when the peripheral is not known to the adapter yet
    #[must_use]
    pub const fn with_scan_timeout(mut self, scan_timeout_ms: u64) -> Self {
        self.scan_timeout_ms = scan_timeout_ms;
        self
    }

    async fn cached_peripheral(&self) -> Result<Option<Peripheral>> {
        Ok(self
            .adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.address() == self.address))
    }

    async fn find_peripheral(&self) -> Result<Peripheral> {
        if let Some(peripheral) = self.cached_peripheral().await? {
            return Ok(peripheral);
        }

        debug!("{} not cached, scanning", self.address);
        self.adapter.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(Duration::from_millis(self.scan_timeout_ms)).await;
        self.adapter.stop_scan().await?;

        self.cached_peripheral()
            .await?
            .ok_or_else(|| WearlinkError::DeviceNotFound(self.address.to_string()))
    }

    async fn spawn_forwarder(&self, peripheral: &Peripheral) -> Result<JoinHandle<()>> {
        let mut notifications = peripheral.notifications().await?;
        let mut central_events = self.adapter.events().await?;
        let id = peripheral.id();
        let address = self.address;
        let sink = self.sink.lock().await.clone();

        Ok(tokio::spawn(async move {
            let Some(sink) = sink else {
                warn!("{}: no event sink attached, inbound data is dropped", address);
                return;
            };
            loop {
                tokio::select! {
                    notification = notifications.next() => {
                        let Some(notification) = notification else {
                            break;
                        };
                        let event = TransportEvent::Notification {
                            characteristic: notification.uuid,
                            value: Bytes::from(notification.value),
                        };
                        if sink.send(event).is_err() {
                            break;
                        }
                    }
                    event = central_events.next() => match event {
                        Some(CentralEvent::DeviceDisconnected(gone)) if gone == id => {
                            let _ = sink.send(TransportEvent::Disconnected {
                                reason: "peripheral disconnected".to_string(),
                            });
                            break;
                        }
                        Some(_) => {}
                        None => break,
                    },
                }
            }
            debug!("{}: notification forwarder stopped", address);
        }))
    }
}

#[async_trait]
impl Transport for BleTransport {
    async fn attach(&self, sink: EventSink) {
        *self.sink.lock().await = Some(sink);
    }

    async fn connect(&self) -> Result<()> {
        let mut link = self.link.lock().await;
        if let Some(old) = link.take() {
            old.forwarder.abort();
        }

        let peripheral = self.find_peripheral().await?;
        if !peripheral.is_connected().await? {
            peripheral
                .connect()
                .await
                .map_err(|e| WearlinkError::ConnectionFailed(e.to_string()))?;
        }
        peripheral.discover_services().await?;

        let characteristics = peripheral
            .characteristics()
            .into_iter()
            .map(|c| (c.uuid, c))
            .collect::<HashMap<_, _>>();
        let forwarder = self.spawn_forwarder(&peripheral).await?;

        info!(
            "Connected to {} ({} characteristics)",
            self.address,
            characteristics.len()
        );
        *link = Some(Link {
            peripheral,
            characteristics,
            forwarder,
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let Some(link) = self.link.lock().await.take() else {
            return Ok(());
        };
        link.forwarder.abort();
        link.peripheral.disconnect().await?;
        info!("Disconnected from {}", self.address);
        Ok(())
    }

    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<()> {
        let link = self.link.lock().await;
        let link = link.as_ref().ok_or(WearlinkError::Disconnected)?;
        let target = link.characteristic(characteristic)?;
        debug!("Writing to {}: {:02X?}", characteristic, data);
        link.peripheral
            .write(target, data, write_type_for(target.properties))
            .await?;
        Ok(())
    }

    async fn read(&self, characteristic: Uuid) -> Result<Bytes> {
        let link = self.link.lock().await;
        let link = link.as_ref().ok_or(WearlinkError::Disconnected)?;
        let value = link
            .peripheral
            .read(link.characteristic(characteristic)?)
            .await?;
        debug!("Read from {}: {:02X?}", characteristic, value);
        Ok(Bytes::from(value))
    }

    async fn set_notify(&self, characteristic: Uuid, enabled: bool) -> Result<()> {
        let link = self.link.lock().await;
        let link = link.as_ref().ok_or(WearlinkError::Disconnected)?;
        let target = link.characteristic(characteristic)?;
        if enabled {
            link.peripheral.subscribe(target).await?;
        } else {
            link.peripheral.unsubscribe(target).await?;
        }
        Ok(())
    }
}
