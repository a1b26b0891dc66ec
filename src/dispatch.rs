use crate::{
    action::{Readiness, Transaction},
    codec::{Codec, DeviceEvent},
    error::{Result, WearlinkError},
    prefs::ConfigStore,
    queue::TransactionQueue,
    samples::{SampleStore, SleepSummary},
    types::{BatteryState, BatteryStatus, Device},
};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

/// Capacity of the [`SessionUpdate`] broadcast channel
pub const UPDATE_CHANNEL_CAPACITY: usize = 64;

/// User-facing outcome published by a session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    /// A battery reading changed
    Battery {
        /// Device address
        address: String,
        /// Battery index
        index: u8,
        /// Percentage, `None` if unknown
        level: Option<u8>,
        /// Charging state
        state: BatteryState,
    },
    /// Firmware or hardware version became known
    Version {
        /// Device address
        address: String,
        /// Firmware version
        firmware: String,
        /// Hardware version
        hardware: Option<String>,
    },
    /// Live measurement
    Realtime {
        /// Device address
        address: String,
        /// Beats per minute
        heart_rate: Option<u8>,
        /// Steps today
        steps: Option<u32>,
    },
    /// Device asks the phone to ring, or to stop
    FindPhone {
        /// Device address
        address: String,
        /// Ring when true
        start: bool,
    },
    /// Night summary
    SleepSummary {
        /// Device address
        address: String,
        /// Summary as reported
        summary: SleepSummary,
    },
    /// App or watchface management finished
    AppManagement {
        /// Device address
        address: String,
        /// Device side app identifier
        app_id: u16,
        /// Whether it worked
        success: bool,
    },
    /// Challenge-response handshake failed
    AuthenticationFailed {
        /// Device address
        address: String,
        /// Why
        reason: String,
    },
    /// The link failed and the session went to reconnect handling
    TransportFailure {
        /// Device address
        address: String,
        /// Transport supplied reason
        reason: String,
    },
}

/// Routes decoded [`DeviceEvent`]s to the device record, the stores, the
/// queue and the update channel
#[derive(Clone)]
pub struct EventDispatcher {
    address: String,
    device: Arc<RwLock<Device>>,
    queue: TransactionQueue,
    prefs: ConfigStore,
    samples: Arc<dyn SampleStore>,
    updates: broadcast::Sender<SessionUpdate>,
}

impl EventDispatcher {
    /// Dispatcher for the device behind `device`
    #[must_use]
    pub fn new(
        device: Arc<RwLock<Device>>,
        address: &str,
        queue: TransactionQueue,
        prefs: ConfigStore,
        samples: Arc<dyn SampleStore>,
    ) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            address: address.to_string(),
            device,
            queue,
            prefs,
            samples,
            updates,
        }
    }

    /// Receive every update published from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.updates.subscribe()
    }

    /// Publish an update; having no subscribers is fine
    pub fn publish(&self, update: SessionUpdate) {
        if self.updates.send(update).is_err() {
            debug!("{}: no update subscribers", self.address);
        }
    }

    /// Handle every event of one decoded chunk, in order
    ///
    /// A failing event is logged and does not stop the remaining ones.
    pub async fn dispatch_all(&self, events: Vec<DeviceEvent>, codec: &mut dyn Codec) {
        for event in events {
            if let Err(e) = self.dispatch(event, codec).await {
                warn!("{}: failed to handle device event: {}", self.address, e);
            }
        }
    }

    /// Handle one event
    ///
    /// # Errors
    ///
    /// Returns [`WearlinkError::NotReady`] when a [`DeviceEvent::SendBytes`]
    /// reply cannot be queued.
    pub async fn dispatch(&self, event: DeviceEvent, codec: &mut dyn Codec) -> Result<()> {
        match event {
            DeviceEvent::BatteryInfo {
                index,
                level,
                state,
            } => {
                self.device
                    .write()
                    .await
                    .batteries
                    .insert(index, BatteryStatus { level, state });
                self.publish(SessionUpdate::Battery {
                    address: self.address.clone(),
                    index,
                    level,
                    state,
                });
            }
            DeviceEvent::VersionInfo { firmware, hardware } => {
                {
                    let mut device = self.device.write().await;
                    device.firmware_version = Some(firmware.clone());
                    if hardware.is_some() {
                        device.hardware_version.clone_from(&hardware);
                    }
                }
                info!("{}: firmware {}", self.address, firmware);
                self.publish(SessionUpdate::Version {
                    address: self.address.clone(),
                    firmware,
                    hardware,
                });
            }
            DeviceEvent::AppManagementResult { app_id, success } => {
                self.publish(SessionUpdate::AppManagement {
                    address: self.address.clone(),
                    app_id,
                    success,
                });
            }
            DeviceEvent::SendBytes {
                characteristic,
                payload,
            } => {
                let mtu = self.device.read().await.mtu;
                let transaction = Transaction::builder("send bytes")
                    .requires(Readiness::Link)
                    .write_chunked(characteristic, &payload, mtu, codec.chunk_delay())
                    .build();
                self.queue.insert(transaction)?;
            }
            DeviceEvent::UpdatePreferences(update) => {
                debug!("{}: device reported {} setting(s)", self.address, update.len());
                self.prefs.merge(&self.address, &update).await;
                let prefs = self.prefs.preferences(&self.address).await;
                codec.load_preferences(&prefs);
            }
            DeviceEvent::SleepMonitorResult(summary) => {
                self.publish(SessionUpdate::SleepSummary {
                    address: self.address.clone(),
                    summary,
                });
            }
            DeviceEvent::AuthenticationFailed { reason } => {
                let error = WearlinkError::AuthenticationFailed(reason.clone());
                warn!("{}: {}", self.address, error);
                self.publish(SessionUpdate::AuthenticationFailed {
                    address: self.address.clone(),
                    reason,
                });
            }
            DeviceEvent::FindPhone(start) => {
                self.publish(SessionUpdate::FindPhone {
                    address: self.address.clone(),
                    start,
                });
            }
            DeviceEvent::RealtimeSample { heart_rate, steps } => {
                self.publish(SessionUpdate::Realtime {
                    address: self.address.clone(),
                    heart_rate,
                    steps,
                });
            }
            DeviceEvent::ActivitySamples(samples) => {
                debug!("{}: storing {} activity row(s)", self.address, samples.len());
                self.samples.upsert_activity(samples).await;
            }
            DeviceEvent::HeartRateSamples(samples) => {
                self.samples.upsert_heart_rate(samples).await;
            }
            DeviceEvent::SleepStages(samples) => {
                self.samples.upsert_sleep(samples).await;
            }
        }
        Ok(())
    }
}
