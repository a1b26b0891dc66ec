use crate::{
    action::Readiness,
    capabilities::DeviceCapabilities,
    codec::{Codec, OutboundCommand},
    dispatch::{EventDispatcher, SessionUpdate},
    error::{Result, WearlinkError},
    prefs::{ConfigStore, ConfigValue, PREF_USER_ID},
    queue::{self, check_ready, with_timeout, ObserverSlot, TransactionQueue},
    samples::{ActivitySample, SampleStore},
    state::{ConnectionStateMachine, ReconnectRequest},
    timeline::{TimelineMerger, TimelineQuery},
    transport::{Transport, TransportEvent},
    types::{ConnectionState, Device, DeviceFamily, SessionConfig},
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::{
    sync::{broadcast, mpsc, watch, Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

struct SessionInner {
    address: String,
    family: DeviceFamily,
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    state: Arc<ConnectionStateMachine>,
    queue: TransactionQueue,
    codec: Mutex<Box<dyn Codec>>,
    dispatcher: EventDispatcher,
    prefs: ConfigStore,
    samples: Arc<dyn SampleStore>,
    device: Arc<RwLock<Device>>,
    closing: AtomicBool,
}

/// Everything that drives one physical device
///
/// Owns the transport, the transaction queue and its executor, the codec and
/// the dispatcher. Background tasks are aborted when the session is dropped.
pub struct DeviceSession {
    inner: Arc<SessionInner>,
    tasks: Vec<JoinHandle<()>>,
}

impl DeviceSession {
    /// Wire up a session and start its background tasks
    ///
    /// The session starts in `NotConnected`; call [`DeviceSession::connect`].
    pub async fn start(
        device: Device,
        transport: Arc<dyn Transport>,
        codec: Box<dyn Codec>,
        config: SessionConfig,
        prefs: ConfigStore,
        samples: Arc<dyn SampleStore>,
    ) -> Self {
        let address = device.address.clone();
        let family = device.family;
        let (reconnect_tx, reconnect_rx) = mpsc::unbounded_channel();
        let state = Arc::new(ConnectionStateMachine::new(
            address.as_str(),
            config.reconnect.clone(),
            reconnect_tx,
        ));

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        transport.attach(events_tx.clone()).await;

        let (queue, executor) = queue::channel(
            &address,
            transport.clone(),
            state.clone(),
            config.timeouts.clone(),
        );
        let executor = executor.with_read_sink(events_tx);
        let observer = executor.observer_slot();

        let device = Arc::new(RwLock::new(device));
        let dispatcher = EventDispatcher::new(
            device.clone(),
            &address,
            queue.clone(),
            prefs.clone(),
            samples.clone(),
        );
        let state_rx = state.subscribe();

        let inner = Arc::new(SessionInner {
            address,
            family,
            config,
            transport,
            state,
            queue,
            codec: Mutex::new(codec),
            dispatcher,
            prefs,
            samples,
            device,
            closing: AtomicBool::new(false),
        });
        {
            let prefs = inner.prefs.preferences(&inner.address).await;
            inner.codec.lock().await.load_preferences(&prefs);
        }

        let tasks = vec![
            tokio::spawn(executor.run()),
            tokio::spawn(pump(inner.clone(), events_rx, observer)),
            tokio::spawn(reconnect_loop(inner.clone(), reconnect_rx)),
            tokio::spawn(watch_state(inner.clone(), state_rx)),
        ];
        debug!("{}: session started for {} device", inner.address, family);
        Self { inner, tasks }
    }

    /// Device address
    #[must_use]
    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// Device family
    #[must_use]
    pub fn family(&self) -> DeviceFamily {
        self.inner.family
    }

    /// What the device can do
    #[must_use]
    pub fn capabilities(&self) -> DeviceCapabilities {
        DeviceCapabilities::for_family(self.inner.family)
    }

    /// Current connection state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.state.state()
    }

    /// Observe connection state changes
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Receive user-facing updates
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.inner.dispatcher.subscribe()
    }

    /// Queue handle for submitting raw transactions
    #[must_use]
    pub fn queue(&self) -> &TransactionQueue {
        &self.inner.queue
    }

    /// Snapshot of the device record
    pub async fn device(&self) -> Device {
        let mut device = self.inner.device.read().await.clone();
        device.state = self.state();
        device
    }

    /// Connect and initialize the device
    ///
    /// # Errors
    ///
    /// Returns [`WearlinkError::InvalidState`] if a connection is already up or
    /// in progress. Transport failures and timeouts are returned after the
    /// session moved to reconnect handling.
    pub async fn connect(&self) -> Result<()> {
        self.inner.connect(true).await
    }

    /// Tear the connection down and stop reconnecting
    ///
    /// Queued transactions are dropped.
    ///
    /// # Errors
    ///
    /// Returns the transport's error if the link could not be closed cleanly.
    pub async fn disconnect(&self) -> Result<()> {
        self.inner.closing.store(true, Ordering::SeqCst);
        self.inner.state.disconnect().await;
        self.inner.queue.clear();
        self.inner.transport.disconnect().await
    }

    /// Translate `command` through the codec and queue it
    ///
    /// Commands the codec does not support are silently ignored.
    ///
    /// # Errors
    ///
    /// Returns [`WearlinkError::NotReady`] unless the device is initialized, or
    /// [`WearlinkError::InvalidConfiguration`] when the codec rejects a setting.
    pub async fn send(&self, command: OutboundCommand) -> Result<()> {
        check_ready(self.state(), Readiness::Initialized)?;
        let prefs = self.inner.prefs.preferences(&self.inner.address).await;
        let transaction = self.inner.codec.lock().await.build(&command, &prefs)?;
        match transaction {
            Some(transaction) => self.inner.queue.submit(transaction),
            None => Ok(()),
        }
    }

    /// Store a preference and push it to the device
    ///
    /// When the device is not connected the value is kept and applied by the
    /// next initialization.
    ///
    /// # Errors
    ///
    /// Returns [`WearlinkError::InvalidConfiguration`] when the codec rejects
    /// the new value; the previous value is restored.
    pub async fn update_preference(
        &self,
        key: &str,
        value: impl Into<ConfigValue> + Send,
    ) -> Result<()> {
        let address = &self.inner.address;
        let previous = self.inner.prefs.set(address, key, value).await;
        let prefs = self.inner.prefs.preferences(address).await;
        let command = OutboundCommand::SendConfiguration(key.to_string());

        let built = self.inner.codec.lock().await.build(&command, &prefs);
        let transaction = match built {
            Ok(Some(transaction)) => transaction,
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!("{}: rejected {}: {}", address, key, e);
                self.inner.prefs.restore(address, key, previous).await;
                return Err(e);
            }
        };

        match self.inner.queue.submit(transaction) {
            Err(WearlinkError::NotReady { reason }) => {
                debug!("{}: {} stored, not sent ({})", address, key, reason);
                Ok(())
            }
            other => other,
        }
    }

    /// Per-minute activity timeline for `[from, to]`
    ///
    /// # Errors
    ///
    /// Returns [`WearlinkError::InvalidParameters`] if the device family does
    /// not record activity.
    pub async fn timeline(
        &self,
        merger: &TimelineMerger,
        from: i64,
        to: i64,
    ) -> Result<Vec<ActivitySample>> {
        let provider = self
            .inner
            .codec
            .lock()
            .await
            .sample_provider()
            .ok_or_else(|| {
                WearlinkError::InvalidParameters(format!(
                    "{} devices do not record activity",
                    self.inner.family
                ))
            })?;
        let user_id = self
            .inner
            .prefs
            .get(&self.inner.address, PREF_USER_ID)
            .await
            .and_then(|value| value.as_int())
            .and_then(|id| u32::try_from(id).ok())
            .unwrap_or(0);
        let query = TimelineQuery {
            device_id: &self.inner.address,
            user_id,
            from,
            to,
        };
        Ok(merger
            .query(self.inner.samples.as_ref(), provider.as_ref(), query)
            .await)
    }

    /// Disconnect and stop every background task
    pub async fn shutdown(mut self) {
        if let Err(e) = self.disconnect().await {
            warn!("{}: disconnect during shutdown failed: {}", self.address(), e);
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!("{}: session closed", self.inner.address);
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl SessionInner {
    async fn connect(&self, manual: bool) -> Result<()> {
        self.state.begin_connect(manual).await?;
        self.closing.store(false, Ordering::SeqCst);
        info!("{}: connecting", self.address);

        let timeouts = &self.config.timeouts;
        if let Err(e) = with_timeout(timeouts.connect_timeout_ms, self.transport.connect()).await {
            self.fail_connection(&e).await;
            return Err(e);
        }
        if let Err(e) = self.state.link_established().await {
            warn!("{}: link came up in the wrong state: {}", self.address, e);
            self.release_transport().await;
            return Err(e);
        }
        self.device.write().await.mtu = self.transport.mtu();

        let prefs = self.prefs.preferences(&self.address).await;
        let initialize = self.codec.lock().await.initialize(&prefs);
        let result = match initialize {
            Ok(transaction) => {
                with_timeout(
                    timeouts.initialization_timeout_ms,
                    self.queue.execute(transaction),
                )
                .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            self.fail_connection(&e).await;
            return Err(e);
        }

        if let Err(e) = self.state.initialized().await {
            warn!("{}: initialization finished in the wrong state: {}", self.address, e);
            self.release_transport().await;
            return Err(e);
        }
        info!("{}: initialized", self.address);
        Ok(())
    }

    async fn fail_connection(&self, e: &WearlinkError) {
        if e.is_user_visible() {
            error!("{}: connection attempt failed: {}", self.address, e);
        } else {
            warn!("{}: connection attempt failed: {}", self.address, e);
        }
        self.queue.clear();
        self.state.link_lost(&e.to_string()).await;
        self.release_transport().await;
    }

    async fn release_transport(&self) {
        if let Err(e) = self.transport.disconnect().await {
            debug!("{}: disconnect after failure: {}", self.address, e);
        }
    }
}

async fn pump(
    inner: Arc<SessionInner>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    observer: ObserverSlot,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Notification {
                characteristic,
                value,
            }
            | TransportEvent::ReadValue {
                characteristic,
                value,
            } => {
                debug!(
                    "{}: inbound {}: {:02X?}",
                    inner.address,
                    characteristic,
                    value.as_ref()
                );
                let current = observer.borrow().clone();
                if let Some(observer) = current {
                    observer.on_value(characteristic, &value);
                }
                let mut codec = inner.codec.lock().await;
                let decoded = codec.decode(characteristic, &value);
                inner.dispatcher.dispatch_all(decoded, &mut **codec).await;
            }
            TransportEvent::Disconnected { reason } => {
                inner.queue.clear();
                inner.state.link_lost(&reason).await;
            }
        }
    }
    debug!("{}: inbound event channel closed", inner.address);
}

async fn reconnect_loop(
    inner: Arc<SessionInner>,
    mut requests: mpsc::UnboundedReceiver<ReconnectRequest>,
) {
    while let Some(request) = requests.recv().await {
        info!(
            "{}: reconnect attempt {} after {:?}",
            inner.address, request.attempt, request.delay
        );
        if let Err(e) = inner.connect(false).await {
            warn!("{}: reconnect attempt {} failed: {}", inner.address, request.attempt, e);
        }
    }
}

async fn watch_state(inner: Arc<SessionInner>, mut state_rx: watch::Receiver<ConnectionState>) {
    let mut previous = *state_rx.borrow_and_update();
    while state_rx.changed().await.is_ok() {
        let current = *state_rx.borrow_and_update();
        inner.device.write().await.state = current;

        let was_active = matches!(
            previous,
            ConnectionState::Connecting | ConnectionState::Initializing | ConnectionState::Initialized
        );
        let dropped = matches!(
            current,
            ConnectionState::WaitingForReconnect | ConnectionState::NotConnected
        );
        if was_active && dropped && !inner.closing.load(Ordering::SeqCst) {
            inner.dispatcher.publish(SessionUpdate::TransportFailure {
                address: inner.address.clone(),
                reason: format!("link lost while {previous}"),
            });
        }
        previous = current;
    }
}
