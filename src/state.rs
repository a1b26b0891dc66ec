use crate::{
    error::{Result, WearlinkError},
    types::{ConnectionState, ReconnectConfig},
};
use std::time::Duration;
use tokio::{
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

/// Exponential reconnect delay
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    initial: Duration,
    max: Duration,
    multiplier: u32,
    next: Duration,
}

impl ReconnectBackoff {
    /// Create a backoff starting at the configured initial delay
    #[must_use]
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            initial: config.initial_delay(),
            max: config.max_delay(),
            multiplier: config.multiplier.max(1),
            next: config.initial_delay(),
        }
    }

    /// Delay for the next attempt; grows the following one
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.saturating_mul(self.multiplier).min(self.max);
        delay
    }

    /// Delay the next attempt would get
    #[must_use]
    pub const fn peek(&self) -> Duration {
        self.next
    }

    /// Go back to the initial delay
    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

/// Posted by the backoff timer when a reconnect attempt is due
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectRequest {
    /// Attempts since the device was last initialized, starting at 1
    pub attempt: u32,
    /// Delay that elapsed before this request
    pub delay: Duration,
}

struct Inner {
    backoff: ReconnectBackoff,
    attempts: u32,
    timer: Option<JoinHandle<()>>,
}

impl Inner {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Owns the lifecycle of one device connection
///
/// State changes are published on a [`watch`] channel. Reconnect timers run as
/// separate tasks and post a [`ReconnectRequest`] when due.
pub struct ConnectionStateMachine {
    address: String,
    config: ReconnectConfig,
    state_tx: watch::Sender<ConnectionState>,
    reconnect_tx: mpsc::UnboundedSender<ReconnectRequest>,
    inner: Mutex<Inner>,
}

impl ConnectionStateMachine {
    /// Create a state machine in `NotConnected`
    #[must_use]
    pub fn new(
        address: impl Into<String>,
        config: ReconnectConfig,
        reconnect_tx: mpsc::UnboundedSender<ReconnectRequest>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::NotConnected);
        Self {
            address: address.into(),
            inner: Mutex::new(Inner {
                backoff: ReconnectBackoff::new(&config),
                attempts: 0,
                timer: None,
            }),
            config,
            state_tx,
            reconnect_tx,
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Observe state changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Start a connection attempt, cancelling any pending reconnect timer
    ///
    /// Manual attempts are allowed from `NotConnected` and `WaitingForReconnect`.
    /// Automatic attempts are only allowed while waiting for a reconnect.
    ///
    /// # Errors
    ///
    /// Returns [`WearlinkError::InvalidState`] from any other state.
    pub async fn begin_connect(&self, manual: bool) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let current = self.state();
        let allowed = match current {
            ConnectionState::WaitingForReconnect => true,
            ConnectionState::NotConnected => manual,
            _ => false,
        };
        if !allowed {
            return Err(self.rejected(current, ConnectionState::Connecting));
        }

        inner.cancel_timer();
        self.set(ConnectionState::Connecting);
        Ok(())
    }

    /// Transport reported the link as established
    ///
    /// # Errors
    ///
    /// Returns [`WearlinkError::InvalidState`] unless currently `Connecting`.
    pub async fn link_established(&self) -> Result<()> {
        let _inner = self.inner.lock().await;
        self.advance(ConnectionState::Connecting, ConnectionState::Initializing)
    }

    /// Initialization transaction completed
    ///
    /// # Errors
    ///
    /// Returns [`WearlinkError::InvalidState`] unless currently `Initializing`.
    pub async fn initialized(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.advance(ConnectionState::Initializing, ConnectionState::Initialized)?;
        inner.backoff.reset();
        inner.attempts = 0;
        Ok(())
    }

    /// The link dropped without a teardown request
    ///
    /// Returns the scheduled reconnect delay, or `None` when the loss was already
    /// handled or automatic reconnect is disabled.
    pub async fn link_lost(&self, reason: &str) -> Option<Duration> {
        let mut inner = self.inner.lock().await;
        let current = self.state();
        if matches!(
            current,
            ConnectionState::NotConnected | ConnectionState::WaitingForReconnect
        ) {
            debug!("{}: ignoring link loss in state {}", self.address, current);
            return None;
        }

        warn!("{}: link lost while {}: {}", self.address, current, reason);
        if !self.config.enabled {
            self.set(ConnectionState::NotConnected);
            return None;
        }

        let delay = inner.backoff.next_delay();
        inner.attempts += 1;
        let request = ReconnectRequest {
            attempt: inner.attempts,
            delay,
        };
        let reconnect_tx = self.reconnect_tx.clone();
        inner.cancel_timer();
        inner.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = reconnect_tx.send(request);
        }));

        self.set(ConnectionState::WaitingForReconnect);
        info!(
            "{}: reconnect attempt {} in {:?}",
            self.address, request.attempt, delay
        );
        Some(delay)
    }

    /// User teardown: cancel reconnects and go to `NotConnected`
    pub async fn disconnect(&self) {
        let mut inner = self.inner.lock().await;
        inner.cancel_timer();
        self.set(ConnectionState::NotConnected);
    }

    /// Delay the next link loss would schedule
    pub async fn next_delay(&self) -> Duration {
        self.inner.lock().await.backoff.peek()
    }

    fn advance(&self, from: ConnectionState, to: ConnectionState) -> Result<()> {
        let current = self.state();
        if current != from {
            return Err(self.rejected(current, to));
        }
        self.set(to);
        Ok(())
    }

    fn rejected(&self, current: ConnectionState, to: ConnectionState) -> WearlinkError {
        WearlinkError::InvalidState {
            state: format!("{}: cannot go from {current} to {to}", self.address),
        }
    }

    fn set(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            info!("{}: {} -> {}", self.address, previous, state);
        }
    }
}

impl Drop for ConnectionStateMachine {
    fn drop(&mut self) {
        self.inner.get_mut().cancel_timer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> (
        ConnectionStateMachine,
        mpsc::UnboundedReceiver<ReconnectRequest>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ConnectionStateMachine::new("AA:BB:CC:DD:EE:FF", ReconnectConfig::default(), tx),
            rx,
        )
    }

    async fn bring_up(machine: &ConnectionStateMachine, manual: bool) {
        machine.begin_connect(manual).await.unwrap();
        machine.link_established().await.unwrap();
        machine.initialized().await.unwrap();
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let mut backoff = ReconnectBackoff::new(&ReconnectConfig::default());
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![4, 8, 16, 32, 64, 64, 64]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_disconnects_back_off_and_reset_on_initialized() {
        let (machine, _rx) = machine();
        bring_up(&machine, true).await;

        assert_eq!(machine.link_lost("gatt 133").await, Some(Duration::from_secs(4)));
        machine.begin_connect(false).await.unwrap();
        assert_eq!(machine.link_lost("gatt 133").await, Some(Duration::from_secs(8)));
        machine.begin_connect(false).await.unwrap();
        assert_eq!(machine.link_lost("gatt 133").await, Some(Duration::from_secs(16)));

        machine.begin_connect(false).await.unwrap();
        machine.link_established().await.unwrap();
        machine.initialized().await.unwrap();
        assert_eq!(machine.next_delay().await, Duration::from_secs(4));
        assert_eq!(machine.link_lost("gatt 8").await, Some(Duration::from_secs(4)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_request_posted_after_delay() {
        let (machine, mut rx) = machine();
        bring_up(&machine, true).await;

        let start = tokio::time::Instant::now();
        machine.link_lost("timeout").await;
        let request = rx.recv().await.unwrap();

        assert!(start.elapsed() >= Duration::from_secs(4));
        assert_eq!(request.attempt, 1);
        assert_eq!(request.delay, Duration::from_secs(4));
        assert_eq!(machine.state(), ConnectionState::WaitingForReconnect);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_connect_bypasses_backoff() {
        let (machine, mut rx) = machine();
        bring_up(&machine, true).await;
        machine.link_lost("out of range").await;

        machine.begin_connect(true).await.unwrap();
        assert_eq!(machine.state(), ConnectionState::Connecting);

        tokio::time::advance(Duration::from_secs(120)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_duplicate_link_loss_is_ignored() {
        let (machine, _rx) = machine();
        bring_up(&machine, true).await;
        assert!(machine.link_lost("write failed").await.is_some());
        assert!(machine.link_lost("disconnected").await.is_none());
        assert_eq!(machine.next_delay().await, Duration::from_secs(8));
    }

    #[tokio::test]
    async fn test_invalid_transitions_rejected() {
        let (machine, _rx) = machine();
        assert!(machine.link_established().await.is_err());
        assert!(machine.initialized().await.is_err());
        assert!(machine.begin_connect(false).await.is_err());

        machine.begin_connect(true).await.unwrap();
        assert!(machine.begin_connect(true).await.is_err());
    }

    #[tokio::test]
    async fn test_auto_reconnect_disabled() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let config = ReconnectConfig {
            enabled: false,
            ..ReconnectConfig::default()
        };
        let machine = ConnectionStateMachine::new("AA:BB:CC:DD:EE:FF", config, tx);
        bring_up(&machine, true).await;

        assert_eq!(machine.link_lost("bye").await, None);
        assert_eq!(machine.state(), ConnectionState::NotConnected);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_state_changes_are_observable() {
        let (machine, _rx) = machine();
        let mut observer = machine.subscribe();

        machine.begin_connect(true).await.unwrap();
        observer.changed().await.unwrap();
        assert_eq!(*observer.borrow_and_update(), ConnectionState::Connecting);

        machine.disconnect().await;
        observer.changed().await.unwrap();
        assert_eq!(*observer.borrow(), ConnectionState::NotConnected);
    }
}
