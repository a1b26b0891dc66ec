use crate::{
    action::{Action, CallbackContext, Continuation, GattObserver, Readiness, Transaction},
    error::{Result, WearlinkError},
    state::ConnectionStateMachine,
    transport::{EventSink, Transport, TransportEvent},
    types::{ConnectionState, TimeoutConfig},
};
use bytes::Bytes;
use std::{collections::VecDeque, future::Future, sync::Arc, time::Duration};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, warn};

type Completion = oneshot::Sender<Result<()>>;

struct Job {
    transaction: Transaction,
    done: Option<Completion>,
}

enum QueueCommand {
    Submit(Job),
    Insert(Job),
    Clear,
}

/// Slot holding the observer of the transaction currently running
pub type ObserverSlot = watch::Receiver<Option<Arc<dyn GattObserver>>>;

/// Check whether a transaction needing `readiness` may run in `state`
///
/// # Errors
///
/// Returns [`WearlinkError::NotReady`] when the connection is not far enough along.
pub fn check_ready(state: ConnectionState, readiness: Readiness) -> Result<()> {
    let ready = match readiness {
        Readiness::Link => state.is_link_up(),
        Readiness::Initialized => state == ConnectionState::Initialized,
    };
    if ready {
        Ok(())
    } else {
        Err(WearlinkError::NotReady {
            reason: format!("connection is {state}"),
        })
    }
}

/// Submission handle for one device's executor
#[derive(Clone)]
pub struct TransactionQueue {
    commands: mpsc::UnboundedSender<QueueCommand>,
    state: watch::Receiver<ConnectionState>,
}

impl TransactionQueue {
    /// Queue a transaction behind all pending work
    ///
    /// Empty transactions are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`WearlinkError::NotReady`] if the connection cannot run it or the
    /// executor has stopped.
    pub fn submit(&self, transaction: Transaction) -> Result<()> {
        self.push(transaction, None, false)
    }

    /// Queue a transaction ahead of all pending work
    ///
    /// # Errors
    ///
    /// Same as [`TransactionQueue::submit`].
    pub fn insert(&self, transaction: Transaction) -> Result<()> {
        self.push(transaction, None, true)
    }

    /// Queue a transaction and wait until it completed
    ///
    /// # Errors
    ///
    /// Returns the error that aborted the transaction, or
    /// [`WearlinkError::TransactionAborted`] if it was discarded before running.
    pub async fn execute(&self, transaction: Transaction) -> Result<()> {
        let name = transaction.name().to_string();
        let (done_tx, done_rx) = oneshot::channel();
        self.push(transaction, Some(done_tx), false)?;
        done_rx
            .await
            .map_err(|_| WearlinkError::TransactionAborted { name })?
    }

    /// Drop every transaction that has not started yet
    pub fn clear(&self) {
        let _ = self.commands.send(QueueCommand::Clear);
    }

    fn push(&self, transaction: Transaction, done: Option<Completion>, front: bool) -> Result<()> {
        if transaction.is_empty() {
            debug!("Skipping empty transaction '{}'", transaction.name());
            if let Some(done) = done {
                let _ = done.send(Ok(()));
            }
            return Ok(());
        }

        check_ready(*self.state.borrow(), transaction.readiness())?;

        let job = Job { transaction, done };
        let command = if front {
            QueueCommand::Insert(job)
        } else {
            QueueCommand::Submit(job)
        };
        self.commands
            .send(command)
            .map_err(|_| WearlinkError::NotReady {
                reason: "executor stopped".to_string(),
            })
    }
}

/// Runs one device's transactions, one at a time, in submission order
pub struct Executor {
    address: String,
    transport: Arc<dyn Transport>,
    state: Arc<ConnectionStateMachine>,
    timeouts: TimeoutConfig,
    commands: mpsc::UnboundedReceiver<QueueCommand>,
    pending: VecDeque<Job>,
    read_sink: Option<EventSink>,
    observer: watch::Sender<Option<Arc<dyn GattObserver>>>,
}

/// Create a connected queue handle and executor for one device
#[must_use]
pub fn channel(
    address: &str,
    transport: Arc<dyn Transport>,
    state: Arc<ConnectionStateMachine>,
    timeouts: TimeoutConfig,
) -> (TransactionQueue, Executor) {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (observer, _) = watch::channel(None);
    let queue = TransactionQueue {
        commands: commands_tx,
        state: state.subscribe(),
    };
    let executor = Executor {
        address: address.to_string(),
        transport,
        state,
        timeouts,
        commands: commands_rx,
        pending: VecDeque::new(),
        read_sink: None,
        observer,
    };
    (queue, executor)
}

impl Executor {
    /// Forward read results into the inbound decode path
    #[must_use]
    pub fn with_read_sink(mut self, sink: EventSink) -> Self {
        self.read_sink = Some(sink);
        self
    }

    /// Observer of the currently running transaction
    #[must_use]
    pub fn observer_slot(&self) -> ObserverSlot {
        self.observer.subscribe()
    }

    /// Drain the queue until every [`TransactionQueue`] handle is gone
    pub async fn run(mut self) {
        let mut state_rx = self.state.subscribe();
        loop {
            self.drain_commands();
            if !state_rx.borrow_and_update().is_link_up() && !self.pending.is_empty() {
                self.discard_pending("link is down");
            }

            if let Some(job) = self.pending.pop_front() {
                self.run_job(job).await;
                continue;
            }

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.accept(command),
                    None => break,
                },
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        self.drain_commands();
        self.discard_pending("executor stopped");
        debug!("{}: executor stopped", self.address);
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            self.accept(command);
        }
    }

    fn accept(&mut self, command: QueueCommand) {
        match command {
            QueueCommand::Submit(job) => self.pending.push_back(job),
            QueueCommand::Insert(job) => self.pending.push_front(job),
            QueueCommand::Clear => self.discard_pending("queue cleared"),
        }
    }

    fn discard_pending(&mut self, reason: &str) {
        for job in self.pending.drain(..) {
            warn!(
                "{}: discarding transaction '{}': {}",
                self.address,
                job.transaction.name(),
                reason
            );
        }
    }

    async fn run_job(&mut self, job: Job) {
        let Job { transaction, done } = job;
        if let Err(e) = check_ready(self.state.state(), transaction.readiness()) {
            warn!(
                "{}: discarding transaction '{}': {}",
                self.address,
                transaction.name(),
                e
            );
            return;
        }

        let (name, actions, observer) = transaction.into_parts();
        debug!("{}: running transaction '{}'", self.address, name);
        self.observer.send_replace(observer);
        let result = self.run_actions(&name, actions).await;
        self.observer.send_replace(None);

        match &result {
            Ok(()) => debug!("{}: transaction '{}' done", self.address, name),
            Err(e) if e.is_transport_failure() => {
                error!("{}: transaction '{}' failed: {}", self.address, name, e);
                self.state.link_lost(&e.to_string()).await;
                self.drain_commands();
                self.discard_pending("transport failure");
            }
            Err(e) if e.is_recoverable() => {
                debug!("{}: transaction '{}' stopped: {}", self.address, name, e);
            }
            Err(e) => warn!("{}: transaction '{}' failed: {}", self.address, name, e),
        }

        if let Some(done) = done {
            let _ = done.send(result);
        }
    }

    async fn run_actions(&mut self, name: &str, actions: Vec<Action>) -> Result<()> {
        let mut remaining: VecDeque<Action> = actions.into();
        let mut last_read: Option<Bytes> = None;
        let mut state_rx = self.state.subscribe();

        while let Some(action) = remaining.pop_front() {
            if !self.state.state().is_link_up() {
                return Err(WearlinkError::Disconnected);
            }

            match action {
                Action::Write {
                    characteristic,
                    payload,
                } => {
                    debug!(
                        "{}: [{}] write {}: {:02X?}",
                        self.address,
                        name,
                        characteristic,
                        payload.as_ref()
                    );
                    with_timeout(
                        self.timeouts.write_timeout_ms,
                        self.transport.write(characteristic, &payload),
                    )
                    .await?;
                }
                Action::Read { characteristic } => {
                    let value = with_timeout(
                        self.timeouts.read_timeout_ms,
                        self.transport.read(characteristic),
                    )
                    .await?;
                    debug!(
                        "{}: [{}] read {}: {:02X?}",
                        self.address,
                        name,
                        characteristic,
                        value.as_ref()
                    );
                    if let Some(sink) = &self.read_sink {
                        let _ = sink.send(TransportEvent::ReadValue {
                            characteristic,
                            value: value.clone(),
                        });
                    }
                    last_read = Some(value);
                }
                Action::SetNotify {
                    characteristic,
                    enabled,
                } => {
                    debug!(
                        "{}: [{}] notify {}: {}",
                        self.address, name, characteristic, enabled
                    );
                    with_timeout(
                        self.timeouts.notify_timeout_ms,
                        self.transport.set_notify(characteristic, enabled),
                    )
                    .await?;
                }
                Action::Wait(duration) => {
                    tokio::select! {
                        () = tokio::time::sleep(duration) => {}
                        () = link_down(&mut state_rx) => return Err(WearlinkError::Disconnected),
                    }
                }
                Action::Callback(callback) => {
                    let context = CallbackContext {
                        address: &self.address,
                        last_read: last_read.as_ref(),
                    };
                    match callback(&context) {
                        Continuation::Continue => {}
                        Continuation::Then(actions) => {
                            for action in actions.into_iter().rev() {
                                remaining.push_front(action);
                            }
                        }
                        Continuation::Abort => {
                            debug!(
                                "{}: [{}] callback skipped {} remaining action(s)",
                                self.address,
                                name,
                                remaining.len()
                            );
                            return Ok(());
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

pub(crate) async fn with_timeout<T>(timeout_ms: u64, operation: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout(Duration::from_millis(timeout_ms), operation)
        .await
        .map_err(|_| WearlinkError::Timeout { timeout_ms })?
}

async fn link_down(state_rx: &mut watch::Receiver<ConnectionState>) {
    loop {
        if !state_rx.borrow_and_update().is_link_up() {
            return;
        }
        if state_rx.changed().await.is_err() {
            futures::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mock::MockTransport, types::ReconnectConfig};
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    };
    use uuid::Uuid;

    const CHAR: Uuid = Uuid::from_u128(0xABCD);

    struct Harness {
        transport: Arc<MockTransport>,
        state: Arc<ConnectionStateMachine>,
        queue: TransactionQueue,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    }

    async fn harness(timeouts: TimeoutConfig) -> Harness {
        let transport = Arc::new(MockTransport::new());
        let (reconnect_tx, _reconnect_rx) = mpsc::unbounded_channel();
        let state = Arc::new(ConnectionStateMachine::new(
            "AA:BB:CC:DD:EE:FF",
            ReconnectConfig::default(),
            reconnect_tx,
        ));
        state.begin_connect(true).await.unwrap();
        state.link_established().await.unwrap();
        state.initialized().await.unwrap();

        let (events_tx, events) = mpsc::unbounded_channel();
        let (queue, executor) = channel(
            "AA:BB:CC:DD:EE:FF",
            transport.clone(),
            state.clone(),
            timeouts,
        );
        tokio::spawn(executor.with_read_sink(events_tx).run());
        Harness {
            transport,
            state,
            queue,
            events,
        }
    }

    fn write(name: &str, payloads: &[u8]) -> Transaction {
        payloads
            .iter()
            .fold(Transaction::builder(name), |builder, byte| {
                builder.write(CHAR, vec![*byte])
            })
            .build()
    }

    #[tokio::test]
    async fn test_transactions_do_not_interleave() {
        let h = harness(TimeoutConfig::default()).await;
        let first = Transaction::builder("first")
            .write(CHAR, vec![0xA1])
            .wait(Duration::from_millis(20))
            .write(CHAR, vec![0xA2])
            .build();
        let second = write("second", &[0xB1, 0xB2]);

        let (r1, r2) = tokio::join!(h.queue.execute(first), h.queue.execute(second));
        r1.unwrap();
        r2.unwrap();

        assert_eq!(
            h.transport.writes().await,
            vec![vec![0xA1], vec![0xA2], vec![0xB1], vec![0xB2]]
        );
    }

    #[tokio::test]
    async fn test_callback_appends_and_aborts() {
        let h = harness(TimeoutConfig::default()).await;
        let acked = Arc::new(AtomicBool::new(false));
        let flag = acked.clone();

        let transaction = Transaction::builder("alert")
            .write(CHAR, vec![0x01])
            .callback(|_| Continuation::Then(vec![Action::Write {
                characteristic: CHAR,
                payload: Bytes::from_static(&[0x02]),
            }]))
            .callback(move |_| {
                if flag.load(Ordering::SeqCst) {
                    Continuation::Abort
                } else {
                    Continuation::Continue
                }
            })
            .write(CHAR, vec![0x03])
            .build();

        acked.store(true, Ordering::SeqCst);
        h.queue.execute(transaction).await.unwrap();
        assert_eq!(h.transport.writes().await, vec![vec![0x01], vec![0x02]]);
    }

    #[tokio::test]
    async fn test_write_failure_aborts_and_discards_queued() {
        let h = harness(TimeoutConfig::default()).await;
        h.transport.set_fail_writes(true).await;

        let (r1, r2) = tokio::join!(
            h.queue.execute(write("first", &[0x01, 0x02])),
            h.queue.execute(write("second", &[0x03]))
        );

        assert!(r1.unwrap_err().is_transport_failure());
        assert!(matches!(
            r2.unwrap_err(),
            WearlinkError::TransactionAborted { .. }
        ));
        assert_eq!(h.transport.writes().await, vec![vec![0x01]]);
        assert_eq!(h.state.state(), ConnectionState::WaitingForReconnect);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_transport_failure() {
        let timeouts = TimeoutConfig {
            write_timeout_ms: 50,
            ..TimeoutConfig::default()
        };
        let h = harness(timeouts).await;
        h.transport.set_stall_writes(true).await;

        let error = h.queue.execute(write("stalled", &[0x01])).await.unwrap_err();
        assert!(matches!(error, WearlinkError::Timeout { timeout_ms: 50 }));
        assert_eq!(h.state.state(), ConnectionState::WaitingForReconnect);
    }

    #[tokio::test]
    async fn test_submit_requires_readiness() {
        let h = harness(TimeoutConfig::default()).await;
        h.state.disconnect().await;
        let error = h.queue.submit(write("late", &[0x01])).unwrap_err();
        assert!(matches!(error, WearlinkError::NotReady { .. }));

        assert!(check_ready(ConnectionState::Initializing, Readiness::Link).is_ok());
        assert!(check_ready(ConnectionState::Initializing, Readiness::Initialized).is_err());
    }

    #[tokio::test]
    async fn test_empty_transaction_is_skipped() {
        let h = harness(TimeoutConfig::default()).await;
        h.queue
            .execute(Transaction::builder("nothing").build())
            .await
            .unwrap();
        assert!(h.transport.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_read_value_reaches_callback_and_sink() {
        let mut h = harness(TimeoutConfig::default()).await;
        h.transport.set_read_value(CHAR, vec![0x64]).await;
        let seen = Arc::new(Mutex::new(None));
        let slot = seen.clone();

        let transaction = Transaction::builder("battery")
            .read(CHAR)
            .callback(move |context| {
                *slot.lock().unwrap() = context.last_read.cloned();
                Continuation::Continue
            })
            .build();
        h.queue.execute(transaction).await.unwrap();

        assert_eq!(
            seen.lock().unwrap().as_deref(),
            Some(&[0x64u8][..])
        );
        assert_eq!(
            h.events.recv().await,
            Some(TransportEvent::ReadValue {
                characteristic: CHAR,
                value: Bytes::from_static(&[0x64])
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_insert_jumps_the_queue() {
        let h = harness(TimeoutConfig::default()).await;
        let slow = Transaction::builder("slow")
            .write(CHAR, vec![0x01])
            .wait(Duration::from_secs(1))
            .build();
        let slow_done = {
            let queue = h.queue.clone();
            tokio::spawn(async move { queue.execute(slow).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        h.queue.submit(write("normal", &[0x02])).unwrap();
        h.queue.insert(write("urgent", &[0x03])).unwrap();
        slow_done.await.unwrap().unwrap();
        h.queue.execute(write("last", &[0x04])).await.unwrap();

        assert_eq!(
            h.transport.writes().await,
            vec![vec![0x01], vec![0x03], vec![0x02], vec![0x04]]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_aborts_in_flight_and_discards_pending() {
        let h = harness(TimeoutConfig::default()).await;
        let slow = Transaction::builder("slow")
            .write(CHAR, vec![0x01])
            .wait(Duration::from_secs(5))
            .write(CHAR, vec![0x02])
            .build();
        let queue = h.queue.clone();
        let slow_done = tokio::spawn(async move { queue.execute(slow).await });
        let queue = h.queue.clone();
        let next_done = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            queue.execute(write("next", &[0x03])).await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        h.state.link_lost("peer closed").await;

        assert!(matches!(
            slow_done.await.unwrap(),
            Err(WearlinkError::Disconnected)
        ));
        assert!(matches!(
            next_done.await.unwrap(),
            Err(WearlinkError::TransactionAborted { .. })
        ));
        assert_eq!(h.transport.writes().await, vec![vec![0x01]]);
    }
}
