use crate::frame;
use bytes::Bytes;
use std::{fmt, sync::Arc, time::Duration};
use uuid::Uuid;

/// What the executor sees when it runs a [`Action::Callback`]
#[derive(Debug)]
pub struct CallbackContext<'a> {
    /// Address of the device the transaction runs against
    pub address: &'a str,
    /// Value returned by the most recent read in this transaction
    pub last_read: Option<&'a Bytes>,
}

/// How a transaction continues after a callback ran
#[derive(Debug)]
pub enum Continuation {
    /// Run the remaining actions
    Continue,
    /// Run these actions next, then the remaining ones
    Then(Vec<Action>),
    /// Skip every remaining action of the transaction
    Abort,
}

/// Side-effecting step run inline by the executor
pub type CallbackFn = Box<dyn FnOnce(&CallbackContext<'_>) -> Continuation + Send>;

/// One primitive operation against a device connection
pub enum Action {
    /// Write a payload to a characteristic
    Write {
        /// Target characteristic
        characteristic: Uuid,
        /// Bytes to write, at most one MTU
        payload: Bytes,
    },
    /// Read a characteristic value
    Read {
        /// Source characteristic
        characteristic: Uuid,
    },
    /// Enable or disable notifications on a characteristic
    SetNotify {
        /// Target characteristic
        characteristic: Uuid,
        /// Subscribe when true
        enabled: bool,
    },
    /// Pause the transaction without blocking other devices
    Wait(Duration),
    /// Run a closure, possibly queueing follow-up actions
    Callback(CallbackFn),
}

impl Action {
    /// Whether running this action talks to the transport
    #[must_use]
    pub const fn touches_transport(&self) -> bool {
        matches!(
            self,
            Self::Write { .. } | Self::Read { .. } | Self::SetNotify { .. }
        )
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Write {
                characteristic,
                payload,
            } => write!(f, "Write({characteristic}, {:02X?})", payload.as_ref()),
            Self::Read { characteristic } => write!(f, "Read({characteristic})"),
            Self::SetNotify {
                characteristic,
                enabled,
            } => write!(f, "SetNotify({characteristic}, {enabled})"),
            Self::Wait(duration) => write!(f, "Wait({duration:?})"),
            Self::Callback(_) => write!(f, "Callback"),
        }
    }
}

/// Receives inbound characteristic values while its transaction is running
pub trait GattObserver: Send + Sync {
    /// Called for every notification or read value during the transaction
    fn on_value(&self, characteristic: Uuid, value: &[u8]);
}

/// Connection state a transaction needs before it may run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Link is up; used by device initialization
    Link,
    /// Device finished initialization
    Initialized,
}

/// Named, ordered batch of actions executed atomically on one connection
pub struct Transaction {
    name: String,
    actions: Vec<Action>,
    observer: Option<Arc<dyn GattObserver>>,
    readiness: Readiness,
}

impl Transaction {
    /// Start building a transaction
    #[must_use]
    pub fn builder(name: impl Into<String>) -> TransactionBuilder {
        TransactionBuilder::new(name)
    }

    /// Transaction name used in logs
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of actions
    #[must_use]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Whether the transaction has no actions
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Required connection state
    #[must_use]
    pub const fn readiness(&self) -> Readiness {
        self.readiness
    }

    /// Actions in submission order
    #[must_use]
    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub(crate) fn into_parts(self) -> (String, Vec<Action>, Option<Arc<dyn GattObserver>>) {
        (self.name, self.actions, self.observer)
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("name", &self.name)
            .field("actions", &self.actions)
            .field("readiness", &self.readiness)
            .field("observed", &self.observer.is_some())
            .finish()
    }
}

/// Builder for [`Transaction`]
pub struct TransactionBuilder {
    name: String,
    actions: Vec<Action>,
    observer: Option<Arc<dyn GattObserver>>,
    readiness: Readiness,
}

impl TransactionBuilder {
    /// Create an empty builder
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            actions: Vec::new(),
            observer: None,
            readiness: Readiness::Initialized,
        }
    }

    /// Append any action
    #[must_use]
    pub fn action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    /// Append a single write
    #[must_use]
    pub fn write(self, characteristic: Uuid, payload: impl Into<Bytes>) -> Self {
        self.action(Action::Write {
            characteristic,
            payload: payload.into(),
        })
    }

    /// Append a write split into `mtu`-sized chunks with `delay` between chunks
    #[must_use]
    pub fn write_chunked(
        mut self,
        characteristic: Uuid,
        payload: &Bytes,
        mtu: usize,
        delay: Duration,
    ) -> Self {
        for (i, part) in frame::chunk(payload, mtu).enumerate() {
            if i > 0 && !delay.is_zero() {
                self.actions.push(Action::Wait(delay));
            }
            self.actions.push(Action::Write {
                characteristic,
                payload: part,
            });
        }
        self
    }

    /// Append a read
    #[must_use]
    pub fn read(self, characteristic: Uuid) -> Self {
        self.action(Action::Read { characteristic })
    }

    /// Append a notification toggle
    #[must_use]
    pub fn notify(self, characteristic: Uuid, enabled: bool) -> Self {
        self.action(Action::SetNotify {
            characteristic,
            enabled,
        })
    }

    /// Append a wait
    #[must_use]
    pub fn wait(self, duration: Duration) -> Self {
        self.action(Action::Wait(duration))
    }

    /// Append a callback
    #[must_use]
    pub fn callback<F>(self, callback: F) -> Self
    where
        F: FnOnce(&CallbackContext<'_>) -> Continuation + Send + 'static,
    {
        self.action(Action::Callback(Box::new(callback)))
    }

    /// Register an observer for inbound values while the transaction runs
    #[must_use]
    pub fn observe(mut self, observer: Arc<dyn GattObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Override the required connection state
    #[must_use]
    pub const fn requires(mut self, readiness: Readiness) -> Self {
        self.readiness = readiness;
        self
    }

    /// Number of actions added so far
    #[must_use]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Whether no actions were added yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Finish the transaction
    #[must_use]
    pub fn build(self) -> Transaction {
        Transaction {
            name: self.name,
            actions: self.actions,
            observer: self.observer,
            readiness: self.readiness,
        }
    }
}
