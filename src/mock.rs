use crate::{
    error::{Result, WearlinkError},
    transport::{EventSink, Transport, TransportEvent},
};
use async_trait::async_trait;
use bytes::Bytes;
use std::{collections::HashMap, time::Duration};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// A transport call recorded by [`MockTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    /// `connect` was called
    Connect,
    /// `disconnect` was called
    Disconnect,
    /// `write` was called
    Write {
        /// Target characteristic
        characteristic: Uuid,
        /// Written bytes
        data: Vec<u8>,
    },
    /// `read` was called
    Read {
        /// Source characteristic
        characteristic: Uuid,
    },
    /// `set_notify` was called
    SetNotify {
        /// Target characteristic
        characteristic: Uuid,
        /// Requested state
        enabled: bool,
    },
}

/// Produces inbound events in reaction to a write
pub type Responder = Box<dyn Fn(Uuid, &[u8]) -> Vec<TransportEvent> + Send + Sync>;

#[derive(Default)]
struct MockState {
    calls: Vec<MockCall>,
    read_values: HashMap<Uuid, Bytes>,
    sink: Option<EventSink>,
    responder: Option<Responder>,
    fail_connect: bool,
    connect_delay: Duration,
    fail_writes: bool,
    stall_writes: bool,
}

/// Scripted in-memory transport for tests and host-side simulation
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    /// Create a transport that accepts every call
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All calls seen so far
    pub async fn calls(&self) -> Vec<MockCall> {
        self.state.lock().await.calls.clone()
    }

    /// Payloads of all writes seen so far
    pub async fn writes(&self) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter_map(|call| match call {
                MockCall::Write { data, .. } => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    /// Value returned by subsequent reads of `characteristic`
    pub async fn set_read_value(&self, characteristic: Uuid, value: impl Into<Bytes>) {
        self.state
            .lock()
            .await
            .read_values
            .insert(characteristic, value.into());
    }

    /// Make `connect` fail
    pub async fn set_fail_connect(&self, fail: bool) {
        self.state.lock().await.fail_connect = fail;
    }

    /// Hold every `connect` for `delay` before it succeeds
    pub async fn set_connect_delay(&self, delay: Duration) {
        self.state.lock().await.connect_delay = delay;
    }

    /// Make every write fail with an I/O error
    pub async fn set_fail_writes(&self, fail: bool) {
        self.state.lock().await.fail_writes = fail;
    }

    /// Make every write hang forever so the caller's timeout fires
    pub async fn set_stall_writes(&self, stall: bool) {
        self.state.lock().await.stall_writes = stall;
    }

    /// Answer writes with scripted inbound events
    pub async fn set_responder(&self, responder: Responder) {
        self.state.lock().await.responder = Some(responder);
    }

    /// Push a notification as if the device sent it
    pub async fn push_notification(&self, characteristic: Uuid, value: impl Into<Bytes>) -> bool {
        self.emit(TransportEvent::Notification {
            characteristic,
            value: value.into(),
        })
        .await
    }

    /// Simulate the radio dropping the link
    pub async fn drop_link(&self, reason: &str) -> bool {
        self.emit(TransportEvent::Disconnected {
            reason: reason.to_string(),
        })
        .await
    }

    async fn emit(&self, event: TransportEvent) -> bool {
        self.state
            .lock()
            .await
            .sink
            .as_ref()
            .is_some_and(|sink| sink.send(event).is_ok())
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn attach(&self, sink: EventSink) {
        self.state.lock().await.sink = Some(sink);
    }

    async fn connect(&self) -> Result<()> {
        let delay = {
            let mut state = self.state.lock().await;
            state.calls.push(MockCall::Connect);
            if state.fail_connect {
                return Err(WearlinkError::ConnectionFailed(
                    "mock connect refused".to_string(),
                ));
            }
            state.connect_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.state.lock().await.calls.push(MockCall::Disconnect);
        Ok(())
    }

    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<()> {
        let stall = {
            let mut state = self.state.lock().await;
            state.calls.push(MockCall::Write {
                characteristic,
                data: data.to_vec(),
            });
            if state.fail_writes {
                return Err(WearlinkError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "mock write failed",
                )));
            }
            if !state.stall_writes {
                if let (Some(responder), Some(sink)) = (&state.responder, &state.sink) {
                    for event in responder(characteristic, data) {
                        debug!("Mock responding with {:?}", event);
                        let _ = sink.send(event);
                    }
                }
            }
            state.stall_writes
        };

        if stall {
            futures::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn read(&self, characteristic: Uuid) -> Result<Bytes> {
        let mut state = self.state.lock().await;
        state.calls.push(MockCall::Read { characteristic });
        state
            .read_values
            .get(&characteristic)
            .cloned()
            .ok_or_else(|| WearlinkError::Protocol(format!("No value for {characteristic}")))
    }

    async fn set_notify(&self, characteristic: Uuid, enabled: bool) -> Result<()> {
        self.state.lock().await.calls.push(MockCall::SetNotify {
            characteristic,
            enabled,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    const CHAR: Uuid = Uuid::from_u128(0x1234);

    #[tokio::test]
    async fn test_mock_records_calls() {
        let transport = MockTransport::new();
        transport.connect().await.unwrap();
        transport.write(CHAR, &[0x01]).await.unwrap();
        transport.set_notify(CHAR, true).await.unwrap();

        assert_eq!(
            transport.calls().await,
            vec![
                MockCall::Connect,
                MockCall::Write {
                    characteristic: CHAR,
                    data: vec![0x01]
                },
                MockCall::SetNotify {
                    characteristic: CHAR,
                    enabled: true
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_mock_responder_and_notifications() {
        let transport = MockTransport::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.attach(tx).await;
        transport
            .set_responder(Box::new(|characteristic, data| {
                vec![TransportEvent::Notification {
                    characteristic,
                    value: Bytes::copy_from_slice(data),
                }]
            }))
            .await;

        transport.write(CHAR, &[0xAA]).await.unwrap();
        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::Notification {
                characteristic: CHAR,
                value: Bytes::from_static(&[0xAA])
            })
        );

        assert!(transport.drop_link("out of range").await);
        assert!(matches!(
            rx.recv().await,
            Some(TransportEvent::Disconnected { .. })
        ));
    }

    #[tokio::test]
    async fn test_mock_failures() {
        let transport = MockTransport::new();
        transport.set_fail_connect(true).await;
        assert!(transport.connect().await.is_err());

        transport.set_fail_writes(true).await;
        let error = transport.write(CHAR, &[0x00]).await.unwrap_err();
        assert!(error.is_transport_failure());

        assert!(transport.read(CHAR).await.is_err());
        transport.set_read_value(CHAR, vec![0x55]).await;
        assert_eq!(transport.read(CHAR).await.unwrap().as_ref(), &[0x55]);
    }
}
