use crate::{
    codec::codec_for,
    error::{Result, WearlinkError},
    prefs::ConfigStore,
    samples::{MemorySampleStore, SampleStore},
    session::DeviceSession,
    transport::Transport,
    types::{Device, SessionConfig},
};
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::RwLock;
use tracing::info;

/// Every paired device and its session
///
/// Sessions share one preference store and one sample store.
pub struct SessionRegistry {
    config: SessionConfig,
    prefs: ConfigStore,
    samples: Arc<dyn SampleStore>,
    sessions: RwLock<BTreeMap<String, Arc<DeviceSession>>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl SessionRegistry {
    /// Registry with in-memory stores
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        Self::with_stores(config, ConfigStore::new(), Arc::new(MemorySampleStore::new()))
    }

    /// Registry backed by the given stores
    #[must_use]
    pub fn with_stores(
        config: SessionConfig,
        prefs: ConfigStore,
        samples: Arc<dyn SampleStore>,
    ) -> Self {
        Self {
            config,
            prefs,
            samples,
            sessions: RwLock::new(BTreeMap::new()),
        }
    }

    /// Start a session for `device` over `transport`
    ///
    /// The codec is chosen from the device family. The session is not connected.
    ///
    /// # Errors
    ///
    /// Returns [`WearlinkError::InvalidParameters`] if the address is already
    /// registered or the codec rejects it.
    pub async fn add(
        &self,
        device: Device,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<DeviceSession>> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&device.address) {
            return Err(WearlinkError::InvalidParameters(format!(
                "{} is already registered",
                device.address
            )));
        }

        let codec = codec_for(device.family, &device.address)?;
        let address = device.address.clone();
        let session = Arc::new(
            DeviceSession::start(
                device,
                transport,
                codec,
                self.config.clone(),
                self.prefs.clone(),
                self.samples.clone(),
            )
            .await,
        );
        sessions.insert(address.clone(), session.clone());
        info!("Registered {}", address);
        Ok(session)
    }

    /// Session for `address`
    pub async fn get(&self, address: &str) -> Option<Arc<DeviceSession>> {
        self.sessions.read().await.get(address).cloned()
    }

    /// Forget `address`, disconnecting it
    ///
    /// # Errors
    ///
    /// Returns [`WearlinkError::DeviceNotFound`] if nothing is registered under
    /// `address`.
    pub async fn remove(&self, address: &str) -> Result<()> {
        let session = self
            .sessions
            .write()
            .await
            .remove(address)
            .ok_or_else(|| WearlinkError::DeviceNotFound(address.to_string()))?;
        close(session).await;
        info!("Removed {}", address);
        Ok(())
    }

    /// Registered addresses in sorted order
    pub async fn addresses(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    /// Number of registered devices
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether nothing is registered
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Shared preference store
    #[must_use]
    pub const fn prefs(&self) -> &ConfigStore {
        &self.prefs
    }

    /// Shared sample store
    #[must_use]
    pub fn samples(&self) -> Arc<dyn SampleStore> {
        self.samples.clone()
    }

    /// Disconnect and drop every session
    pub async fn shutdown_all(&self) {
        let sessions: Vec<_> = std::mem::take(&mut *self.sessions.write().await)
            .into_values()
            .collect();
        for session in sessions {
            close(session).await;
        }
    }
}

async fn close(session: Arc<DeviceSession>) {
    match Arc::try_unwrap(session) {
        Ok(session) => session.shutdown().await,
        Err(shared) => {
            // Still held elsewhere; tasks stop once the last handle drops
            if let Err(e) = shared.disconnect().await {
                tracing::warn!("{}: disconnect failed: {}", shared.address(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mock::{MockCall, MockTransport},
        types::{ConnectionState, DeviceFamily},
    };
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_add_get_remove() {
        let registry = SessionRegistry::default();
        assert!(registry.is_empty().await);

        let transport = Arc::new(MockTransport::new());
        let session = registry
            .add(Device::new("AA:00:00:00:00:01", DeviceFamily::Earbuds), transport.clone())
            .await
            .unwrap();
        assert_eq!(session.address(), "AA:00:00:00:00:01");
        assert_eq!(session.state(), ConnectionState::NotConnected);
        drop(session);

        registry
            .add(
                Device::new("AA:00:00:00:00:00", DeviceFamily::Headphones),
                Arc::new(MockTransport::new()),
            )
            .await
            .unwrap();
        assert_eq!(
            registry.addresses().await,
            vec!["AA:00:00:00:00:00".to_string(), "AA:00:00:00:00:01".to_string()]
        );

        assert_ok!(registry.remove("AA:00:00:00:00:01").await);
        assert_eq!(registry.len().await, 1);
        assert!(registry.get("AA:00:00:00:00:01").await.is_none());
        assert_eq!(transport.calls().await, vec![MockCall::Disconnect]);
        assert!(matches!(
            registry.remove("AA:00:00:00:00:01").await,
            Err(WearlinkError::DeviceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_and_invalid_addresses_are_rejected() {
        let registry = SessionRegistry::default();
        let device = Device::new("ED:5A:94:CB:98:E4", DeviceFamily::Tag);
        registry
            .add(device.clone(), Arc::new(MockTransport::new()))
            .await
            .unwrap();
        assert_err!(registry.add(device, Arc::new(MockTransport::new())).await.map(drop));
        assert_err!(
            registry
                .add(
                    Device::new("not a mac", DeviceFamily::Tag),
                    Arc::new(MockTransport::new())
                )
                .await
                .map(drop)
        );
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_sessions_share_preferences() {
        let registry = SessionRegistry::default();
        registry
            .prefs()
            .set("AA:00:00:00:00:02", crate::prefs::PREF_USER_ID, 7i64)
            .await;
        let session = registry
            .add(
                Device::new("AA:00:00:00:00:02", DeviceFamily::Band),
                Arc::new(MockTransport::new()),
            )
            .await
            .unwrap();
        session
            .update_preference(crate::codec::band::PREF_UNITS_METRIC, false)
            .await
            .unwrap();
        assert_eq!(
            registry
                .prefs()
                .preferences("AA:00:00:00:00:02")
                .await
                .bool(crate::codec::band::PREF_UNITS_METRIC),
            Some(false)
        );

        registry.shutdown_all().await;
        assert!(registry.is_empty().await);
    }
}
