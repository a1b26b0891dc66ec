use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Arc,
};
use tokio::sync::RwLock;

/// A typed preference value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConfigValue {
    /// Text value
    String(String),
    /// Integer value
    Int(i64),
    /// Boolean flag
    Bool(bool),
    /// Floating point value
    Float(f64),
    /// Set of strings, for multi-select preferences
    StringSet(BTreeSet<String>),
}

impl ConfigValue {
    /// Text value, if this is a string
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    /// Integer value; numeric strings are accepted
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            Self::String(value) => value.trim().parse().ok(),
            _ => None,
        }
    }

    /// Boolean value
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for ConfigValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for ConfigValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for ConfigValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

/// Preference: user a device's recorded activity is attributed to
pub const PREF_USER_ID: &str = "user_id";

/// Preferences of one device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Preferences {
    values: BTreeMap<String, ConfigValue>,
}

impl Preferences {
    /// Empty preferences
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<ConfigValue>) -> Self {
        self.set(key, value);
        self
    }

    /// Value for `key`
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.values.get(key)
    }

    /// Set `key`, returning the previous value
    pub fn set(
        &mut self,
        key: impl Into<String>,
        value: impl Into<ConfigValue>,
    ) -> Option<ConfigValue> {
        self.values.insert(key.into(), value.into())
    }

    /// Remove `key`, returning its value
    pub fn remove(&mut self, key: &str) -> Option<ConfigValue> {
        self.values.remove(key)
    }

    /// Integer value for `key`
    #[must_use]
    pub fn int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(ConfigValue::as_int)
    }

    /// Boolean value for `key`
    #[must_use]
    pub fn bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(ConfigValue::as_bool)
    }

    /// String value for `key`
    #[must_use]
    pub fn string(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(ConfigValue::as_str)
    }

    /// Copy every entry of `other` over this one
    pub fn merge(&mut self, other: &Self) {
        for (key, value) in &other.values {
            self.values.insert(key.clone(), value.clone());
        }
    }

    /// Iterate entries in key order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ConfigValue)> {
        self.values.iter()
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether there are no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<K: Into<String>, V: Into<ConfigValue>> FromIterator<(K, V)> for Preferences {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }
}

/// Per-device preference store shared by all sessions
#[derive(Debug, Clone, Default)]
pub struct ConfigStore {
    devices: Arc<RwLock<HashMap<String, Preferences>>>,
}

impl ConfigStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the preferences of `address`
    pub async fn preferences(&self, address: &str) -> Preferences {
        self.devices
            .read()
            .await
            .get(address)
            .cloned()
            .unwrap_or_default()
    }

    /// Value of one preference
    pub async fn get(&self, address: &str, key: &str) -> Option<ConfigValue> {
        self.devices
            .read()
            .await
            .get(address)
            .and_then(|prefs| prefs.get(key).cloned())
    }

    /// Set one preference, returning the previous value
    pub async fn set(
        &self,
        address: &str,
        key: &str,
        value: impl Into<ConfigValue> + Send,
    ) -> Option<ConfigValue> {
        self.devices
            .write()
            .await
            .entry(address.to_string())
            .or_default()
            .set(key, value)
    }

    /// Put back a value captured by [`ConfigStore::set`]
    pub async fn restore(&self, address: &str, key: &str, previous: Option<ConfigValue>) {
        let mut devices = self.devices.write().await;
        let prefs = devices.entry(address.to_string()).or_default();
        match previous {
            Some(value) => {
                prefs.set(key, value);
            }
            None => {
                prefs.remove(key);
            }
        }
    }

    /// Merge device-reported preferences into the store
    pub async fn merge(&self, address: &str, update: &Preferences) {
        self.devices
            .write()
            .await
            .entry(address.to_string())
            .or_default()
            .merge(update);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_value_accessors() {
        assert_eq!(ConfigValue::from(42i64).as_int(), Some(42));
        assert_eq!(ConfigValue::from(" 7 ").as_int(), Some(7));
        assert_eq!(ConfigValue::from(true).as_bool(), Some(true));
        assert_eq!(ConfigValue::from("x").as_bool(), None);
        assert_eq!(ConfigValue::from("name").as_str(), Some("name"));
    }

    #[test]
    fn test_preferences_merge_overwrites() {
        let mut prefs: Preferences = [("units", "metric"), ("name", "band")].into_iter().collect();
        let update = Preferences::new().with("units", "imperial").with("level", 3i64);
        prefs.merge(&update);

        assert_eq!(prefs.string("units"), Some("imperial"));
        assert_eq!(prefs.string("name"), Some("band"));
        assert_eq!(prefs.int("level"), Some(3));
        assert_eq!(prefs.len(), 3);
    }

    #[tokio::test]
    async fn test_store_set_and_restore() {
        let store = ConfigStore::new();
        let address = "AA:BB:CC:DD:EE:FF";

        assert_eq!(store.set(address, "alert_low", 50i64).await, None);
        let previous = store.set(address, "alert_low", 90i64).await;
        assert_eq!(previous, Some(ConfigValue::Int(50)));

        store.restore(address, "alert_low", previous).await;
        assert_eq!(store.get(address, "alert_low").await, Some(ConfigValue::Int(50)));

        store.restore(address, "alert_low", None).await;
        assert!(store.preferences(address).await.is_empty());
    }

    #[tokio::test]
    async fn test_store_isolates_devices() {
        let store = ConfigStore::new();
        store
            .merge("11:11:11:11:11:11", &Preferences::new().with("k", true))
            .await;
        assert!(store.preferences("22:22:22:22:22:22").await.is_empty());
        assert_eq!(
            store.preferences("11:11:11:11:11:11").await.bool("k"),
            Some(true)
        );
    }
}
