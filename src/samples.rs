use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};
use tokio::sync::RwLock;

/// Raw kind / intensity value meaning "nothing recorded"
pub const NOT_MEASURED: i32 = -1;

/// Canonical activity categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivityKind {
    /// Nothing known
    Unknown,
    /// Generic movement
    Activity,
    /// Light sleep stage
    LightSleep,
    /// Deep sleep stage
    DeepSleep,
    /// REM sleep stage
    RemSleep,
    /// Awake during a sleep session
    Awake,
    /// Device not on the wrist
    NotWorn,
    /// Walking
    Walking,
    /// Running
    Running,
    /// Cycling
    Cycling,
}

impl ActivityKind {
    /// Whether this is one of the sleep stages
    #[must_use]
    pub const fn is_sleep(self) -> bool {
        matches!(
            self,
            Self::LightSleep | Self::DeepSleep | Self::RemSleep | Self::Awake
        )
    }

    /// Fixed intensity marker written into sleep minutes
    #[must_use]
    pub const fn sleep_intensity(self) -> Option<i32> {
        match self {
            Self::Awake => Some(60),
            Self::LightSleep => Some(30),
            Self::RemSleep => Some(20),
            Self::DeepSleep => Some(10),
            _ => None,
        }
    }
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "Unknown",
            Self::Activity => "Activity",
            Self::LightSleep => "Light sleep",
            Self::DeepSleep => "Deep sleep",
            Self::RemSleep => "REM sleep",
            Self::Awake => "Awake",
            Self::NotWorn => "Not worn",
            Self::Walking => "Walking",
            Self::Running => "Running",
            Self::Cycling => "Cycling",
        };
        write!(f, "{name}")
    }
}

/// One per-minute activity row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivitySample {
    /// Epoch seconds, aligned to the minute
    pub timestamp: i64,
    /// Device address
    pub device_id: String,
    /// Owner of the device
    pub user_id: u32,
    /// Device specific activity kind
    pub raw_kind: i32,
    /// Device specific intensity
    pub raw_intensity: i32,
    /// Steps; cumulative or per interval depending on the device
    pub steps: Option<u32>,
    /// Heart rate in beats per minute
    pub heart_rate: Option<u8>,
}

impl ActivitySample {
    /// An empty row that only marks a timestamp
    #[must_use]
    pub fn placeholder(device_id: &str, user_id: u32, timestamp: i64) -> Self {
        Self {
            timestamp,
            device_id: device_id.to_string(),
            user_id,
            raw_kind: NOT_MEASURED,
            raw_intensity: NOT_MEASURED,
            steps: None,
            heart_rate: None,
        }
    }

    /// Builder-style step count
    #[must_use]
    pub const fn with_steps(mut self, steps: u32) -> Self {
        self.steps = Some(steps);
        self
    }

    /// Builder-style raw kind and intensity
    #[must_use]
    pub const fn with_raw(mut self, raw_kind: i32, raw_intensity: i32) -> Self {
        self.raw_kind = raw_kind;
        self.raw_intensity = raw_intensity;
        self
    }
}

/// A heart-rate measurement at second resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartRateSample {
    /// Epoch seconds
    pub timestamp: i64,
    /// Device address
    pub device_id: String,
    /// Beats per minute
    pub heart_rate: u8,
}

/// One contiguous sleep stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SleepStageSample {
    /// Stage start, epoch seconds
    pub timestamp: i64,
    /// Device address
    pub device_id: String,
    /// Stage length in seconds
    pub duration_secs: u32,
    /// Which stage
    pub stage: ActivityKind,
}

impl SleepStageSample {
    /// Stage end, epoch seconds
    #[must_use]
    pub fn end(&self) -> i64 {
        self.timestamp + i64::from(self.duration_secs)
    }
}

/// Summary a device reports at the end of a night
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SleepSummary {
    /// Fell asleep, epoch seconds
    pub start: i64,
    /// Woke up, epoch seconds
    pub end: i64,
    /// Minutes of deep sleep
    pub deep_minutes: u16,
    /// Minutes of light sleep
    pub light_minutes: u16,
    /// Minutes of REM sleep
    pub rem_minutes: u16,
    /// Minutes awake
    pub awake_minutes: u16,
}

/// Maps a device's raw sample fields to canonical values
pub trait SampleProvider: Send + Sync {
    /// Canonical kind for a raw kind
    fn normalize_type(&self, raw_kind: i32) -> ActivityKind;

    /// Raw kind written for a canonical kind
    fn to_raw_kind(&self, kind: ActivityKind) -> i32;

    /// Intensity in `0.0..=1.0`, negative infinity when not measured
    fn normalize_intensity(&self, raw_intensity: i32) -> f32;

    /// Whether `steps` are running daily totals rather than per-interval counts
    fn reports_cumulative_steps(&self) -> bool {
        false
    }
}

/// Persistent per-device sample tables
///
/// Rows are keyed by `(device_id, timestamp)`; an upsert replaces the row with
/// the same key.
#[async_trait]
pub trait SampleStore: Send + Sync {
    /// Activity rows with `from <= timestamp <= to`, ascending
    async fn activity_range(&self, device_id: &str, from: i64, to: i64) -> Vec<ActivitySample>;

    /// Latest activity row with a step count strictly before `timestamp`
    async fn activity_before(&self, device_id: &str, timestamp: i64) -> Option<ActivitySample>;

    /// Heart-rate rows with `from <= timestamp <= to`, ascending
    async fn heart_rate_range(&self, device_id: &str, from: i64, to: i64) -> Vec<HeartRateSample>;

    /// Sleep stages overlapping `[from, to]`, ascending by start
    async fn sleep_range(&self, device_id: &str, from: i64, to: i64) -> Vec<SleepStageSample>;

    /// Insert or replace activity rows
    async fn upsert_activity(&self, samples: Vec<ActivitySample>);

    /// Insert or replace heart-rate rows
    async fn upsert_heart_rate(&self, samples: Vec<HeartRateSample>);

    /// Insert or replace sleep stages
    async fn upsert_sleep(&self, samples: Vec<SleepStageSample>);
}

type Table<T> = RwLock<BTreeMap<(String, i64), T>>;

/// In-memory [`SampleStore`], safe for concurrent writers
#[derive(Debug, Default)]
pub struct MemorySampleStore {
    activity: Table<ActivitySample>,
    heart_rate: Table<HeartRateSample>,
    sleep: Table<SleepStageSample>,
}

impl MemorySampleStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn range_of<T: Clone>(table: &BTreeMap<(String, i64), T>, device_id: &str, from: i64, to: i64) -> Vec<T> {
    if from > to {
        return Vec::new();
    }
    table
        .range((device_id.to_string(), from)..=(device_id.to_string(), to))
        .map(|(_, row)| row.clone())
        .collect()
}

#[async_trait]
impl SampleStore for MemorySampleStore {
    async fn activity_range(&self, device_id: &str, from: i64, to: i64) -> Vec<ActivitySample> {
        range_of(&*self.activity.read().await, device_id, from, to)
    }

    async fn activity_before(&self, device_id: &str, timestamp: i64) -> Option<ActivitySample> {
        self.activity
            .read()
            .await
            .range((device_id.to_string(), i64::MIN)..(device_id.to_string(), timestamp))
            .rev()
            .map(|(_, row)| row)
            .find(|row| row.steps.is_some())
            .cloned()
    }

    async fn heart_rate_range(&self, device_id: &str, from: i64, to: i64) -> Vec<HeartRateSample> {
        range_of(&*self.heart_rate.read().await, device_id, from, to)
    }

    async fn sleep_range(&self, device_id: &str, from: i64, to: i64) -> Vec<SleepStageSample> {
        if from > to {
            return Vec::new();
        }
        self.sleep
            .read()
            .await
            .range((device_id.to_string(), i64::MIN)..=(device_id.to_string(), to))
            .map(|(_, stage)| stage)
            .filter(|stage| stage.end() > from)
            .cloned()
            .collect()
    }

    async fn upsert_activity(&self, samples: Vec<ActivitySample>) {
        let mut table = self.activity.write().await;
        for sample in samples {
            table.insert((sample.device_id.clone(), sample.timestamp), sample);
        }
    }

    async fn upsert_heart_rate(&self, samples: Vec<HeartRateSample>) {
        let mut table = self.heart_rate.write().await;
        for sample in samples {
            table.insert((sample.device_id.clone(), sample.timestamp), sample);
        }
    }

    async fn upsert_sleep(&self, samples: Vec<SleepStageSample>) {
        let mut table = self.sleep.write().await;
        for sample in samples {
            table.insert((sample.device_id.clone(), sample.timestamp), sample);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const DEVICE: &str = "AA:BB:CC:DD:EE:FF";

    #[test]
    fn test_sleep_intensity_markers_are_distinct() {
        let deep = ActivityKind::DeepSleep.sleep_intensity();
        let light = ActivityKind::LightSleep.sleep_intensity();
        let rem = ActivityKind::RemSleep.sleep_intensity();
        assert!(deep.is_some() && light.is_some() && rem.is_some());
        assert_ne!(deep, light);
        assert_ne!(light, rem);
        assert_ne!(deep, rem);
        assert_eq!(ActivityKind::Walking.sleep_intensity(), None);
        assert!(ActivityKind::RemSleep.is_sleep());
        assert!(!ActivityKind::Running.is_sleep());
    }

    #[tokio::test]
    async fn test_store_ranges_are_per_device_and_inclusive() {
        let store = MemorySampleStore::new();
        store
            .upsert_activity(vec![
                ActivitySample::placeholder(DEVICE, 1, 60).with_steps(5),
                ActivitySample::placeholder(DEVICE, 1, 120).with_steps(7),
                ActivitySample::placeholder("11:22:33:44:55:66", 1, 90),
            ])
            .await;

        let rows = store.activity_range(DEVICE, 60, 120).await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].steps, Some(7));
        assert_eq!(
            store.activity_before(DEVICE, 120).await.map(|s| s.timestamp),
            Some(60)
        );
        assert!(store.activity_before(DEVICE, 60).await.is_none());
    }

    #[tokio::test]
    async fn test_activity_before_skips_rows_without_steps() {
        let store = MemorySampleStore::new();
        store
            .upsert_activity(vec![
                ActivitySample::placeholder(DEVICE, 1, 60).with_steps(40),
                ActivitySample::placeholder(DEVICE, 1, 120).with_raw(2, 10),
                ActivitySample::placeholder(DEVICE, 1, 180),
            ])
            .await;

        let before = store.activity_before(DEVICE, 240).await;
        assert_eq!(before.map(|s| (s.timestamp, s.steps)), Some((60, Some(40))));
        assert!(store.activity_before(DEVICE, 60).await.is_none());
    }

    #[tokio::test]
    async fn test_upsert_replaces_same_key() {
        let store = MemorySampleStore::new();
        store
            .upsert_activity(vec![ActivitySample::placeholder(DEVICE, 1, 60).with_steps(5)])
            .await;
        store
            .upsert_activity(vec![ActivitySample::placeholder(DEVICE, 1, 60).with_steps(9)])
            .await;
        let rows = store.activity_range(DEVICE, 0, 1000).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].steps, Some(9));
    }

    #[tokio::test]
    async fn test_sleep_range_includes_overlapping_stage() {
        let store = MemorySampleStore::new();
        store
            .upsert_sleep(vec![SleepStageSample {
                timestamp: 0,
                device_id: DEVICE.to_string(),
                duration_secs: 600,
                stage: ActivityKind::DeepSleep,
            }])
            .await;
        assert_eq!(store.sleep_range(DEVICE, 300, 900).await.len(), 1);
        assert!(store.sleep_range(DEVICE, 600, 900).await.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_writers() {
        let store = Arc::new(MemorySampleStore::new());
        let mut handles = Vec::new();
        for device in 0..4u8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let id = format!("00:00:00:00:00:{device:02X}");
                for minute in 0..50 {
                    store
                        .upsert_heart_rate(vec![HeartRateSample {
                            timestamp: minute * 60,
                            device_id: id.clone(),
                            heart_rate: 60 + device,
                        }])
                        .await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        for device in 0..4u8 {
            let id = format!("00:00:00:00:00:{device:02X}");
            assert_eq!(store.heart_rate_range(&id, 0, i64::MAX).await.len(), 50);
        }
    }
}
