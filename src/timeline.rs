use crate::samples::{
    ActivitySample, HeartRateSample, SampleProvider, SampleStore, SleepStageSample, NOT_MEASURED,
};
use chrono::{DateTime, FixedOffset, NaiveDate, Offset, Utc};
use std::collections::{btree_map::Entry, BTreeMap};
use tracing::debug;

const MINUTE: i64 = 60;

/// Round an epoch timestamp down to the containing minute
#[must_use]
pub const fn minute_of(timestamp: i64) -> i64 {
    timestamp.div_euclid(MINUTE) * MINUTE
}

/// One merge request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineQuery<'a> {
    /// Device address
    pub device_id: &'a str,
    /// User written into synthesized rows
    pub user_id: u32,
    /// Window start, epoch seconds, inclusive
    pub from: i64,
    /// Window end, epoch seconds, inclusive
    pub to: i64,
}

/// Raw streams for one window
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimelineInput {
    /// Activity rows in the window, any order
    pub activity: Vec<ActivitySample>,
    /// Last activity row before the window, for cumulative step devices
    pub previous: Option<ActivitySample>,
    /// Heart-rate measurements
    pub heart_rate: Vec<HeartRateSample>,
    /// Sleep stages overlapping the window
    pub sleep: Vec<SleepStageSample>,
}

/// Combines activity, heart-rate and sleep streams into per-minute rows
#[derive(Debug, Clone)]
pub struct TimelineMerger {
    zone: FixedOffset,
    fill_gaps: bool,
}

impl Default for TimelineMerger {
    fn default() -> Self {
        Self::new(Utc.fix())
    }
}

impl TimelineMerger {
    /// Merger that splits calendar days in `zone`
    #[must_use]
    pub const fn new(zone: FixedOffset) -> Self {
        Self {
            zone,
            fill_gaps: false,
        }
    }

    /// Also emit placeholder rows for every missing minute of the window
    #[must_use]
    pub const fn with_gap_filling(mut self) -> Self {
        self.fill_gaps = true;
        self
    }

    /// Load the window from `store` and merge it
    pub async fn query(
        &self,
        store: &dyn SampleStore,
        provider: &dyn SampleProvider,
        query: TimelineQuery<'_>,
    ) -> Vec<ActivitySample> {
        let previous = if provider.reports_cumulative_steps() {
            store.activity_before(query.device_id, query.from).await
        } else {
            None
        };
        let input = TimelineInput {
            activity: store
                .activity_range(query.device_id, query.from, query.to)
                .await,
            previous,
            heart_rate: store
                .heart_rate_range(query.device_id, query.from, query.to)
                .await,
            sleep: store.sleep_range(query.device_id, query.from, query.to).await,
        };
        self.merge(provider, query, input)
    }

    /// Merge already loaded streams
    #[must_use]
    pub fn merge(
        &self,
        provider: &dyn SampleProvider,
        query: TimelineQuery<'_>,
        input: TimelineInput,
    ) -> Vec<ActivitySample> {
        let TimelineInput {
            mut activity,
            previous,
            heart_rate,
            sleep,
        } = input;

        activity.sort_by_key(|sample| sample.timestamp);
        if provider.reports_cumulative_steps() {
            self.convert_cumulative_steps(&mut activity, previous.as_ref());
        }

        let mut by_minute: BTreeMap<i64, ActivitySample> = BTreeMap::new();
        for mut sample in activity {
            sample.timestamp = minute_of(sample.timestamp);
            match by_minute.entry(sample.timestamp) {
                Entry::Vacant(slot) => {
                    slot.insert(sample);
                }
                Entry::Occupied(mut slot) => combine(slot.get_mut(), &sample),
            }
        }

        for measurement in heart_rate
            .iter()
            .filter(|m| (query.from..=query.to).contains(&m.timestamp))
        {
            let minute = minute_of(measurement.timestamp);
            by_minute
                .entry(minute)
                .or_insert_with(|| {
                    ActivitySample::placeholder(query.device_id, query.user_id, minute)
                })
                .heart_rate = Some(measurement.heart_rate);
        }

        for stage in &sleep {
            let Some(intensity) = stage.stage.sleep_intensity() else {
                debug!("Ignoring non-sleep stage {} at {}", stage.stage, stage.timestamp);
                continue;
            };
            let raw_kind = provider.to_raw_kind(stage.stage);
            let first = minute_of(stage.timestamp.max(query.from));
            let last = stage.end().min(query.to.saturating_add(1));
            let mut minute = first;
            while minute < last {
                let row = by_minute.entry(minute).or_insert_with(|| {
                    ActivitySample::placeholder(query.device_id, query.user_id, minute)
                });
                row.raw_kind = raw_kind;
                row.raw_intensity = intensity;
                minute += MINUTE;
            }
        }

        let merged: Vec<ActivitySample> = by_minute.into_values().collect();
        if self.fill_gaps {
            fill_gaps(&merged, query)
        } else {
            merged
        }
    }

    /// Turn running daily totals into per-interval counts, in timestamp order
    ///
    /// Rows without a positive step count are left alone and do not move the
    /// running total. A new calendar day restarts the total.
    pub fn convert_cumulative_steps(
        &self,
        samples: &mut [ActivitySample],
        previous: Option<&ActivitySample>,
    ) {
        let mut last: Option<(i64, u32)> = previous
            .and_then(|sample| sample.steps.map(|steps| (minute_of(sample.timestamp), steps)));

        for sample in samples.iter_mut() {
            let Some(cumulative) = sample.steps.filter(|steps| *steps > 0) else {
                continue;
            };
            let minute = minute_of(sample.timestamp);
            if let Some((last_minute, last_total)) = last {
                if self.same_day(last_minute, minute) {
                    sample.steps = Some(cumulative.saturating_sub(last_total));
                }
            }
            last = Some((minute, cumulative));
        }
    }

    fn same_day(&self, a: i64, b: i64) -> bool {
        match (self.local_date(a), self.local_date(b)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    fn local_date(&self, timestamp: i64) -> Option<NaiveDate> {
        DateTime::<Utc>::from_timestamp(timestamp, 0).map(|utc| utc.with_timezone(&self.zone).date_naive())
    }
}

/// Fold a later row of the same minute into `row`
///
/// Step counts add up, the later row's kind and intensity win and the higher
/// heart rate is kept.
fn combine(row: &mut ActivitySample, later: &ActivitySample) {
    row.steps = match (row.steps, later.steps) {
        (Some(a), Some(b)) => Some(a.saturating_add(b)),
        (a, b) => a.or(b),
    };
    if later.raw_kind != NOT_MEASURED {
        row.raw_kind = later.raw_kind;
        row.raw_intensity = later.raw_intensity;
    }
    row.heart_rate = row.heart_rate.max(later.heart_rate);
}

/// Insert placeholder rows so that every minute of the query window has a row
///
/// `samples` must be minute aligned and sorted.
#[must_use]
pub fn fill_gaps(samples: &[ActivitySample], query: TimelineQuery<'_>) -> Vec<ActivitySample> {
    let mut filled = Vec::with_capacity(samples.len());
    let mut minute = minute_of(query.from);
    if minute < query.from {
        minute += MINUTE;
    }
    for sample in samples {
        while minute < sample.timestamp {
            filled.push(ActivitySample::placeholder(query.device_id, query.user_id, minute));
            minute += MINUTE;
        }
        filled.push(sample.clone());
        minute = minute.max(sample.timestamp + MINUTE);
    }
    while minute <= query.to {
        filled.push(ActivitySample::placeholder(query.device_id, query.user_id, minute));
        minute += MINUTE;
    }
    filled
}
