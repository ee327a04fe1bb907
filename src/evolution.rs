use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};
use thiserror::Error;
use tracing::debug;

use crate::ingest;
use crate::models::{Bucket, Cluster, SessionConfig, TimePoint};

/// Windows shorter than this many whole days are bucketed by hour.
pub const HOURLY_SPAN_LIMIT_DAYS: i64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Hour,
    Day,
}

impl Granularity {
    fn step(self) -> Duration {
        match self {
            Granularity::Hour => Duration::hours(1),
            Granularity::Day => Duration::days(1),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Granularity::Hour => "hour",
            Granularity::Day => "day",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EvolutionError {
    #[error("analysis window ends at {end} before it starts at {start}")]
    InvalidWindow {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    #[error("invalid timestamp {0:?}")]
    InvalidTimestamp(String),
}

/// Inclusive `[start, end]` range an analysis run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalysisWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl AnalysisWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, EvolutionError> {
        if end < start {
            return Err(EvolutionError::InvalidWindow { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn from_config(config: &SessionConfig) -> Result<Self, EvolutionError> {
        let start = ingest::parse_timestamp(&config.start_date)
            .ok_or_else(|| EvolutionError::InvalidTimestamp(config.start_date.clone()))?;
        let end = ingest::parse_timestamp(&config.end_date)
            .ok_or_else(|| EvolutionError::InvalidTimestamp(config.end_date.clone()))?;
        Self::new(start, end)
    }

    pub fn span_days(&self) -> i64 {
        span_days(self.start, self.end)
    }

    pub fn contains(&self, instant: &DateTime<Utc>) -> bool {
        *instant >= self.start && *instant <= self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvolutionSeries {
    pub granularity: Granularity,
    pub buckets: Vec<Bucket>,
    pub assigned: usize,
    pub out_of_range: usize,
    pub unknown_cluster: usize,
}

pub fn span_days(start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    (end - start).num_days()
}

pub fn select_granularity(span_days: i64) -> Granularity {
    if span_days < HOURLY_SPAN_LIMIT_DAYS {
        Granularity::Hour
    } else {
        Granularity::Day
    }
}

/// Start of the hour or day containing `instant`, on the wall clock of `tz`.
pub fn truncate<Tz: TimeZone>(
    instant: &DateTime<Utc>,
    granularity: Granularity,
    tz: &Tz,
) -> NaiveDateTime {
    let local = instant.with_timezone(tz).naive_local();
    let midnight = local.date().and_time(NaiveTime::MIN);
    match granularity {
        Granularity::Hour => midnight + Duration::hours(i64::from(local.hour())),
        Granularity::Day => midnight,
    }
}

/// Every unit boundary from the unit holding `start` through the unit holding `end`.
///
/// Hours that do not exist on the local clock (DST gap) are skipped. A repeated
/// hour after a fall-back shift is a single boundary, so both occurrences share
/// one bucket. Returns an empty sequence when `end < start`.
pub fn bucket_boundaries<Tz: TimeZone>(
    start: &DateTime<Utc>,
    end: &DateTime<Utc>,
    granularity: Granularity,
    tz: &Tz,
) -> Vec<NaiveDateTime> {
    let last = truncate(end, granularity, tz);
    let mut cursor = truncate(start, granularity, tz);
    let mut boundaries = Vec::new();

    while cursor <= last {
        let exists = granularity == Granularity::Day
            || tz.from_local_datetime(&cursor).earliest().is_some();
        if exists {
            boundaries.push(cursor);
        }
        cursor += granularity.step();
    }

    boundaries
}

pub fn format_label(boundary: NaiveDateTime, granularity: Granularity) -> String {
    match granularity {
        Granularity::Hour => boundary.format("%H:%M").to_string(),
        Granularity::Day => boundary.format("%b %d").to_string(),
    }
}

/// Counts points per cluster into the buckets starting at `boundaries`.
///
/// Every bucket carries every cluster of `clusters`, zero when empty. Points
/// whose unit has no bucket, or whose cluster is not listed, are dropped.
pub fn assign_points<Tz: TimeZone>(
    boundaries: &[NaiveDateTime],
    granularity: Granularity,
    clusters: &[Cluster],
    points: &[TimePoint],
    tz: &Tz,
) -> EvolutionSeries {
    let columns: BTreeMap<i64, u64> = clusters.iter().map(|cluster| (cluster.id, 0)).collect();
    let mut buckets: Vec<Bucket> = boundaries
        .iter()
        .map(|boundary| Bucket {
            starts_at: *boundary,
            date: format_label(*boundary, granularity),
            counts: columns.clone(),
        })
        .collect();
    let slots: HashMap<NaiveDateTime, usize> = boundaries
        .iter()
        .enumerate()
        .map(|(slot, boundary)| (*boundary, slot))
        .collect();

    let mut assigned = 0usize;
    let mut out_of_range = 0usize;
    let mut unknown_cluster = 0usize;

    for point in points {
        let key = truncate(&point.created_at, granularity, tz);
        let Some(&slot) = slots.get(&key) else {
            out_of_range += 1;
            continue;
        };
        match buckets[slot].counts.get_mut(&point.cluster_id) {
            Some(count) => {
                *count += 1;
                assigned += 1;
            }
            None => unknown_cluster += 1,
        }
    }

    EvolutionSeries {
        granularity,
        buckets,
        assigned,
        out_of_range,
        unknown_cluster,
    }
}

/// Granularity selection, boundaries and assignment for one analysis window.
///
/// Points outside `[window.start, window.end]` are dropped even when they share
/// a unit with the first or last bucket.
pub fn build_evolution<Tz: TimeZone>(
    window: &AnalysisWindow,
    clusters: &[Cluster],
    points: &[TimePoint],
    tz: &Tz,
) -> EvolutionSeries {
    let granularity = select_granularity(window.span_days());
    let boundaries = bucket_boundaries(&window.start, &window.end, granularity, tz);
    let (inside, outside): (Vec<TimePoint>, Vec<TimePoint>) = points
        .iter()
        .partition(|point| window.contains(&point.created_at));

    let mut series = assign_points(&boundaries, granularity, clusters, &inside, tz);
    series.out_of_range += outside.len();

    debug!(
        granularity = granularity.as_str(),
        buckets = series.buckets.len(),
        assigned = series.assigned,
        out_of_range = series.out_of_range,
        unknown_cluster = series.unknown_cluster,
        "built opinion evolution"
    );

    series
}
