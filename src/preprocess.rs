//! Time-series preparation for anomaly detection.
//!
//! Turns a flow-record [`Dataset`] into a regular [`Series`]: Unix-second
//! timestamps are floored to a [`Frequency`], values are averaged per
//! bucket, the range is re-indexed so every bucket exists, and gaps are
//! linearly interpolated.

use anyhow::{bail, Result};
use chrono::{DateTime, Datelike, NaiveDateTime, Timelike};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::dataset::{parse_number, Dataset};

/// Display/serialization format for bucket timestamps.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrequencyUnit {
    Second,
    Minute,
    Hour,
    Day,
}

/// A fixed resampling interval such as `1min` or `30s`.
///
/// Accepts pandas-style offset aliases: `s`/`S`, `min`/`T`, `h`/`H`,
/// `d`/`D`, with an optional positive multiplier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frequency {
    pub count: u32,
    pub unit: FrequencyUnit,
}

impl Frequency {
    pub fn minutes(count: u32) -> Self {
        Self {
            count,
            unit: FrequencyUnit::Minute,
        }
    }

    /// Interval length in seconds.
    pub fn seconds(&self) -> i64 {
        let unit = match self.unit {
            FrequencyUnit::Second => 1,
            FrequencyUnit::Minute => 60,
            FrequencyUnit::Hour => 3_600,
            FrequencyUnit::Day => 86_400,
        };
        unit * self.count as i64
    }

    /// Floors a Unix timestamp (seconds) to the start of its bucket.
    pub fn floor(&self, ts: i64) -> i64 {
        ts.div_euclid(self.seconds()) * self.seconds()
    }

    /// Alias understood by the hosted anomaly API.
    pub fn api_alias(&self) -> String {
        let unit = match self.unit {
            FrequencyUnit::Second => "s",
            FrequencyUnit::Minute => "min",
            FrequencyUnit::Hour => "h",
            FrequencyUnit::Day => "D",
        };
        if self.count == 1 {
            unit.to_string()
        } else {
            format!("{}{}", self.count, unit)
        }
    }
}

impl FromStr for Frequency {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
        let (digits, unit) = s.split_at(split);

        let count = if digits.is_empty() {
            1
        } else {
            digits.parse::<u32>()?
        };
        if count == 0 {
            bail!("frequency multiplier must be > 0");
        }

        let unit = match unit {
            "s" | "S" | "sec" => FrequencyUnit::Second,
            "min" | "T" => FrequencyUnit::Minute,
            "h" | "H" => FrequencyUnit::Hour,
            "d" | "D" => FrequencyUnit::Day,
            other => bail!("unsupported frequency unit '{}'", other),
        };

        Ok(Self { count, unit })
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unit = match self.unit {
            FrequencyUnit::Second => "s",
            FrequencyUnit::Minute => "min",
            FrequencyUnit::Hour => "h",
            FrequencyUnit::Day => "d",
        };
        write!(f, "{}{}", self.count, unit)
    }
}

/// One bucket of the regular series.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesPoint {
    #[serde(serialize_with = "serialize_ds")]
    pub ds: NaiveDateTime,
    pub y: Option<f64>,
}

pub fn serialize_ds<S: Serializer>(ds: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&ds.format(TIMESTAMP_FORMAT).to_string())
}

/// A regularly spaced time series.
#[derive(Debug, Clone)]
pub struct Series {
    pub freq: Frequency,
    pub points: Vec<SeriesPoint>,
}

/// First/last bucket and counts, as reported to API clients.
#[derive(Debug, Clone, Serialize)]
pub struct TimeRange {
    pub start: String,
    pub end: String,
    pub total_points: usize,
    pub missing_values: usize,
}

impl Series {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Number of buckets still lacking a value.
    pub fn missing(&self) -> usize {
        self.points.iter().filter(|p| p.y.is_none()).count()
    }

    /// Drops buckets without a value.
    pub fn dropna(&self) -> Series {
        Series {
            freq: self.freq,
            points: self.points.iter().filter(|p| p.y.is_some()).cloned().collect(),
        }
    }

    pub fn head(&self, n: usize) -> &[SeriesPoint] {
        &self.points[..n.min(self.points.len())]
    }

    pub fn time_range(&self) -> Option<TimeRange> {
        let first = self.points.first()?;
        let last = self.points.last()?;
        Some(TimeRange {
            start: first.ds.format(TIMESTAMP_FORMAT).to_string(),
            end: last.ds.format(TIMESTAMP_FORMAT).to_string(),
            total_points: self.len(),
            missing_values: self.missing(),
        })
    }
}

/// Largest regular grid [`resample`] will build.
pub const MAX_GRID_POINTS: usize = 5_000_000;

// 0001-01-01 .. 9999-12-31, well inside chrono's range
const MIN_TIMESTAMP: i64 = -62_135_596_800;
const MAX_TIMESTAMP: i64 = 253_402_300_799;

/// Resamples `value_col` over `timestamp_col` (Unix seconds) at `freq`.
///
/// Rows whose timestamp does not parse are skipped. Buckets are averaged
/// over their parsable values, re-indexed across `[min, max]`, and gaps
/// are filled by [`interpolate_linear`].
///
/// Timestamps outside years 1..=9999 and grids over [`MAX_GRID_POINTS`]
/// buckets are rejected before anything is allocated.
pub fn resample(
    dataset: &Dataset,
    timestamp_col: &str,
    value_col: &str,
    freq: Frequency,
) -> Result<Series> {
    if dataset.is_empty() {
        bail!("dataset is empty");
    }

    let ts_idx = dataset.column_index(timestamp_col)?;
    let value_idx = dataset.column_index(value_col)?;

    // bucket start -> (sum, count)
    let mut buckets: BTreeMap<i64, (f64, usize)> = BTreeMap::new();
    for row in &dataset.rows {
        let Some(ts) = parse_number(&row[ts_idx]) else {
            continue;
        };
        let secs = ts.floor();
        if secs < MIN_TIMESTAMP as f64 || secs > MAX_TIMESTAMP as f64 {
            bail!("invalid timestamp {} in column '{}'", row[ts_idx].trim(), timestamp_col);
        }
        let entry = buckets.entry(freq.floor(secs as i64)).or_insert((0.0, 0));
        if let Some(v) = parse_number(&row[value_idx]) {
            entry.0 += v;
            entry.1 += 1;
        }
    }

    let (Some(&start), Some(&end)) = (buckets.keys().next(), buckets.keys().next_back()) else {
        bail!("no parsable timestamps in column '{}'", timestamp_col);
    };

    let step = freq.seconds();
    let buckets_needed = end
        .checked_sub(start)
        .map(|span| span / step + 1)
        .filter(|&n| n <= MAX_GRID_POINTS as i64)
        .ok_or_else(|| {
            anyhow::anyhow!(
                "invalid time range for {} resampling: more than {} buckets between {} and {}",
                freq,
                MAX_GRID_POINTS,
                start,
                end
            )
        })?;
    let mut points = Vec::with_capacity(buckets_needed as usize);
    let mut ts = start;
    while ts <= end {
        let y = buckets
            .get(&ts)
            .filter(|(_, count)| *count > 0)
            .map(|(sum, count)| sum / *count as f64);
        let ds = DateTime::from_timestamp(ts, 0)
            .ok_or_else(|| anyhow::anyhow!("timestamp out of range: {}", ts))?
            .naive_utc();
        points.push(SeriesPoint { ds, y });
        ts += step;
    }

    let mut values: Vec<Option<f64>> = points.iter().map(|p| p.y).collect();
    interpolate_linear(&mut values);
    for (point, value) in points.iter_mut().zip(values) {
        point.y = value;
    }

    Ok(Series { freq, points })
}

/// Fills `None` gaps in place.
///
/// Interior gaps are interpolated linearly by position between the
/// surrounding values; trailing gaps take the last value; leading gaps
/// stay empty.
pub fn interpolate_linear(values: &mut [Option<f64>]) {
    let mut prev: Option<(usize, f64)> = None;
    for i in 0..values.len() {
        let Some(v) = values[i] else {
            continue;
        };
        if let Some((pi, pv)) = prev {
            let span = (i - pi) as f64;
            for (offset, slot) in values[pi + 1..i].iter_mut().enumerate() {
                let t = (offset + 1) as f64 / span;
                *slot = Some(pv + (v - pv) * t);
            }
        }
        prev = Some((i, v));
    }

    if let Some((pi, pv)) = prev {
        for slot in values[pi + 1..].iter_mut() {
            *slot = Some(pv);
        }
    }
}

/// An exogenous regressor column derived from bucket timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureColumn {
    pub name: String,
    pub values: Vec<f64>,
}

/// Builds calendar regressors (`hour`, `day` of month) for each point.
///
/// With `one_hot`, every distinct value present becomes its own 0/1
/// column (`hour_3`, `day_17`, ...), ordered by feature then value.
pub fn date_features(series: &Series, names: &[String], one_hot: bool) -> Result<Vec<FeatureColumn>> {
    let mut columns = Vec::new();
    for name in names {
        let raw: Vec<u32> = match name.as_str() {
            "hour" => series.points.iter().map(|p| p.ds.hour()).collect(),
            "day" => series.points.iter().map(|p| p.ds.day()).collect(),
            other => bail!("unknown date feature '{}'", other),
        };

        if one_hot {
            let mut distinct: Vec<u32> = raw.clone();
            distinct.sort_unstable();
            distinct.dedup();
            for value in distinct {
                columns.push(FeatureColumn {
                    name: format!("{}_{}", name, value),
                    values: raw.iter().map(|&r| if r == value { 1.0 } else { 0.0 }).collect(),
                });
            }
        } else {
            columns.push(FeatureColumn {
                name: name.clone(),
                values: raw.iter().map(|&r| r as f64).collect(),
            });
        }
    }
    Ok(columns)
}
