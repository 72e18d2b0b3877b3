//! CSV → InfluxDB ingestion.
//!
//! Each CSV row becomes one point of the configured measurement. Numeric
//! columns are written as float fields and everything else as string
//! fields. Points are serialized to InfluxDB line protocol and written in
//! batches through the v2 HTTP write API.
//!
//! ```text
//! network_features Dload=1200.5,proto="tcp",srcip="59.166.0.0" 1421927414000000000
//! ```

use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::config::{Config, InfluxConfig};
use crate::dataset::{parse_number, Dataset};
use crate::retry::send_with_retry;

/// A field value in line protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Str(String),
}

/// One line-protocol point (no tags; all columns are fields).
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: String,
    pub fields: Vec<(String, FieldValue)>,
    /// Nanoseconds since the Unix epoch.
    pub timestamp: Option<i64>,
}

impl Point {
    /// Serializes the point as one line of InfluxDB line protocol.
    pub fn to_line(&self) -> String {
        let mut line = escape_measurement(&self.measurement);
        line.push(' ');

        let fields: Vec<String> = self
            .fields
            .iter()
            .map(|(key, value)| {
                let value = match value {
                    FieldValue::Float(v) => format_float(*v),
                    FieldValue::Str(s) => format!("\"{}\"", escape_string_value(s)),
                };
                format!("{}={}", escape_key(key), value)
            })
            .collect();
        line.push_str(&fields.join(","));

        if let Some(ts) = self.timestamp {
            line.push(' ');
            line.push_str(&ts.to_string());
        }
        line
    }
}

fn escape_measurement(s: &str) -> String {
    s.replace('\\', "\\\\").replace(',', "\\,").replace(' ', "\\ ")
}

fn escape_key(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

fn escape_string_value(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Floats always carry a decimal point or exponent so InfluxDB does not
/// read them as integers.
fn format_float(v: f64) -> String {
    let s = v.to_string();
    if s.contains('.') || s.contains('e') || s.contains("inf") || s.contains("NaN") {
        s
    } else {
        format!("{}.0", s)
    }
}

/// Loads a feature CSV, rejecting files without data rows.
pub fn preprocess_features(path: &Path) -> Result<Dataset> {
    let dataset = Dataset::from_path(path)?;
    if dataset.is_empty() {
        bail!("The features dataset is empty.");
    }
    Ok(dataset)
}

/// Converts every row into a [`Point`].
///
/// Column types are decided per column: a column whose non-empty cells
/// all parse as numbers becomes float fields, otherwise string fields.
/// Empty numeric cells are omitted and rows left without fields are
/// skipped.
///
/// Every point gets a distinct timestamp, since points of one measurement
/// without tags that share a time overwrite each other. `timestamp_col`
/// (Unix seconds) supplies the time and is not written as a field; rows
/// without a parsable value, or all rows when the column is absent, are
/// stamped `base_ns + row`. Collisions (several flows in one second) are
/// moved forward one nanosecond at a time.
pub fn build_points(
    dataset: &Dataset,
    measurement: &str,
    timestamp_col: Option<&str>,
    base_ns: i64,
) -> Result<Vec<Point>> {
    let ts_idx = match timestamp_col.filter(|c| !c.is_empty()) {
        Some(column) => {
            let idx = dataset.columns.iter().position(|c| c == column);
            if idx.is_none() {
                tracing::warn!(column, "timestamp column not found; stamping rows from ingestion time");
            }
            idx
        }
        None => None,
    };
    let numeric: Vec<bool> = (0..dataset.columns.len()).map(|c| dataset.is_numeric(c)).collect();

    let mut used: HashSet<i64> = HashSet::with_capacity(dataset.rows.len());
    let mut points = Vec::with_capacity(dataset.rows.len());
    for (row_idx, row) in dataset.rows.iter().enumerate() {
        let mut fields = Vec::with_capacity(row.len());
        for (col, cell) in row.iter().enumerate() {
            if Some(col) == ts_idx {
                continue;
            }
            let key = dataset.columns[col].clone();
            if numeric[col] {
                if let Some(v) = parse_number(cell) {
                    fields.push((key, FieldValue::Float(v)));
                }
            } else {
                fields.push((key, FieldValue::Str(cell.clone())));
            }
        }

        if fields.is_empty() {
            continue;
        }

        let mut timestamp = ts_idx
            .and_then(|idx| parse_number(&row[idx]))
            .and_then(seconds_to_ns)
            .unwrap_or_else(|| base_ns.saturating_add(row_idx as i64));
        while !used.insert(timestamp) {
            timestamp = timestamp.saturating_add(1);
        }

        points.push(Point {
            measurement: measurement.to_string(),
            fields,
            timestamp: Some(timestamp),
        });
    }
    Ok(points)
}

/// Unix seconds to nanoseconds; `None` outside the `i64` nanosecond range.
fn seconds_to_ns(secs: f64) -> Option<i64> {
    let ns = (secs * 1e9).round();
    if ns >= i64::MIN as f64 && ns < i64::MAX as f64 {
        Some(ns as i64)
    } else {
        None
    }
}

/// Writes points to an InfluxDB v2 bucket.
pub struct InfluxWriter {
    client: reqwest::Client,
    url: String,
    org: String,
    bucket: String,
    token: String,
    batch_size: usize,
    max_retries: u32,
}

impl InfluxWriter {
    /// Builds a writer from `[influxdb]` and `INFLUXDB_TOKEN`.
    pub fn new(config: &InfluxConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("influxdb.url (or INFLUXDB_URL) must be set"))?;
        let org = config
            .org
            .clone()
            .ok_or_else(|| anyhow::anyhow!("influxdb.org (or INFLUXDB_ORG) must be set"))?;
        let token = std::env::var("INFLUXDB_TOKEN")
            .map_err(|_| anyhow::anyhow!("INFLUXDB_TOKEN environment variable not set"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            org,
            bucket: config.bucket.clone(),
            token,
            batch_size: config.batch_size,
            max_retries: config.max_retries,
        })
    }

    /// Writes all points, `batch_size` lines per request. Returns the
    /// number of points written.
    pub async fn write(&self, points: &[Point]) -> Result<usize> {
        let endpoint = format!("{}/api/v2/write", self.url);
        let mut written = 0;

        for batch in points.chunks(self.batch_size) {
            let body = batch
                .iter()
                .map(Point::to_line)
                .collect::<Vec<_>>()
                .join("\n");

            send_with_retry("influxdb", self.max_retries, || {
                self.client
                    .post(&endpoint)
                    .query(&[
                        ("org", self.org.as_str()),
                        ("bucket", self.bucket.as_str()),
                        ("precision", "ns"),
                    ])
                    .header("Authorization", format!("Token {}", self.token))
                    .header("Content-Type", "text/plain; charset=utf-8")
                    .body(body.clone())
            })
            .await?;

            written += batch.len();
            tracing::debug!(written, total = points.len(), "batch written");
        }

        Ok(written)
    }
}

/// Reads `path` and writes its rows to InfluxDB, printing a summary.
///
/// With `dry_run`, prints the point count and first line without any
/// network access.
pub async fn run_ingest(config: &Config, path: &Path, dry_run: bool) -> Result<()> {
    let dataset = preprocess_features(path)
        .with_context(|| format!("Error preprocessing features: {}", path.display()))?;
    let base_ns = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let points = build_points(
        &dataset,
        &config.influxdb.measurement,
        config.influxdb.timestamp_col.as_deref(),
        base_ns,
    )?;

    if dry_run {
        println!("ingest {} (dry-run)", path.display());
        println!("  rows: {}", dataset.rows.len());
        println!("  points: {}", points.len());
        if let Some(first) = points.first() {
            println!("  first line: {}", first.to_line());
        }
        return Ok(());
    }

    let writer = InfluxWriter::new(&config.influxdb)?;
    let written = writer
        .write(&points)
        .await
        .with_context(|| "Error ingesting features")?;

    println!("ingest {}", path.display());
    println!("  bucket: {}", config.influxdb.bucket);
    println!("  points written: {}", written);
    println!("ok");
    tracing::info!(points = written, bucket = %config.influxdb.bucket, "ingestion finished");
    Ok(())
}
