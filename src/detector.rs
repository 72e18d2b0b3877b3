//! Anomaly detection pipeline and post-detection analysis.
//!
//! ```text
//! CSV ──▶ Dataset ──▶ resample ──▶ Series ──▶ AnomalyService ──▶ AnomalyFrame
//! ```
//!
//! [`AnomalyFrame`] carries the per-bucket flag and provides the summary
//! statistics, hourly distribution, and CSV export used by the CLI and the
//! HTTP service.

use anyhow::{bail, Context, Result};
use chrono::{NaiveDateTime, Timelike};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use crate::config::Config;
use crate::dataset::Dataset;
use crate::nixtla::AnomalyService;
use crate::preprocess::{resample, serialize_ds, Frequency, Series, TIMESTAMP_FORMAT};

/// A resampled bucket with its anomaly flag.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnomalyPoint {
    #[serde(serialize_with = "serialize_ds")]
    pub ds: NaiveDateTime,
    pub y: f64,
    pub anomaly: bool,
}

/// Every point of a series after detection.
#[derive(Debug, Clone, Default)]
pub struct AnomalyFrame {
    pub points: Vec<AnomalyPoint>,
}

/// Overall traffic statistics, as shown in the anomaly chart.
#[derive(Debug, Clone, Serialize)]
pub struct TrafficSummary {
    pub total_points: usize,
    pub anomalies: usize,
    pub anomaly_pct: f64,
    pub mean: f64,
    pub std: f64,
}

/// Statistics over the anomalous points only.
#[derive(Debug, Clone, Serialize)]
pub struct AnomalyAnalysis {
    pub total: usize,
    pub mean: Option<f64>,
    pub max: Option<f64>,
    pub min: Option<f64>,
    /// Anomaly count per hour of day (only hours with anomalies).
    pub hourly: BTreeMap<u32, usize>,
}

/// Column and detection parameters for one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineParams {
    pub timestamp_col: String,
    pub value_col: String,
    pub freq: Frequency,
    pub level: u8,
}

impl PipelineParams {
    /// Parameters from `[preprocess]` and `[anomaly]`, with optional
    /// per-call overrides.
    pub fn from_config(
        config: &Config,
        timestamp_col: Option<String>,
        value_col: Option<String>,
        freq: Option<String>,
        level: Option<u8>,
    ) -> Result<Self> {
        let freq = match freq {
            Some(f) => f.parse()?,
            None => config.frequency()?,
        };
        let level = level.unwrap_or(config.anomaly.level);
        if !(1..=99).contains(&level) {
            bail!("invalid level {}: must be in [1, 99]", level);
        }
        Ok(Self {
            timestamp_col: timestamp_col.unwrap_or_else(|| config.preprocess.timestamp_col.clone()),
            value_col: value_col.unwrap_or_else(|| config.preprocess.value_col.clone()),
            freq,
            level,
        })
    }
}

impl AnomalyFrame {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Only the anomalous points, in time order.
    pub fn anomalies(&self) -> Vec<&AnomalyPoint> {
        self.points.iter().filter(|p| p.anomaly).collect()
    }

    pub fn anomaly_count(&self) -> usize {
        self.points.iter().filter(|p| p.anomaly).count()
    }

    /// Mean and sample standard deviation (ddof = 1) of all values.
    pub fn summary(&self) -> TrafficSummary {
        let values: Vec<f64> = self.points.iter().map(|p| p.y).collect();
        let total_points = values.len();
        let anomalies = self.anomaly_count();
        let mean = mean(&values).unwrap_or(0.0);
        let std = sample_std(&values).unwrap_or(0.0);
        let anomaly_pct = if total_points == 0 {
            0.0
        } else {
            anomalies as f64 / total_points as f64 * 100.0
        };
        TrafficSummary {
            total_points,
            anomalies,
            anomaly_pct,
            mean,
            std,
        }
    }

    /// Statistics and hourly distribution of the anomalous points.
    ///
    /// Fails when the frame holds no points at all, i.e. detection was
    /// never run on real data.
    pub fn analysis(&self) -> Result<AnomalyAnalysis> {
        if self.is_empty() {
            bail!("no detection results: run anomaly detection first");
        }

        let anomalies = self.anomalies();
        let values: Vec<f64> = anomalies.iter().map(|p| p.y).collect();

        let mut hourly = BTreeMap::new();
        for point in &anomalies {
            *hourly.entry(point.ds.hour()).or_insert(0) += 1;
        }

        Ok(AnomalyAnalysis {
            total: anomalies.len(),
            mean: mean(&values),
            max: values.iter().copied().reduce(f64::max),
            min: values.iter().copied().reduce(f64::min),
            hourly,
        })
    }

    /// Writes the anomalous rows as CSV (`ds,y,anomaly`).
    pub fn export_csv<W: Write>(&self, writer: W) -> Result<usize> {
        let mut wtr = csv::Writer::from_writer(writer);
        wtr.write_record(["ds", "y", "anomaly"])?;
        let mut written = 0;
        for point in self.anomalies() {
            wtr.write_record([
                point.ds.format(TIMESTAMP_FORMAT).to_string(),
                point.y.to_string(),
                "True".to_string(),
            ])?;
            written += 1;
        }
        wtr.flush()?;
        Ok(written)
    }
}

/// Runs detection on `series`, dropping buckets that still lack a value.
pub async fn detect_anomalies(
    service: &dyn AnomalyService,
    series: &Series,
    level: u8,
) -> Result<AnomalyFrame> {
    let clean = series.dropna();
    if clean.is_empty() {
        bail!("series has no values to analyse");
    }

    let flags = service.detect(&clean, level).await?;
    if flags.len() != clean.len() {
        bail!(
            "anomaly service returned {} flags for {} points",
            flags.len(),
            clean.len()
        );
    }

    let points = clean
        .points
        .iter()
        .zip(flags)
        .filter_map(|(p, anomaly)| {
            p.y.map(|y| AnomalyPoint {
                ds: p.ds,
                y,
                anomaly,
            })
        })
        .collect();

    let frame = AnomalyFrame { points };
    tracing::info!(
        total = frame.len(),
        anomalies = frame.anomaly_count(),
        "anomaly detection finished"
    );
    Ok(frame)
}

/// Loads and resamples a CSV file.
pub fn load_series(path: &Path, params: &PipelineParams) -> Result<Series> {
    let dataset = Dataset::from_path(path)?;
    tracing::debug!(path = %path.display(), rows = dataset.rows.len(), "dataset loaded");
    resample(&dataset, &params.timestamp_col, &params.value_col, params.freq)
}

/// Load → resample → detect.
pub async fn run_pipeline(
    service: &dyn AnomalyService,
    path: &Path,
    params: &PipelineParams,
) -> Result<AnomalyFrame> {
    let series = load_series(path, params)?;
    detect_anomalies(service, &series, params.level).await
}

/// `anomalyx preprocess`: resample a CSV and print its range and head.
pub fn run_preprocess(path: &Path, params: &PipelineParams) -> Result<()> {
    let series = load_series(path, params)?;

    println!("preprocess {}", path.display());
    println!("  freq: {}", params.freq);
    if let Some(range) = series.time_range() {
        println!("  start: {}", range.start);
        println!("  end: {}", range.end);
        println!("  points: {}", range.total_points);
        println!("  missing: {}", range.missing_values);
    }
    println!();
    println!("ds,y");
    for point in series.head(5) {
        let y = point.y.map(|v| v.to_string()).unwrap_or_default();
        println!("{},{}", point.ds.format(TIMESTAMP_FORMAT), y);
    }
    Ok(())
}

/// `anomalyx detect`: full pipeline with printed analysis, optional CSV
/// export and chart.
pub async fn run_detect(
    service: &dyn AnomalyService,
    path: &Path,
    params: &PipelineParams,
    export: Option<&Path>,
    plot_path: Option<&Path>,
) -> Result<()> {
    let frame = run_pipeline(service, path, params).await?;
    let summary = frame.summary();
    let analysis = frame.analysis()?;

    println!("detect {}", path.display());
    println!("  points: {}", summary.total_points);
    println!(
        "  anomalies: {} ({:.2}%)",
        summary.anomalies, summary.anomaly_pct
    );
    println!("  mean: {:.2}", summary.mean);
    println!("  std: {:.2}", summary.std);
    if let (Some(mean), Some(max), Some(min)) = (analysis.mean, analysis.max, analysis.min) {
        println!("  anomaly mean: {:.2}", mean);
        println!("  anomaly max: {:.2}", max);
        println!("  anomaly min: {:.2}", min);
    }
    if !analysis.hourly.is_empty() {
        println!();
        println!("Anomalies by hour:");
        for (hour, count) in &analysis.hourly {
            println!("  {:02}:00  {}", hour, count);
        }
    }

    if let Some(export) = export {
        let file = std::fs::File::create(export)
            .with_context(|| format!("Failed to create {}", export.display()))?;
        let written = frame.export_csv(file)?;
        println!();
        println!("Exported {} anomalies to {}", written, export.display());
    }

    if let Some(plot_path) = plot_path {
        crate::plot::save(plot_path, &crate::plot::anomaly_chart(&frame))?;
        println!("Chart written to {}", plot_path.display());
    }

    Ok(())
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

fn sample_std(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values)?;
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    Some(var.sqrt())
}
