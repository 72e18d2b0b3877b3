//! Client for the hosted time-series anomaly-detection API.
//!
//! The scoring model itself is opaque; this module only shapes the request
//! (values plus calendar regressors) and turns the response into one
//! boolean flag per input point.
//!
//! # Response handling
//!
//! The API answers with either an explicit `anomaly` array or the fitted
//! `mean` and prediction `intervals` (`lo-{level}` / `hi-{level}`). In the
//! second case a point is anomalous when its value falls outside the
//! interval. Responses shorter than the input (the model consumes a
//! warm-up window) are aligned to the tail of the series.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use crate::config::AnomalyConfig;
use crate::preprocess::{date_features, Series};
use crate::retry::send_with_retry;

/// An external service that flags anomalous points in a series.
#[async_trait]
pub trait AnomalyService: Send + Sync {
    /// Returns one flag per point of `series`, in order.
    ///
    /// `series` must not contain missing values.
    async fn detect(&self, series: &Series, level: u8) -> Result<Vec<bool>>;
}

/// The hosted TimeGPT anomaly endpoint.
pub struct NixtlaClient {
    client: reqwest::Client,
    config: AnomalyConfig,
    api_key: String,
}

impl NixtlaClient {
    /// Builds a client from configuration and `NIXTLA_API_KEY`.
    pub fn new(config: &AnomalyConfig) -> Result<Self> {
        let api_key = std::env::var("NIXTLA_API_KEY")
            .map_err(|_| anyhow::anyhow!("NIXTLA_API_KEY environment variable not set"))?;
        Self::with_key(config, api_key)
    }

    pub fn with_key(config: &AnomalyConfig, api_key: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            config: config.clone(),
            api_key: api_key.into(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/v2/anomaly_detection", self.config.api_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl AnomalyService for NixtlaClient {
    async fn detect(&self, series: &Series, level: u8) -> Result<Vec<bool>> {
        let y = series_values(series)?;
        let body = build_request(series, &self.config, level)?;
        let url = self.endpoint();

        tracing::info!(points = y.len(), level, model = %self.config.model, "calling anomaly API");

        let response = send_with_retry("anomaly", self.config.max_retries, || {
            self.client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&body)
        })
        .await?;

        let json: Value = response.json().await?;
        parse_response(&json, &y, level)
    }
}

fn series_values(series: &Series) -> Result<Vec<f64>> {
    series
        .points
        .iter()
        .map(|p| p.y.ok_or_else(|| anyhow::anyhow!("series contains missing values at {}", p.ds)))
        .collect()
}

/// Builds the JSON request body for `series`.
pub fn build_request(series: &Series, config: &AnomalyConfig, level: u8) -> Result<Value> {
    let y = series_values(series)?;
    let features = date_features(series, &config.date_features, config.date_features_to_one_hot)?;

    let mut body = json!({
        "model": config.model,
        "freq": series.freq.api_alias(),
        "level": [level],
        "clean_ex_first": true,
        "series": {
            "sizes": [y.len()],
            "y": y,
        },
    });

    if !features.is_empty() {
        // row-major: one vector of regressors per point
        let rows: Vec<Vec<f64>> = (0..series.len())
            .map(|i| features.iter().map(|f| f.values[i]).collect())
            .collect();
        let names: Vec<&str> = features.iter().map(|f| f.name.as_str()).collect();
        body["series"]["X"] = json!(rows);
        body["feature_names"] = json!(names);
    }

    Ok(body)
}

/// Converts an API response into per-point flags for the values `y`.
pub fn parse_response(json: &Value, y: &[f64], level: u8) -> Result<Vec<bool>> {
    if let Some(flags) = json.get("anomaly").and_then(Value::as_array) {
        let flags: Vec<bool> = flags
            .iter()
            .map(|f| f.as_bool().unwrap_or(false))
            .collect();
        return align_tail(flags, y.len());
    }

    let intervals = json
        .get("intervals")
        .ok_or_else(|| anyhow::anyhow!("Invalid anomaly response: missing intervals"))?;
    let lo = float_array(intervals, &format!("lo-{}", level))?;
    let hi = float_array(intervals, &format!("hi-{}", level))?;
    if lo.len() != hi.len() {
        bail!("Invalid anomaly response: interval bounds differ in length");
    }
    if lo.len() > y.len() {
        bail!(
            "Invalid anomaly response: {} intervals for {} points",
            lo.len(),
            y.len()
        );
    }

    let offset = y.len() - lo.len();
    let flags = y[offset..]
        .iter()
        .zip(lo.iter().zip(&hi))
        .map(|(value, (l, h))| value < l || value > h)
        .collect();
    align_tail(flags, y.len())
}

fn float_array(obj: &Value, key: &str) -> Result<Vec<f64>> {
    let arr = obj
        .get(key)
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow::anyhow!("Invalid anomaly response: missing '{}'", key))?;
    Ok(arr.iter().map(|v| v.as_f64().unwrap_or(f64::NAN)).collect())
}

/// Left-pads `flags` with `false` so it covers `len` points.
fn align_tail(flags: Vec<bool>, len: usize) -> Result<Vec<bool>> {
    if flags.len() > len {
        bail!(
            "Invalid anomaly response: {} flags for {} points",
            flags.len(),
            len
        );
    }
    let mut out = vec![false; len - flags.len()];
    out.extend(flags);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Dataset;
    use crate::preprocess::{resample, Frequency};

    fn series() -> Series {
        let ds = Dataset::from_reader("Stime,Dload\n0,1\n60,2\n120,50\n180,3\n".as_bytes()).unwrap();
        resample(&ds, "Stime", "Dload", Frequency::minutes(1)).unwrap()
    }

    #[test]
    fn test_build_request_shape() {
        let body = build_request(&series(), &AnomalyConfig::default(), 85).unwrap();
        assert_eq!(body["freq"], "min");
        assert_eq!(body["level"], json!([85]));
        assert_eq!(body["series"]["sizes"], json!([4]));
        assert_eq!(body["series"]["y"], json!([1.0, 2.0, 50.0, 3.0]));
        // hour_0 and day_1 one-hot columns
        assert_eq!(body["feature_names"], json!(["hour_0", "day_1"]));
        assert_eq!(body["series"]["X"][0], json!([1.0, 1.0]));
    }

    #[test]
    fn test_build_request_without_features() {
        let config = AnomalyConfig {
            date_features: vec![],
            ..AnomalyConfig::default()
        };
        let body = build_request(&series(), &config, 90).unwrap();
        assert!(body["series"].get("X").is_none());
        assert!(body.get("feature_names").is_none());
    }

    #[test]
    fn test_parse_explicit_flags() {
        let json = json!({"anomaly": [false, true, false, false]});
        let flags = parse_response(&json, &[1.0, 2.0, 3.0, 4.0], 85).unwrap();
        assert_eq!(flags, vec![false, true, false, false]);
    }

    #[test]
    fn test_parse_intervals_aligned_to_tail() {
        let json = json!({
            "mean": [2.0, 2.5, 3.0],
            "intervals": {"lo-85": [0.0, 0.0, 0.0], "hi-85": [5.0, 5.0, 5.0]}
        });
        let flags = parse_response(&json, &[1.0, 2.0, 50.0, 3.0], 85).unwrap();
        assert_eq!(flags, vec![false, false, true, false]);
    }

    #[test]
    fn test_parse_below_interval() {
        let json = json!({"intervals": {"lo-99": [10.0], "hi-99": [20.0]}});
        let flags = parse_response(&json, &[5.0], 99).unwrap();
        assert_eq!(flags, vec![true]);
    }

    #[test]
    fn test_parse_missing_level_key() {
        let json = json!({"intervals": {"lo-80": [0.0], "hi-80": [1.0]}});
        let err = parse_response(&json, &[0.5], 85).unwrap_err();
        assert!(err.to_string().contains("lo-85"));
    }

    #[test]
    fn test_parse_too_many_flags() {
        let json = json!({"anomaly": [true, true]});
        assert!(parse_response(&json, &[1.0], 85).is_err());
    }
}
