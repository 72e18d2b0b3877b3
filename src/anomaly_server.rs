//! HTTP service for network traffic anomaly detection.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/load_dataset` | Upload a CSV (multipart field `file`) |
//! | `POST` | `/preprocess_data` | Resample an uploaded file, report its range |
//! | `POST` | `/detect_anomalies` | Run detection, return anomalous points |
//! | `POST` | `/plot_anomalies` | Detection chart as an SVG attachment |
//! | `POST` | `/advanced_anomaly_analysis` | Hourly chart attachment; also renders the intensity chart |
//! | `GET`  | `/download_anomaly_intensity_plot` | Last intensity chart |
//! | `POST` | `/export_anomalies` | Anomalous points as a CSV attachment |
//! | `GET`  | `/health` | Health check |
//!
//! JSON requests name an uploaded file by `file_path`; only its final
//! component is used and it is looked up in the uploads directory.

use axum::{
    extract::{multipart::Field, multipart::MultipartError, DefaultBodyLimit, Multipart, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Config;
use crate::dataset::Dataset;
use crate::detector::{detect_anomalies, load_series, AnomalyFrame, AnomalyPoint, PipelineParams};
use crate::nixtla::AnomalyService;
use crate::plot;
use crate::preprocess::{Series, SeriesPoint, TimeRange};
use crate::server::{
    bad_request, blocking, classify_error, finish_router, internal, not_found, upstream_error,
    AppError, JsonBody,
};
use tokio::io::AsyncWriteExt;

const ANOMALY_PLOT: &str = "anomalies_plot.svg";
const HOURLY_PLOT: &str = "hourly_anomalies_plot.svg";
const INTENSITY_PLOT: &str = "anomaly_intensity_plot.svg";
const EXPORT_FILE: &str = "network_anomalies.csv";

#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    detector: Arc<dyn AnomalyService>,
}

/// Builds the anomaly service router.
pub fn router(config: Arc<Config>, detector: Arc<dyn AnomalyService>) -> Router {
    let upload_limit = config.storage.max_upload_bytes;
    let state = AppState { config, detector };

    let routes = Router::new()
        .route("/load_dataset", post(handle_load_dataset))
        .route("/preprocess_data", post(handle_preprocess))
        .route("/detect_anomalies", post(handle_detect))
        .route("/plot_anomalies", post(handle_plot))
        .route("/advanced_anomaly_analysis", post(handle_advanced_analysis))
        .route(
            "/download_anomaly_intensity_plot",
            get(handle_download_intensity_plot),
        )
        .route("/export_anomalies", post(handle_export))
        .layer(DefaultBodyLimit::max(upload_limit))
        .with_state(state);

    finish_router(routes)
}

/// Body shared by every JSON endpoint. Unset fields fall back to config.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DetectRequest {
    pub file_path: Option<String>,
    pub timestamp_col: Option<String>,
    pub value_col: Option<String>,
    pub freq: Option<String>,
    pub level: Option<u8>,
}

impl DetectRequest {
    fn params(&self, config: &Config) -> Result<PipelineParams, AppError> {
        PipelineParams::from_config(
            config,
            self.timestamp_col.clone(),
            self.value_col.clone(),
            self.freq.clone(),
            self.level,
        )
        .map_err(|e| bad_request(format!("{:#}", e)))
    }
}

/// Resolves a client-supplied path to a file in the uploads directory.
fn resolve_upload(config: &Config, file_path: Option<&str>) -> Result<PathBuf, AppError> {
    let file_path = file_path
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| bad_request("file_path is required"))?;
    let name = Path::new(file_path)
        .file_name()
        .ok_or_else(|| bad_request(format!("invalid file_path: {}", file_path)))?;
    let path = config.storage.uploads_dir.join(name);
    if !path.is_file() {
        return Err(not_found(format!("dataset not found: {}", name.to_string_lossy())));
    }
    Ok(path)
}

/// Strips directories and unusual characters from an uploaded file name.
pub fn sanitize_file_name(name: &str) -> Option<String> {
    let base = Path::new(name).file_name()?.to_string_lossy().to_string();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

async fn load(state: &AppState, req: DetectRequest) -> Result<(Series, PipelineParams), AppError> {
    let config = state.config.clone();
    blocking(move || {
        let path = resolve_upload(&config, req.file_path.as_deref())?;
        let params = req.params(&config)?;
        let series = load_series(&path, &params).map_err(classify_error)?;
        Ok((series, params))
    })
    .await
}

async fn detect(state: &AppState, req: DetectRequest) -> Result<AnomalyFrame, AppError> {
    let (series, params) = load(state, req).await?;
    if series.dropna().is_empty() {
        return Err(bad_request(format!(
            "column '{}' has no numeric values",
            params.value_col
        )));
    }
    detect_anomalies(state.detector.as_ref(), &series, params.level)
        .await
        .map_err(|e| upstream_error(format!("anomaly detection failed: {:#}", e)))
}

fn attachment(content_type: &'static str, file_name: &str, body: String) -> Response {
    (
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", file_name),
            ),
        ],
        body,
    )
        .into_response()
}

async fn save_plot(state: &AppState, file_name: &str, svg: String) -> Result<String, AppError> {
    let path = state.config.storage.plots_dir.join(file_name);
    blocking(move || {
        plot::save(&path, &svg).map_err(|e| internal(format!("{:#}", e)))?;
        Ok(svg)
    })
    .await
}

/// Keeps the status axum assigns (413 past `storage.max_upload_bytes`).
fn multipart_error(err: MultipartError) -> AppError {
    let status = err.status();
    let code = if status == StatusCode::PAYLOAD_TOO_LARGE {
        "payload_too_large"
    } else {
        "bad_request"
    };
    AppError {
        status,
        code: code.to_string(),
        message: err.body_text(),
    }
}

/// Streams an upload field to `path` chunk by chunk. Returns bytes written.
async fn stream_to_file(field: &mut Field<'_>, path: &Path) -> Result<u64, AppError> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| internal(format!("Failed to create {}: {}", path.display(), e)))?;
    let mut written = 0u64;
    while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
        file.write_all(&chunk)
            .await
            .map_err(|e| internal(e.to_string()))?;
        written += chunk.len() as u64;
    }
    file.flush().await.map_err(|e| internal(e.to_string()))?;
    Ok(written)
}

// ============ POST /load_dataset ============

#[derive(Serialize)]
struct LoadResponse {
    message: String,
    shape: (usize, usize),
    columns: Vec<String>,
    file_path: String,
}

async fn handle_load_dataset(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<LoadResponse>, AppError> {
    while let Some(mut field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some("file") {
            continue;
        }

        let file_name = field
            .file_name()
            .and_then(sanitize_file_name)
            .ok_or_else(|| bad_request("uploaded file has no usable name"))?;

        let uploads = state.config.storage.uploads_dir.clone();
        tokio::fs::create_dir_all(&uploads)
            .await
            .map_err(|e| internal(e.to_string()))?;
        let path = uploads.join(&file_name);

        let bytes = match stream_to_file(&mut field, &path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                let _ = tokio::fs::remove_file(&path).await;
                return Err(err);
            }
        };

        let parse_path = path.clone();
        let dataset = blocking(move || Dataset::from_path(&parse_path).map_err(classify_error)).await?;
        tracing::info!(file = %file_name, bytes, rows = dataset.rows.len(), "dataset uploaded");

        return Ok(Json(LoadResponse {
            message: "Dataset loaded successfully".to_string(),
            shape: dataset.shape(),
            columns: dataset.columns,
            file_path: path.to_string_lossy().to_string(),
        }));
    }

    Err(bad_request("No file uploaded"))
}

// ============ POST /preprocess_data ============

#[derive(Serialize)]
struct PreprocessResponse {
    message: String,
    time_range: Option<TimeRange>,
    head: Vec<SeriesPoint>,
}

async fn handle_preprocess(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<DetectRequest>,
) -> Result<Json<PreprocessResponse>, AppError> {
    let (series, _) = load(&state, req).await?;
    Ok(Json(PreprocessResponse {
        message: "Data processed successfully".to_string(),
        time_range: series.time_range(),
        head: series.head(5).to_vec(),
    }))
}

// ============ POST /detect_anomalies ============

#[derive(Serialize)]
struct DetectResponse {
    message: String,
    anomalies_count: usize,
    anomalies: Vec<AnomalyPoint>,
}

async fn handle_detect(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<DetectRequest>,
) -> Result<Json<DetectResponse>, AppError> {
    let frame = detect(&state, req).await?;
    let anomalies: Vec<AnomalyPoint> = frame.anomalies().into_iter().cloned().collect();
    Ok(Json(DetectResponse {
        message: "Anomalies detected successfully".to_string(),
        anomalies_count: anomalies.len(),
        anomalies,
    }))
}

// ============ POST /plot_anomalies ============

async fn handle_plot(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<DetectRequest>,
) -> Result<Response, AppError> {
    let frame = detect(&state, req).await?;
    let svg = save_plot(&state, ANOMALY_PLOT, plot::anomaly_chart(&frame)).await?;
    Ok(attachment(plot::CONTENT_TYPE, ANOMALY_PLOT, svg))
}

// ============ POST /advanced_anomaly_analysis ============

async fn handle_advanced_analysis(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<DetectRequest>,
) -> Result<Response, AppError> {
    let frame = detect(&state, req).await?;
    let analysis = frame
        .analysis()
        .map_err(|e| bad_request(e.to_string()))?;

    let hourly = save_plot(&state, HOURLY_PLOT, plot::hourly_chart(&analysis)).await?;
    save_plot(&state, INTENSITY_PLOT, plot::intensity_chart(&frame)).await?;

    tracing::info!(
        anomalies = analysis.total,
        hours = analysis.hourly.len(),
        "advanced analysis rendered"
    );
    Ok(attachment(plot::CONTENT_TYPE, HOURLY_PLOT, hourly))
}

// ============ GET /download_anomaly_intensity_plot ============

async fn handle_download_intensity_plot(State(state): State<AppState>) -> Result<Response, AppError> {
    let path = state.config.storage.plots_dir.join(INTENSITY_PLOT);
    let svg = tokio::fs::read_to_string(&path)
        .await
        .map_err(|_| not_found("no intensity plot yet: run /advanced_anomaly_analysis first"))?;
    Ok(attachment(plot::CONTENT_TYPE, INTENSITY_PLOT, svg))
}

// ============ POST /export_anomalies ============

async fn handle_export(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<DetectRequest>,
) -> Result<Response, AppError> {
    let frame = detect(&state, req).await?;
    let mut buf = Vec::new();
    frame
        .export_csv(&mut buf)
        .map_err(|e| internal(format!("{:#}", e)))?;
    let csv = String::from_utf8(buf).map_err(|e| internal(e.to_string()))?;
    Ok(attachment("text/csv", EXPORT_FILE, csv))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("flows.csv").as_deref(), Some("flows.csv"));
        assert_eq!(sanitize_file_name("../../etc/passwd").as_deref(), Some("passwd"));
        assert_eq!(sanitize_file_name("my flows (1).csv").as_deref(), Some("my_flows__1_.csv"));
        assert_eq!(sanitize_file_name(".."), None);
        assert_eq!(sanitize_file_name(".hidden").as_deref(), Some("hidden"));
    }

    #[test]
    fn test_resolve_upload_requires_path() {
        let config = Config::minimal();
        let err = resolve_upload(&config, None).unwrap_err();
        assert_eq!(err.code, "bad_request");
    }

    #[test]
    fn test_resolve_upload_uses_file_name_only() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut config = Config::minimal();
        config.storage.uploads_dir = tmp.path().to_path_buf();
        std::fs::write(tmp.path().join("flows.csv"), "a\n1\n").unwrap();

        let path = resolve_upload(&config, Some("uploads/flows.csv")).unwrap();
        assert_eq!(path, tmp.path().join("flows.csv"));

        let err = resolve_upload(&config, Some("/etc/missing.csv")).unwrap_err();
        assert_eq!(err.code, "not_found");
    }
}
