//! Shared HTTP plumbing for the three services.
//!
//! | Service | Router | Default bind |
//! |---------|--------|--------------|
//! | anomaly | [`crate::anomaly_server::router`] | `127.0.0.1:5000` |
//! | ask | [`crate::ask::router`] | `127.0.0.1:8000` |
//! | assistant | [`crate::assistant::router`] | `0.0.0.0:5001` |
//!
//! # Error Contract
//!
//! All error responses share one schema:
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "file_path is required" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404),
//! `payload_too_large` (413, uploads only), `upstream_error` (502),
//! `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so the browser frontend
//! can call the services directly.

use axum::{
    extract::{rejection::JsonRejection, FromRequest, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::generation::{GeminiGenerator, LocalGenerator};
use crate::nixtla::NixtlaClient;

/// Which service `anomalyx serve` starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Anomaly,
    Ask,
    Assistant,
}

/// Builds the requested service from configuration and serves it until
/// the process is terminated.
pub async fn run_server(config: &Config, service: Service) -> anyhow::Result<()> {
    let config = Arc::new(config.clone());

    let (bind_addr, app) = match service {
        Service::Anomaly => {
            let detector = Arc::new(NixtlaClient::new(&config.anomaly)?);
            std::fs::create_dir_all(&config.storage.uploads_dir)?;
            (
                config.server.anomaly_bind.clone(),
                crate::anomaly_server::router(config.clone(), detector),
            )
        }
        Service::Ask => {
            let generator = Arc::new(GeminiGenerator::new(&config.chat)?);
            (
                config.server.ask_bind.clone(),
                crate::ask::router(config.clone(), generator),
            )
        }
        Service::Assistant => {
            let engine = crate::assistant::RagEngine::from_path(&config.assistant.dataset_path)?;
            let generator = Arc::new(LocalGenerator::new(&config.assistant)?);
            tracing::info!(
                rows = engine.len(),
                model = %config.assistant.model,
                "assistant engine ready"
            );
            (
                config.server.assistant_bind.clone(),
                crate::assistant::router(config.clone(), Arc::new(engine), generator),
            )
        }
    };

    println!("{:?} service listening on http://{}", service, bind_addr);
    tracing::info!(?service, bind = %bind_addr, "server starting");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Adds `/health`, CORS, and request tracing to a service router.
pub fn finish_router(router: Router) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    router
        .route("/health", get(handle_health))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Error type that converts into a JSON HTTP response.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(code = %self.code, message = %self.message, "request failed");
        }
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

pub fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

pub fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

/// A call to an external API failed.
pub fn upstream_error(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_GATEWAY,
        code: "upstream_error".to_string(),
        message: message.into(),
    }
}

pub fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

/// Maps a local processing error (CSV parsing, resampling, column lookup)
/// to the most fitting status.
pub fn classify_error(err: anyhow::Error) -> AppError {
    let msg = format!("{:#}", err);

    let io_not_found = err.chain().any(|cause| {
        cause
            .downcast_ref::<std::io::Error>()
            .is_some_and(|e| e.kind() == std::io::ErrorKind::NotFound)
    });

    if io_not_found {
        not_found(msg)
    } else if msg.contains("not found")
        || msg.contains("invalid")
        || msg.contains("unsupported")
        || msg.contains("no parsable")
        || msg.contains("empty")
        || msg.contains("Failed to parse")
    {
        bad_request(msg)
    } else {
        internal(msg)
    }
}

/// `Json` extractor whose rejections follow the error contract above
/// instead of axum's plain-text bodies.
pub struct JsonBody<T>(pub T);

impl<S, T> FromRequest<S> for JsonBody<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(JsonBody(value)),
            Err(rejection) => Err(bad_request(rejection.body_text())),
        }
    }
}

/// Runs CSV parsing, indexing, and file I/O on the blocking pool.
pub async fn blocking<T, F>(f: F) -> Result<T, AppError>
where
    F: FnOnce() -> Result<T, AppError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| internal(format!("worker task failed: {}", e)))?
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_classify_missing_file() {
        let err = std::fs::File::open("/nonexistent/flows.csv")
            .context("Failed to open dataset")
            .unwrap_err();
        assert_eq!(classify_error(err).status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_classify_unknown_column() {
        let err = anyhow::anyhow!("column 'Sload' not found");
        let app_err = classify_error(err);
        assert_eq!(app_err.status, StatusCode::BAD_REQUEST);
        assert_eq!(app_err.code, "bad_request");
    }

    #[tokio::test]
    async fn test_blocking_propagates_result() {
        let value = blocking(|| Ok(21 * 2)).await.unwrap();
        assert_eq!(value, 42);

        let err = blocking::<(), _>(|| Err(bad_request("nope"))).await.unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_classify_other() {
        let err = anyhow::anyhow!("disk on fire");
        assert_eq!(classify_error(err).status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
