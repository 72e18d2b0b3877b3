use anomalyx::assistant::{self, RagEngine};
use anomalyx::config::Config;
use anomalyx::dataset::Dataset;
use anomalyx::generation::{GeminiGenerator, Generator};
use anomalyx::nixtla::AnomalyService;
use anomalyx::preprocess::Series;
use anomalyx::{anomaly_server, ask};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tower::util::ServiceExt; // for `oneshot`

const FLOWS: &str = "srcip,dstip,proto,state,attack_cat,Stime,Dload\n\
59.166.0.0,149.171.126.6,tcp,FIN,Normal,1421927400,10\n\
175.45.176.1,149.171.126.16,udp,INT,Exploits,1421927460,20\n\
59.166.0.3,149.171.126.9,tcp,CON,Normal,1421927580,40\n";

/// Flags every value at or above the threshold.
struct ThresholdDetector(f64);

#[async_trait]
impl AnomalyService for ThresholdDetector {
    async fn detect(&self, series: &Series, _level: u8) -> anyhow::Result<Vec<bool>> {
        Ok(series
            .points
            .iter()
            .map(|p| p.y.is_some_and(|y| y >= self.0))
            .collect())
    }
}

struct DownDetector;

#[async_trait]
impl AnomalyService for DownDetector {
    async fn detect(&self, _series: &Series, _level: u8) -> anyhow::Result<Vec<bool>> {
        anyhow::bail!("HTTP 503 from anomaly API")
    }
}

/// Answers with the prompt it was given.
struct EchoGenerator;

#[async_trait]
impl Generator for EchoGenerator {
    fn model_name(&self) -> &str {
        "echo"
    }

    async fn generate(&self, prompt: &str) -> anyhow::Result<String> {
        Ok(prompt.to_string())
    }
}

struct DownGenerator;

#[async_trait]
impl Generator for DownGenerator {
    fn model_name(&self) -> &str {
        "down"
    }

    async fn generate(&self, _prompt: &str) -> anyhow::Result<String> {
        anyhow::bail!("connection refused")
    }
}

fn test_config(tmp: &TempDir) -> Arc<Config> {
    let mut config = Config::minimal();
    config.storage.uploads_dir = tmp.path().join("uploads");
    config.storage.plots_dir = tmp.path().join("plots");
    std::fs::create_dir_all(&config.storage.uploads_dir).unwrap();
    std::fs::write(config.storage.uploads_dir.join("flows.csv"), FLOWS).unwrap();
    Arc::new(config)
}

fn anomaly_app(tmp: &TempDir) -> Router {
    anomaly_server::router(test_config(tmp), Arc::new(ThresholdDetector(40.0)))
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(app: Router, request: Request<Body>) -> Response {
    app.oneshot(request).await.unwrap()
}

async fn body_text(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn body_json(response: Response) -> Value {
    serde_json::from_str(&body_text(response).await).unwrap()
}

fn content_type(response: &Response) -> String {
    response.headers()[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .to_string()
}

fn multipart_upload(file_name: &str, content: &str) -> Request<Body> {
    let boundary = "anomalyxboundary";
    let body = format!(
        "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{name}\"\r\n\
         Content-Type: text/csv\r\n\r\n{csv}\r\n--{b}--\r\n",
        b = boundary,
        name = file_name,
        csv = content
    );
    Request::builder()
        .method("POST")
        .uri("/load_dataset")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", boundary),
        )
        .body(Body::from(body))
        .unwrap()
}

/// A `Stime,Dload` CSV of roughly `bytes` bytes.
fn large_flows(bytes: usize) -> String {
    let mut csv = String::from("Stime,Dload\n");
    let mut i = 0u64;
    while csv.len() < bytes {
        csv.push_str(&format!("{},{}.5\n", 1421927400 + i, i % 1000));
        i += 1;
    }
    csv
}

// ============ anomaly service ============

#[tokio::test]
async fn test_health() {
    let tmp = TempDir::new().unwrap();
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let response = send(anomaly_app(&tmp), request).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
}

#[tokio::test]
async fn test_load_dataset_multipart() {
    let tmp = TempDir::new().unwrap();
    let boundary = "anomalyxboundary";
    let body = format!(
        "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"../new flows.csv\"\r\n\
         Content-Type: text/csv\r\n\r\n{csv}\r\n--{b}--\r\n",
        b = boundary,
        csv = FLOWS
    );
    let request = Request::builder()
        .method("POST")
        .uri("/load_dataset")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", boundary),
        )
        .body(Body::from(body))
        .unwrap();

    let response = send(anomaly_app(&tmp), request).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["message"], "Dataset loaded successfully");
    assert_eq!(json["shape"], json!([3, 7]));
    assert_eq!(json["columns"][5], "Stime");
    assert!(json["file_path"].as_str().unwrap().ends_with("new_flows.csv"));
    assert!(tmp.path().join("uploads/new_flows.csv").is_file());
}

#[tokio::test]
async fn test_load_dataset_larger_than_axum_default() {
    let tmp = TempDir::new().unwrap();
    let csv = large_flows(3 * 1024 * 1024);
    let rows = csv.lines().count() - 1;

    let response = send(anomaly_app(&tmp), multipart_upload("big.csv", &csv)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["shape"], json!([rows, 2]));
    assert_eq!(
        std::fs::metadata(tmp.path().join("uploads/big.csv")).unwrap().len(),
        csv.len() as u64
    );
}

#[tokio::test]
async fn test_load_dataset_over_configured_limit() {
    let tmp = TempDir::new().unwrap();
    let mut config = (*test_config(&tmp)).clone();
    config.storage.max_upload_bytes = 1024;
    let app = anomaly_server::router(Arc::new(config), Arc::new(ThresholdDetector(40.0)));

    let response = send(app, multipart_upload("big.csv", &large_flows(8 * 1024))).await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "payload_too_large");
    assert!(!tmp.path().join("uploads/big.csv").exists());
}

#[tokio::test]
async fn test_malformed_json_uses_error_schema() {
    let tmp = TempDir::new().unwrap();
    let request = Request::builder()
        .method("POST")
        .uri("/detect_anomalies")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{\"file_path\": "))
        .unwrap();
    let response = send(anomaly_app(&tmp), request).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "bad_request");
    assert!(json["error"]["message"].is_string());
}

#[tokio::test]
async fn test_missing_json_body_uses_error_schema() {
    let tmp = TempDir::new().unwrap();
    let request = Request::builder()
        .method("POST")
        .uri("/query")
        .body(Body::empty())
        .unwrap();
    let response = send(assistant_app(&tmp, FLOWS, Arc::new(EchoGenerator)), request).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "bad_request");
}

#[tokio::test]
async fn test_far_timestamp_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    std::fs::write(
        config.storage.uploads_dir.join("stray.csv"),
        "Stime,Dload\n0,1\n1e15,2\n",
    )
    .unwrap();
    let app = anomaly_server::router(config, Arc::new(ThresholdDetector(40.0)));

    let response = send(app, post_json("/preprocess_data", json!({"file_path": "stray.csv"}))).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert!(json["error"]["message"]
        .as_str()
        .unwrap()
        .contains("invalid timestamp"));
}

#[tokio::test]
async fn test_load_dataset_without_file() {
    let tmp = TempDir::new().unwrap();
    let boundary = "anomalyxboundary";
    let body = format!(
        "--{b}\r\nContent-Disposition: form-data; name=\"note\"\r\n\r\nhello\r\n--{b}--\r\n",
        b = boundary
    );
    let request = Request::builder()
        .method("POST")
        .uri("/load_dataset")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", boundary),
        )
        .body(Body::from(body))
        .unwrap();

    let response = send(anomaly_app(&tmp), request).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "bad_request");
    assert_eq!(json["error"]["message"], "No file uploaded");
}

#[tokio::test]
async fn test_preprocess_data() {
    let tmp = TempDir::new().unwrap();
    let request = post_json("/preprocess_data", json!({"file_path": "uploads/flows.csv"}));
    let response = send(anomaly_app(&tmp), request).await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["message"], "Data processed successfully");
    assert_eq!(json["time_range"]["start"], "2015-01-22 11:50:00");
    assert_eq!(json["time_range"]["total_points"], 4);
    assert_eq!(json["time_range"]["missing_values"], 0);
    assert_eq!(json["head"].as_array().unwrap().len(), 4);
    assert_eq!(json["head"][2]["y"], 30.0);
}

#[tokio::test]
async fn test_preprocess_requires_file_path() {
    let tmp = TempDir::new().unwrap();
    let response = send(anomaly_app(&tmp), post_json("/preprocess_data", json!({}))).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_preprocess_unknown_column() {
    let tmp = TempDir::new().unwrap();
    let request = post_json(
        "/preprocess_data",
        json!({"file_path": "flows.csv", "value_col": "Sload"}),
    );
    let response = send(anomaly_app(&tmp), request).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert!(json["error"]["message"]
        .as_str()
        .unwrap()
        .contains("column 'Sload' not found"));
}

#[tokio::test]
async fn test_detect_anomalies() {
    let tmp = TempDir::new().unwrap();
    let request = post_json("/detect_anomalies", json!({"file_path": "flows.csv"}));
    let response = send(anomaly_app(&tmp), request).await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["message"], "Anomalies detected successfully");
    assert_eq!(json["anomalies_count"], 1);
    assert_eq!(json["anomalies"][0]["ds"], "2015-01-22 11:53:00");
    assert_eq!(json["anomalies"][0]["y"], 40.0);
    assert_eq!(json["anomalies"][0]["anomaly"], true);
}

#[tokio::test]
async fn test_detect_missing_dataset() {
    let tmp = TempDir::new().unwrap();
    let request = post_json("/detect_anomalies", json!({"file_path": "nope.csv"}));
    let response = send(anomaly_app(&tmp), request).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "not_found");
}

#[tokio::test]
async fn test_detect_invalid_level() {
    let tmp = TempDir::new().unwrap();
    let request = post_json(
        "/detect_anomalies",
        json!({"file_path": "flows.csv", "level": 100}),
    );
    let response = send(anomaly_app(&tmp), request).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_detect_upstream_failure() {
    let tmp = TempDir::new().unwrap();
    let app = anomaly_server::router(test_config(&tmp), Arc::new(DownDetector));
    let request = post_json("/detect_anomalies", json!({"file_path": "flows.csv"}));
    let response = send(app, request).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "upstream_error");
}

#[tokio::test]
async fn test_plot_anomalies() {
    let tmp = TempDir::new().unwrap();
    let request = post_json("/plot_anomalies", json!({"file_path": "flows.csv"}));
    let response = send(anomaly_app(&tmp), request).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(content_type(&response), "image/svg+xml");
    assert!(response.headers()[header::CONTENT_DISPOSITION]
        .to_str()
        .unwrap()
        .contains("anomalies_plot.svg"));

    let svg = body_text(response).await;
    assert!(svg.starts_with("<svg"));
    assert!(svg.contains("Anomalies (1 points)"));
    assert!(tmp.path().join("plots/anomalies_plot.svg").is_file());
}

#[tokio::test]
async fn test_intensity_plot_after_analysis() {
    let tmp = TempDir::new().unwrap();
    let app = anomaly_app(&tmp);

    let download = || {
        Request::builder()
            .uri("/download_anomaly_intensity_plot")
            .body(Body::empty())
            .unwrap()
    };

    let response = send(app.clone(), download()).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let request = post_json("/advanced_anomaly_analysis", json!({"file_path": "flows.csv"}));
    let response = send(app.clone(), request).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(content_type(&response), "image/svg+xml");
    assert!(body_text(response).await.contains("Anomalies by Hour of Day"));

    let response = send(app, download()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_text(response).await.contains("Anomaly Intensity Over Time"));
}

#[tokio::test]
async fn test_export_anomalies() {
    let tmp = TempDir::new().unwrap();
    let request = post_json("/export_anomalies", json!({"file_path": "flows.csv"}));
    let response = send(anomaly_app(&tmp), request).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(content_type(&response), "text/csv");
    assert_eq!(
        body_text(response).await,
        "ds,y,anomaly\n2015-01-22 11:53:00,40,True\n"
    );
}

// ============ ask service ============

fn ask_app(tmp: &TempDir, generator: Arc<dyn Generator>) -> Router {
    ask::router(test_config(tmp), generator)
}

#[tokio::test]
async fn test_ask_prompts_with_retrieved_rows() {
    let tmp = TempDir::new().unwrap();
    let request = post_json(
        "/ask",
        json!({"fileName": "flows.csv", "question": "any udp exploits?"}),
    );
    let response = send(ask_app(&tmp, Arc::new(EchoGenerator)), request).await;
    assert_eq!(response.status(), StatusCode::OK);

    let answer = body_json(response).await["answer"].as_str().unwrap().to_string();
    assert!(answer.contains("named AnomalyX"));
    assert!(answer.contains("175.45.176.1"));
    assert!(answer.ends_with("Question: any udp exploits?"));
}

#[tokio::test]
async fn test_ask_requires_question() {
    let tmp = TempDir::new().unwrap();
    let request = post_json("/ask", json!({"fileName": "flows.csv", "question": " "}));
    let response = send(ask_app(&tmp, Arc::new(EchoGenerator)), request).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_ask_unknown_file() {
    let tmp = TempDir::new().unwrap();
    let request = post_json("/ask", json!({"fileName": "nope.csv", "question": "hi"}));
    let response = send(ask_app(&tmp, Arc::new(EchoGenerator)), request).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_ask_failure_does_not_expose_api_key() {
    let tmp = TempDir::new().unwrap();
    let mut chat = Config::minimal().chat;
    chat.api_url = "http://127.0.0.1:1/v1beta".to_string();
    chat.max_retries = 0;
    let generator = GeminiGenerator::with_key(&chat, "SECRETKEY123").unwrap();

    let request = post_json("/ask", json!({"fileName": "flows.csv", "question": "hi"}));
    let response = send(ask_app(&tmp, Arc::new(generator)), request).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    let body = body_text(response).await;
    assert!(body.contains("upstream_error"));
    assert!(!body.contains("SECRETKEY123"), "key leaked: {}", body);
}

#[tokio::test]
async fn test_ask_generator_failure() {
    let tmp = TempDir::new().unwrap();
    let request = post_json("/ask", json!({"fileName": "flows.csv", "question": "hi"}));
    let response = send(ask_app(&tmp, Arc::new(DownGenerator)), request).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

// ============ assistant service ============

fn assistant_app(tmp: &TempDir, csv: &str, generator: Arc<dyn Generator>) -> Router {
    let engine = RagEngine::new(Dataset::from_reader(csv.as_bytes()).unwrap());
    assistant::router(test_config(tmp), Arc::new(engine), generator)
}

#[tokio::test]
async fn test_query() {
    let tmp = TempDir::new().unwrap();
    let request = post_json("/query", json!({"query": "udp exploits"}));
    let response = send(assistant_app(&tmp, FLOWS, Arc::new(EchoGenerator)), request).await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["query"], "udp exploits");
    let text = json["response"].as_str().unwrap();
    assert!(text.contains("Context 1: Source IP: 175.45.176.1"));
}

#[tokio::test]
async fn test_query_required() {
    let tmp = TempDir::new().unwrap();
    let request = post_json("/query", json!({}));
    let response = send(assistant_app(&tmp, FLOWS, Arc::new(EchoGenerator)), request).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["error"]["message"], "Query is required");
}

#[tokio::test]
async fn test_query_generation_error_is_text() {
    let tmp = TempDir::new().unwrap();
    let request = post_json("/query", json!({"query": "tcp"}));
    let response = send(assistant_app(&tmp, FLOWS, Arc::new(DownGenerator)), request).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["response"], "Error generating response: connection refused");
}

#[tokio::test]
async fn test_chat_returns_context() {
    let tmp = TempDir::new().unwrap();
    let request = post_json("/chat", json!({"query": "udp exploits"}));
    let response = send(assistant_app(&tmp, FLOWS, Arc::new(EchoGenerator)), request).await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    let context = json["context"].as_array().unwrap();
    assert_eq!(context.len(), 3);
    assert_eq!(context[0]["srcip"], "175.45.176.1");
    assert!(context[0]["text_representation"]
        .as_str()
        .unwrap()
        .contains("Attack Category: Exploits"));
}

#[tokio::test]
async fn test_chat_failure() {
    let tmp = TempDir::new().unwrap();
    let request = post_json("/chat", json!({"query": "tcp"}));
    let response = send(assistant_app(&tmp, "srcip\n", Arc::new(EchoGenerator)), request).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let json = body_json(response).await;
    assert!(json["response"]
        .as_str()
        .unwrap()
        .starts_with("An error occurred:"));
    assert_eq!(json["context"], json!([]));
}
