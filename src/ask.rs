//! Question answering over an uploaded CSV with a hosted model.
//!
//! `POST /ask` loads the named upload, keeps its first `chat.max_rows` rows,
//! retrieves the `chat.top_n` rows most similar to the question and asks the
//! [`Generator`] about them.
//!
//! Rows are indexed by their values joined with single spaces, so the
//! question is matched against raw cell text (addresses, protocols, states,
//! attack categories).

use anyhow::Result;
use axum::{extract::State, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::dataset::Dataset;
use crate::generation::Generator;
use crate::server::{
    bad_request, blocking, classify_error, finish_router, not_found, upstream_error, AppError,
    JsonBody,
};
use crate::tfidf::TfidfIndex;

/// Rows retrieved for a question, rendered for the prompt.
#[derive(Debug, Clone)]
pub struct Retrieval {
    /// `(row, score)`, best first.
    pub hits: Vec<(usize, f64)>,
    pub table: String,
}

/// Joins every value of every row with spaces.
pub fn combined_text(dataset: &Dataset) -> Vec<String> {
    dataset.rows.iter().map(|row| row.join(" ")).collect()
}

/// Retrieves the `top_n` rows of `dataset` closest to `question`.
pub fn retrieve(dataset: &Dataset, question: &str, top_n: usize) -> Retrieval {
    let index = TfidfIndex::build(&combined_text(dataset));
    let hits = index.top_k(question, top_n);
    let rows: Vec<usize> = hits.iter().map(|(row, _)| *row).collect();
    Retrieval {
        table: dataset.render_table(&rows),
        hits,
    }
}

pub fn build_prompt(table: &str, question: &str) -> String {
    format!(
        "Your are an network anomaly detecting AI model named AnomalyX Here is some relevant data from the dataset:\n{}\n\nQuestion: {}",
        table, question
    )
}

/// Loads an upload, truncated to `max_rows`.
pub fn load_upload(uploads_dir: &Path, file_name: &str, max_rows: usize) -> Result<Dataset> {
    let name = Path::new(file_name)
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("invalid fileName: {}", file_name))?;
    let dataset = Dataset::from_path(&uploads_dir.join(name))?;
    Ok(dataset.head(max_rows))
}

/// `anomalyx retrieve`: print the rows a question would be answered from.
pub fn run_retrieve(path: &Path, question: &str, top_n: usize, max_rows: usize) -> Result<()> {
    let dataset = Dataset::from_path(path)?.head(max_rows);
    let retrieval = retrieve(&dataset, question, top_n);

    println!("retrieve {} ({} rows)", path.display(), dataset.rows.len());
    for (rank, (row, score)) in retrieval.hits.iter().enumerate() {
        println!("  {}. row {}  score {:.4}", rank + 1, row, score);
    }
    println!();
    println!("{}", retrieval.table);
    Ok(())
}

#[derive(Clone)]
struct AskState {
    config: Arc<Config>,
    generator: Arc<dyn Generator>,
}

pub fn router(config: Arc<Config>, generator: Arc<dyn Generator>) -> Router {
    let state = AskState { config, generator };
    finish_router(
        Router::new()
            .route("/ask", post(handle_ask))
            .with_state(state),
    )
}

#[derive(Debug, Deserialize)]
pub struct AskRequest {
    #[serde(rename = "fileName", default)]
    pub file_name: String,
    #[serde(default)]
    pub question: String,
}

#[derive(Debug, Serialize)]
pub struct AskResponse {
    pub answer: String,
}

async fn handle_ask(
    State(state): State<AskState>,
    JsonBody(req): JsonBody<AskRequest>,
) -> Result<Json<AskResponse>, AppError> {
    if req.file_name.trim().is_empty() || req.question.trim().is_empty() {
        return Err(bad_request("fileName and question are required"));
    }

    // file read, CSV parse and index build run off the async workers
    let config = state.config.clone();
    let file_name = req.file_name.clone();
    let question = req.question.clone();
    let (rows, retrieval) = blocking(move || {
        let dataset = load_upload(&config.storage.uploads_dir, &file_name, config.chat.max_rows)
            .map_err(|e| match classify_error(e) {
                err if err.code == "not_found" => {
                    not_found(format!("File not found: {}", file_name))
                }
                err => err,
            })?;
        let retrieval = retrieve(&dataset, &question, config.chat.top_n);
        Ok((dataset.rows.len(), retrieval))
    })
    .await?;

    tracing::debug!(
        rows,
        hits = retrieval.hits.len(),
        model = state.generator.model_name(),
        "ask"
    );

    let prompt = build_prompt(&retrieval.table, &req.question);
    let answer = state
        .generator
        .generate(&prompt)
        .await
        .map_err(|e| upstream_error(format!("generation failed: {:#}", e)))?;

    Ok(Json(AskResponse { answer }))
}
