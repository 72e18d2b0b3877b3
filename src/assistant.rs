//! Network security assistant backed by a local language model.
//!
//! [`RagEngine`] loads a flow dataset once, renders each row as a short
//! description and indexes those descriptions with TF-IDF. Each query
//! retrieves the closest rows and hands them to a [`Generator`] as numbered
//! contexts.
//!
//! # Endpoints
//!
//! | Method | Path | Response |
//! |--------|------|----------|
//! | `POST` | `/query` | `{query, response}` |
//! | `POST` | `/chat` | `{response, context}` with the retrieved rows |

use anyhow::{bail, Result};
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::dataset::Dataset;
use crate::generation::Generator;
use crate::server::{bad_request, finish_router, AppError, JsonBody};
use crate::tfidf::TfidfIndex;

const FIELDS: [(&str, &str); 7] = [
    ("Source IP", "srcip"),
    ("Destination IP", "dstip"),
    ("Protocol", "proto"),
    ("State", "state"),
    ("Attack Category", "attack_cat"),
    ("Source Bytes", "sbytes"),
    ("Destination Bytes", "dbytes"),
];

/// Column added to retrieved records alongside the dataset columns.
pub const TEXT_COLUMN: &str = "text_representation";

/// One retrieved row.
#[derive(Debug, Clone)]
pub struct Context {
    pub row: usize,
    pub score: f64,
    pub text: String,
}

pub struct RagEngine {
    dataset: Dataset,
    texts: Vec<String>,
    index: TfidfIndex,
}

impl RagEngine {
    pub fn new(mut dataset: Dataset) -> Self {
        dataset.normalize_columns();
        let texts: Vec<String> = (0..dataset.rows.len())
            .map(|row| text_representation(&dataset, row))
            .collect();
        let index = TfidfIndex::build(&texts);
        Self {
            dataset,
            texts,
            index,
        }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        Ok(Self::new(Dataset::from_path(path)?))
    }

    pub fn len(&self) -> usize {
        self.texts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.texts.is_empty()
    }

    /// The `k` rows closest to `query`, best first.
    pub fn retrieve_context(&self, query: &str, k: usize) -> Result<Vec<Context>> {
        if self.is_empty() {
            bail!("assistant dataset is empty");
        }
        Ok(self
            .index
            .top_k(query, k)
            .into_iter()
            .map(|(row, score)| Context {
                row,
                score,
                text: self.texts[row].clone(),
            })
            .collect())
    }

    /// A retrieved row as a JSON object, including its text representation.
    pub fn record(&self, context: &Context) -> Map<String, Value> {
        let mut record = self.dataset.record(context.row);
        record.insert(TEXT_COLUMN.to_string(), Value::String(context.text.clone()));
        record
    }

    pub fn build_prompt(&self, query: &str, contexts: &[Context]) -> String {
        let context_str = contexts
            .iter()
            .enumerate()
            .map(|(i, c)| format!("Context {}: {}", i + 1, c.text))
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "Network Security Insights Chatbot\n\n\
             Query: {}\n\n\
             Retrieved Contexts:\n{}\n\n\
             Provide a detailed and helpful response based on the retrieved network security information.",
            query, context_str
        )
    }

    /// Asks `generator` about `contexts`. Never fails: a generation error is
    /// returned as the response text.
    pub async fn generate_response(
        &self,
        generator: &dyn Generator,
        query: &str,
        contexts: &[Context],
    ) -> String {
        let prompt = self.build_prompt(query, contexts);
        match generator.generate(&prompt).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(model = generator.model_name(), error = %e, "generation failed");
                format!("Error generating response: {:#}", e)
            }
        }
    }
}

/// `Source IP: .., Destination IP: .., ...` with `Unknown` for absent columns.
pub fn text_representation(dataset: &Dataset, row: usize) -> String {
    FIELDS
        .iter()
        .map(|(label, column)| {
            format!("{}: {}", label, dataset.value(row, column).unwrap_or("Unknown"))
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Clone)]
struct AssistantState {
    config: Arc<Config>,
    engine: Arc<RagEngine>,
    generator: Arc<dyn Generator>,
}

pub fn router(config: Arc<Config>, engine: Arc<RagEngine>, generator: Arc<dyn Generator>) -> Router {
    let state = AssistantState {
        config,
        engine,
        generator,
    };
    finish_router(
        Router::new()
            .route("/query", post(handle_query))
            .route("/chat", post(handle_chat))
            .with_state(state),
    )
}

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    #[serde(default)]
    pub query: String,
}

#[derive(Serialize)]
struct QueryResponse {
    query: String,
    response: String,
}

async fn handle_query(
    State(state): State<AssistantState>,
    JsonBody(req): JsonBody<QueryRequest>,
) -> Result<Json<QueryResponse>, AppError> {
    if req.query.trim().is_empty() {
        return Err(bad_request("Query is required"));
    }

    let contexts = state
        .engine
        .retrieve_context(&req.query, state.config.assistant.top_k)
        .map_err(|e| bad_request(e.to_string()))?;
    let response = state
        .engine
        .generate_response(state.generator.as_ref(), &req.query, &contexts)
        .await;

    Ok(Json(QueryResponse {
        query: req.query,
        response,
    }))
}

#[derive(Serialize)]
struct ChatResponse {
    response: String,
    context: Vec<Map<String, Value>>,
}

async fn handle_chat(
    State(state): State<AssistantState>,
    JsonBody(req): JsonBody<QueryRequest>,
) -> impl IntoResponse {
    let contexts = match state
        .engine
        .retrieve_context(&req.query, state.config.assistant.top_k)
    {
        Ok(contexts) => contexts,
        Err(e) => {
            tracing::error!(error = %e, "chat failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ChatResponse {
                    response: format!("An error occurred: {}", e),
                    context: Vec::new(),
                }),
            );
        }
    };

    let response = state
        .engine
        .generate_response(state.generator.as_ref(), &req.query, &contexts)
        .await;
    let context = contexts.iter().map(|c| state.engine.record(c)).collect();

    (StatusCode::OK, Json(ChatResponse { response, context }))
}
