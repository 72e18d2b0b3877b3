//! # AnomalyX
//!
//! Network traffic anomaly detection and retrieval-augmented chat over flow
//! datasets.
//!
//! AnomalyX resamples flow records into a regular time series, sends it to a
//! hosted anomaly-detection API, and renders the results as charts and CSV
//! exports. Two chat services answer questions about flow datasets by
//! retrieving the most similar rows with TF-IDF and prompting a language
//! model (hosted or local) with them. Feature CSVs can also be written to
//! InfluxDB.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────┐   ┌──────────────┐   ┌────────────┐
//! │   CSV    │──▶│ Preprocess │──▶│ Anomaly API  │──▶│ Plots/CSV  │
//! └────┬─────┘   └────────────┘   └──────────────┘   └────────────┘
//!      │
//!      ├────────▶ TF-IDF top-k ──▶ Generator (Gemini / local) ──▶ answer
//!      │
//!      └────────▶ line protocol ──▶ InfluxDB
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! anomalyx preprocess flows.csv
//! anomalyx detect flows.csv --export anomalies.csv --plot anomalies.svg
//! anomalyx retrieve flows.csv "which hosts were scanned?"
//! anomalyx ingest features.csv --dry-run
//! anomalyx serve anomaly
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`dataset`] | In-memory CSV table |
//! | [`preprocess`] | Resampling, interpolation, date features |
//! | [`retry`] | HTTP retry with exponential backoff |
//! | [`nixtla`] | Hosted anomaly-detection client |
//! | [`detector`] | Detection pipeline and analysis |
//! | [`plot`] | SVG charts |
//! | [`influx`] | InfluxDB ingestion |
//! | [`tfidf`] | TF-IDF vectorizer and top-k retrieval |
//! | [`generation`] | Language model backends |
//! | [`server`] | Shared HTTP plumbing |
//! | [`anomaly_server`] | Anomaly detection HTTP service |
//! | [`ask`] | Hosted-model question answering service |
//! | [`assistant`] | Local-model security assistant service |

pub mod anomaly_server;
pub mod ask;
pub mod assistant;
pub mod config;
pub mod dataset;
pub mod detector;
pub mod generation;
pub mod influx;
pub mod nixtla;
pub mod plot;
pub mod preprocess;
pub mod retry;
pub mod server;
pub mod tfidf;
