//! TF-IDF vectorization and cosine top-k retrieval.
//!
//! Follows the conventional defaults for TF-IDF over short documents:
//!
//! - lowercase, tokens of two or more word characters (`\b\w\w+\b`)
//! - raw term counts
//! - smoothed idf: `ln((1 + n) / (1 + df)) + 1`
//! - L2-normalized rows
//!
//! Because every vector is unit length, cosine similarity reduces to a dot
//! product over shared terms.

use regex::Regex;
use std::collections::HashMap;

/// Sparse vector: `(term index, weight)` sorted by term index.
pub type SparseVector = Vec<(usize, f64)>;

/// Vocabulary and idf weights learned from a corpus.
#[derive(Debug, Clone)]
pub struct TfidfVectorizer {
    token_pattern: Regex,
    vocabulary: HashMap<String, usize>,
    idf: Vec<f64>,
}

impl TfidfVectorizer {
    /// Learns the vocabulary and idf weights from `docs`.
    pub fn fit<S: AsRef<str>>(docs: &[S]) -> Self {
        let token_pattern = token_regex();
        let mut vocabulary: HashMap<String, usize> = HashMap::new();
        let mut df: Vec<usize> = Vec::new();

        for doc in docs {
            let mut seen: Vec<usize> = tokenize(&token_pattern, doc.as_ref())
                .into_iter()
                .map(|token| {
                    let next = vocabulary.len();
                    let idx = *vocabulary.entry(token).or_insert(next);
                    if idx == df.len() {
                        df.push(0);
                    }
                    idx
                })
                .collect();
            seen.sort_unstable();
            seen.dedup();
            for idx in seen {
                df[idx] += 1;
            }
        }

        let n = docs.len() as f64;
        let idf = df
            .iter()
            .map(|&d| ((1.0 + n) / (1.0 + d as f64)).ln() + 1.0)
            .collect();

        Self {
            token_pattern,
            vocabulary,
            idf,
        }
    }

    pub fn vocabulary_len(&self) -> usize {
        self.vocabulary.len()
    }

    /// Vectorizes `text` with the learned vocabulary. Terms never seen
    /// during [`fit`](Self::fit) are ignored.
    pub fn transform(&self, text: &str) -> SparseVector {
        let mut counts: HashMap<usize, f64> = HashMap::new();
        for token in tokenize(&self.token_pattern, text) {
            if let Some(&idx) = self.vocabulary.get(&token) {
                *counts.entry(idx).or_insert(0.0) += 1.0;
            }
        }

        let mut vector: SparseVector = counts
            .into_iter()
            .map(|(idx, tf)| (idx, tf * self.idf[idx]))
            .collect();
        vector.sort_unstable_by_key(|(idx, _)| *idx);

        let norm = vector.iter().map(|(_, w)| w * w).sum::<f64>().sqrt();
        if norm > 0.0 {
            for (_, w) in &mut vector {
                *w /= norm;
            }
        }
        vector
    }
}

fn token_regex() -> Regex {
    // static pattern; cannot fail
    Regex::new(r"\b\w\w+\b").expect("valid token pattern")
}

fn tokenize(pattern: &Regex, text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    pattern
        .find_iter(&lower)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Cosine similarity of two sparse vectors (sorted by index).
///
/// Returns `0.0` when either vector is empty or all-zero.
pub fn cosine_similarity(a: &[(usize, f64)], b: &[(usize, f64)]) -> f64 {
    let (mut i, mut j) = (0, 0);
    let mut dot = 0.0;
    while i < a.len() && j < b.len() {
        match a[i].0.cmp(&b[j].0) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                dot += a[i].1 * b[j].1;
                i += 1;
                j += 1;
            }
        }
    }

    let norm_a = a.iter().map(|(_, w)| w * w).sum::<f64>().sqrt();
    let norm_b = b.iter().map(|(_, w)| w * w).sum::<f64>().sqrt();
    let denom = norm_a * norm_b;
    if denom < f64::EPSILON {
        return 0.0;
    }
    dot / denom
}

/// A fitted vectorizer plus the vectors of every corpus document.
#[derive(Debug, Clone)]
pub struct TfidfIndex {
    vectorizer: TfidfVectorizer,
    matrix: Vec<SparseVector>,
}

impl TfidfIndex {
    pub fn build<S: AsRef<str>>(docs: &[S]) -> Self {
        let vectorizer = TfidfVectorizer::fit(docs);
        let matrix = docs.iter().map(|d| vectorizer.transform(d.as_ref())).collect();
        Self { vectorizer, matrix }
    }

    pub fn len(&self) -> usize {
        self.matrix.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matrix.is_empty()
    }

    /// Similarity of `query` against every document, in corpus order.
    pub fn similarities(&self, query: &str) -> Vec<f64> {
        let q = self.vectorizer.transform(query);
        self.matrix.iter().map(|row| cosine_similarity(&q, row)).collect()
    }

    /// The `k` most similar documents as `(row, score)`.
    ///
    /// Ordered by score descending; equal scores keep corpus order. `k` is
    /// clamped to the corpus size.
    pub fn top_k(&self, query: &str, k: usize) -> Vec<(usize, f64)> {
        let mut scored: Vec<(usize, f64)> = self.similarities(query).into_iter().enumerate().collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        scored.truncate(k);
        scored
    }
}
