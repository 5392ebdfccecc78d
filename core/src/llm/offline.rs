use super::LanguageModel;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashSet;

pub const INSUFFICIENT_INFORMATION: &str = "Insufficient Information";

const EMPTY_SENTINEL: &str = "#EMPTY#";
const MAX_ANSWER_SPANS: usize = 3;

/// Deterministic model that needs no network access.
///
/// Summaries restate the input on one line, embeddings are signed hashed
/// bags of words, and answers quote the passage spans whose summaries share
/// the most words with the question.
pub struct OfflineModel {
    dimensions: usize,
}

impl OfflineModel {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }
}

fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
}

fn fnv1a(word: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in word.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

fn one_line(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("; ")
}

/// `(span id, summary)` pairs from the nodes section of a passage
fn passage_nodes(passage: &str) -> Vec<(String, String)> {
    let mut nodes = Vec::new();
    let mut current: Option<String> = None;
    for line in passage.lines() {
        if let Some(id) = line.strip_prefix("Span ID: ") {
            current = Some(id.trim().to_string());
        } else if let Some(summary) = line.strip_prefix("Summary: ") {
            if let Some(id) = current.take() {
                nodes.push((id, summary.trim().to_string()));
            }
        }
    }
    nodes
}

#[async_trait]
impl LanguageModel for OfflineModel {
    async fn summarize_span(&self, rendered: &str) -> Result<String> {
        Ok(one_line(rendered))
    }

    async fn summarize_logs(&self, rendered: &str) -> Result<String> {
        let summary = one_line(rendered);
        if summary.is_empty() {
            return Ok(EMPTY_SENTINEL.to_string());
        }
        Ok(summary)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dimensions];
        for word in words(text) {
            let hash = fnv1a(&word);
            let slot = (hash % self.dimensions as u64) as usize;
            let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
            vector[slot] += sign;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        Ok(vector)
    }

    async fn generate_answer(&self, question: &str, passage: &str) -> Result<String> {
        let asked: HashSet<String> = words(question).filter(|w| w.len() > 2).collect();

        let mut scored: Vec<(usize, String, String)> = passage_nodes(passage)
            .into_iter()
            .filter_map(|(id, summary)| {
                let overlap = words(&summary)
                    .collect::<HashSet<_>>()
                    .intersection(&asked)
                    .count();
                (overlap > 0).then_some((overlap, id, summary))
            })
            .collect();
        if scored.is_empty() {
            return Ok(INSUFFICIENT_INFORMATION.to_string());
        }

        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        Ok(scored
            .into_iter()
            .take(MAX_ANSWER_SPANS)
            .map(|(_, id, summary)| format!("Span {}: {}", id, summary))
            .collect::<Vec<_>>()
            .join("\n"))
    }
}
