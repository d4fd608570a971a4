use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// Tokens at or below this probability are not worth listing.
pub const SIGNIFICANCE_THRESHOLD: f32 = 0.001;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenProbability {
    pub token: String,
    pub probability: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignificantToken {
    pub index: usize,
    pub text: String,
    pub probability: f32,
}

fn descending(a: f32, b: f32) -> Ordering {
    // NaN sorts last
    let key = |p: f32| if p.is_nan() { f32::NEG_INFINITY } else { p };
    key(b).total_cmp(&key(a))
}

/// The `k` most likely tokens, highest first. Equal probabilities keep
/// vocabulary order. Probabilities are reported as given.
pub fn rank_top_k<S: AsRef<str>>(probs: &[f32], vocab: &[S], k: usize) -> Vec<TokenProbability> {
    let mut ranked: Vec<(usize, f32)> = probs
        .iter()
        .copied()
        .take(vocab.len())
        .enumerate()
        .collect();
    // stable, so ties stay in index order
    ranked.sort_by(|a, b| descending(a.1, b.1));
    ranked
        .into_iter()
        .take(k)
        .map(|(index, probability)| TokenProbability {
            token: vocab[index].as_ref().to_string(),
            probability,
        })
        .collect()
}

/// Tokens with probability strictly above [`SIGNIFICANCE_THRESHOLD`], in
/// vocabulary order.
pub fn significant_tokens<S: AsRef<str>>(vocab: &[S], probs: &[f32]) -> Vec<SignificantToken> {
    vocab
        .iter()
        .zip(probs)
        .enumerate()
        .filter(|(_, (_, p))| **p > SIGNIFICANCE_THRESHOLD)
        .map(|(index, (text, &probability))| SignificantToken {
            index,
            text: text.as_ref().to_string(),
            probability,
        })
        .collect()
}

/// Distribution recorded for one generation step of a `[step][vocab]`
/// tensor; empty if the step was never recorded.
pub fn step_distribution(tensor: &[Vec<f32>], step: usize) -> &[f32] {
    tensor.get(step).map(Vec::as_slice).unwrap_or(&[])
}
