use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::config::AttentionConfig;

/// `[step][layer][head][query row][key]`
pub type AttentionTensor = Vec<Vec<Vec<Vec<Vec<f32>>>>>;
/// `[layer][head][row][key]` for a single step
pub type LayerAttention = Vec<Vec<Vec<Vec<f32>>>>;

/// Lower bound of the exaggeration exponent.
pub const MIN_EXPONENT: f32 = 1.5;
pub const DEFAULT_MAX_EXPONENT: f32 = 4.0;
/// Smallest divisor used when rescaling to peak 1.
const PEAK_FLOOR: f32 = 1e-8;

/// Which slice of the attention tensor to reduce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttentionSelection {
    /// Generation step the hovered token was produced in
    pub step: usize,
    pub layer: usize,
    /// Position of the hovered token; output has one entry per earlier
    /// position
    pub query_index: usize,
    /// How far the query is shifted from the start of the model context
    pub offset: usize,
}

/// Strongest head for one key position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeadWeight {
    /// `None` when no head recorded anything for this position
    pub head: Option<usize>,
    pub weight: f32,
}

impl HeadWeight {
    pub const NONE: HeadWeight = HeadWeight {
        head: None,
        weight: 0.0,
    };
}

fn sanitize(value: f32) -> f32 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}

/// Exponent for [`exaggerate`]: `max_exponent` for a flat distribution,
/// falling towards [`MIN_EXPONENT`] as the spread (stddev / mean) grows.
pub fn exaggeration_exponent(weights: &[f32], max_exponent: f32) -> f32 {
    let max_exponent = max_exponent.max(MIN_EXPONENT);
    if weights.is_empty() {
        return MIN_EXPONENT;
    }
    let n = weights.len() as f32;
    let mean = weights.iter().map(|&w| sanitize(w)).sum::<f32>() / n;
    if mean <= PEAK_FLOOR {
        return MIN_EXPONENT;
    }
    let variance = weights
        .iter()
        .map(|&w| (sanitize(w) - mean).powi(2))
        .sum::<f32>()
        / n;
    let spread = (variance.sqrt() / mean).min(1.0);
    (MIN_EXPONENT + (max_exponent - MIN_EXPONENT) * (1.0 - spread)).clamp(MIN_EXPONENT, max_exponent)
}

/// Raise every weight to the adaptive exponent and rescale so the peak
/// is 1. All-zero input stays all zero.
pub fn exaggerate(weights: &[f32], max_exponent: f32) -> Vec<f32> {
    raise_to_peak(weights, exaggeration_exponent(weights, max_exponent))
}

fn raise_to_peak(weights: &[f32], exponent: f32) -> Vec<f32> {
    let raised: Vec<f32> = weights.iter().map(|&w| sanitize(w).powf(exponent)).collect();
    let peak = raised.iter().copied().fold(0.0f32, f32::max).max(PEAK_FLOOR);
    raised.into_iter().map(|w| (w / peak).clamp(0.0, 1.0)).collect()
}

/// Right-align one head's query row against `query_index`.
///
/// Key `i` up to `real_index = min(query_index + offset - 1, len - 1)`
/// lands on slot `query_index - real_index + i - 1`; slots that would fall
/// before 0 are dropped. Returns the aligned weights and the range of
/// slots that received a key, everything outside it is 0.
fn align_head(row: &[f32], query_index: usize, offset: usize) -> (Vec<f32>, Range<usize>) {
    let mut weights = vec![0.0; query_index];
    if row.is_empty() || query_index == 0 {
        return (weights, query_index..query_index);
    }
    let real_index = query_index
        .saturating_add(offset)
        .saturating_sub(1)
        .min(row.len() - 1);
    let mapped = (real_index + 1).min(query_index);
    let first_slot = query_index - mapped;
    let first_key = real_index + 1 - mapped;
    for (slot, &value) in weights[first_slot..].iter_mut().zip(&row[first_key..=real_index]) {
        *slot = sanitize(value);
    }
    (weights, first_slot..query_index)
}

/// Per-position weight for the token at `selection.query_index`: every
/// head of the selected step and layer is aligned, exaggerated and the
/// strongest head wins each position.
///
/// Missing steps, layers, heads or rows read as zero. The result always
/// has `query_index` entries.
pub fn reduce_attention(
    tensor: &[LayerAttention],
    selection: &AttentionSelection,
    max_exponent: f32,
) -> Vec<HeadWeight> {
    let mut result = vec![HeadWeight::NONE; selection.query_index];

    let Some(heads) = tensor
        .get(selection.step)
        .and_then(|layers| layers.get(selection.layer))
    else {
        return result;
    };

    for (head, rows) in heads.iter().enumerate() {
        // Last recorded row is the query's own row, with or without a
        // KV cache.
        let Some(row) = rows.last() else { continue };
        let (aligned, mapped) = align_head(row, selection.query_index, selection.offset);
        // padding slots don't count towards the spread
        let exponent = exaggeration_exponent(&aligned[mapped], max_exponent);
        let exaggerated = raise_to_peak(&aligned, exponent);
        for (slot, weight) in result.iter_mut().zip(exaggerated) {
            if weight > slot.weight {
                *slot = HeadWeight {
                    head: Some(head),
                    weight,
                };
            }
        }
    }
    result
}

/// [`reduce_attention`] with the exponent ceiling from settings.
pub fn reduce_attention_with(
    tensor: &[LayerAttention],
    selection: &AttentionSelection,
    config: &AttentionConfig,
) -> Vec<HeadWeight> {
    reduce_attention(tensor, selection, config.max_exponent)
}

/// Just the weights of a [`reduce_attention`] result.
pub fn display_weights(reduced: &[HeadWeight]) -> Vec<f32> {
    reduced.iter().map(|hw| hw.weight).collect()
}

/// Single-pass view over `[layer][head][row][key]`: per layer, the
/// maximum across heads of row 0, divided by the maximum over all
/// layers. If nothing was recorded anywhere the result is all zeros.
pub fn reduce_layers(tensor: &[Vec<Vec<Vec<f32>>>]) -> Vec<Vec<f32>> {
    let mut layers: Vec<Vec<f32>> = tensor
        .iter()
        .map(|heads| {
            let keys = heads
                .iter()
                .filter_map(|rows| rows.first())
                .map(Vec::len)
                .max()
                .unwrap_or(0);
            (0..keys)
                .map(|k| {
                    heads
                        .iter()
                        .filter_map(|rows| rows.first().and_then(|row| row.get(k)))
                        .map(|&v| sanitize(v))
                        .fold(0.0f32, f32::max)
                })
                .collect()
        })
        .collect();

    let global_max = layers
        .iter()
        .flatten()
        .copied()
        .fold(0.0f32, f32::max);
    if global_max <= 0.0 {
        // all entries are already 0
        return layers;
    }
    for value in layers.iter_mut().flatten() {
        *value /= global_max;
    }
    layers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_head(row: Vec<f32>) -> Vec<LayerAttention> {
        // one step, one layer, one head, one row
        vec![vec![vec![vec![row]]]]
    }

    #[test]
    fn test_flat_weights_get_sharper_exponent() {
        let flat = [0.1, 0.1, 0.1, 0.1];
        let spiky = [0.9, 0.05, 0.03, 0.02];
        let flat_exp = exaggeration_exponent(&flat, DEFAULT_MAX_EXPONENT);
        let spiky_exp = exaggeration_exponent(&spiky, DEFAULT_MAX_EXPONENT);
        assert!((flat_exp - DEFAULT_MAX_EXPONENT).abs() < 1e-4);
        assert_eq!(spiky_exp, MIN_EXPONENT);
        assert!(flat_exp > spiky_exp);
    }

    #[test]
    fn test_exponent_is_clamped() {
        let mid = [0.4, 0.3, 0.2, 0.1];
        let exp = exaggeration_exponent(&mid, 10.0);
        assert!((MIN_EXPONENT..=10.0).contains(&exp));
        // a max below the floor is raised to the floor
        assert_eq!(exaggeration_exponent(&mid, 1.0), MIN_EXPONENT);
        assert_eq!(exaggeration_exponent(&[], 4.0), MIN_EXPONENT);
    }

    #[test]
    fn test_exaggerate_peaks_at_one() {
        let out = exaggerate(&[0.2, 0.4, 0.1], DEFAULT_MAX_EXPONENT);
        assert_eq!(out[1], 1.0);
        assert!(out.iter().all(|w| (0.0..=1.0).contains(w)));
        // lower inputs are pushed further down than a linear rescale would
        assert!(out[0] < 0.5);
    }

    #[test]
    fn test_exaggerate_all_zero() {
        assert_eq!(exaggerate(&[0.0, 0.0, 0.0], DEFAULT_MAX_EXPONENT), vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_align_right_to_query() {
        // query 3, no offset: keys map straight onto positions 0..3
        assert_eq!(align_head(&[0.5, 0.3, 0.2], 3, 0), (vec![0.5, 0.3, 0.2], 0..3));
        // offset 1 drops the first key and shifts the rest left
        assert_eq!(align_head(&[0.5, 0.3, 0.2, 0.1], 3, 1), (vec![0.3, 0.2, 0.1], 0..3));
        // short row fills the slots just before the query
        assert_eq!(align_head(&[0.7, 0.3], 4, 4), (vec![0.0, 0.0, 0.7, 0.3], 2..4));
        assert_eq!(align_head(&[], 2, 0), (vec![0.0, 0.0], 2..2));
        assert_eq!(align_head(&[1.0], 0, 0), (vec![], 0..0));
    }

    #[test]
    fn test_align_huge_offset() {
        assert_eq!(align_head(&[0.1, 0.9], 2, usize::MAX), (vec![0.1, 0.9], 0..2));
        assert_eq!(align_head(&[0.1, 0.9], 2, usize::MAX / 2), (vec![0.1, 0.9], 0..2));

        let selection = AttentionSelection {
            step: 0,
            layer: 0,
            query_index: 2,
            offset: usize::MAX,
        };
        let reduced = reduce_attention(&single_head(vec![0.1, 0.9]), &selection, DEFAULT_MAX_EXPONENT);
        assert_eq!(reduced.len(), 2);
        assert_eq!(reduced[1].weight, 1.0);
    }

    #[test]
    fn test_short_row_exponent_ignores_padding() {
        // mapped weights [0.7, 0.3]: mean 0.5, stddev 0.2, exponent 3
        let selection = AttentionSelection {
            step: 0,
            layer: 0,
            query_index: 4,
            offset: 4,
        };
        let reduced = reduce_attention(&single_head(vec![0.7, 0.3]), &selection, DEFAULT_MAX_EXPONENT);
        assert_eq!(reduced[0], HeadWeight::NONE);
        assert_eq!(reduced[1], HeadWeight::NONE);
        assert_eq!(reduced[2].weight, 1.0);
        let expected = (0.3f32 / 0.7).powi(3);
        assert!((reduced[3].weight - expected).abs() < 1e-4, "got {}", reduced[3].weight);
    }

    #[test]
    fn test_reduce_picks_strongest_head() {
        let head_a = vec![vec![0.8, 0.1, 0.1]];
        let head_b = vec![vec![0.1, 0.1, 0.8]];
        let tensor: Vec<LayerAttention> = vec![vec![vec![head_a, head_b]]];
        let selection = AttentionSelection {
            step: 0,
            layer: 0,
            query_index: 3,
            offset: 1,
        };

        let reduced = reduce_attention(&tensor, &selection, DEFAULT_MAX_EXPONENT);
        assert_eq!(reduced.len(), 3);
        assert_eq!(reduced[0].head, Some(0));
        assert_eq!(reduced[0].weight, 1.0);
        assert_eq!(reduced[2].head, Some(1));
        assert_eq!(reduced[2].weight, 1.0);
        assert!(display_weights(&reduced).iter().all(|w| (0.0..=1.0).contains(w)));
    }

    #[test]
    fn test_reduce_all_zero_and_missing() {
        let selection = AttentionSelection {
            step: 0,
            layer: 0,
            query_index: 3,
            offset: 1,
        };
        let zeros = reduce_attention(&single_head(vec![0.0, 0.0, 0.0]), &selection, DEFAULT_MAX_EXPONENT);
        assert_eq!(zeros, vec![HeadWeight::NONE; 3]);

        // step out of range
        let missing = reduce_attention(
            &single_head(vec![1.0]),
            &AttentionSelection { step: 5, ..selection },
            DEFAULT_MAX_EXPONENT,
        );
        assert_eq!(missing, vec![HeadWeight::NONE; 3]);

        // a head with no rows is skipped
        let ragged: Vec<LayerAttention> = vec![vec![vec![vec![], vec![vec![0.2, f32::NAN, 0.6]]]]];
        let reduced = reduce_attention(&ragged, &selection, DEFAULT_MAX_EXPONENT);
        assert_eq!(reduced[1], HeadWeight::NONE);
        assert_eq!(reduced[2].head, Some(1));
        assert_eq!(reduced[2].weight, 1.0);
    }

    #[test]
    fn test_reduce_uses_last_row() {
        let head = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
        let tensor: Vec<LayerAttention> = vec![vec![vec![head]]];
        let selection = AttentionSelection {
            step: 0,
            layer: 0,
            query_index: 2,
            offset: 1,
        };
        let reduced = reduce_attention(&tensor, &selection, DEFAULT_MAX_EXPONENT);
        assert_eq!(reduced[0], HeadWeight::NONE);
        assert_eq!(reduced[1].weight, 1.0);
    }

    #[test]
    fn test_reduce_with_settings() {
        let tensor = single_head(vec![0.2, 0.4, 0.4]);
        let selection = AttentionSelection {
            step: 0,
            layer: 0,
            query_index: 3,
            offset: 0,
        };
        let config = AttentionConfig { max_exponent: 2.0 };
        assert_eq!(
            reduce_attention_with(&tensor, &selection, &config),
            reduce_attention(&tensor, &selection, 2.0)
        );
        assert_ne!(
            display_weights(&reduce_attention_with(&tensor, &selection, &config))[0],
            display_weights(&reduce_attention_with(&tensor, &selection, &AttentionConfig::default()))[0]
        );
    }

    #[test]
    fn test_reduce_layers_global_max() {
        // unnormalized scores, max 2.0
        let layer0 = vec![vec![vec![0.5, 1.0]], vec![vec![0.25, 2.0]]];
        let layer1 = vec![vec![vec![1.0]]];
        let out = reduce_layers(&[layer0, layer1]);
        assert_eq!(out, vec![vec![0.5, 1.0], vec![0.5]]);
    }

    #[test]
    fn test_reduce_layers_zero_max() {
        let layer = vec![vec![vec![0.0, 0.0]], vec![]];
        assert_eq!(reduce_layers(&[layer]), vec![vec![0.0, 0.0]]);
        assert!(reduce_layers(&[]).is_empty());
    }
}
