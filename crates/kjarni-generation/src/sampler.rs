//! Next-token selection from processed scores.

use log::debug;
use ndarray::{ArrayBase, Data, Ix1};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::GenerationConfig;
use crate::logits::{is_candidate, ScoreMatrix};

/// Picks one token id per row.
///
/// The RNG lives inside the sampler, which is created per `generate` call, so
/// concurrent calls never share random state.
#[derive(Debug, Clone)]
pub enum Sampler {
    /// Arg-max, ties broken by the smallest index.
    Greedy,
    /// Categorical draw over the selectable entries of each row.
    Multinomial { rng: StdRng },
}

impl Sampler {
    pub fn from_config(config: &GenerationConfig) -> Self {
        if !config.is_sampling() {
            return Sampler::Greedy;
        }
        let rng = match config.random_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => {
                debug!("no random_seed set; sampling will not be reproducible");
                StdRng::from_entropy()
            }
        };
        Sampler::Multinomial { rng }
    }

    pub fn seeded(seed: u64) -> Self {
        Sampler::Multinomial {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn is_greedy(&self) -> bool {
        matches!(self, Sampler::Greedy)
    }

    /// One draw per active row, in row order.
    ///
    /// Inactive rows get `None` and take no draw from the RNG, so the random
    /// stream seen by the remaining rows does not depend on finished ones.
    pub fn sample(&mut self, scores: &ScoreMatrix, active: &[bool]) -> Vec<Option<u32>> {
        let mut tokens = Vec::with_capacity(scores.nrows());
        for (row, &is_active) in scores.rows().into_iter().zip(active) {
            if !is_active {
                tokens.push(None);
                continue;
            }
            let token = match self {
                Sampler::Greedy => argmax(&row),
                Sampler::Multinomial { rng } => sample_row(&row, rng),
            };
            tokens.push(Some(token));
        }
        tokens
    }
}

/// Index of the highest score; the first one wins on ties. Returns 0 when
/// nothing is selectable.
pub fn argmax<S>(logits: &ArrayBase<S, Ix1>) -> u32
where
    S: Data<Elem = f32>,
{
    let mut best_idx = 0usize;
    let mut best = f32::NEG_INFINITY;
    for (idx, &score) in logits.iter().enumerate() {
        if score > best {
            best = score;
            best_idx = idx;
        }
    }
    best_idx as u32
}

/// Softmax over selectable entries; filtered entries get probability zero.
pub fn softmax_candidates<S>(logits: &ArrayBase<S, Ix1>) -> Vec<f64>
where
    S: Data<Elem = f32>,
{
    let max = logits
        .iter()
        .copied()
        .filter(|&s| is_candidate(s))
        .fold(f32::NEG_INFINITY, f32::max);
    if !is_candidate(max) {
        return vec![0.0; logits.len()];
    }
    let exps: Vec<f64> = logits
        .iter()
        .map(|&s| {
            if is_candidate(s) {
                ((s - max) as f64).exp()
            } else {
                0.0
            }
        })
        .collect();
    let total: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / total).collect()
}

fn sample_row<S>(logits: &ArrayBase<S, Ix1>, rng: &mut StdRng) -> u32
where
    S: Data<Elem = f32>,
{
    let probs = softmax_candidates(logits);
    let last_candidate = probs.iter().rposition(|&p| p > 0.0);
    let Some(last_candidate) = last_candidate else {
        return argmax(logits);
    };

    let uniform: f64 = rng.r#gen();
    let mut cumulative = 0.0;
    for (idx, &prob) in probs.iter().enumerate() {
        if prob == 0.0 {
            continue;
        }
        cumulative += prob;
        if cumulative > uniform {
            return idx as u32;
        }
    }
    // Rounding left the cumulative sum just below the draw.
    last_candidate as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{array, Array2};

    #[test]
    fn test_greedy_picks_max() {
        let scores = array![[1.0, 5.0, 3.0, 2.0], [9.0, 0.0, 0.0, 0.0]];
        let mut sampler = Sampler::Greedy;
        assert_eq!(sampler.sample(&scores, &[true, true]), vec![Some(1), Some(0)]);
    }

    #[test]
    fn test_greedy_tie_picks_smallest_index() {
        let scores = array![[1.0, 5.0, 5.0, 5.0]];
        assert_eq!(Sampler::Greedy.sample(&scores, &[true]), vec![Some(1)]);
    }

    #[test]
    fn test_argmax_all_filtered_returns_zero() {
        let row = array![f32::NEG_INFINITY, f32::NEG_INFINITY];
        assert_eq!(argmax(&row), 0);
    }

    #[test]
    fn test_softmax_candidates_ignores_filtered() {
        let probs = softmax_candidates(&array![0.0, f32::NEG_INFINITY, 0.0]);
        assert_relative_eq!(probs[0], 0.5, epsilon = 1e-9);
        assert_eq!(probs[1], 0.0);
        assert_relative_eq!(probs.iter().sum::<f64>(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_softmax_candidates_numerical_stability() {
        let probs = softmax_candidates(&array![1000.0f32, 1001.0, 1002.0]);
        assert!(probs.iter().all(|p| p.is_finite()));
        assert_relative_eq!(probs.iter().sum::<f64>(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_multinomial_never_picks_filtered() {
        let scores = array![[f32::NEG_INFINITY, 1.0, f32::NEG_INFINITY, 1.0]];
        let mut sampler = Sampler::seeded(7);
        for _ in 0..200 {
            let token = sampler.sample(&scores, &[true])[0].unwrap();
            assert!(token == 1 || token == 3);
        }
    }

    #[test]
    fn test_multinomial_single_candidate_is_deterministic() {
        let scores = array![[f32::NEG_INFINITY, f32::NEG_INFINITY, 0.3]];
        let mut sampler = Sampler::seeded(1);
        for _ in 0..20 {
            assert_eq!(sampler.sample(&scores, &[true]), vec![Some(2)]);
        }
    }

    #[test]
    fn test_same_seed_same_draws() {
        let scores = Array2::from_elem((3, 50), 0.0f32);
        let mut a = Sampler::seeded(42);
        let mut b = Sampler::seeded(42);
        for _ in 0..10 {
            assert_eq!(a.sample(&scores, &[true; 3]), b.sample(&scores, &[true; 3]));
        }
    }

    #[test]
    fn test_from_config_zero_temperature_is_greedy() {
        let config = GenerationConfig::sampling(0.0, 0, 1.0).with_seed(3);
        assert!(Sampler::from_config(&config).is_greedy());
    }

    #[test]
    fn test_from_config_sampling() {
        let config = GenerationConfig::sampling(0.8, 0, 1.0).with_seed(3);
        assert!(!Sampler::from_config(&config).is_greedy());
    }

    #[test]
    fn test_multinomial_all_filtered_row_falls_back_to_argmax() {
        let scores = array![[f32::NEG_INFINITY, f32::NEG_INFINITY]];
        assert_eq!(Sampler::seeded(0).sample(&scores, &[true]), vec![Some(0)]);
    }

    #[test]
    fn test_inactive_rows_take_no_draw() {
        let scores = Array2::from_elem((3, 20), 0.0f32);
        let mut all = Sampler::seeded(11);
        let mut skipping = Sampler::seeded(11);

        let first = all.sample(&scores, &[true, true, true]);
        let skipped = skipping.sample(&scores, &[true, false, true]);
        assert_eq!(skipped[1], None);
        assert_eq!(skipped[0], first[0]);

        // Row 2 consumed the second draw, so it matches row 1 of the full pass.
        assert_eq!(skipped[2], first[1]);
    }

    #[test]
    fn test_greedy_inactive_row_is_none() {
        let scores = array![[1.0f32, 5.0], [7.0, 0.0]];
        assert_eq!(Sampler::Greedy.sample(&scores, &[false, true]), vec![None, Some(0)]);
    }
}
