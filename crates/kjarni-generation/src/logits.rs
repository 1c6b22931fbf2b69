//! Logits processing applied between the forward pass and sampling.
//!
//! Stages run in a fixed order:
//!
//! 1. token suppression (ignored ids, EOS below the minimum length)
//! 2. repetition penalty
//! 3. no-repeat n-gram blocking
//! 4. temperature scaling
//! 5. top-k filtering
//! 6. top-p (nucleus) filtering
//!
//! Stages 4-6 only take part when sampling; they cannot change the arg-max.
//! Every stage takes the score matrix by value and returns a new one, so a
//! stage never observes changes made after it ran.

use std::collections::BTreeSet;

use log::debug;
use ndarray::{Array2, ArrayBase, DataMut, Ix1};

use crate::config::GenerationConfig;

/// Batch × vocab scores for a single step.
pub type ScoreMatrix = Array2<f32>;

/// Value written into filtered-out entries.
pub const FILTER_VALUE: f32 = f32::NEG_INFINITY;

/// True for entries that can still be selected.
#[inline]
pub fn is_candidate(score: f32) -> bool {
    score > f32::NEG_INFINITY
}

/// Number of selectable entries in a row.
pub fn count_candidates<'a>(row: impl IntoIterator<Item = &'a f32>) -> usize {
    row.into_iter().filter(|&&s| is_candidate(s)).count()
}

/// A single transformation of the per-step scores.
pub trait LogitsWarper: Send + Sync {
    fn name(&self) -> &'static str;

    /// `history[b]` is the full running sequence of row `b`; `step` is the
    /// 0-based decoder step, which equals the number of tokens generated so far
    /// by every unfinished row.
    fn warp(&self, history: &[Vec<u32>], scores: ScoreMatrix, step: usize) -> ScoreMatrix;
}

// ============================================================================
//  Row kernels
// ============================================================================

/// Apply repetition penalty in-place to every distinct token in `tokens`.
pub fn apply_repetition_penalty_inplace<S>(
    logits: &mut ArrayBase<S, Ix1>,
    tokens: &[u32],
    penalty: f32,
) where
    S: DataMut<Elem = f32>,
{
    if penalty == 1.0 {
        return;
    }
    let distinct: BTreeSet<u32> = tokens.iter().copied().collect();
    for token in distinct {
        let idx = token as usize;
        if idx < logits.len() {
            let score = logits[idx];
            if score > 0.0 {
                logits[idx] = score / penalty;
            } else {
                logits[idx] = score * penalty;
            }
        }
    }
}

/// Apply no-repeat n-gram blocking in-place.
pub fn apply_no_repeat_ngram_inplace<S>(
    logits: &mut ArrayBase<S, Ix1>,
    tokens: &[u32],
    ngram_size: usize,
) where
    S: DataMut<Elem = f32>,
{
    let n = ngram_size;
    // Need at least n-1 tokens to form a prefix
    if n == 0 || tokens.len() < n - 1 {
        return;
    }

    // The last n-1 tokens form the current prefix
    let current_prefix = &tokens[tokens.len() - (n - 1)..];

    // Any historical n-gram starting with this prefix bans its completing token
    for window in tokens.windows(n) {
        if &window[..n - 1] == current_prefix {
            let banned_token = window[n - 1] as usize;
            if banned_token < logits.len() {
                logits[banned_token] = FILTER_VALUE;
            }
        }
    }
}

/// Candidates of a row sorted by score descending, ties broken by ascending index.
fn sorted_candidates<S>(logits: &ArrayBase<S, Ix1>) -> Vec<(usize, f32)>
where
    S: ndarray::Data<Elem = f32>,
{
    let mut candidates: Vec<(usize, f32)> = logits
        .iter()
        .enumerate()
        .filter(|&(_, &s)| is_candidate(s))
        .map(|(i, &s)| (i, s))
        .collect();
    candidates.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    candidates
}

/// Keep only the `max(k, min_tokens_to_keep)` best candidates of a row.
pub fn top_k_filter_inplace<S>(logits: &mut ArrayBase<S, Ix1>, k: usize, min_tokens_to_keep: usize)
where
    S: DataMut<Elem = f32>,
{
    if k == 0 {
        return;
    }
    let candidates = sorted_candidates(logits);
    let keep = k.max(min_tokens_to_keep).min(candidates.len());
    for &(idx, _) in &candidates[keep..] {
        logits[idx] = FILTER_VALUE;
    }
}

/// Keep the smallest set of best candidates whose probability mass reaches `p`.
pub fn top_p_filter_inplace<S>(logits: &mut ArrayBase<S, Ix1>, p: f32, min_tokens_to_keep: usize)
where
    S: DataMut<Elem = f32>,
{
    if p >= 1.0 {
        return;
    }
    let candidates = sorted_candidates(logits);
    if candidates.is_empty() {
        return;
    }

    let max = candidates[0].1;
    let exps: Vec<f32> = candidates.iter().map(|&(_, s)| (s - max).exp()).collect();
    let total: f32 = exps.iter().sum();

    let mut cumulative = 0.0;
    let mut keep = candidates.len();
    for (i, e) in exps.iter().enumerate() {
        cumulative += e / total;
        if cumulative >= p {
            keep = i + 1;
            break;
        }
    }
    let keep = keep.max(min_tokens_to_keep.max(1)).min(candidates.len());

    for &(idx, _) in &candidates[keep..] {
        logits[idx] = FILTER_VALUE;
    }
}

// ============================================================================
//  Warpers
// ============================================================================

/// Forces ignored ids, and EOS while below the minimum length, to `-inf`.
#[derive(Debug, Clone)]
pub struct SuppressTokens {
    pub ignore_token_ids: BTreeSet<u32>,
    pub eos_token_id: Option<u32>,
    pub min_output_length: usize,
}

impl LogitsWarper for SuppressTokens {
    fn name(&self) -> &'static str {
        "suppress_tokens"
    }

    fn warp(&self, _history: &[Vec<u32>], mut scores: ScoreMatrix, step: usize) -> ScoreMatrix {
        let vocab = scores.ncols();
        let suppress_eos = step < self.min_output_length;
        for mut row in scores.outer_iter_mut() {
            for &id in &self.ignore_token_ids {
                if (id as usize) < vocab {
                    row[id as usize] = FILTER_VALUE;
                }
            }
            if suppress_eos {
                if let Some(eos) = self.eos_token_id {
                    if (eos as usize) < vocab {
                        row[eos as usize] = FILTER_VALUE;
                    }
                }
            }
        }
        scores
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RepetitionPenalty(pub f32);

impl LogitsWarper for RepetitionPenalty {
    fn name(&self) -> &'static str {
        "repetition_penalty"
    }

    fn warp(&self, history: &[Vec<u32>], mut scores: ScoreMatrix, _step: usize) -> ScoreMatrix {
        for (mut row, tokens) in scores.outer_iter_mut().zip(history) {
            apply_repetition_penalty_inplace(&mut row, tokens, self.0);
        }
        scores
    }
}

#[derive(Debug, Clone, Copy)]
pub struct NoRepeatNGram(pub usize);

impl LogitsWarper for NoRepeatNGram {
    fn name(&self) -> &'static str {
        "no_repeat_ngram"
    }

    fn warp(&self, history: &[Vec<u32>], mut scores: ScoreMatrix, _step: usize) -> ScoreMatrix {
        for (mut row, tokens) in scores.outer_iter_mut().zip(history) {
            apply_no_repeat_ngram_inplace(&mut row, tokens, self.0);
        }
        scores
    }
}

/// Divides every selectable score by the temperature. Zero or negative
/// temperatures leave the scores untouched.
#[derive(Debug, Clone, Copy)]
pub struct Temperature(pub f32);

impl LogitsWarper for Temperature {
    fn name(&self) -> &'static str {
        "temperature"
    }

    fn warp(&self, _history: &[Vec<u32>], mut scores: ScoreMatrix, _step: usize) -> ScoreMatrix {
        if self.0 <= 0.0 || self.0 == 1.0 {
            return scores;
        }
        let t = self.0;
        scores.mapv_inplace(|s| if is_candidate(s) { s / t } else { s });
        scores
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TopK {
    pub k: usize,
    pub min_tokens_to_keep: usize,
}

impl LogitsWarper for TopK {
    fn name(&self) -> &'static str {
        "top_k"
    }

    fn warp(&self, _history: &[Vec<u32>], mut scores: ScoreMatrix, _step: usize) -> ScoreMatrix {
        for mut row in scores.outer_iter_mut() {
            top_k_filter_inplace(&mut row, self.k, self.min_tokens_to_keep);
        }
        scores
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TopP {
    pub p: f32,
    pub min_tokens_to_keep: usize,
}

impl LogitsWarper for TopP {
    fn name(&self) -> &'static str {
        "top_p"
    }

    fn warp(&self, _history: &[Vec<u32>], mut scores: ScoreMatrix, _step: usize) -> ScoreMatrix {
        for mut row in scores.outer_iter_mut() {
            top_p_filter_inplace(&mut row, self.p, self.min_tokens_to_keep);
        }
        scores
    }
}

// ============================================================================
//  Chain
// ============================================================================

/// Ordered list of warpers applied to every step's scores.
#[derive(Default)]
pub struct LogitsProcessorChain {
    warpers: Vec<Box<dyn LogitsWarper>>,
}

impl LogitsProcessorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<W: LogitsWarper + 'static>(mut self, warper: W) -> Self {
        self.warpers.push(Box::new(warper));
        self
    }

    /// Builds the chain for a config, skipping every stage its threshold disables.
    pub fn from_config(config: &GenerationConfig, eos_token_id: Option<u32>) -> Self {
        let mut chain = Self::new();

        let suppress_eos = config.min_output_length > 0 && eos_token_id.is_some();
        if !config.ignore_token_ids.is_empty() || suppress_eos {
            chain = chain.push(SuppressTokens {
                ignore_token_ids: config.ignore_token_ids.clone(),
                eos_token_id,
                min_output_length: config.min_output_length,
            });
        }
        if config.repetition_penalty != 1.0 {
            chain = chain.push(RepetitionPenalty(config.repetition_penalty));
        }
        if config.no_repeat_ngram_size > 0 {
            chain = chain.push(NoRepeatNGram(config.no_repeat_ngram_size));
        }

        if config.is_sampling() {
            if config.temperature != 1.0 {
                chain = chain.push(Temperature(config.temperature));
            }
            if config.top_k > 0 {
                chain = chain.push(TopK {
                    k: config.top_k,
                    min_tokens_to_keep: config.min_tokens_to_keep,
                });
            }
            if config.top_p < 1.0 {
                chain = chain.push(TopP {
                    p: config.top_p,
                    min_tokens_to_keep: config.min_tokens_to_keep,
                });
            }
        }
        chain
    }

    pub fn len(&self) -> usize {
        self.warpers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.warpers.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.warpers.iter().map(|w| w.name()).collect()
    }

    /// Runs every stage in order.
    pub fn apply(&self, history: &[Vec<u32>], scores: ScoreMatrix, step: usize) -> ScoreMatrix {
        self.warpers
            .iter()
            .fold(scores, |scores, warper| warper.warp(history, scores, step))
    }

    /// Runs the chain on a copy of `raw`. Rows left without any selectable
    /// entry fall back to their unfiltered scores.
    pub fn process(&self, history: &[Vec<u32>], raw: &ScoreMatrix, step: usize) -> ScoreMatrix {
        let mut filtered = self.apply(history, raw.clone(), step);
        for (b, mut row) in filtered.outer_iter_mut().enumerate() {
            if count_candidates(row.iter()) == 0 {
                debug!(
                    "step {}: row {} has no candidates after filtering, using unfiltered scores",
                    step, b
                );
                row.assign(&raw.row(b));
            }
        }
        filtered
    }
}

impl std::fmt::Debug for LogitsProcessorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogitsProcessorChain")
            .field("warpers", &self.names())
            .finish()
    }
}
