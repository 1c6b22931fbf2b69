//! Generation configuration.
//!
//! `GenerationConfig` is set once per `generate` call and never mutated while
//! the call runs. It deserializes from the usual `generation_config.json`
//! layout; camelCase spellings are accepted as aliases.

use std::collections::BTreeSet;
use std::path::Path;

use log::warn;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{GenerationError, GenerationResult};
use crate::model::SequenceModel;

/// The unified configuration struct for text generation.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct GenerationConfig {
    #[serde(alias = "doSample")]
    pub do_sample: bool,
    /// 0 disables top-k filtering. Negative values in JSON also disable it.
    #[serde(alias = "topK", deserialize_with = "deserialize_top_k")]
    pub top_k: usize,
    /// Values >= 1.0 disable nucleus filtering.
    #[serde(alias = "topP")]
    pub top_p: f32,
    /// 0.0 degenerates to greedy selection.
    pub temperature: f32,
    #[serde(alias = "repetitionPenalty")]
    pub repetition_penalty: f32,
    #[serde(alias = "noRepeatNgramSize")]
    pub no_repeat_ngram_size: usize,
    /// EOS is suppressed until a sequence has generated this many tokens.
    #[serde(alias = "minOutputLength", alias = "min_length")]
    pub min_output_length: usize,
    #[serde(alias = "maxOutputLength", alias = "maxNewTokens", alias = "max_output_length")]
    pub max_new_tokens: usize,
    /// Absolute cap on the running sequence length (prompt or start token included).
    #[serde(alias = "maxTextLength", alias = "max_length")]
    pub max_text_length: Option<usize>,
    /// Prompts and encoder inputs are right-truncated to this length.
    #[serde(alias = "maxInputLength")]
    pub max_input_length: Option<usize>,
    #[serde(alias = "ignoreTokenIds")]
    pub ignore_token_ids: BTreeSet<u32>,
    #[serde(alias = "stopAtEos")]
    pub stop_at_eos: bool,
    /// Overrides the model's end-of-sequence id.
    #[serde(alias = "eosTokenId")]
    pub eos_token_id: Option<u32>,
    #[serde(alias = "randomSeed", alias = "seed")]
    pub random_seed: Option<u64>,
    /// Largest accepted batch; 0 means unbounded.
    #[serde(alias = "batchSize")]
    pub batch_size: usize,
    /// Cross-checked against the model when set.
    #[serde(alias = "vocabSize")]
    pub vocab_size: Option<usize>,
    #[serde(alias = "beamSize", alias = "num_beams")]
    pub beam_size: usize,
    /// Floor on the entries top-k and top-p leave selectable. Defaults to 1,
    /// the smallest floor that still keeps every row samplable.
    #[serde(alias = "minTokensToKeep")]
    pub min_tokens_to_keep: usize,
    #[serde(alias = "useCache")]
    pub use_cache: bool,
    /// Keep the EOS token at the end of a finished sequence.
    #[serde(alias = "includeStopToken")]
    pub include_stop_token: bool,
}

/// Reads `top_k` as a signed integer; anything below zero means "disabled".
fn deserialize_top_k<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: Deserializer<'de>,
{
    let k = i64::deserialize(deserializer)?;
    Ok(usize::try_from(k).unwrap_or(0))
}

/// A sensible default: greedy decoding with the KV cache enabled.
impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            do_sample: false,
            top_k: 50,
            top_p: 1.0,
            temperature: 1.0,
            repetition_penalty: 1.0,
            no_repeat_ngram_size: 0,
            min_output_length: 0,
            max_new_tokens: 50,
            max_text_length: None,
            max_input_length: None,
            ignore_token_ids: BTreeSet::new(),
            stop_at_eos: true,
            eos_token_id: None,
            random_seed: None,
            batch_size: 0,
            vocab_size: None,
            beam_size: 1,
            min_tokens_to_keep: 1,
            use_cache: true,
            include_stop_token: true,
        }
    }
}

impl GenerationConfig {
    /// Arg-max decoding.
    pub fn greedy() -> Self {
        Self::default()
    }

    /// Temperature / top-k / top-p sampling.
    pub fn sampling(temperature: f32, top_k: usize, top_p: f32) -> Self {
        Self {
            do_sample: true,
            temperature,
            top_k,
            top_p,
            ..Self::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.random_seed = Some(seed);
        self
    }

    pub fn with_max_new_tokens(mut self, max_new_tokens: usize) -> Self {
        self.max_new_tokens = max_new_tokens;
        self
    }

    /// Parses a JSON config. Unknown keys are ignored, missing keys take defaults.
    pub fn from_json(json: &str) -> GenerationResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| GenerationError::invalid_config(format!("failed to parse config: {}", e)))
    }

    pub fn from_file(path: impl AsRef<Path>) -> GenerationResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            GenerationError::invalid_config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }

    /// True when decoding draws from the distribution instead of taking the arg-max.
    ///
    /// `temperature == 0` always selects greedy decoding.
    pub fn is_sampling(&self) -> bool {
        self.do_sample && self.temperature > 0.0
    }

    /// The EOS id that stops a sequence, if stopping at EOS is enabled.
    pub fn stop_token(&self, model: &dyn SequenceModel) -> Option<u32> {
        if self.stop_at_eos {
            self.eos_token_id.or_else(|| model.eos_token_id())
        } else {
            None
        }
    }

    /// The EOS id used for min-length suppression, regardless of `stop_at_eos`.
    pub fn eos_token(&self, model: &dyn SequenceModel) -> Option<u32> {
        self.eos_token_id.or_else(|| model.eos_token_id())
    }

    /// Checks value ranges that do not depend on a model.
    pub fn validate_ranges(&self) -> GenerationResult<()> {
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(GenerationError::invalid_config(format!(
                "top_p must be in [0, 1], got {}",
                self.top_p
            )));
        }
        if self.temperature.is_nan() || self.temperature < 0.0 {
            return Err(GenerationError::invalid_config(format!(
                "temperature must be >= 0, got {}",
                self.temperature
            )));
        }
        if self.repetition_penalty.is_nan() || self.repetition_penalty < 1.0 {
            return Err(GenerationError::invalid_config(format!(
                "repetition_penalty must be >= 1, got {}",
                self.repetition_penalty
            )));
        }
        if let Some(max_text) = self.max_text_length {
            if max_text == 0 {
                return Err(GenerationError::invalid_config(
                    "max_text_length must be positive",
                ));
            }
        }
        if let Some(0) = self.max_input_length {
            return Err(GenerationError::invalid_config(
                "max_input_length must be positive",
            ));
        }
        Ok(())
    }

    /// Validates the config against the model's limits.
    pub fn validate(&self, model: &dyn SequenceModel) -> GenerationResult<()> {
        self.validate_ranges()?;

        let limit = model.max_position_embeddings();
        if let Some(max_text) = self.max_text_length {
            if max_text > limit {
                return Err(GenerationError::invalid_config(format!(
                    "max_text_length {} exceeds the model's positional limit {}",
                    max_text, limit
                )));
            }
        }
        if let Some(max_input) = self.max_input_length {
            if max_input > limit {
                return Err(GenerationError::invalid_config(format!(
                    "max_input_length {} exceeds the model's positional limit {}",
                    max_input, limit
                )));
            }
        }

        let vocab = model.vocab_size();
        if let Some(v) = self.vocab_size {
            if v != vocab {
                return Err(GenerationError::invalid_config(format!(
                    "vocab_size {} does not match the model's vocabulary of {}",
                    v, vocab
                )));
            }
        }
        if let Some(eos) = self.stop_token(model) {
            if eos as usize >= vocab {
                return Err(GenerationError::invalid_config(format!(
                    "eos_token_id {} is outside the vocabulary of {}",
                    eos, vocab
                )));
            }
        }

        if self.beam_size > 1 {
            warn!(
                "beam_size={} requested, but only single-candidate decoding is supported. Decoding with 1 beam.",
                self.beam_size
            );
        }
        Ok(())
    }

    /// Validates the batch shape against the config.
    pub fn validate_batch(&self, batch: &[Vec<u32>]) -> GenerationResult<()> {
        if batch.is_empty() {
            return Err(GenerationError::invalid_config("input batch is empty"));
        }
        if self.batch_size > 0 && batch.len() > self.batch_size {
            return Err(GenerationError::invalid_config(format!(
                "batch of {} sequences exceeds batch_size {}",
                batch.len(),
                self.batch_size
            )));
        }
        if let Some(idx) = batch.iter().position(|seq| seq.is_empty()) {
            return Err(GenerationError::invalid_config(format!(
                "input sequence {} is empty",
                idx
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_greedy() {
        let config = GenerationConfig::default();
        assert!(!config.is_sampling());
        assert_eq!(config.beam_size, 1);
        assert!(config.use_cache);
        assert!(config.validate_ranges().is_ok());
    }

    #[test]
    fn test_zero_temperature_is_not_sampling() {
        let config = GenerationConfig::sampling(0.0, 10, 0.9);
        assert!(config.do_sample);
        assert!(!config.is_sampling());
        assert!(config.validate_ranges().is_ok());
    }

    #[test]
    fn test_top_p_out_of_range_rejected() {
        let mut config = GenerationConfig::default();
        config.top_p = 1.5;
        assert!(config.validate_ranges().unwrap_err().is_config_error());

        config.top_p = -0.1;
        assert!(config.validate_ranges().is_err());
    }

    #[test]
    fn test_negative_temperature_rejected() {
        let config = GenerationConfig::sampling(-1.0, 0, 1.0);
        assert!(config.validate_ranges().is_err());
    }

    #[test]
    fn test_repetition_penalty_below_one_rejected() {
        let mut config = GenerationConfig::default();
        config.repetition_penalty = 0.5;
        assert!(config.validate_ranges().is_err());
    }

    #[test]
    fn test_from_json_camel_case_aliases() {
        let json = r#"{
            "doSample": true,
            "topK": 5,
            "topP": 0.8,
            "temperature": 0.7,
            "maxNewTokens": 12,
            "noRepeatNgramSize": 2,
            "ignoreTokenIds": [3, 4],
            "randomSeed": 42
        }"#;
        let config = GenerationConfig::from_json(json).unwrap();
        assert!(config.do_sample);
        assert_eq!(config.top_k, 5);
        assert_eq!(config.max_new_tokens, 12);
        assert_eq!(config.no_repeat_ngram_size, 2);
        assert!(config.ignore_token_ids.contains(&3));
        assert_eq!(config.random_seed, Some(42));
        // Unspecified fields keep their defaults.
        assert!(config.use_cache);
        assert_eq!(config.min_tokens_to_keep, 1);
    }

    #[test]
    fn test_from_json_snake_case() {
        let json = r#"{ "max_output_length": 7, "stop_at_eos": false }"#;
        let config = GenerationConfig::from_json(json).unwrap();
        assert_eq!(config.max_new_tokens, 7);
        assert!(!config.stop_at_eos);
    }

    #[test]
    fn test_negative_max_new_tokens_is_config_error() {
        let err = GenerationConfig::from_json(r#"{ "maxNewTokens": -1 }"#).unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_negative_top_k_disables_filtering() {
        let config = GenerationConfig::from_json(r#"{ "topK": -1 }"#).unwrap();
        assert_eq!(config.top_k, 0);

        let config = GenerationConfig::from_json(r#"{ "top_k": 7 }"#).unwrap();
        assert_eq!(config.top_k, 7);
    }

    #[test]
    fn test_validate_batch() {
        let config = GenerationConfig {
            batch_size: 2,
            ..Default::default()
        };
        assert!(config.validate_batch(&[vec![1], vec![2]]).is_ok());
        assert!(config.validate_batch(&[]).is_err());
        assert!(config.validate_batch(&[vec![1], vec![]]).is_err());
        assert!(config.validate_batch(&[vec![1], vec![2], vec![3]]).is_err());
    }

    #[test]
    fn test_builder_helpers() {
        let config = GenerationConfig::sampling(0.7, 40, 0.95)
            .with_seed(7)
            .with_max_new_tokens(3);
        assert!(config.is_sampling());
        assert_eq!(config.random_seed, Some(7));
        assert_eq!(config.max_new_tokens, 3);
    }
}
