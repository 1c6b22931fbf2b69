//! # Model Traits
//!
//! The generation engine never runs the network itself. It drives a
//! [`SequenceModel`], an opaque executor that maps token ids, attention masks,
//! an optional encoder context and an optional KV cache to per-position logits.
//!
//! ## Responsibilities
//!
//! 1.  **Engine (`SequenceGenerator`)**: owns the loop, the cache lifetime,
//!     padding, logits processing, sampling and stopping. Knows *when* to run a step.
//! 2.  **Executor (`SequenceModel`)**: the forward pass. Knows *how* to run one.
//!
//! Executors must be deterministic given identical inputs and cache, must not
//! mutate the buffers they are handed, and must return an error rather than
//! zeros when shapes are inconsistent.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use ndarray::{Array2, Array3};

use crate::batch::PaddedBatch;
use crate::cache::CachePair;
use crate::config::GenerationConfig;

/// The two model shapes the engine can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelArchitecture {
    /// Causal LM: every step is conditioned on the growing prefix alone.
    DecoderOnly,
    /// Seq2seq: the source is encoded once into a context read by every step.
    EncoderDecoder,
}

impl ModelArchitecture {
    pub fn is_encoder_decoder(&self) -> bool {
        matches!(self, ModelArchitecture::EncoderDecoder)
    }
}

/// Encoder output, produced once per call and shared read-only by every decoder step.
#[derive(Debug, Clone)]
pub struct EncoderContext {
    /// Shape: `[batch, source_len, hidden]`.
    pub hidden_states: Array3<f32>,
    /// Source attention mask. Shape: `[batch, source_len]`.
    pub attention_mask: Array2<u32>,
}

impl EncoderContext {
    pub fn batch_size(&self) -> usize {
        self.hidden_states.shape()[0]
    }
}

/// Everything handed to the executor for one forward pass.
#[derive(Debug, Clone, Copy)]
pub struct StepInput<'a> {
    /// Shape: `[batch, fed_len]`. The whole prefix on an init step, a single
    /// column on a cached step.
    pub input_ids: &'a Array2<u32>,
    /// Shape: `[batch, past_len + fed_len]`. Covers cached positions too.
    pub attention_mask: &'a Array2<u32>,
    pub encoder_context: Option<&'a EncoderContext>,
    pub cache: Option<&'a CachePair>,
}

impl StepInput<'_> {
    pub fn batch_size(&self) -> usize {
        self.input_ids.nrows()
    }

    pub fn fed_len(&self) -> usize {
        self.input_ids.ncols()
    }
}

/// The result of one forward pass.
#[derive(Debug)]
pub struct StepOutput {
    /// Shape: `[batch, fed_len, vocab]`.
    pub logits: Array3<f32>,
    /// Updated cache, if the executor keeps one.
    pub cache: Option<CachePair>,
}

/// The forward-pass executor driven by the generation loop.
#[async_trait]
pub trait SequenceModel: Send + Sync {
    fn architecture(&self) -> ModelArchitecture;

    fn vocab_size(&self) -> usize;

    /// Longest sequence the model's positional encoding supports.
    fn max_position_embeddings(&self) -> usize;

    fn eos_token_id(&self) -> Option<u32>;

    fn pad_token_id(&self) -> u32;

    /// First decoder token for encoder-decoder models. Defaults to the pad id (T5 convention).
    fn decoder_start_token_id(&self) -> u32 {
        self.pad_token_id()
    }

    fn default_generation_config(&self) -> GenerationConfig {
        GenerationConfig::default()
    }

    /// Runs the encoder once over the padded source batch.
    async fn encode(&self, _input: &PaddedBatch) -> Result<EncoderContext> {
        Err(anyhow!("model has no encoder"))
    }

    /// Runs one forward pass.
    async fn forward_step(&self, input: StepInput<'_>) -> Result<StepOutput>;

    /// Releases a superseded cache pair. The default simply drops it.
    fn release_cache(&self, cache: CachePair) -> Result<()> {
        drop(cache);
        Ok(())
    }
}
