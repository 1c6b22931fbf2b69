//! Autoregressive sequence generation engine.
//!
//! Drives a pluggable forward-pass executor ([`SequenceModel`]) through the
//! decode loop: padded batching, KV-cache lifetime, logits processing,
//! greedy or multinomial sampling and per-sequence stopping. Works for both
//! decoder-only and encoder-decoder models.

pub mod batch;
pub mod cache;
pub mod config;
pub mod error;
pub mod generator;
pub mod logits;
pub mod model;
pub mod sampler;
pub mod sequence;
pub mod stopping;

// Re-export commonly used items
pub use crate::{
    batch::PaddedBatch,
    cache::{CachePair, KvCacheManager, StepMode},
    config::GenerationConfig,
    error::{GenerationError, GenerationResult},
    generator::{GenerationOutput, SequenceGenerator, StepTokens},
    logits::{LogitsProcessorChain, LogitsWarper, ScoreMatrix},
    model::{EncoderContext, ModelArchitecture, SequenceModel, StepInput, StepOutput},
    sampler::Sampler,
    sequence::Sequence,
    stopping::{SequenceStatus, StopReason, StoppingCriteria},
};

// Prelude for easy imports
pub mod prelude {
    pub use crate::config::GenerationConfig;
    pub use crate::error::{GenerationError, GenerationResult};
    pub use crate::generator::SequenceGenerator;
    pub use crate::model::{
        EncoderContext, ModelArchitecture, SequenceModel, StepInput, StepOutput,
    };
}
