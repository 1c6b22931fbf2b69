//! Error definitions for the generation engine.

use thiserror::Error;

/// Errors that can occur during a `generate` call.
///
/// A call either returns every sequence or one of these errors; partial output
/// is never surfaced.
#[derive(Debug, Error)]
pub enum GenerationError {
    /// Invalid configuration or input batch, reported before the model is invoked.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The model's encoder or forward pass failed.
    #[error("Executor failed{}{}: {source}", fmt_step(.step), fmt_batch(.batch_index))]
    Executor {
        step: Option<usize>,
        batch_index: Option<usize>,
        #[source]
        source: anyhow::Error,
    },

    /// The model returned logits of an unexpected shape.
    #[error("Executor returned logits of shape {actual:?} at step {step}, expected {expected:?}")]
    ShapeMismatch {
        step: usize,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// The model returned NaN scores for a row.
    #[error("Executor returned NaN logits at step {step} for batch index {batch_index}")]
    NonFiniteLogits { step: usize, batch_index: usize },
}

impl GenerationError {
    pub(crate) fn invalid_config(msg: impl Into<String>) -> Self {
        GenerationError::InvalidConfig(msg.into())
    }

    pub(crate) fn executor(step: Option<usize>, source: anyhow::Error) -> Self {
        GenerationError::Executor {
            step,
            batch_index: None,
            source,
        }
    }

    /// True for errors raised before any executor call.
    pub fn is_config_error(&self) -> bool {
        matches!(self, GenerationError::InvalidConfig(_))
    }
}

fn fmt_step(step: &Option<usize>) -> String {
    match step {
        Some(s) => format!(" at step {}", s),
        None => " during encoder pass".to_string(),
    }
}

fn fmt_batch(batch_index: &Option<usize>) -> String {
    match batch_index {
        Some(b) => format!(" (batch index {})", b),
        None => String::new(),
    }
}

/// Result type for generation operations.
pub type GenerationResult<T> = Result<T, GenerationError>;
