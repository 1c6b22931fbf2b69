//! Per-row decoding state.

use crate::stopping::{SequenceStatus, StopReason, StoppingCriteria};

/// One member of the batch, owned by the decoding loop for the duration of a call.
#[derive(Debug, Clone, PartialEq)]
pub struct Sequence {
    /// Position in the caller's batch.
    pub index: usize,
    /// Running prefix: the prompt (decoder-only) or start token (encoder-decoder),
    /// followed by every generated token.
    pub tokens: Vec<u32>,
    /// Length of the seed part of `tokens`.
    pub prefix_len: usize,
    /// Number of tokens appended so far.
    pub generated: usize,
    pub status: SequenceStatus,
}

impl Sequence {
    pub fn new(index: usize, prefix: Vec<u32>) -> Self {
        let prefix_len = prefix.len();
        Self {
            index,
            tokens: prefix,
            prefix_len,
            generated: 0,
            status: SequenceStatus::Running,
        }
    }

    pub fn is_done(&self) -> bool {
        self.status.is_done()
    }

    pub fn last_token(&self) -> Option<u32> {
        self.tokens.last().copied()
    }

    pub fn finish(&mut self, reason: StopReason) {
        if !self.is_done() {
            self.status = SequenceStatus::Done(reason);
        }
    }

    /// Appends a sampled token and updates the stop state.
    ///
    /// Returns `false` without touching the sequence once it is done, so a
    /// finished row's stream stays frozen at its transition point.
    pub fn push(&mut self, token: u32, criteria: &StoppingCriteria) -> bool {
        if self.is_done() {
            return false;
        }
        self.tokens.push(token);
        self.generated += 1;
        if let Some(reason) = criteria.evaluate(token, self.generated, self.tokens.len()) {
            self.status = SequenceStatus::Done(reason);
        }
        true
    }

    /// The generated tokens, optionally dropping a trailing EOS.
    pub fn output(&self, include_stop_token: bool) -> Vec<u32> {
        let generated = &self.tokens[self.prefix_len..];
        if !include_stop_token && self.status == SequenceStatus::Done(StopReason::EndOfSequence) {
            generated[..generated.len().saturating_sub(1)].to_vec()
        } else {
            generated.to_vec()
        }
    }

    pub fn into_output(self, include_stop_token: bool) -> Vec<u32> {
        self.output(include_stop_token)
    }
}
