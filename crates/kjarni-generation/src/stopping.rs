//! Per-sequence stopping rules.

use serde::Serialize;

use crate::sequence::Sequence;

/// Why a sequence stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopReason {
    /// The end-of-sequence token was sampled.
    EndOfSequence,
    /// The generated-token budget was used up.
    MaxNewTokens,
    /// The running sequence hit the absolute length cap.
    MaxTextLength,
}

/// `Running -> Done` state of one sequence. There is no way back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SequenceStatus {
    #[default]
    Running,
    Done(StopReason),
}

impl SequenceStatus {
    pub fn is_done(&self) -> bool {
        matches!(self, SequenceStatus::Done(_))
    }

    pub fn reason(&self) -> Option<StopReason> {
        match self {
            SequenceStatus::Done(reason) => Some(*reason),
            SequenceStatus::Running => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoppingCriteria {
    /// `None` when stopping at EOS is disabled.
    pub eos_token_id: Option<u32>,
    pub max_new_tokens: usize,
    pub max_text_length: Option<usize>,
}

impl StoppingCriteria {
    pub fn new(
        eos_token_id: Option<u32>,
        max_new_tokens: usize,
        max_text_length: Option<usize>,
    ) -> Self {
        Self {
            eos_token_id,
            max_new_tokens,
            max_text_length,
        }
    }

    /// Decides whether a sequence that just appended `token` is done.
    ///
    /// `generated` and `total_len` already include `token`. EOS wins over the
    /// length caps when several rules fire on the same step.
    pub fn evaluate(&self, token: u32, generated: usize, total_len: usize) -> Option<StopReason> {
        if self.eos_token_id == Some(token) {
            return Some(StopReason::EndOfSequence);
        }
        if generated >= self.max_new_tokens {
            return Some(StopReason::MaxNewTokens);
        }
        if let Some(max_text) = self.max_text_length {
            if total_len >= max_text {
                return Some(StopReason::MaxTextLength);
            }
        }
        None
    }

    /// Whether a sequence should stop before producing anything, e.g. when its
    /// prompt already fills the length cap.
    pub fn evaluate_initial(&self, total_len: usize) -> Option<StopReason> {
        if self.max_new_tokens == 0 {
            return Some(StopReason::MaxNewTokens);
        }
        match self.max_text_length {
            Some(max_text) if total_len >= max_text => Some(StopReason::MaxTextLength),
            _ => None,
        }
    }
}

/// Loop-level stop condition: every sequence is done.
pub fn all_done(sequences: &[Sequence]) -> bool {
    sequences.iter().all(|s| s.is_done())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eos_stops() {
        let criteria = StoppingCriteria::new(Some(0), 5, None);
        assert_eq!(criteria.evaluate(0, 3, 6), Some(StopReason::EndOfSequence));
        assert_eq!(criteria.evaluate(4, 3, 6), None);
    }

    #[test]
    fn test_eos_disabled() {
        let criteria = StoppingCriteria::new(None, 5, None);
        assert_eq!(criteria.evaluate(0, 3, 6), None);
    }

    #[test]
    fn test_max_new_tokens_boundary() {
        let criteria = StoppingCriteria::new(Some(0), 5, None);
        assert_eq!(criteria.evaluate(7, 4, 10), None);
        assert_eq!(criteria.evaluate(7, 5, 11), Some(StopReason::MaxNewTokens));
    }

    #[test]
    fn test_max_text_length() {
        let criteria = StoppingCriteria::new(None, 100, Some(8));
        assert_eq!(criteria.evaluate(3, 2, 7), None);
        assert_eq!(criteria.evaluate(3, 3, 8), Some(StopReason::MaxTextLength));
    }

    #[test]
    fn test_eos_takes_precedence() {
        let criteria = StoppingCriteria::new(Some(1), 2, Some(4));
        assert_eq!(criteria.evaluate(1, 2, 4), Some(StopReason::EndOfSequence));
    }

    #[test]
    fn test_initial_checks() {
        assert_eq!(
            StoppingCriteria::new(None, 0, None).evaluate_initial(3),
            Some(StopReason::MaxNewTokens)
        );
        assert_eq!(
            StoppingCriteria::new(None, 4, Some(3)).evaluate_initial(3),
            Some(StopReason::MaxTextLength)
        );
        assert_eq!(StoppingCriteria::new(None, 4, Some(5)).evaluate_initial(3), None);
    }

    #[test]
    fn test_status_transitions() {
        let status = SequenceStatus::default();
        assert!(!status.is_done());
        assert_eq!(status.reason(), None);

        let done = SequenceStatus::Done(StopReason::MaxNewTokens);
        assert!(done.is_done());
        assert_eq!(done.reason(), Some(StopReason::MaxNewTokens));
    }
}
