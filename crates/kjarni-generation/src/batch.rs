//! Padded batch construction and next-token logits extraction.

use ndarray::{s, Array2, Array3, ArrayView1, ArrayView2};

/// Token ids and the matching attention mask for a right-padded batch.
#[derive(Debug, Clone, PartialEq)]
pub struct PaddedBatch {
    /// Shape: `[batch, seq_len]`.
    pub input_ids: Array2<u32>,
    /// 1 for real tokens, 0 for padding. Shape: `[batch, seq_len]`.
    pub attention_mask: Array2<u32>,
}

impl PaddedBatch {
    /// Right-truncates every row to `max_len` (if given), then right-pads to the
    /// longest remaining row with `pad_id`.
    pub fn from_sequences<S: AsRef<[u32]>>(
        sequences: &[S],
        pad_id: u32,
        max_len: Option<usize>,
    ) -> Self {
        let truncated_len = |seq: &S| {
            let len = seq.as_ref().len();
            max_len.map_or(len, |m| len.min(m))
        };
        let batch_size = sequences.len();
        let seq_len = sequences.iter().map(truncated_len).max().unwrap_or(0);

        let mut input_ids = Array2::from_elem((batch_size, seq_len), pad_id);
        let mut attention_mask = Array2::zeros((batch_size, seq_len));

        for (row, seq) in sequences.iter().enumerate() {
            let len = truncated_len(seq);
            for (col, &token) in seq.as_ref()[..len].iter().enumerate() {
                input_ids[[row, col]] = token;
                attention_mask[[row, col]] = 1;
            }
        }

        Self {
            input_ids,
            attention_mask,
        }
    }

    /// A single-column batch, used to feed the most recent token on a cached step.
    pub fn single_column(ids: &[u32], mask: &[u32]) -> Self {
        let n = ids.len();
        Self {
            input_ids: Array2::from_shape_fn((n, 1), |(b, _)| ids[b]),
            attention_mask: Array2::from_shape_fn((n, 1), |(b, _)| mask[b]),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.input_ids.nrows()
    }

    pub fn seq_len(&self) -> usize {
        self.input_ids.ncols()
    }

    /// Number of real (unpadded) tokens in each row.
    pub fn lengths(&self) -> Vec<usize> {
        self.attention_mask
            .rows()
            .into_iter()
            .map(|row| row.iter().filter(|&&m| m != 0).count())
            .collect()
    }
}

/// Appends one column to a running attention mask.
pub fn append_column(mask: &Array2<u32>, column: &[u32]) -> Array2<u32> {
    let (rows, cols) = mask.dim();
    Array2::from_shape_fn((rows, cols + 1), |(b, t)| {
        if t < cols {
            mask[[b, t]]
        } else {
            column[b]
        }
    })
}

/// Index of the last real position in a mask row, or the final column if the row has none.
fn last_real_position(mask_row: ArrayView1<u32>) -> usize {
    mask_row
        .iter()
        .enumerate()
        .filter(|&(_, &m)| m != 0)
        .map(|(i, _)| i)
        .last()
        .unwrap_or_else(|| mask_row.len().saturating_sub(1))
}

/// Picks, for each row, the logits at its last real position within the fed window.
///
/// `logits` has shape `[batch, fed_len, vocab]`; `window_mask` is the part of the
/// attention mask covering the fed positions, shape `[batch, fed_len]`.
pub fn next_token_logits(logits: &Array3<f32>, window_mask: ArrayView2<u32>) -> Array2<f32> {
    let (batch, _, vocab) = logits.dim();
    let mut out = Array2::zeros((batch, vocab));
    for (b, mask_row) in window_mask.rows().into_iter().enumerate() {
        let pos = last_real_position(mask_row);
        out.row_mut(b).assign(&logits.slice(s![b, pos, ..]));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_pad_heterogeneous_lengths() {
        let batch = PaddedBatch::from_sequences(&[vec![5u32, 6, 7], vec![8]], 0, None);

        assert_eq!(batch.input_ids, array![[5u32, 6, 7], [8, 0, 0]]);
        assert_eq!(batch.attention_mask, array![[1u32, 1, 1], [1, 0, 0]]);
        assert_eq!(batch.lengths(), vec![3, 1]);
    }

    #[test]
    fn test_right_truncation() {
        let batch = PaddedBatch::from_sequences(&[vec![1u32, 2, 3, 4], vec![5, 6]], 9, Some(3));

        assert_eq!(batch.seq_len(), 3);
        assert_eq!(batch.input_ids, array![[1u32, 2, 3], [5, 6, 9]]);
        assert_eq!(batch.attention_mask, array![[1u32, 1, 1], [1, 1, 0]]);
    }

    #[test]
    fn test_pad_uses_configured_pad_id() {
        let batch = PaddedBatch::from_sequences(&[vec![1u32], vec![2, 3]], 42, None);
        assert_eq!(batch.input_ids[[0, 1]], 42);
        assert_eq!(batch.attention_mask[[0, 1]], 0);
    }

    #[test]
    fn test_single_column() {
        let batch = PaddedBatch::single_column(&[4, 0], &[1, 0]);
        assert_eq!(batch.input_ids, array![[4u32], [0]]);
        assert_eq!(batch.attention_mask, array![[1u32], [0]]);
    }

    #[test]
    fn test_append_column() {
        let mask = array![[1u32, 1], [1, 0]];
        let grown = append_column(&mask, &[1, 0]);
        assert_eq!(grown, array![[1u32, 1, 1], [1, 0, 0]]);
    }

    #[test]
    fn test_next_token_logits_uses_last_real_position() {
        // batch=2, fed_len=3, vocab=2
        let logits = Array3::from_shape_fn((2, 3, 2), |(b, t, v)| (b * 100 + t * 10 + v) as f32);
        let mask = array![[1u32, 1, 1], [1, 0, 0]];

        let next = next_token_logits(&logits, mask.view());

        assert_eq!(next.row(0).to_vec(), vec![20.0, 21.0]);
        assert_eq!(next.row(1).to_vec(), vec![100.0, 101.0]);
    }

    #[test]
    fn test_next_token_logits_all_padding_row_uses_last_column() {
        let logits = Array3::from_shape_fn((1, 2, 2), |(_, t, v)| (t * 10 + v) as f32);
        let mask = array![[0u32, 0]];

        let next = next_token_logits(&logits, mask.view());
        assert_eq!(next.row(0).to_vec(), vec![10.0, 11.0]);
    }
}
