//! Variable-length examples → one right-padded rectangular batch

use candle_core::{Device, Tensor};

use pairtune_core::{Result, TuneError};

use crate::example::EncodedExample;

/// Row-major `(rows, seq_len)` token ids and loss mask.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub rows: usize,
    pub seq_len: usize,
    pub token_ids: Vec<u32>,
    pub loss_mask: Vec<bool>,
}

impl Batch {
    pub fn row_ids(&self, row: usize) -> &[u32] {
        &self.token_ids[row * self.seq_len..(row + 1) * self.seq_len]
    }

    pub fn row_mask(&self, row: usize) -> &[bool] {
        &self.loss_mask[row * self.seq_len..(row + 1) * self.seq_len]
    }

    /// Supervised next-token targets, i.e. marked positions past column 0.
    pub fn target_count(&self) -> usize {
        (0..self.rows)
            .map(|r| self.row_mask(r).iter().skip(1).filter(|m| **m).count())
            .sum()
    }

    /// `(token_ids: u32, loss_mask: f32)` tensors of shape `(rows, seq_len)`.
    pub fn to_tensors(&self, device: &Device) -> Result<(Tensor, Tensor)> {
        let shape = (self.rows, self.seq_len);
        let ids = Tensor::from_slice(&self.token_ids, shape, device)?;
        let mask: Vec<f32> = self.loss_mask.iter().map(|&m| if m { 1.0 } else { 0.0 }).collect();
        let mask = Tensor::from_vec(mask, shape, device)?;
        Ok((ids, mask))
    }
}

/// Pad every example on the right to the longest one. Rows keep input order.
pub fn collate(examples: &[EncodedExample], pad_id: u32) -> Result<Batch> {
    let seq_len = examples
        .iter()
        .map(EncodedExample::len)
        .max()
        .ok_or(TuneError::EmptyBatch)?;

    let mut token_ids = Vec::with_capacity(examples.len() * seq_len);
    let mut loss_mask = Vec::with_capacity(examples.len() * seq_len);
    for example in examples {
        let pad = seq_len - example.len();
        token_ids.extend_from_slice(&example.token_ids);
        token_ids.extend(std::iter::repeat(pad_id).take(pad));
        loss_mask.extend_from_slice(&example.loss_mask);
        loss_mask.extend(std::iter::repeat(false).take(pad));
    }

    Ok(Batch {
        rows: examples.len(),
        seq_len,
        token_ids,
        loss_mask,
    })
}
