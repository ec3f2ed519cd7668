//! Masked next-token loss

use candle_core::{Result, Tensor, D};
use candle_nn::ops::log_softmax;

/// Mean cross-entropy over positions whose target token is marked in `loss_mask`.
///
/// Position `t` of the logits predicts token `t + 1`, so the target at `t`
/// contributes only when `loss_mask[t + 1] == 1.0`. A batch without a single
/// marked target yields a zero loss that still belongs to the graph.
pub fn masked_next_token_loss(logits: &Tensor, input_ids: &Tensor, loss_mask: &Tensor) -> Result<Tensor> {
    let (batch_size, seq_len, vocab_size) = logits.dims3()?;
    if seq_len < 2 {
        return logits.sum_all()? * 0.0;
    }
    let n = batch_size * (seq_len - 1);

    let logits = logits.narrow(1, 0, seq_len - 1)?.reshape((n, vocab_size))?;
    let targets = input_ids.narrow(1, 1, seq_len - 1)?.reshape((n, 1))?;
    let mask = loss_mask.narrow(1, 1, seq_len - 1)?.reshape(n)?;

    let log_probs = log_softmax(&logits, D::Minus1)?;
    let target_log_probs = log_probs.gather(&targets, 1)?.squeeze(1)?;

    let total = target_log_probs.mul(&mask)?.sum_all()?.neg()?;
    let count = mask.sum_all()?.maximum(1.0)?;
    total.div(&count)
}
