//! Causal grouped-query self-attention with rotary position embeddings

use candle_core::{DType, Device, Result, Tensor, D};
use candle_nn::{Linear, VarBuilder};

use crate::config::DecoderConfig;
use crate::model::project;

pub struct CausalSelfAttention {
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    rope_theta: f64,

    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
}

impl CausalSelfAttention {
    /// Bias-free `q_proj`, `k_proj`, `v_proj` and `o_proj` under `vb`, as in a Llama `self_attn` block.
    pub fn new(config: &DecoderConfig, vb: VarBuilder) -> Result<Self> {
        let num_heads = config.num_attention_heads;
        let num_kv_heads = config.num_kv_heads();
        if num_kv_heads == 0 || num_heads % num_kv_heads != 0 {
            candle_core::bail!("num_attention_heads {num_heads} must be a multiple of num_key_value_heads {num_kv_heads}");
        }
        let head_dim = config.head_dim();
        let hidden_size = config.hidden_size;

        let q_proj = candle_nn::linear_no_bias(hidden_size, num_heads * head_dim, vb.pp("q_proj"))?;
        let k_proj = candle_nn::linear_no_bias(hidden_size, num_kv_heads * head_dim, vb.pp("k_proj"))?;
        let v_proj = candle_nn::linear_no_bias(hidden_size, num_kv_heads * head_dim, vb.pp("v_proj"))?;
        let o_proj = candle_nn::linear_no_bias(num_heads * head_dim, hidden_size, vb.pp("o_proj"))?;

        Ok(Self {
            num_heads,
            num_kv_heads,
            head_dim,
            rope_theta: config.rope_theta,
            q_proj,
            k_proj,
            v_proj,
            o_proj,
        })
    }

    /// `hidden_states`: (batch, seq, hidden) in `dtype`. Padding sits to the right of
    /// every real token, so the causal mask alone keeps it out of real positions.
    pub fn forward(&self, hidden_states: &Tensor, dtype: DType) -> Result<Tensor> {
        let (_batch, seq_len, _) = hidden_states.dims3()?;

        let q = self.split_heads(&project(&self.q_proj, hidden_states, dtype)?, self.num_heads)?;
        let k = self.split_heads(&project(&self.k_proj, hidden_states, dtype)?, self.num_kv_heads)?;
        let v = self.split_heads(&project(&self.v_proj, hidden_states, dtype)?, self.num_kv_heads)?;

        let (cos, sin) = rope_tables(seq_len, self.head_dim, self.rope_theta, q.device())?;
        let (cos, sin) = (cos.to_dtype(dtype)?, sin.to_dtype(dtype)?);
        let q = apply_rope(&q, &cos, &sin)?;
        let k = apply_rope(&k, &cos, &sin)?;

        let n_rep = self.num_heads / self.num_kv_heads;
        let k = repeat_kv(k, n_rep)?;
        let v = repeat_kv(v, n_rep)?;

        let scale = (self.head_dim as f64).sqrt();
        let k_t = k.transpose(2, 3)?.contiguous()?;
        let scores = (q.matmul(&k_t)? / scale)?;

        // Softmax in F32 whatever the compute dtype.
        let mask = causal_mask(seq_len, scores.device())?;
        let scores = scores.to_dtype(DType::F32)?.broadcast_add(&mask)?;
        let probs = candle_nn::ops::softmax(&scores, D::Minus1)?.to_dtype(dtype)?;

        let context = probs.matmul(&v)?;
        let context = self.merge_heads(&context)?;
        project(&self.o_proj, &context, dtype)
    }

    // (batch, seq, heads * head_dim) -> (batch, heads, seq, head_dim)
    fn split_heads(&self, x: &Tensor, heads: usize) -> Result<Tensor> {
        let (batch_size, seq_len, _) = x.dims3()?;
        x.reshape((batch_size, seq_len, heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    // (batch, heads, seq, head_dim) -> (batch, seq, heads * head_dim)
    fn merge_heads(&self, x: &Tensor) -> Result<Tensor> {
        let (batch_size, _, seq_len, _) = x.dims4()?;
        x.transpose(1, 2)?
            .contiguous()?
            .reshape((batch_size, seq_len, self.num_heads * self.head_dim))
    }
}

/// Each key/value head serves `n_rep` consecutive query heads.
fn repeat_kv(x: Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x);
    }
    let (batch_size, kv_heads, seq_len, head_dim) = x.dims4()?;
    Tensor::cat(&vec![&x; n_rep], 2)?.reshape((batch_size, kv_heads * n_rep, seq_len, head_dim))
}

/// cos/sin tables of shape (seq_len, head_dim), F32.
fn rope_tables(seq_len: usize, head_dim: usize, theta: f64, device: &Device) -> Result<(Tensor, Tensor)> {
    let half = head_dim / 2;
    let inv_freq: Vec<f32> = (0..half)
        .map(|i| 1.0 / theta.powf(2.0 * i as f64 / head_dim as f64) as f32)
        .collect();
    let inv_freq = Tensor::from_vec(inv_freq, (1, half), device)?;
    let positions: Vec<f32> = (0..seq_len).map(|p| p as f32).collect();
    let positions = Tensor::from_vec(positions, (seq_len, 1), device)?;

    let freqs = positions.broadcast_mul(&inv_freq)?;
    let emb = Tensor::cat(&[&freqs, &freqs], 1)?;
    Ok((emb.cos()?, emb.sin()?))
}

fn apply_rope(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    let head_dim = x.dim(D::Minus1)?;
    let half = head_dim / 2;
    let x1 = x.narrow(D::Minus1, 0, half)?;
    let x2 = x.narrow(D::Minus1, half, half)?;
    let rotated = Tensor::cat(&[&x2.neg()?, &x1], D::Minus1)?;

    x.broadcast_mul(cos)?.add(&rotated.broadcast_mul(sin)?)
}

fn causal_mask(seq_len: usize, device: &Device) -> Result<Tensor> {
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j > i { -1e9 } else { 0.0 }))
        .collect();
    Tensor::from_vec(mask, (1, 1, seq_len, seq_len), device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    #[test]
    fn test_attention_shape() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = DecoderConfig { num_key_value_heads: Some(2), ..DecoderConfig::tiny(10) };
        let attn = CausalSelfAttention::new(&config, vb)?;

        let hidden = Tensor::randn(0f32, 1.0, (2, 7, 32), &device)?;
        let output = attn.forward(&hidden, DType::F32)?;
        assert_eq!(output.dims(), &[2, 7, 32]);

        let names: Vec<String> = varmap.data().lock().unwrap().keys().cloned().collect();
        assert!(names.iter().all(|n| n.ends_with("_proj.weight")), "{names:?}");
        assert_eq!(varmap.data().lock().unwrap()["k_proj.weight"].dims(), &[16, 32]);
        Ok(())
    }

    #[test]
    fn test_kv_heads_are_shared_by_consecutive_query_heads() -> Result<()> {
        let device = Device::Cpu;
        let kv = Tensor::arange(0f32, 4.0, &device)?.reshape((1, 2, 1, 2))?;
        let repeated = repeat_kv(kv, 2)?;
        assert_eq!(repeated.dims(), &[1, 4, 1, 2]);
        assert_eq!(
            repeated.flatten_all()?.to_vec1::<f32>()?,
            vec![0., 1., 0., 1., 2., 3., 2., 3.]
        );
        Ok(())
    }

    #[test]
    fn test_earlier_positions_ignore_later_tokens() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = DecoderConfig { hidden_size: 16, num_attention_heads: 2, ..DecoderConfig::tiny(10) };
        let attn = CausalSelfAttention::new(&config, vb)?;

        let prefix = Tensor::randn(0f32, 1.0, (1, 3, 16), &device)?;
        let tail_a = Tensor::randn(0f32, 1.0, (1, 2, 16), &device)?;
        let tail_b = Tensor::randn(0f32, 1.0, (1, 2, 16), &device)?;

        let out_a = attn.forward(&Tensor::cat(&[&prefix, &tail_a], 1)?, DType::F32)?;
        let out_b = attn.forward(&Tensor::cat(&[&prefix, &tail_b], 1)?, DType::F32)?;

        let diff = (out_a.narrow(1, 0, 3)? - out_b.narrow(1, 0, 3)?)?
            .abs()?
            .max_all()?
            .to_scalar::<f32>()?;
        assert!(diff < 1e-5, "prefix outputs changed by {diff}");
        Ok(())
    }

    #[test]
    fn test_rope_preserves_norm() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1.0, (1, 1, 5, 8), &device)?;
        let (cos, sin) = rope_tables(5, 8, 10000.0, &device)?;
        let rotated = apply_rope(&x, &cos, &sin)?;

        let before = x.sqr()?.sum_all()?.to_scalar::<f32>()?;
        let after = rotated.sqr()?.sum_all()?.to_scalar::<f32>()?;
        assert!((before - after).abs() < 1e-3);
        Ok(())
    }
}
