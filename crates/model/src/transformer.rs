use std::cell::Cell;

use candle_core::{DType, Device, Error, Result, Tensor, Var, D};
use candle_nn::{
    embedding, linear_no_bias, loss, ops, rms_norm, Dropout, Embedding, Linear, Module, RmsNorm,
    VarBuilder, VarMap,
};

use crate::args::ModelArgs;

const ROPE_THETA: f64 = 10_000.0;

/// Decoder-only transformer with rotary attention and a SwiGLU feed-forward,
/// producing next-token logits over the vocabulary.
pub struct Transformer {
    args: ModelArgs,
    device: Device,
    dtype: DType,
    varmap: VarMap,
    tok_embeddings: Embedding,
    layers: Vec<Block>,
    final_norm: RmsNorm,
    lm_head: Linear,
    dropout: Dropout,
    rope_cos: Tensor,
    rope_sin: Tensor,
    training: Cell<bool>,
}

struct Block {
    attention_norm: RmsNorm,
    wq: Linear,
    wk: Linear,
    wv: Linear,
    wo: Linear,
    ffn_norm: RmsNorm,
    w1: Linear,
    w2: Linear,
    w3: Linear,
    attn_dropout: Dropout,
    resid_dropout: Dropout,
    n_heads: usize,
    head_dim: usize,
}

impl Transformer {
    pub fn new(args: ModelArgs, device: &Device, dtype: DType) -> Result<Self> {
        args.validate()?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, dtype, device);

        let tok_embeddings = embedding(args.vocab_size, args.dim, vb.pp("tok_embeddings"))?;
        let hidden_dim = args.ffn_hidden_dim();

        let mut layers = Vec::with_capacity(args.n_layers);
        for idx in 0..args.n_layers {
            layers.push(Block::new(&args, hidden_dim, vb.pp(format!("layers.{idx}")))?);
        }

        let final_norm = rms_norm(args.dim, args.norm_eps, vb.pp("norm"))?;
        let lm_head = linear_no_bias(args.dim, args.vocab_size, vb.pp("output"))?;
        let dropout = Dropout::new(args.dropout);

        let (rope_cos, rope_sin) = build_rope_tables(&args, device, dtype)?;

        Ok(Self {
            args,
            device: device.clone(),
            dtype,
            varmap,
            tok_embeddings,
            layers,
            final_norm,
            lm_head,
            dropout,
            rope_cos,
            rope_sin,
            training: Cell::new(true),
        })
    }

    pub fn args(&self) -> &ModelArgs {
        &self.args
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn is_training(&self) -> bool {
        self.training.get()
    }

    /// Toggles dropout behavior. Interior mutability so read-only evaluation
    /// paths can flip modes without exclusive access to the model.
    pub fn set_training(&self, training: bool) {
        self.training.set(training);
    }

    /// Named trainable parameters, sorted by name for deterministic
    /// checkpoint and optimizer ordering.
    pub fn named_parameters(&self) -> Vec<(String, Var)> {
        let data = self.varmap.data().lock().unwrap();
        let mut params: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));
        params
    }

    /// Precomputed rotary tables, shaped `(max_context_length, head_dim / 2)`.
    pub fn rope_tables(&self) -> (&Tensor, &Tensor) {
        (&self.rope_cos, &self.rope_sin)
    }

    pub fn num_parameters(&self) -> usize {
        self.varmap
            .all_vars()
            .iter()
            .map(|var| var.as_tensor().elem_count())
            .sum()
    }

    /// Logits shaped `(batch, seq, vocab_size)`.
    pub fn forward(&self, tokens: &Tensor) -> Result<Tensor> {
        let (_batch, seq) = tokens.dims2()?;
        if seq > self.args.max_context_length {
            return Err(Error::Msg(format!(
                "sequence length {} exceeds max_context_length {}",
                seq, self.args.max_context_length
            )));
        }

        let train = self.training.get();
        let mut hidden = self.tok_embeddings.forward(tokens)?;
        hidden = self.dropout.forward(&hidden, train)?;

        let mask = causal_mask(seq, self.dtype, &self.device)?;
        let cos = self.rope_cos.narrow(0, 0, seq)?;
        let sin = self.rope_sin.narrow(0, 0, seq)?;

        for layer in &self.layers {
            hidden = layer.forward(&hidden, &mask, &cos, &sin, train)?;
        }

        let hidden = self.final_norm.forward(&hidden)?;
        self.lm_head.forward(&hidden)
    }

    /// Forward pass plus mean cross-entropy against the shifted targets.
    pub fn forward_train(&self, tokens: &Tensor, targets: &Tensor) -> Result<(Tensor, Tensor)> {
        let logits = self.forward(tokens)?;
        let (batch, seq, vocab) = logits.dims3()?;
        let flat_logits = logits.reshape((batch * seq, vocab))?.to_dtype(DType::F32)?;
        let flat_targets = targets.reshape(batch * seq)?;
        let loss = loss::cross_entropy(&flat_logits, &flat_targets)?;
        Ok((logits, loss))
    }

    /// Model-flops-utilization for one optimizer step, as a fraction of the
    /// accelerator's promised peak. PaLM appendix B estimate: 6N per token
    /// plus the attention term.
    pub fn estimate_mfu(&self, effective_batch: usize, dt_secs: f64, flops_promised: f64) -> f64 {
        let n = self.num_parameters() as f64;
        let l = self.args.n_layers as f64;
        let h = self.args.n_heads as f64;
        let q = self.args.head_dim() as f64;
        let t = self.args.max_context_length as f64;

        let flops_per_token = 6.0 * n + 12.0 * l * h * q * t;
        let flops_per_fwdbwd = flops_per_token * t;
        let flops_per_iter = flops_per_fwdbwd * effective_batch as f64;
        if dt_secs <= 0.0 || flops_promised <= 0.0 {
            return 0.0;
        }
        (flops_per_iter / dt_secs) / flops_promised
    }
}

impl Block {
    fn new(args: &ModelArgs, hidden_dim: usize, vb: VarBuilder) -> Result<Self> {
        let dim = args.dim;
        Ok(Self {
            attention_norm: rms_norm(dim, args.norm_eps, vb.pp("attention_norm"))?,
            wq: linear_no_bias(dim, dim, vb.pp("attention.wq"))?,
            wk: linear_no_bias(dim, dim, vb.pp("attention.wk"))?,
            wv: linear_no_bias(dim, dim, vb.pp("attention.wv"))?,
            wo: linear_no_bias(dim, dim, vb.pp("attention.wo"))?,
            ffn_norm: rms_norm(dim, args.norm_eps, vb.pp("ffn_norm"))?,
            w1: linear_no_bias(dim, hidden_dim, vb.pp("feed_forward.w1"))?,
            w2: linear_no_bias(hidden_dim, dim, vb.pp("feed_forward.w2"))?,
            w3: linear_no_bias(dim, hidden_dim, vb.pp("feed_forward.w3"))?,
            attn_dropout: Dropout::new(args.dropout),
            resid_dropout: Dropout::new(args.dropout),
            n_heads: args.n_heads,
            head_dim: args.head_dim(),
        })
    }

    fn forward(
        &self,
        hidden: &Tensor,
        mask: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let attn_out = self.attention(&self.attention_norm.forward(hidden)?, mask, cos, sin, train)?;
        let hidden = (hidden + attn_out)?;
        let ffn_out = self.feed_forward(&self.ffn_norm.forward(&hidden)?, train)?;
        hidden + ffn_out
    }

    fn attention(
        &self,
        x: &Tensor,
        mask: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let (batch, seq, dim) = x.dims3()?;

        let shape = (batch, seq, self.n_heads, self.head_dim);
        let q = self.wq.forward(x)?.reshape(shape)?.transpose(1, 2)?;
        let k = self.wk.forward(x)?.reshape(shape)?.transpose(1, 2)?;
        let v = self.wv.forward(x)?.reshape(shape)?.transpose(1, 2)?.contiguous()?;

        let q = apply_rope(&q, cos, sin)?;
        let k = apply_rope(&k, cos, sin)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = q
            .contiguous()?
            .matmul(&k.transpose(2, 3)?.contiguous()?)?
            .affine(scale, 0.0)?;
        let scores = scores.broadcast_add(mask)?;
        let weights = ops::softmax_last_dim(&scores)?;
        let weights = self.attn_dropout.forward(&weights, train)?;

        let out = weights
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((batch, seq, dim))?;
        let out = self.wo.forward(&out)?;
        self.resid_dropout.forward(&out, train)
    }

    fn feed_forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let gate = ops::silu(&self.w1.forward(x)?)?;
        let up = self.w3.forward(x)?;
        let out = self.w2.forward(&(gate * up)?)?;
        self.resid_dropout.forward(&out, train)
    }
}

/// Half-split rotary embedding over the last dimension of `(b, h, s, d)`.
fn apply_rope(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    let head_dim = x.dim(D::Minus1)?;
    let half = head_dim / 2;
    let x1 = x.narrow(D::Minus1, 0, half)?;
    let x2 = x.narrow(D::Minus1, half, half)?;
    let rotated_a = (x1.broadcast_mul(cos)? - x2.broadcast_mul(sin)?)?;
    let rotated_b = (x1.broadcast_mul(sin)? + x2.broadcast_mul(cos)?)?;
    Tensor::cat(&[rotated_a, rotated_b], D::Minus1)
}

fn build_rope_tables(args: &ModelArgs, device: &Device, dtype: DType) -> Result<(Tensor, Tensor)> {
    let half = args.head_dim() / 2;
    let max_seq = args.max_context_length;

    let mut cos = Vec::with_capacity(max_seq * half);
    let mut sin = Vec::with_capacity(max_seq * half);
    for pos in 0..max_seq {
        for idx in 0..half {
            let freq = 1.0 / ROPE_THETA.powf(2.0 * idx as f64 / args.head_dim() as f64);
            let angle = pos as f64 * freq;
            cos.push(angle.cos() as f32);
            sin.push(angle.sin() as f32);
        }
    }

    // (seq, half) broadcasts right-aligned against (batch, heads, seq, half).
    let cos = Tensor::from_vec(cos, (max_seq, half), device)?.to_dtype(dtype)?;
    let sin = Tensor::from_vec(sin, (max_seq, half), device)?.to_dtype(dtype)?;
    Ok((cos, sin))
}

fn causal_mask(seq: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let mut data = vec![0f32; seq * seq];
    for row in 0..seq {
        for col in (row + 1)..seq {
            data[row * seq + col] = f32::NEG_INFINITY;
        }
    }
    Tensor::from_vec(data, (seq, seq), device)?.to_dtype(dtype)
}
