use candle_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Architecture hyperparameters. Immutable once a `Transformer` is built from
/// them; the structural subset additionally survives checkpoint resume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelArgs {
    pub dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub vocab_size: usize,
    /// Explicit feed-forward width; derived from `dim` when absent.
    #[serde(default)]
    pub hidden_dim: Option<usize>,
    #[serde(default = "default_hidden_dim_multiplier")]
    pub hidden_dim_multiplier: usize,
    #[serde(default = "default_multiple_of")]
    pub multiple_of: usize,
    #[serde(default = "default_norm_eps")]
    pub norm_eps: f64,
    #[serde(default = "default_max_context_length")]
    pub max_context_length: usize,
    #[serde(default)]
    pub dropout: f32,
}

impl Default for ModelArgs {
    fn default() -> Self {
        Self {
            dim: 288,
            n_layers: 6,
            n_heads: 6,
            vocab_size: 32_000,
            hidden_dim: None,
            hidden_dim_multiplier: default_hidden_dim_multiplier(),
            multiple_of: default_multiple_of(),
            norm_eps: default_norm_eps(),
            max_context_length: default_max_context_length(),
            dropout: 0.0,
        }
    }
}

impl ModelArgs {
    pub fn validate(&self) -> Result<()> {
        if self.dim == 0 {
            return Err(Error::Msg("model dim must be greater than zero".into()));
        }
        if self.n_layers == 0 {
            return Err(Error::Msg("n_layers must be greater than zero".into()));
        }
        if self.n_heads == 0 {
            return Err(Error::Msg("n_heads must be greater than zero".into()));
        }
        if self.dim % self.n_heads != 0 {
            return Err(Error::Msg(format!(
                "dim ({}) must be divisible by n_heads ({})",
                self.dim, self.n_heads
            )));
        }
        if self.head_dim() % 2 != 0 {
            return Err(Error::Msg(format!(
                "head dim ({}) must be even for rotary embeddings",
                self.head_dim()
            )));
        }
        if self.vocab_size == 0 {
            return Err(Error::Msg("vocab_size must be greater than zero".into()));
        }
        if self.multiple_of == 0 {
            return Err(Error::Msg("multiple_of must be greater than zero".into()));
        }
        if self.max_context_length == 0 {
            return Err(Error::Msg(
                "max_context_length must be greater than zero".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::Msg("dropout must be in [0, 1)".into()));
        }
        Ok(())
    }

    pub fn head_dim(&self) -> usize {
        self.dim / self.n_heads
    }

    /// Feed-forward width: explicit when given, otherwise the llama2.c
    /// derivation rounded up to a multiple of `multiple_of`.
    pub fn ffn_hidden_dim(&self) -> usize {
        if let Some(hidden) = self.hidden_dim {
            return hidden;
        }
        let base = 2 * (self.hidden_dim_multiplier * self.dim) / 3;
        self.multiple_of * base.div_ceil(self.multiple_of)
    }

    /// Forces the tensor-shape-governing fields to `source`'s values. Called
    /// on resume: these fields cannot be overridden without invalidating the
    /// checkpointed parameters, while dropout and norm_eps may change freely.
    pub fn adopt_structural(&mut self, source: &ModelArgs) {
        self.dim = source.dim;
        self.n_layers = source.n_layers;
        self.n_heads = source.n_heads;
        self.vocab_size = source.vocab_size;
        self.hidden_dim = source.hidden_dim;
        self.hidden_dim_multiplier = source.hidden_dim_multiplier;
        self.multiple_of = source.multiple_of;
        self.max_context_length = source.max_context_length;
    }
}

fn default_hidden_dim_multiplier() -> usize {
    4
}

fn default_multiple_of() -> usize {
    256
}

fn default_norm_eps() -> f64 {
    1e-5
}

fn default_max_context_length() -> usize {
    256
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ffn_width_is_rounded_to_multiple() {
        let args = ModelArgs {
            dim: 288,
            multiple_of: 32,
            hidden_dim_multiplier: 4,
            hidden_dim: None,
            ..ModelArgs::default()
        };
        let hidden = args.ffn_hidden_dim();
        assert_eq!(hidden % 32, 0);
        assert!(hidden >= 2 * (4 * 288) / 3);
    }

    #[test]
    fn explicit_ffn_width_wins() {
        let args = ModelArgs {
            hidden_dim: Some(512),
            ..ModelArgs::default()
        };
        assert_eq!(args.ffn_hidden_dim(), 512);
    }

    #[test]
    fn adopt_structural_keeps_tunable_fields() {
        let saved = ModelArgs {
            dim: 64,
            n_layers: 2,
            n_heads: 4,
            vocab_size: 128,
            dropout: 0.1,
            norm_eps: 1e-5,
            ..ModelArgs::default()
        };
        let mut active = ModelArgs {
            dim: 32,
            vocab_size: 999,
            dropout: 0.0,
            norm_eps: 1e-6,
            ..ModelArgs::default()
        };
        active.adopt_structural(&saved);
        assert_eq!(active.dim, 64);
        assert_eq!(active.vocab_size, 128);
        assert_eq!(active.dropout, 0.0);
        assert_eq!(active.norm_eps, 1e-6);
    }
}
