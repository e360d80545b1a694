use std::{
    collections::HashMap,
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

use candle_core::{DType, Tensor};
use model::Transformer;

use crate::config::{to_runtime_error, TrainingError};

/// The legacy flat layout. The only version currently emitted.
pub const LEGACY_VERSION: u32 = 0;

/// Writes the model in the flat inference format: a fixed i32 header
/// followed by f32 tensor groups in little-endian order, each group
/// covering one weight family across all layers. Consumers mmap the file
/// and index by offset, so the ordering here is load-bearing.
pub fn export_model(model: &Transformer, path: &Path, version: u32) -> Result<(), TrainingError> {
    if version != LEGACY_VERSION {
        return Err(TrainingError::runtime(format!(
            "unsupported export version {version} (only {LEGACY_VERSION} is supported)"
        )));
    }
    let args = model.args();
    let file = File::create(path).map_err(|err| {
        TrainingError::runtime(format!("failed to create {}: {err}", path.display()))
    })?;
    let mut writer = BufWriter::new(file);

    let params: HashMap<String, Tensor> = model
        .named_parameters()
        .into_iter()
        .map(|(name, var)| (name, var.as_tensor().clone()))
        .collect();

    // The classifier head is a separate tensor, signalled by a negative
    // vocab size; shared-embedding exports would write it positive.
    let header: [i32; 7] = [
        args.dim as i32,
        args.ffn_hidden_dim() as i32,
        args.n_layers as i32,
        args.n_heads as i32,
        args.n_heads as i32,
        -(args.vocab_size as i32),
        args.max_context_length as i32,
    ];
    for value in header {
        writer.write_all(&value.to_le_bytes())?;
    }

    write_tensor(&mut writer, &params, "tok_embeddings.weight")?;
    for family in [
        "attention_norm.weight",
        "attention.wq.weight",
        "attention.wk.weight",
        "attention.wv.weight",
        "attention.wo.weight",
        "ffn_norm.weight",
        "feed_forward.w1.weight",
        "feed_forward.w2.weight",
        "feed_forward.w3.weight",
    ] {
        for layer in 0..args.n_layers {
            write_tensor(&mut writer, &params, &format!("layers.{layer}.{family}"))?;
        }
    }
    write_tensor(&mut writer, &params, "norm.weight")?;

    let (rope_cos, rope_sin) = model.rope_tables();
    write_f32_values(&mut writer, rope_cos)?;
    write_f32_values(&mut writer, rope_sin)?;

    write_tensor(&mut writer, &params, "output.weight")?;

    writer.flush()?;
    Ok(())
}

fn write_tensor(
    writer: &mut impl Write,
    params: &HashMap<String, Tensor>,
    name: &str,
) -> Result<(), TrainingError> {
    let tensor = params
        .get(name)
        .ok_or_else(|| TrainingError::runtime(format!("export missing parameter '{name}'")))?;
    write_f32_values(writer, tensor)
}

fn write_f32_values(writer: &mut impl Write, tensor: &Tensor) -> Result<(), TrainingError> {
    let values = tensor
        .to_dtype(DType::F32)
        .map_err(to_runtime_error)?
        .flatten_all()
        .map_err(to_runtime_error)?
        .to_vec1::<f32>()
        .map_err(to_runtime_error)?;
    for value in values {
        writer.write_all(&value.to_le_bytes())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use model::ModelArgs;
    use std::fs;

    fn tiny_model() -> Transformer {
        let args = ModelArgs {
            dim: 8,
            n_layers: 2,
            n_heads: 2,
            vocab_size: 16,
            hidden_dim: Some(16),
            max_context_length: 4,
            dropout: 0.0,
            ..ModelArgs::default()
        };
        Transformer::new(args, &Device::Cpu, DType::F32).unwrap()
    }

    #[test]
    fn header_carries_model_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.bin");
        let model = tiny_model();
        export_model(&model, &path, LEGACY_VERSION).unwrap();

        let bytes = fs::read(&path).unwrap();
        let read_i32 =
            |idx: usize| i32::from_le_bytes(bytes[idx * 4..idx * 4 + 4].try_into().unwrap());
        assert_eq!(read_i32(0), 8); // dim
        assert_eq!(read_i32(1), 16); // hidden_dim
        assert_eq!(read_i32(2), 2); // n_layers
        assert_eq!(read_i32(3), 2); // n_heads
        assert_eq!(read_i32(4), 2); // n_kv_heads
        assert_eq!(read_i32(5), -16); // separate classifier head
        assert_eq!(read_i32(6), 4); // max_context_length
    }

    #[test]
    fn file_length_matches_parameter_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.bin");
        let model = tiny_model();
        export_model(&model, &path, LEGACY_VERSION).unwrap();

        let rope_elems = 2 * model.args().max_context_length * (model.args().head_dim() / 2);
        let expected = 7 * 4 + (model.num_parameters() + rope_elems) * 4;
        assert_eq!(fs::read(&path).unwrap().len(), expected);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.bin");
        let model = tiny_model();
        let err = export_model(&model, &path, 3).unwrap_err();
        assert!(err.to_string().contains("unsupported export version"));
        assert!(!path.exists());
    }
}
