use std::{
    collections::HashMap,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::safetensors::load as load_safetensors;
use hex::encode as hex_encode;
use model::{ModelArgs, Transformer};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    config::{to_runtime_error, TrainingConfig, TrainingError},
    optimizer::{AdamW, OptimizerState},
};

pub const CHECKPOINT_VERSION: u32 = 1;
const CHECKPOINT_DIRNAME: &str = "ckpt";
const STAGING_DIRNAME: &str = "ckpt.staging";
const MODEL_FILENAME: &str = "model.safetensors";
const OPTIMIZER_FILENAME: &str = "optimizer.json";
const MANIFEST_FILENAME: &str = "manifest.json";

/// Key prefixes added by model-wrapping layers in other training stacks.
/// Stripped on load so checkpoints written through such a wrapper still
/// resolve against plain parameter names.
const WRAPPER_PREFIXES: &[&str] = &["_orig_mod.", "module."];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Everything needed to resume: file records for integrity, the model
/// shape for structural reconciliation, the loop counters, and the full
/// run config for provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub created_unix_timestamp: u64,
    pub config_sha256: String,
    pub model: FileRecord,
    pub optimizer: FileRecord,
    pub model_args: ModelArgs,
    pub iter_num: usize,
    pub best_val_loss: f64,
    pub run_config: TrainingConfig,
}

pub struct SaveRequest<'a> {
    pub out_dir: &'a Path,
    pub config: &'a TrainingConfig,
    pub model: &'a Transformer,
    pub optimizer: &'a AdamW,
    pub iter_num: usize,
    pub best_val_loss: f64,
}

pub struct LoadOutcome {
    pub manifest: CheckpointManifest,
    pub optimizer_state: OptimizerState,
    pub model_weights_path: PathBuf,
}

pub fn checkpoint_dir(out_dir: &Path) -> PathBuf {
    out_dir.join(CHECKPOINT_DIRNAME)
}

/// Writes the checkpoint into a staging directory, then swaps it in with
/// a rename so a crash mid-save never corrupts the previous checkpoint.
pub fn save_checkpoint(request: SaveRequest<'_>) -> Result<CheckpointManifest, TrainingError> {
    fs::create_dir_all(request.out_dir).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to create output directory {}: {err}",
            request.out_dir.display()
        ))
    })?;

    let staging_dir = request.out_dir.join(STAGING_DIRNAME);
    if staging_dir.exists() {
        fs::remove_dir_all(&staging_dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to clear stale staging directory {}: {err}",
                staging_dir.display()
            ))
        })?;
    }
    fs::create_dir(&staging_dir).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to create staging directory {}: {err}",
            staging_dir.display()
        ))
    })?;

    let model_path = staging_dir.join(MODEL_FILENAME);
    save_model_weights(request.model, &model_path)?;
    let model_record = file_record(&model_path)?;

    let optimizer_state = request.optimizer.state()?;
    let optimizer_path = staging_dir.join(OPTIMIZER_FILENAME);
    write_json(&optimizer_path, &optimizer_state)?;
    let optimizer_record = file_record(&optimizer_path)?;

    let manifest = CheckpointManifest {
        version: CHECKPOINT_VERSION,
        created_unix_timestamp: unix_timestamp(),
        config_sha256: fingerprint_config(request.config)?,
        model: model_record,
        optimizer: optimizer_record,
        model_args: request.config.model.clone(),
        iter_num: request.iter_num,
        best_val_loss: request.best_val_loss,
        run_config: request.config.clone(),
    };
    write_json(&staging_dir.join(MANIFEST_FILENAME), &manifest)?;

    let final_dir = checkpoint_dir(request.out_dir);
    if final_dir.exists() {
        fs::remove_dir_all(&final_dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to replace checkpoint {}: {err}",
                final_dir.display()
            ))
        })?;
    }
    fs::rename(&staging_dir, &final_dir).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to publish checkpoint {}: {err}",
            final_dir.display()
        ))
    })?;

    Ok(manifest)
}

pub fn load_checkpoint(directory: &Path) -> Result<LoadOutcome, TrainingError> {
    let manifest = load_manifest(directory)?;
    ensure_version_supported(manifest.version)?;

    let model_path = directory.join(&manifest.model.filename);
    validate_file(&model_path, &manifest.model.sha256)?;

    let optimizer_path = directory.join(&manifest.optimizer.filename);
    validate_file(&optimizer_path, &manifest.optimizer.sha256)?;
    let optimizer_state: OptimizerState = read_json(&optimizer_path)?;

    Ok(LoadOutcome {
        manifest,
        optimizer_state,
        model_weights_path: model_path,
    })
}

/// Copies checkpointed tensors into the model's parameters by name.
/// Missing or leftover tensors are fatal: a name mismatch means the
/// checkpoint was produced by a different architecture.
pub fn apply_model_weights(
    model: &Transformer,
    weights_path: &Path,
) -> Result<(), TrainingError> {
    let device = model.device().clone();
    let tensors = load_safetensors(weights_path, &device).map_err(to_runtime_error)?;
    let mut by_name: HashMap<String, _> = tensors
        .into_iter()
        .map(|(name, tensor)| (normalize_parameter_name(&name), tensor))
        .collect();

    for (name, var) in model.named_parameters() {
        let tensor = by_name.remove(&name).ok_or_else(|| {
            TrainingError::runtime(format!("checkpoint missing parameter '{name}'"))
        })?;
        let desired_dtype = var.as_tensor().dtype();
        let tensor = if tensor.dtype() == desired_dtype {
            tensor
        } else {
            tensor.to_dtype(desired_dtype).map_err(to_runtime_error)?
        };
        var.set(&tensor).map_err(to_runtime_error)?;
    }

    if !by_name.is_empty() {
        let extra = by_name.keys().cloned().collect::<Vec<_>>().join(", ");
        return Err(TrainingError::runtime(format!(
            "checkpoint contains unused parameters: {extra}"
        )));
    }

    Ok(())
}

/// Strips wrapper prefixes until the bare parameter name remains.
pub fn normalize_parameter_name(name: &str) -> String {
    let mut name = name;
    loop {
        let mut stripped = false;
        for prefix in WRAPPER_PREFIXES {
            if let Some(rest) = name.strip_prefix(prefix) {
                name = rest;
                stripped = true;
            }
        }
        if !stripped {
            return name.to_string();
        }
    }
}

pub fn fingerprint_config(config: &TrainingConfig) -> Result<String, TrainingError> {
    let json = serde_json::to_vec(config)
        .map_err(|err| TrainingError::runtime(format!("failed to hash config: {err}")))?;
    Ok(hex_encode(Sha256::digest(json)))
}

fn save_model_weights(model: &Transformer, path: &Path) -> Result<(), TrainingError> {
    let named_parameters = model.named_parameters();
    if named_parameters.is_empty() {
        return Err(TrainingError::runtime(
            "model contains no parameters to checkpoint",
        ));
    }
    let mut tensors = HashMap::with_capacity(named_parameters.len());
    for (name, var) in named_parameters {
        tensors.insert(name, var.as_tensor().clone());
    }
    candle_core::safetensors::save(&tensors, path).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to serialize model weights to {}: {err}",
            path.display()
        ))
    })
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn file_record(path: &Path) -> Result<FileRecord, TrainingError> {
    let sha = sha256_file(path)?;
    let bytes = path
        .metadata()
        .map_err(|err| {
            TrainingError::runtime(format!(
                "failed to stat checkpoint file {}: {err}",
                path.display()
            ))
        })?
        .len();
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            TrainingError::runtime(format!(
                "checkpoint file name is not valid UTF-8: {}",
                path.display()
            ))
        })?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256: sha,
        bytes,
    })
}

fn load_manifest(directory: &Path) -> Result<CheckpointManifest, TrainingError> {
    let manifest_path = directory.join(MANIFEST_FILENAME);
    if !manifest_path.is_file() {
        return Err(TrainingError::runtime(format!(
            "checkpoint manifest not found at {}",
            manifest_path.display()
        )));
    }
    read_json(&manifest_path)
}

fn ensure_version_supported(version: u32) -> Result<(), TrainingError> {
    if version != CHECKPOINT_VERSION {
        return Err(TrainingError::runtime(format!(
            "unsupported checkpoint version {} (expected {})",
            version, CHECKPOINT_VERSION
        )));
    }
    Ok(())
}

fn validate_file(path: &Path, expected_sha: &str) -> Result<(), TrainingError> {
    let actual = sha256_file(path)?;
    if actual != expected_sha {
        return Err(TrainingError::runtime(format!(
            "checkpoint file {} failed checksum validation",
            path.display()
        )));
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to read {}: {err}", path.display()))
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let mut file = File::create(path).map_err(|err| {
        TrainingError::runtime(format!("failed to create {}: {err}", path.display()))
    })?;
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| TrainingError::runtime(format!("failed to serialize JSON: {err}")))?;
    file.write_all(&data).map_err(|err| {
        TrainingError::runtime(format!("failed to write {}: {err}", path.display()))
    })?;
    file.write_all(b"\n")
        .map_err(|err| TrainingError::runtime(format!("failed to write {}: {err}", path.display())))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, TrainingError> {
    let file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    serde_json::from_reader(file).map_err(|err| {
        TrainingError::runtime(format!("failed to parse JSON {}: {err}", path.display()))
    })
}
