//! Checkpoint save/load.

use std::path::Path;

use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use thinkchat_core::error::require_file;
use thinkchat_core::{ModelConfig, Result};

pub const WEIGHTS_FILE: &str = "model.safetensors";
pub const META_FILE: &str = "meta.json";

/// Metadata stored alongside model weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub model: ModelConfig,
    pub step: usize,
    pub loss: f64,
}

/// Save weights and metadata to `dir`.
///
/// Creates:
///   - `<dir>/model.safetensors`
///   - `<dir>/meta.json`
pub fn save_checkpoint<P: AsRef<Path>>(varmap: &VarMap, meta: &CheckpointMeta, dir: P) -> Result<()> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;
    varmap.save(dir.join(WEIGHTS_FILE))?;
    std::fs::write(dir.join(META_FILE), serde_json::to_string_pretty(meta)?)?;
    crate::logging::log_checkpoint_save(meta.step, &dir.display().to_string(), meta.loss);
    Ok(())
}

/// Load metadata and weights into `varmap`.
///
/// The caller builds the model on `varmap` first so every variable exists;
/// loading then overwrites them in place.
pub fn load_checkpoint<P: AsRef<Path>>(dir: P, varmap: &mut VarMap) -> Result<CheckpointMeta> {
    let dir = dir.as_ref();
    let meta_path = dir.join(META_FILE);
    let weights_path = dir.join(WEIGHTS_FILE);
    require_file(&meta_path)?;
    require_file(&weights_path)?;

    let meta: CheckpointMeta = serde_json::from_str(&std::fs::read_to_string(&meta_path)?)?;
    varmap.load(&weights_path)?;
    Ok(meta)
}

/// Read only the metadata of a checkpoint.
pub fn read_meta<P: AsRef<Path>>(dir: P) -> Result<CheckpointMeta> {
    let meta_path = dir.as_ref().join(META_FILE);
    require_file(&meta_path)?;
    Ok(serde_json::from_str(&std::fs::read_to_string(&meta_path)?)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{build_tiny_lm, ScoringModel};
    use candle_core::{Device, Tensor};
    use thinkchat_core::ThinkChatError;

    fn tiny_config() -> ModelConfig {
        ModelConfig {
            vocab_size: 16,
            dim: 8,
            hidden_dim: 8,
        }
    }

    #[test]
    fn test_checkpoint_roundtrip() -> Result<()> {
        let device = Device::Cpu;
        let (varmap, model) = build_tiny_lm(&tiny_config(), &device)?;
        let dir = tempfile::tempdir()?;
        let meta = CheckpointMeta {
            model: tiny_config(),
            step: 42,
            loss: 3.14,
        };
        save_checkpoint(&varmap, &meta, dir.path())?;
        assert!(dir.path().join(WEIGHTS_FILE).exists());
        assert_eq!(read_meta(dir.path())?, meta);

        let (mut restored_map, restored) = build_tiny_lm(&tiny_config(), &device)?;
        let loaded = load_checkpoint(dir.path(), &mut restored_map)?;
        assert_eq!(loaded.step, 42);

        let ids = Tensor::new(&[[1u32, 2, 3]], &device)?;
        let a = model.forward(&ids)?.flatten_all()?.to_vec1::<f32>()?;
        let b = restored.forward(&ids)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn test_missing_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let mut varmap = VarMap::new();
        let err = load_checkpoint(dir.path(), &mut varmap).unwrap_err();
        assert!(matches!(err, ThinkChatError::NotFound { .. }));
    }
}
