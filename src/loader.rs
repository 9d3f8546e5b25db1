//! Weight and config loading.
//!
//! Resource errors here are fatal by design: a missing checkpoint, an
//! unreadable config, or a failed hub fetch propagates to the caller
//! unmodified, with no retry.

use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tracing::info;

/// Errors raised while locating or reading model files.
#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    #[error("failed to read file: {path}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse JSON config: {path}")]
    JsonParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("model weights not found: {path}")]
    MissingWeights { path: String },

    #[error("failed to fetch {what} from the HuggingFace hub: {message}")]
    Fetch { what: String, message: String },

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

/// Parse a JSON config file into any deserializable type.
pub fn load_json_config<T: DeserializeOwned>(path: &Path) -> Result<T, LoaderError> {
    let contents = std::fs::read_to_string(path).map_err(|source| LoaderError::FileRead {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| LoaderError::JsonParse {
        path: path.display().to_string(),
        source,
    })
}

/// Memory-map a safetensors checkpoint into a `VarBuilder`.
pub fn mmap_safetensors(
    path: &Path,
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>, LoaderError> {
    if !path.is_file() {
        return Err(LoaderError::MissingWeights {
            path: path.display().to_string(),
        });
    }
    info!("loading weights from {}", path.display());
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[path], dtype, device)? };
    Ok(vb)
}

/// Locate the CLIP weight and tokenizer files.
///
/// With a local directory the files are expected at
/// `<dir>/model.safetensors` and `<dir>/tokenizer.json`; otherwise both
/// are fetched (and cached) from the HuggingFace hub.
pub fn fetch_clip_files(
    repo_id: &str,
    local: Option<&Path>,
) -> Result<(PathBuf, PathBuf), LoaderError> {
    if let Some(dir) = local {
        let weights = dir.join("model.safetensors");
        let tokenizer = dir.join("tokenizer.json");
        if !weights.is_file() {
            return Err(LoaderError::MissingWeights {
                path: weights.display().to_string(),
            });
        }
        if !tokenizer.is_file() {
            return Err(LoaderError::MissingWeights {
                path: tokenizer.display().to_string(),
            });
        }
        return Ok((weights, tokenizer));
    }

    info!("fetching CLIP files for {repo_id}");
    let api = hf_hub::api::sync::Api::new().map_err(|e| LoaderError::Fetch {
        what: repo_id.to_string(),
        message: e.to_string(),
    })?;
    let repo = api.model(repo_id.to_string());
    let weights = repo.get("model.safetensors").map_err(|e| LoaderError::Fetch {
        what: format!("{repo_id}/model.safetensors"),
        message: e.to_string(),
    })?;
    let tokenizer = repo.get("tokenizer.json").map_err(|e| LoaderError::Fetch {
        what: format!("{repo_id}/tokenizer.json"),
        message: e.to_string(),
    })?;
    Ok((weights, tokenizer))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_checkpoint_is_fatal() {
        let err = match mmap_safetensors(
            Path::new("/nonexistent/model.safetensors"),
            DType::F32,
            &Device::Cpu,
        ) {
            Ok(_) => panic!("expected an error"),
            Err(e) => e,
        };
        assert!(matches!(err, LoaderError::MissingWeights { .. }));
    }

    #[test]
    fn missing_local_clip_dir_is_fatal() {
        let err = fetch_clip_files("unused", Some(Path::new("/nonexistent"))).unwrap_err();
        assert!(matches!(err, LoaderError::MissingWeights { .. }));
    }

    #[test]
    fn json_config_errors_name_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = load_json_config::<serde_json::Value>(&path).unwrap_err();
        assert!(err.to_string().contains("broken.json"));
    }
}
