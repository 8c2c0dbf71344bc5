//! Checkpoint Management - naming, discovery and atomic persistence
//!
//! A checkpoint is `<dir>/<model_name>-<step>.safetensors`. The file name is
//! the only thing resumption trusts; the JSON sidecar is informational.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;
use thiserror::Error;
use tracing::{debug, info, warn};

use disp_engine::TrainableModel;

pub const CHECKPOINT_EXT: &str = "safetensors";
const SEPARATOR: char = '-';

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CheckpointIdError {
    #[error("'{0}' has no '-' separating model name and step")]
    MissingSeparator(String),

    #[error("'{0}' has an empty model name")]
    EmptyName(String),

    #[error("'{id}' has an invalid step suffix '{suffix}'")]
    InvalidStep { id: String, suffix: String },
}

/// Typed `<model_name>-<step>` identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CheckpointId {
    pub model_name: String,
    pub step: u64,
}

impl CheckpointId {
    pub fn new(model_name: impl Into<String>, step: u64) -> Self {
        Self {
            model_name: model_name.into(),
            step,
        }
    }

    pub fn encode(&self) -> String {
        format!("{}{}{}", self.model_name, SEPARATOR, self.step)
    }

    /// Splits at the last `-`. The step must be plain decimal without sign or
    /// leading zeros, so each step has exactly one spelling.
    pub fn decode(id: &str) -> Result<Self, CheckpointIdError> {
        let (name, suffix) = id
            .rsplit_once(SEPARATOR)
            .ok_or_else(|| CheckpointIdError::MissingSeparator(id.to_string()))?;
        if name.is_empty() {
            return Err(CheckpointIdError::EmptyName(id.to_string()));
        }
        let invalid = || CheckpointIdError::InvalidStep {
            id: id.to_string(),
            suffix: suffix.to_string(),
        };
        if suffix.is_empty()
            || !suffix.bytes().all(|b| b.is_ascii_digit())
            || (suffix.len() > 1 && suffix.starts_with('0'))
        {
            return Err(invalid());
        }
        let step = suffix.parse::<u64>().map_err(|_| invalid())?;
        Ok(Self::new(name, step))
    }
}

/// Sidecar metadata written next to each checkpoint.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct TrainingState {
    pub step: u64,
    pub loss: f32,
    pub date: String,
    pub checkpoint: String,
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("malformed checkpoint file {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: CheckpointIdError,
    },

    #[error("checkpoint file {path} belongs to model '{found}', expected '{expected}'")]
    ForeignName {
        path: PathBuf,
        found: String,
        expected: String,
    },

    #[error("failed to scan checkpoint directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Clone, Debug)]
pub struct CheckpointStore {
    dir: PathBuf,
    model_name: String,
    /// Newest checkpoints to keep; 0 keeps all.
    keep: usize,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, model_name: impl Into<String>, keep: usize) -> Self {
        Self {
            dir: dir.into(),
            model_name: model_name.into(),
            keep,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn path_for(&self, step: u64) -> PathBuf {
        let id = CheckpointId::new(&self.model_name, step);
        self.dir.join(format!("{}.{}", id.encode(), CHECKPOINT_EXT))
    }

    /// All checkpoints of this model, sorted by step.
    ///
    /// Any `<model_name>-*.safetensors` whose name does not decode is an error:
    /// a checkpoint that cannot be read must not be mistaken for "no checkpoint".
    pub fn list(&self) -> Result<Vec<(u64, PathBuf)>, DiscoveryError> {
        let io_err = |source| DiscoveryError::Io {
            path: self.dir.clone(),
            source,
        };
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let prefix = format!("{}{}", self.model_name, SEPARATOR);
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            if !path.is_file() || path.extension().map_or(true, |ext| ext != CHECKPOINT_EXT) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !stem.starts_with(&prefix) {
                continue;
            }
            let id = CheckpointId::decode(stem).map_err(|source| DiscoveryError::Malformed {
                path: path.clone(),
                source,
            })?;
            if id.model_name != self.model_name {
                return Err(DiscoveryError::ForeignName {
                    path,
                    found: id.model_name,
                    expected: self.model_name.clone(),
                });
            }
            found.push((id.step, path));
        }
        found.sort_by_key(|(step, _)| *step);
        Ok(found)
    }

    pub fn latest(&self) -> Result<Option<(u64, PathBuf)>, DiscoveryError> {
        Ok(self.list()?.pop())
    }

    /// Persists the model at `step`. The weights go to a temporary file that is
    /// renamed into place, so a crash never leaves a discoverable partial
    /// checkpoint.
    pub fn save<M: TrainableModel>(&self, model: &M, step: u64, loss: f32) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;

        let final_path = self.path_for(step);
        let tmp_path = final_path.with_extension(format!("{CHECKPOINT_EXT}.tmp"));

        let lock_path = self.dir.join(format!("{}.lock", self.model_name));
        let lock_file = File::create(&lock_path)?;
        lock_file.lock_exclusive()?;
        let written = model
            .save(&tmp_path)
            .and_then(|_| fs::rename(&tmp_path, &final_path).map_err(anyhow::Error::from));
        lock_file.unlock()?;
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.context(format!("Failed to save checkpoint {}", final_path.display())));
        }

        self.write_state(step, loss, &final_path)?;
        self.rotate()?;
        Ok(final_path)
    }

    fn write_state(&self, step: u64, loss: f32, checkpoint: &Path) -> Result<()> {
        let id = CheckpointId::new(&self.model_name, step);
        let state = TrainingState {
            step,
            loss,
            date: chrono::Local::now().to_rfc3339(),
            checkpoint: checkpoint
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };
        let path = self.dir.join(format!("{}.json", id.encode()));
        let file = File::create(&path)?;
        serde_json::to_writer_pretty(file, &state)?;
        Ok(())
    }

    fn rotate(&self) -> Result<()> {
        if self.keep == 0 {
            return Ok(());
        }
        let checkpoints = self.list()?;
        let excess = checkpoints.len().saturating_sub(self.keep);
        for (step, path) in checkpoints.into_iter().take(excess) {
            debug!("Rotating out checkpoint at step {}", step);
            if let Err(e) = fs::remove_file(&path) {
                warn!("⚠️ Failed to remove old checkpoint {}: {}", path.display(), e);
                continue;
            }
            let sidecar = path.with_extension("json");
            if sidecar.exists() {
                let _ = fs::remove_file(sidecar);
            }
        }
        if excess > 0 {
            info!("Kept the newest {} checkpoints", self.keep);
        }
        Ok(())
    }
}
