//! Resume - recover the starting step from the checkpoint directory

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

use disp_engine::preinit::PREINIT_PREFIX;
use disp_engine::TrainableModel;

use super::checkpoint::CheckpointStore;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResumeSource {
    /// Full state restored from a checkpoint of this model.
    Checkpoint(PathBuf),
    /// No checkpoint; `restored` variables were taken from an external file.
    Preinitialized { path: PathBuf, restored: usize },
    /// No checkpoint and no usable preinitialization weights.
    Fresh,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResumePoint {
    pub start_step: u64,
    pub source: ResumeSource,
}

/// Restores the newest checkpoint of `store`'s model into `model` and returns
/// its step. Without a checkpoint, training starts at 0, optionally seeded from
/// `preinit_weights`.
///
/// A malformed checkpoint name aborts: silently starting from 0 would replay
/// the schedule from the beginning over already-trained weights.
pub fn resume<M: TrainableModel>(
    store: &CheckpointStore,
    model: &mut M,
    preinit_weights: Option<&Path>,
) -> Result<ResumePoint> {
    if let Some((step, path)) = store.latest()? {
        info!("Restoring from {}", path.display());
        model
            .restore(&path)
            .with_context(|| format!("Failed to restore checkpoint {}", path.display()))?;
        info!("step: {}", step);
        return Ok(ResumePoint {
            start_step: step,
            source: ResumeSource::Checkpoint(path),
        });
    }

    info!("No checkpoint for {} in {}. Starting at step 0.", store.model_name(), store.dir().display());
    let source = match preinit_weights {
        Some(path) => preinitialize(model, path),
        None => ResumeSource::Fresh,
    };
    Ok(ResumePoint {
        start_step: 0,
        source,
    })
}

fn preinitialize<M: TrainableModel>(model: &mut M, path: &Path) -> ResumeSource {
    if !path.exists() {
        warn!("⚠️ Preinitialization weights not found: {}", path.display());
        warn!("⚠️ Training from fresh initialization.");
        return ResumeSource::Fresh;
    }

    match model.restore_matching(path, PREINIT_PREFIX) {
        Ok(0) => {
            warn!(
                "⚠️ Found 0 variables to restore in {} (prefix '{}')",
                path.display(),
                PREINIT_PREFIX
            );
            warn!("⚠️ Training from fresh initialization.");
            ResumeSource::Preinitialized {
                path: path.to_path_buf(),
                restored: 0,
            }
        }
        Ok(restored) => {
            info!("Found {} variables to restore", restored);
            info!("✅ Weights restored from {}", path.display());
            ResumeSource::Preinitialized {
                path: path.to_path_buf(),
                restored,
            }
        }
        Err(e) => {
            warn!("⚠️ Failed to read preinitialization weights {}: {:#}", path.display(), e);
            warn!("⚠️ Training from fresh initialization.");
            ResumeSource::Fresh
        }
    }
}
