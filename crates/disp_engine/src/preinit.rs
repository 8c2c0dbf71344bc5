//! Preinitialization - selective restore from an external safetensors file

use std::path::Path;

use anyhow::{Context, Result};
use candle_core::Device;
use candle_nn::VarMap;
use tracing::{debug, warn};

/// Name prefix under which external weight files store model variables.
pub const PREINIT_PREFIX: &str = "model/";

/// Copies every tensor stored as `<prefix><var name>` into the matching
/// variable of `varmap`. Variables missing from the file, or stored with a
/// different shape, keep their current values.
pub fn restore_matching(varmap: &VarMap, path: &Path, prefix: &str) -> Result<usize> {
    let tensors = candle_core::safetensors::load(path, &Device::Cpu)
        .with_context(|| format!("Failed to read weight file {}", path.display()))?;

    let data = varmap
        .data()
        .lock()
        .map_err(|_| anyhow::anyhow!("VarMap lock poisoned"))?;

    let mut restored = 0;
    for (name, var) in data.iter() {
        let key = format!("{prefix}{name}");
        let Some(tensor) = tensors.get(&key) else {
            continue;
        };
        if tensor.shape() != var.shape() {
            warn!(
                "Skipping '{}': file shape {:?} != model shape {:?}",
                key,
                tensor.shape(),
                var.shape()
            );
            continue;
        }
        let value = tensor.to_dtype(var.dtype())?.to_device(var.device())?;
        var.set(&value)?;
        debug!("Restored '{}' from {}", name, path.display());
        restored += 1;
    }

    Ok(restored)
}
