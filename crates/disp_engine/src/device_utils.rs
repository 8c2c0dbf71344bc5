use candle_core::Device;
use tracing::{info, warn};

use crate::model::CorrType;

/// Picks the device for a correlation realization.
/// `Cuda` asks for GPU 0 and falls back to CPU when CUDA is unavailable or the
/// crate was built without the `cuda` feature.
pub fn select_device(corr_type: CorrType) -> Device {
    match corr_type {
        CorrType::Cuda => match Device::cuda_if_available(0) {
            Ok(device) => {
                info!("Correlation realization 'cuda' on {:?}", device);
                device
            }
            Err(e) => {
                warn!("⚠️ CUDA device requested but unavailable ({}). Using CPU.", e);
                Device::Cpu
            }
        },
        _ => Device::Cpu,
    }
}
