//! Device selection
//! One device claim per session; callers receive the device as a value and
//! thread it through instead of reading a process-wide global.

use anyhow::Result;
use candle_core::Device;
use log::{info, warn};
use once_cell::sync::OnceCell;

static SESSION_DEVICE: OnceCell<Device> = OnceCell::new();

/// Pick the training device for this session. A missing CUDA ordinal degrades
/// to any available GPU and then CPU with a warning; this never fails.
pub fn select_device(ordinal: usize) -> Result<Device> {
    let device = SESSION_DEVICE.get_or_init(|| match Device::new_cuda(ordinal) {
        Ok(device) => {
            info!("Using CUDA device {}", ordinal);
            device
        }
        Err(e) => {
            warn!("CUDA device {} unavailable ({}), falling back", ordinal, e);
            Device::cuda_if_available(0).unwrap_or(Device::Cpu)
        }
    });
    Ok(device.clone())
}
