use std::path::Path;

use candle_core::{safetensors, DType, Device, Result};
use candle_nn::{VarBuilder, VarMap};
use tracing::{info, warn};

/// Builds a read-only variable source for a frozen network: the named safetensors
/// file when one is given, otherwise a fresh initialisation from the device RNG.
pub fn frozen_var_builder(
    network: &str,
    weights: Option<&Path>,
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>> {
    match weights {
        Some(path) => {
            info!(network, path = %path.display(), "loading frozen weights");
            let tensors = safetensors::load(path, device)?;
            Ok(VarBuilder::from_tensors(tensors, dtype, device))
        }
        None => {
            warn!(network, "no weights configured; using a random initialisation");
            let varmap = VarMap::new();
            Ok(VarBuilder::from_varmap(&varmap, dtype, device))
        }
    }
}
