//! Kernel compilation: naga_oil preprocessing, naga validation, WGSL output.
//!
//! The preprocessor substitutes the workgroup size and selects the image
//! format; the validated module is written back out as WGSL so any backend
//! accepting WGSL can consume it.

use crate::config::EngineConfig;
use crate::kernel::{ImageFormat, Kernel};
use crate::{Error, Result};
use naga_oil::compose::{Composer, NagaModuleDescriptor, ShaderDefValue};
use std::collections::HashMap;
use tracing::debug;

/// A validated kernel ready for pipeline creation.
#[derive(Debug, Clone)]
pub struct CompiledKernel {
    pub kernel: Kernel,
    pub label: String,
    /// Preprocessed WGSL with a single `main` entry point.
    pub wgsl: String,
}

/// Preprocessor definitions for `kernel` under `config`.
pub fn shader_defs(kernel: Kernel, config: &EngineConfig) -> HashMap<String, ShaderDefValue> {
    let [x, y] = config.group_size;
    let mut defs = HashMap::new();
    defs.insert("GROUP_X".to_string(), ShaderDefValue::UInt(x));
    defs.insert("GROUP_Y".to_string(), ShaderDefValue::UInt(y));
    defs.insert("GROUP_LINEAR".to_string(), ShaderDefValue::UInt(x * y));
    if kernel == Kernel::TensorToImage && config.image_format == ImageFormat::Rgba32Float {
        defs.insert("IMAGE_RGBA32F".to_string(), ShaderDefValue::Bool(true));
    }
    defs
}

/// Compile one kernel.
pub fn compile_kernel(kernel: Kernel, config: &EngineConfig) -> Result<CompiledKernel> {
    let label = kernel.label();
    let shader_error = |message: String| Error::Shader {
        label: label.to_string(),
        message,
    };

    let source = kernel.full_source();
    let file_path = format!("{label}.wgsl");
    let mut composer = Composer::default();
    let module = composer
        .make_naga_module(NagaModuleDescriptor {
            source: &source,
            file_path: &file_path,
            shader_defs: shader_defs(kernel, config),
            ..Default::default()
        })
        .map_err(|e| shader_error(format!("preprocessing failed: {e}")))?;

    let info = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    )
    .validate(&module)
    .map_err(|e| shader_error(format!("validation failed: {e}")))?;

    let wgsl = naga::back::wgsl::write_string(&module, &info, naga::back::wgsl::WriterFlags::empty())
        .map_err(|e| shader_error(format!("WGSL generation failed: {e}")))?;

    debug!(kernel = label, bytes = wgsl.len(), "compiled kernel");

    Ok(CompiledKernel {
        kernel,
        label: label.to_string(),
        wgsl,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defs_follow_config() {
        let config = EngineConfig::default().with_group_size(16, 4);
        let defs = shader_defs(Kernel::Conv, &config);
        assert_eq!(defs.get("GROUP_X"), Some(&ShaderDefValue::UInt(16)));
        assert_eq!(defs.get("GROUP_Y"), Some(&ShaderDefValue::UInt(4)));
        assert_eq!(defs.get("GROUP_LINEAR"), Some(&ShaderDefValue::UInt(64)));
        assert!(!defs.contains_key("IMAGE_RGBA32F"));

        let float_images = config.with_image_format(ImageFormat::Rgba32Float);
        assert!(shader_defs(Kernel::TensorToImage, &float_images).contains_key("IMAGE_RGBA32F"));
    }
}
