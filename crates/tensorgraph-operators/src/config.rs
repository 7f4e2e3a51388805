//! Engine configuration shared by planning and kernel compilation.

use crate::kernel::ImageFormat;
use tensorgraph_core::{Error, Result};

/// Fixed per-engine settings.
///
/// Group size and image format are baked into the compiled kernels; the
/// remaining fields only affect dispatch validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Workgroup size over the output's x and y axes.
    pub group_size: [u32; 2],

    /// Accept binary16 source operands.
    pub allow_f16: bool,

    /// Pixel format of the images the conversion kernels touch.
    pub image_format: ImageFormat,

    /// Largest group count per grid dimension.
    pub max_groups_per_dimension: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            group_size: [8, 8],
            allow_f16: false,
            image_format: ImageFormat::Rgba8Unorm,
            max_groups_per_dimension: 65535,
        }
    }
}

impl EngineConfig {
    pub fn with_group_size(self, x: u32, y: u32) -> Self {
        Self {
            group_size: [x, y],
            ..self
        }
    }

    pub fn with_f16(self, allow_f16: bool) -> Self {
        Self { allow_f16, ..self }
    }

    pub fn with_image_format(self, image_format: ImageFormat) -> Self {
        Self {
            image_format,
            ..self
        }
    }

    /// Threads per workgroup, saturating at `u32::MAX`.
    pub fn group_threads(&self) -> u32 {
        self.group_size[0].saturating_mul(self.group_size[1])
    }

    pub fn validate(&self) -> Result<()> {
        let [x, y] = self.group_size;
        if x == 0 || y == 0 {
            return Err(Error::configuration(format!(
                "group size {x}x{y} must be non-zero"
            )));
        }
        if x.checked_mul(y).is_none_or(|threads| threads > 256) {
            return Err(Error::configuration(format!(
                "group size {x}x{y} exceeds 256 invocations"
            )));
        }
        if self.max_groups_per_dimension == 0 {
            return Err(Error::configuration("max groups per dimension must be non-zero"));
        }
        Ok(())
    }
}
