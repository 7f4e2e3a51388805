//! Adapter selection and device creation.

use crate::error::{Result, RuntimeError};
use crate::graph::{GraphConfig, TensorGraph};
use std::sync::Arc;
use tracing::info;

/// Main entry point for GPU execution.
///
/// Owns the wgpu device and queue and hands them out to [`TensorGraph`]s.
///
/// # Example
/// ```no_run
/// # use tensorgraph_runtime::{GraphConfig, Runtime};
/// #[pollster::main]
/// async fn main() -> anyhow::Result<()> {
///     let runtime = Runtime::new().await?;
///     let graph = runtime.graph(GraphConfig::default())?;
///     Ok(())
/// }
/// ```
pub struct Runtime {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    adapter_info: wgpu::AdapterInfo,
}

impl Runtime {
    /// Initialize the runtime with the default high-performance adapter.
    ///
    /// # Errors
    /// Returns [`RuntimeError::Setup`] if no adapter is found, the adapter
    /// cannot run compute shaders or device creation fails.
    pub async fn new() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|e| RuntimeError::Setup(format!("Failed to find suitable GPU adapter: {e}")))?;

        Self::with_adapter(&adapter).await
    }

    /// Initialize the runtime on a specific adapter.
    pub async fn with_adapter(adapter: &wgpu::Adapter) -> Result<Self> {
        let adapter_info = adapter.get_info();

        let downlevel = adapter.get_downlevel_capabilities();
        if !downlevel
            .flags
            .contains(wgpu::DownlevelFlags::COMPUTE_SHADERS)
        {
            return Err(RuntimeError::Setup(format!(
                "adapter '{}' does not support compute shaders",
                adapter_info.name
            )));
        }

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor::default())
            .await
            .map_err(|e| RuntimeError::Setup(format!("Failed to create device: {e}")))?;

        info!(
            adapter = %adapter_info.name,
            backend = ?adapter_info.backend,
            "GPU device ready"
        );

        Ok(Self {
            device: Arc::new(device),
            queue: Arc::new(queue),
            adapter_info,
        })
    }

    /// Create a dispatcher on this device, compiling every kernel.
    pub fn graph(&self, config: GraphConfig) -> Result<TensorGraph> {
        TensorGraph::new(Arc::clone(&self.device), Arc::clone(&self.queue), config)
    }

    /// Get information about the GPU adapter.
    pub fn adapter_info(&self) -> &wgpu::AdapterInfo {
        &self.adapter_info
    }

    pub fn device(&self) -> &Arc<wgpu::Device> {
        &self.device
    }

    pub fn queue(&self) -> &Arc<wgpu::Queue> {
        &self.queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[pollster::test]
    #[ignore = "requires GPU"]
    async fn test_runtime_init() {
        let runtime = Runtime::new().await;
        assert!(runtime.is_ok(), "Failed to initialize runtime");

        if let Ok(runtime) = runtime {
            let info = runtime.adapter_info();
            println!("GPU: {} ({:?})", info.name, info.backend);
        }
    }
}
