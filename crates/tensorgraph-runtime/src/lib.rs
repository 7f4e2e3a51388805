//! GPU execution for TensorGraph networks.
//!
//! This crate runs fixed convolutional networks on the GPU using `wgpu`.
//!
//! # Architecture
//!
//! 1. **Device setup** ([`Runtime`]) - adapter and device selection
//! 2. **Dispatch** ([`TensorGraph`]) - buffer ownership, kernel pipelines and
//!    one compute pass per operator, validated before recording
//! 3. **Sessions** ([`Session`]) - a network's stage list run once per frame
//!    over ping-pong scratch buffers
//!
//! # Example
//!
//! ```no_run
//! use tensorgraph_runtime::{GraphConfig, Image, Runtime, Session, SessionConfig, networks};
//!
//! #[pollster::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = Runtime::new().await?;
//!     let graph = runtime.graph(GraphConfig::default())?;
//!
//!     let model = tensorgraph_model::load_model("denoiser.bin")?;
//!     let mut session = Session::new(graph, &model, SessionConfig::new(networks::denoiser()))?;
//!
//!     session.set_input(&Image::new(256, 128))?;
//!     let report = session.advance()?;
//!     println!("frame {} in {:?}", report.frame, report.elapsed);
//!
//!     let image = session.read_output_image()?;
//!     println!("{}x{}", image.width, image.height);
//!     Ok(())
//! }
//! ```

mod error;
mod graph;
mod image;
pub mod networks;
mod runtime;
mod session;
pub mod stage;

// Public exports
pub use error::{Result, RuntimeError};
pub use graph::{GraphConfig, TensorGraph};
pub use image::{Image, image_format, texture_format};
pub use networks::{Network, NetworkOutput};
pub use runtime::Runtime;
pub use session::{FrameReport, Session, SessionConfig, SessionState};
pub use stage::{Operand, Stage, StageOp, Target};

pub use tensorgraph_core::{Activation, BufferId, DispatchFlags, Format, TensorDesc};
pub use tensorgraph_operators::{ImageExtent, ImageFormat, Operation};
