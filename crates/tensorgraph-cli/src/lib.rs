//! TensorGraph CLI library - shared functionality for testing and binary.

pub mod inspect;
pub mod run;

use tensorgraph_runtime::{Network, networks};

/// Built-in network selectable on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum NetworkKind {
    Denoiser,
    Classifier,
}

impl NetworkKind {
    pub fn network(self) -> Network {
        match self {
            NetworkKind::Denoiser => networks::denoiser(),
            NetworkKind::Classifier => networks::classifier(),
        }
    }
}
