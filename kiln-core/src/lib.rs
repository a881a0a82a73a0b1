pub mod cache;
pub mod control;
pub mod device_map;
pub mod generate;
pub mod loader;
mod loader_factory;
pub mod output;
pub mod session;
pub mod stats;
mod util;

mod flux;

pub use cache::*;
pub use device_map::*;
pub use flux::{FluxLoader, FluxModel, FluxVariant};
pub use generate::*;
use image::DynamicImage;
pub use loader::*;
pub use loader_factory::*;
pub use output::*;
use serde::{Deserialize, Serialize};
pub use session::*;
pub use stats::*;
pub(crate) use util::*;

/// Whether a generation starts from noise alone or from a source image.
#[derive(Debug, Clone)]
pub enum Mode {
    TextToImage,
    ImageToImage { image: DynamicImage, strength: f64 },
}

impl Mode {
    pub fn name(&self) -> &'static str {
        match self {
            Mode::TextToImage => "txt2img",
            Mode::ImageToImage { .. } => "img2img",
        }
    }
}

/// Fully normalized parameters handed to a pipeline.
#[derive(Debug, Clone)]
pub struct PipelineInput {
    pub prompt: String,
    pub width: usize,
    pub height: usize,
    pub steps: usize,
    pub guidance: f64,
    pub seed: u64,
    pub mode: Mode,
}

/// Where the heavy sub-models live while the pipeline is loaded.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Every sub-model stays on the accelerator.
    Resident,
    /// Text encoders stay in host memory; only their embeddings move to the accelerator.
    #[default]
    Offloaded,
}

serde_plain::derive_display_from_serialize!(ExecutionMode);
serde_plain::derive_fromstr_from_deserialize!(ExecutionMode);

pub trait ModelLike: Send {
    fn run(&mut self, input: &PipelineInput) -> anyhow::Result<DynamicImage>;
}
