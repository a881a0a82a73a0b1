//! Turns a raw request from the UI into one pipeline call and a saved image.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use image::DynamicImage;
use thiserror::Error;

use crate::{Mode, ModelSession, OutputStore, PipelineInput};

pub const MIN_SIZE: u32 = 512;
pub const MAX_SIZE: u32 = 2048;
pub const SIZE_STEP: u32 = 64;
pub const MAX_STEPS: u32 = 50;
pub const MAX_GUIDANCE: f64 = 10.0;
/// Seed value that asks for a fresh random seed.
pub const RANDOM_SEED: i64 = -1;

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    /// Switches to image-to-image when present.
    pub source_image: Option<DynamicImage>,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub guidance: f64,
    /// `None` or any negative value draws a random seed.
    pub seed: Option<i64>,
    /// Only read in image-to-image mode.
    pub strength: f64,
}

impl Default for GenerationRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            source_image: None,
            width: 1024,
            height: 1024,
            steps: 4,
            guidance: 1.0,
            seed: Some(RANDOM_SEED),
            strength: 0.8,
        }
    }
}

/// Clamps to `[MIN_SIZE, MAX_SIZE]` and snaps to the nearest multiple of `SIZE_STEP`.
pub fn normalize_dimension(value: u32) -> u32 {
    let clamped = value.clamp(MIN_SIZE, MAX_SIZE);
    let snapped = (clamped + SIZE_STEP / 2) / SIZE_STEP * SIZE_STEP;
    snapped.min(MAX_SIZE)
}

/// Concrete seed for a request: random 32-bit for the sentinel, verbatim otherwise.
pub fn resolve_seed(seed: Option<i64>) -> u64 {
    match seed {
        Some(seed) if seed >= 0 => seed as u64,
        _ => rand::random::<u32>() as u64,
    }
}

fn finite_or(value: f64, fallback: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        fallback
    }
}

impl GenerationRequest {
    /// Applies the clamp policy and resolves the seed.
    pub fn normalize(self) -> PipelineInput {
        let defaults = Self::default();
        let mode = match self.source_image {
            Some(image) => Mode::ImageToImage {
                image,
                strength: finite_or(self.strength, defaults.strength).clamp(0., 1.),
            },
            None => Mode::TextToImage,
        };
        PipelineInput {
            prompt: self.prompt,
            width: normalize_dimension(self.width) as usize,
            height: normalize_dimension(self.height) as usize,
            steps: self.steps.clamp(1, MAX_STEPS) as usize,
            guidance: finite_or(self.guidance, defaults.guidance).clamp(0., MAX_GUIDANCE),
            seed: resolve_seed(self.seed),
            mode,
        }
    }
}

#[derive(Error, Debug)]
pub enum GenerateError {
    #[error("Model not loaded!")]
    NotReady,
    #[error("{0:#}")]
    Pipeline(anyhow::Error),
    #[error("{0:#}")]
    Output(anyhow::Error),
}

#[derive(Debug)]
pub enum GenerationResult {
    Success {
        image: DynamicImage,
        path: PathBuf,
        seed: u64,
        elapsed: Duration,
    },
    Failure {
        error: GenerateError,
    },
}

impl GenerationResult {
    pub fn status_line(&self) -> String {
        match self {
            GenerationResult::Success { seed, elapsed, .. } => {
                format!("Done! Seed: {} ({:.2}s)", seed, elapsed.as_secs_f64())
            }
            GenerationResult::Failure { error } => format!("Error: {error}"),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, GenerationResult::Success { .. })
    }

    pub fn seed(&self) -> Option<u64> {
        match self {
            GenerationResult::Success { seed, .. } => Some(*seed),
            GenerationResult::Failure { .. } => None,
        }
    }
}

impl From<GenerateError> for GenerationResult {
    fn from(error: GenerateError) -> Self {
        GenerationResult::Failure { error }
    }
}

/// Owns the model session and the output directory.
pub struct Generator {
    session: ModelSession,
    outputs: OutputStore,
}

impl Generator {
    pub fn new(session: ModelSession, outputs: OutputStore) -> Self {
        Self { session, outputs }
    }

    pub fn session(&self) -> &ModelSession {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut ModelSession {
        &mut self.session
    }

    pub fn outputs(&self) -> &OutputStore {
        &self.outputs
    }

    /// Never fails outright: every error comes back as `GenerationResult::Failure`.
    pub fn generate(&mut self, request: GenerationRequest) -> GenerationResult {
        if !self.session.is_ready() {
            return GenerateError::NotReady.into();
        }

        let input = request.normalize();
        tracing::info!(
            mode = input.mode.name(),
            seed = input.seed,
            "generating: '{}'",
            input.prompt
        );

        let start = Instant::now();
        let image = match self.session.run(&input) {
            None => return GenerateError::NotReady.into(),
            Some(Err(e)) => {
                tracing::error!("generation failed: {e:#}");
                return GenerateError::Pipeline(e).into();
            }
            Some(Ok(image)) => image,
        };
        let elapsed = start.elapsed();

        let path = match self.outputs.save(&image) {
            Ok(path) => path,
            Err(e) => {
                tracing::error!("saving output failed: {e:#}");
                return GenerateError::Output(e).into();
            }
        };
        tracing::info!("saved {} in {:.2}s", path.display(), elapsed.as_secs_f64());

        GenerationResult::Success {
            image,
            path,
            seed: input.seed,
            elapsed,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;
    use crate::session::tests::FakeModel;

    fn generator(dir: &std::path::Path, calls: Arc<AtomicUsize>) -> Generator {
        Generator::new(
            ModelSession::with_model(FakeModel::boxed(calls)),
            OutputStore::new(dir, "flux").unwrap(),
        )
    }

    fn red_cube() -> GenerationRequest {
        GenerationRequest {
            prompt: "a red cube".to_string(),
            source_image: None,
            width: 1024,
            height: 1024,
            steps: 4,
            guidance: 1.0,
            seed: Some(42),
            strength: 0.8,
        }
    }

    fn files_in(dir: &std::path::Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn dimensions_are_clamped_and_aligned() {
        assert_eq!(normalize_dimension(100), 512);
        assert_eq!(normalize_dimension(4096), 2048);
        assert_eq!(normalize_dimension(1000), 1024);
        assert_eq!(normalize_dimension(1055), 1024);
        assert_eq!(normalize_dimension(1056), 1088);
        assert_eq!(normalize_dimension(2047), 2048);
        for value in [0, 513, 777, 1500, 2100] {
            let n = normalize_dimension(value);
            assert_eq!(n % SIZE_STEP, 0);
            assert!((MIN_SIZE..=MAX_SIZE).contains(&n));
        }
    }

    #[test]
    fn explicit_seeds_pass_through() {
        assert_eq!(resolve_seed(Some(42)), 42);
        assert_eq!(resolve_seed(Some(0)), 0);
        assert_eq!(resolve_seed(Some(5_000_000_000)), 5_000_000_000);
    }

    #[test]
    fn random_seeds_fit_in_u32() {
        for seed in [None, Some(RANDOM_SEED), Some(-7)] {
            for _ in 0..64 {
                assert!(resolve_seed(seed) <= u32::MAX as u64);
            }
        }
    }

    #[test]
    fn normalize_clamps_every_parameter() {
        let input = GenerationRequest {
            width: 300,
            height: 3000,
            steps: 0,
            guidance: 25.0,
            strength: 3.0,
            source_image: Some(DynamicImage::new_rgb8(8, 8)),
            ..red_cube()
        }
        .normalize();
        assert_eq!((input.width, input.height), (512, 2048));
        assert_eq!(input.steps, 1);
        assert_eq!(input.guidance, MAX_GUIDANCE);
        match input.mode {
            Mode::ImageToImage { strength, .. } => assert_eq!(strength, 1.0),
            Mode::TextToImage => panic!("source image should select img2img"),
        }

        let input = GenerationRequest {
            steps: 80,
            guidance: f64::NAN,
            ..red_cube()
        }
        .normalize();
        assert_eq!(input.steps, 50);
        assert_eq!(input.guidance, 1.0);
    }

    #[test]
    fn strength_is_ignored_without_source_image() {
        let a = GenerationRequest { strength: 0.1, ..red_cube() }.normalize();
        let b = GenerationRequest { strength: 0.9, ..red_cube() }.normalize();
        assert!(matches!(a.mode, Mode::TextToImage));
        assert!(matches!(b.mode, Mode::TextToImage));
    }

    #[test]
    fn red_cube_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut generator = generator(dir.path(), calls.clone());

        let result = generator.generate(red_cube());
        assert!(result.is_success());
        assert_eq!(result.seed(), Some(42));
        assert!(result.status_line().contains("42"));
        assert!(result.status_line().starts_with("Done! Seed: 42 ("));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let GenerationResult::Success { image, path, .. } = result else {
            unreachable!()
        };
        assert_eq!((image.width(), image.height()), (1024, 1024));
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        let stamp = name
            .strip_prefix("flux_")
            .and_then(|s| s.strip_suffix(".png"))
            .unwrap();
        assert!(stamp.parse::<i64>().unwrap() > 0);
        assert_eq!(files_in(dir.path()), vec![name]);
    }

    #[test]
    fn repeated_explicit_seed_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let mut generator = generator(dir.path(), Arc::new(AtomicUsize::new(0)));
        let first = generator.generate(red_cube());
        let second = generator.generate(red_cube());
        assert_eq!(first.seed(), Some(42));
        assert_eq!(first.seed(), second.seed());
        assert_eq!(files_in(dir.path()).len(), 2);
    }

    #[test]
    fn random_seed_is_echoed_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut generator = generator(dir.path(), Arc::new(AtomicUsize::new(0)));
        let result = generator.generate(GenerationRequest {
            seed: Some(RANDOM_SEED),
            ..red_cube()
        });
        let seed = result.seed().unwrap();
        assert!(seed <= u32::MAX as u64);
        assert!(result.status_line().contains(&seed.to_string()));
    }

    #[test]
    fn source_image_selects_img2img() {
        let dir = tempfile::tempdir().unwrap();
        let mut generator = generator(dir.path(), Arc::new(AtomicUsize::new(0)));
        let result = generator.generate(GenerationRequest {
            source_image: Some(DynamicImage::new_rgb8(64, 64)),
            ..red_cube()
        });
        let GenerationResult::Success { image, .. } = result else {
            panic!("expected success");
        };
        // The fake paints img2img output white.
        assert_eq!(image.to_rgb8().get_pixel(0, 0).0, [255, 255, 255]);
    }

    #[test]
    fn failed_session_rejects_without_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = ModelSession::new();
        assert!(session.begin_load());
        session.finish_load(Err(anyhow::anyhow!("incompatible hardware")));
        let mut generator = Generator::new(session, OutputStore::new(dir.path(), "flux").unwrap());

        let result = generator.generate(red_cube());
        assert!(!result.is_success());
        assert_eq!(result.status_line(), "Error: Model not loaded!");
        assert!(files_in(dir.path()).is_empty());
    }

    #[test]
    fn unloaded_session_makes_no_pipeline_call() {
        let dir = tempfile::tempdir().unwrap();
        let mut generator = Generator::new(
            ModelSession::new(),
            OutputStore::new(dir.path(), "flux").unwrap(),
        );
        let result = generator.generate(red_cube());
        assert!(matches!(
            result,
            GenerationResult::Failure {
                error: GenerateError::NotReady
            }
        ));
        assert!(files_in(dir.path()).is_empty());
    }

    #[test]
    fn pipeline_errors_become_messages() {
        let dir = tempfile::tempdir().unwrap();
        let model = FakeModel {
            calls: Arc::new(AtomicUsize::new(0)),
            fail_with: Some("CUDA out of memory".to_string()),
        };
        let mut generator = Generator::new(
            ModelSession::with_model(Box::new(model)),
            OutputStore::new(dir.path(), "flux").unwrap(),
        );
        let result = generator.generate(red_cube());
        assert_eq!(result.status_line(), "Error: CUDA out of memory");
        assert!(files_in(dir.path()).is_empty());
        assert!(generator.session().is_ready());
    }
}
