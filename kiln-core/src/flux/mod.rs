use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::Module;
use candle_transformers::models::{
    clip::text_model::{Activation, ClipTextConfig, ClipTextTransformer},
    flux::{
        autoencoder::{self, AutoEncoder, DiagonalGaussian, Encoder},
        model::{self, Flux},
        sampling,
    },
    t5::{self, T5EncoderModel},
};
use hf_hub::Repo;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;

use crate::{
    image_to_tensor, seeded_noise, select_best_device, tensor_to_image, Artifact, ArtifactStore,
    ExecutionMode, LoadOptions, Loader, Mode, ModelLike, PipelineInput,
};

#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FluxVariant {
    #[default]
    Schnell,
    Dev,
}

serde_plain::derive_display_from_serialize!(FluxVariant);
serde_plain::derive_fromstr_from_deserialize!(FluxVariant);

impl FluxVariant {
    pub fn repo_id(&self) -> &'static str {
        match self {
            FluxVariant::Schnell => "black-forest-labs/FLUX.1-schnell",
            FluxVariant::Dev => "black-forest-labs/FLUX.1-dev",
        }
    }

    fn weights_file(&self) -> &'static str {
        match self {
            FluxVariant::Schnell => "flux1-schnell.safetensors",
            FluxVariant::Dev => "flux1-dev.safetensors",
        }
    }

    fn t5_max_len(&self) -> usize {
        match self {
            FluxVariant::Schnell => 256,
            FluxVariant::Dev => 512,
        }
    }

    /// Everything a load needs, in the order `FluxLoader::load` consumes it.
    fn manifest(&self) -> Vec<Artifact> {
        let t5 = Repo::with_revision(
            "google/t5-v1_1-xxl".to_string(),
            hf_hub::RepoType::Model,
            "refs/pr/2".to_string(),
        );
        let clip = Repo::model("openai/clip-vit-large-patch14".to_string());
        let bf = Repo::model(self.repo_id().to_string());
        vec![
            Artifact::new(t5.clone(), "model.safetensors"),
            Artifact::new(t5, "config.json"),
            Artifact::new(
                Repo::model("lmz/mt5-tokenizers".to_string()),
                "t5-v1_1-xxl.tokenizer.json",
            ),
            Artifact::new(clip.clone(), "model.safetensors"),
            Artifact::new(clip, "tokenizer.json"),
            Artifact::new(bf.clone(), "ae.safetensors"),
            Artifact::new(bf, self.weights_file()),
        ]
    }
}

/// Autoencoder encoder half that maps a source image to the mean of its
/// latent distribution. `AutoEncoder::encode` samples from that distribution
/// with the unseeded device rng, which would make img2img irreproducible.
pub(crate) struct SourceEncoder {
    encoder: Encoder,
    mean: DiagonalGaussian,
    shift_factor: f64,
    scale_factor: f64,
}

impl SourceEncoder {
    pub(crate) fn new(cfg: &autoencoder::Config, vb: candle_nn::VarBuilder) -> Result<Self> {
        Ok(Self {
            encoder: Encoder::new(cfg, vb.pp("encoder"))?,
            mean: DiagonalGaussian::new(false, 1)?,
            shift_factor: cfg.shift_factor,
            scale_factor: cfg.scale_factor,
        })
    }

    pub(crate) fn encode(&self, xs: &Tensor) -> Result<Tensor> {
        let z = xs.apply(&self.encoder)?.apply(&self.mean)?;
        Ok(((z - self.shift_factor)? * self.scale_factor)?)
    }
}

pub struct FluxModel {
    variant: FluxVariant,
    device: Device,
    dtype: DType,
    encoder_device: Device,
    t5_model: T5EncoderModel,
    t5_tokenizer: Tokenizer,
    clip_model: ClipTextTransformer,
    clip_tokenizer: Tokenizer,
    autoencoder: AutoEncoder,
    source_encoder: SourceEncoder,
    flux_model: Flux,
}

impl FluxModel {
    /// T5 and CLIP embeddings for `prompt`, placed on the denoising device.
    fn embed(&mut self, prompt: &str) -> Result<(Tensor, Tensor)> {
        let mut t5_tokens = self
            .t5_tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        t5_tokens.resize(self.variant.t5_max_len(), 0);
        let input_token_ids = Tensor::new(&*t5_tokens, &self.encoder_device)?.unsqueeze(0)?;
        let t5_emb = self.t5_model.forward(&input_token_ids)?;

        let clip_tokens = self
            .clip_tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        let input_token_ids_clip = Tensor::new(&*clip_tokens, &self.encoder_device)?.unsqueeze(0)?;
        let clip_emb = self.clip_model.forward(&input_token_ids_clip)?;

        Ok((
            t5_emb.to_device(&self.device)?.to_dtype(self.dtype)?,
            clip_emb.to_device(&self.device)?.to_dtype(self.dtype)?,
        ))
    }

    fn schedule(&self, steps: usize, img: &Tensor) -> Result<Vec<f64>> {
        Ok(match self.variant {
            FluxVariant::Schnell => sampling::get_schedule(steps, None),
            FluxVariant::Dev => sampling::get_schedule(steps, Some((img.dim(1)?, 0.5, 1.15))),
        })
    }
}

/// Drops the leading part of `timesteps` so only `floor(steps * strength)`
/// denoising steps remain.
pub(crate) fn truncate_schedule(timesteps: &[f64], strength: f64) -> &[f64] {
    let steps = timesteps.len().saturating_sub(1);
    let kept = ((steps as f64) * strength.clamp(0., 1.)).floor() as usize;
    &timesteps[steps - kept..]
}

impl ModelLike for FluxModel {
    fn run(&mut self, input: &PipelineInput) -> anyhow::Result<DynamicImage> {
        let (width, height) = (input.width, input.height);
        let noise = seeded_noise(input.seed, height, width, &self.device, self.dtype)?;
        let (t5_emb, clip_emb) = self.embed(&input.prompt)?;

        // Packing only depends on the latent shape, which noise and source latents share.
        let packed = sampling::State::new(&t5_emb, &clip_emb, &noise)?;
        let timesteps = self.schedule(input.steps, &packed.img)?;

        let latent_img = match &input.mode {
            Mode::TextToImage => sampling::denoise(
                &self.flux_model,
                &packed.img,
                &packed.img_ids,
                &packed.txt,
                &packed.txt_ids,
                &packed.vec,
                &timesteps,
                input.guidance,
            )?,
            Mode::ImageToImage { image, strength } => {
                let source = image_to_tensor(image, width, height, &self.device, self.dtype)?;
                let latent = self.source_encoder.encode(&source)?;
                let timesteps = truncate_schedule(&timesteps, *strength);
                if timesteps.len() < 2 {
                    tracing::debug!("strength leaves no denoising steps, decoding source latent");
                    sampling::State::new(&t5_emb, &clip_emb, &latent)?.img
                } else {
                    let t0 = timesteps[0];
                    let noised = (noise.affine(t0, 0.)? + latent.affine(1. - t0, 0.)?)?;
                    let state = sampling::State::new(&t5_emb, &clip_emb, &noised)?;
                    sampling::denoise(
                        &self.flux_model,
                        &state.img,
                        &state.img_ids,
                        &state.txt,
                        &state.txt_ids,
                        &state.vec,
                        timesteps,
                        input.guidance,
                    )?
                }
            }
        };

        let unpacked = sampling::unpack(&latent_img, height, width)?;
        tracing::debug!("generated latent image");

        let decoded = self.autoencoder.decode(&unpacked)?;
        tracing::debug!("decoded image");

        let img = ((decoded.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?.to_dtype(DType::U8)?;
        let img_tensor = img.i(0)?;

        tensor_to_image(&img_tensor)
    }
}

pub struct FluxLoader;

impl Loader for FluxLoader {
    type Model = FluxModel;
    type Variant = FluxVariant;

    async fn load(
        variant: FluxVariant,
        store: &ArtifactStore,
        options: LoadOptions,
    ) -> Result<Self::Model> {
        let device = select_best_device(options.device_map).context("failed to set up device")?;
        let dtype = device.bf16_default_to_f32();
        let encoder_device = match options.execution {
            ExecutionMode::Resident => device.clone(),
            ExecutionMode::Offloaded => Device::Cpu,
        };
        let encoder_dtype = encoder_device.bf16_default_to_f32();

        let paths = store.ensure(variant.repo_id(), &variant.manifest()).await?;
        let [t5_model_file, t5_config_file, t5_tokenizer_file, clip_model_file, clip_tokenizer_file, autoencoder_model_file, flux_model_file] =
            <[_; 7]>::try_from(paths)
                .map_err(|paths| anyhow::anyhow!("expected 7 artifacts, got {}", paths.len()))?;

        // --- T5 ---
        let t5_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(
                &[t5_model_file],
                encoder_dtype,
                &encoder_device,
            )
            .context("failed to build T5 var builder")?
        };
        let config_str =
            std::fs::read_to_string(&t5_config_file).context("failed to read T5 config")?;
        let t5_config: t5::Config =
            serde_json::from_str(&config_str).context("failed to parse T5 config")?;
        let t5_model =
            T5EncoderModel::load(t5_vb, &t5_config).context("failed to load T5 model")?;
        let t5_tokenizer = Tokenizer::from_file(t5_tokenizer_file)
            .map_err(anyhow::Error::msg)
            .context("failed to load T5 tokenizer")?;

        // --- CLIP ---
        let clip_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(
                &[clip_model_file],
                encoder_dtype,
                &encoder_device,
            )
            .context("failed to build CLIP var builder")?
        };
        let clip_config = ClipTextConfig {
            vocab_size: 49408,
            projection_dim: 768,
            activation: Activation::QuickGelu,
            intermediate_size: 3072,
            embed_dim: 768,
            max_position_embeddings: 77,
            pad_with: None,
            num_hidden_layers: 12,
            num_attention_heads: 12,
        };
        let clip_model = ClipTextTransformer::new(clip_vb.pp("text_model"), &clip_config)
            .context("failed to load CLIP model")?;
        let clip_tokenizer = Tokenizer::from_file(clip_tokenizer_file)
            .map_err(anyhow::Error::msg)
            .context("failed to load CLIP tokenizer")?;

        // --- Autoencoder ---
        let autoencoder_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(
                &[autoencoder_model_file],
                dtype,
                &device,
            )
            .context("failed to build autoencoder var builder")?
        };
        let autoencoder_config = match variant {
            FluxVariant::Schnell => autoencoder::Config::schnell(),
            FluxVariant::Dev => autoencoder::Config::dev(),
        };
        let source_encoder = SourceEncoder::new(&autoencoder_config, autoencoder_vb.clone())
            .context("failed to load autoencoder encoder")?;
        let autoencoder = AutoEncoder::new(&autoencoder_config, autoencoder_vb)
            .context("failed to load autoencoder")?;

        // --- Flux transformer ---
        let flux_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[flux_model_file], dtype, &device)
                .context("failed to build flux var builder")?
        };
        let flux_config = match variant {
            FluxVariant::Schnell => model::Config::schnell(),
            FluxVariant::Dev => model::Config::dev(),
        };
        let flux_model = Flux::new(&flux_config, flux_vb).context("failed to load flux model")?;

        tracing::info!(%variant, ?device, "flux pipeline ready");

        Ok(FluxModel {
            variant,
            device,
            dtype,
            encoder_device,
            t5_model,
            t5_tokenizer,
            clip_model,
            clip_tokenizer,
            autoencoder,
            source_encoder,
            flux_model,
        })
    }
}
