use anyhow::{anyhow, Result};

use crate::{flux, ArtifactStore, FluxLoader, LoadOptions, Loader, ModelLike};

/// Enum of supported model families
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ModelType {
    Flux,
}

impl ModelType {
    /// Detect model type from model name
    pub fn from_name(model_name: &str) -> Option<Self> {
        if model_name.to_uppercase().contains("FLUX") {
            Some(ModelType::Flux)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModelVariant {
    Flux(flux::FluxVariant),
}

impl ModelVariant {
    /// Detect model variant from model name
    pub fn from_name(model_name: &str) -> Option<Self> {
        let name_upper = model_name.to_uppercase();

        if name_upper.contains("FLUX") {
            Some(ModelVariant::Flux(if name_upper.contains("DEV") {
                flux::FluxVariant::Dev
            } else {
                flux::FluxVariant::Schnell
            }))
        } else {
            None
        }
    }
}

/// Load a model based on its name, automatically detecting the appropriate loader
pub async fn load_model(
    model_name: &str,
    store: &ArtifactStore,
    options: LoadOptions,
) -> Result<Box<dyn ModelLike>> {
    let model_type = ModelType::from_name(model_name)
        .ok_or_else(|| anyhow!("Unsupported model type: {}", model_name))?;
    let model_variant = ModelVariant::from_name(model_name)
        .ok_or_else(|| anyhow!("Unsupported model variant: {}", model_name))?;

    tracing::info!(
        "loading model: {} (detected type: {:?}/variant: {:?}, {} execution)",
        model_name,
        model_type,
        model_variant,
        options.execution
    );

    match model_variant {
        ModelVariant::Flux(variant) => {
            let model = FluxLoader::load(variant, store, options).await?;
            Ok(Box::new(model))
        }
    }
}
