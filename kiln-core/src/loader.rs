use std::future::Future;

use anyhow::Result;

use crate::{ArtifactStore, DeviceMap, ExecutionMode, ModelLike};

/// Settings shared by every loader.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOptions {
    pub device_map: DeviceMap,
    pub execution: ExecutionMode,
}

pub trait Loader {
    type Model: ModelLike;
    type Variant;

    fn load(
        variant: Self::Variant,
        store: &ArtifactStore,
        options: LoadOptions,
    ) -> impl Future<Output = Result<Self::Model>>
    where
        Self: Sized;
}
