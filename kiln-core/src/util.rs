use anyhow::Result;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, Tensor};
use image::{imageops::FilterType, DynamicImage};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::DeviceMap;

pub fn select_best_device(device_map: DeviceMap) -> Result<Device> {
    match device_map {
        DeviceMap::ForceCpu => Ok(Device::Cpu),
        DeviceMap::Ordinal(ordinal) if cuda_is_available() => Ok(Device::new_cuda(ordinal)?),
        DeviceMap::Ordinal(ordinal) if metal_is_available() => Ok(Device::new_metal(ordinal)?),
        DeviceMap::Ordinal(_) => {
            #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
            {
                tracing::warn!("running on CPU, to run on GPU(metal), build with `--features metal`");
            }
            #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
            {
                tracing::warn!("running on CPU, to run on GPU, build with `--features cuda`");
            }
            Ok(Device::Cpu)
        }
    }
}

/// Converts a u8 tensor with shape (3, height, width) into an RGB image.
pub fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        anyhow::bail!("tensor_to_image expects an image with 3 channels");
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let buffer = image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| candle_core::Error::msg("error converting tensor to image buffer"))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

/// Resizes `img` to exactly `width` x `height` and converts it to a
/// (1, 3, height, width) tensor with values in [-1, 1].
pub fn image_to_tensor(
    img: &DynamicImage,
    width: usize,
    height: usize,
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    let rgb = img
        .resize_exact(width as u32, height as u32, FilterType::CatmullRom)
        .to_rgb8()
        .into_raw();
    let tensor = Tensor::from_vec(rgb, (height, width, 3), &Device::Cpu)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(1. / 127.5, -1.)?
        .unsqueeze(0)?;
    Ok(tensor.to_device(device)?.to_dtype(dtype)?)
}

/// Latent noise with the same layout as `flux::sampling::get_noise`, drawn on
/// the host from `seed` so every backend starts from identical values.
pub fn seeded_noise(
    seed: u64,
    height: usize,
    width: usize,
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    let height = height.div_ceil(16) * 2;
    let width = width.div_ceil(16) * 2;
    let len = 16 * height * width;
    let mut rng = StdRng::seed_from_u64(seed);
    let values: Vec<f32> = (0..len).map(|_| rng.sample(StandardNormal)).collect();
    let noise = Tensor::from_vec(values, (1, 16, height, width), &Device::Cpu)?;
    Ok(noise.to_device(device)?.to_dtype(dtype)?)
}
