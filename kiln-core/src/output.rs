use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::DynamicImage;

/// Directory that receives every finished image as `<prefix>_<unix_seconds>.png`.
#[derive(Debug, Clone)]
pub struct OutputStore {
    dir: PathBuf,
    prefix: String,
}

impl OutputStore {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create output directory {}", dir.display()))?;
        Ok(Self {
            dir,
            prefix: prefix.into(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn save(&self, image: &DynamicImage) -> Result<PathBuf> {
        self.save_at(image, chrono::Utc::now().timestamp())
    }

    pub(crate) fn save_at(&self, image: &DynamicImage, timestamp: i64) -> Result<PathBuf> {
        let path = self.free_path(timestamp);
        image
            .save_with_format(&path, image::ImageFormat::Png)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(path)
    }

    /// Completions within the same second get a counter suffix instead of overwriting.
    fn free_path(&self, timestamp: i64) -> PathBuf {
        let base = format!("{}_{}", self.prefix, timestamp);
        let mut path = self.dir.join(format!("{base}.png"));
        let mut n = 1;
        while path.exists() {
            path = self.dir.join(format!("{base}_{n}.png"));
            n += 1;
        }
        path
    }
}
