//! Local weight cache.
//!
//! Artifacts are stored in the regular hf-hub cache layout under `cache_dir`.
//! A marker file per model records that every artifact of its manifest has
//! been fetched, so later startups resolve paths without touching the network.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use hf_hub::{api::tokio::Api, Cache, Repo};

/// A single file inside a hub repository.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub repo: Repo,
    pub file: String,
}

impl Artifact {
    pub fn new(repo: Repo, file: impl Into<String>) -> Self {
        Self {
            repo,
            file: file.into(),
        }
    }
}

pub struct ArtifactStore {
    cache_dir: PathBuf,
    api: Option<Api>,
}

impl ArtifactStore {
    /// Store that downloads missing artifacts through `api`.
    pub fn online(cache_dir: impl Into<PathBuf>, api: Api) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            api: Some(api),
        }
    }

    /// Store that only resolves artifacts already present on disk.
    pub fn offline(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            api: None,
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn marker_path(&self, model_id: &str) -> PathBuf {
        let name: String = model_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect();
        self.cache_dir.join(".kiln").join(format!("{name}.ready"))
    }

    /// Resolves every artifact of `manifest`, downloading whatever is missing.
    /// Paths come back in manifest order.
    pub async fn ensure(&self, model_id: &str, manifest: &[Artifact]) -> Result<Vec<PathBuf>> {
        let marker = self.marker_path(model_id);
        if marker.exists() {
            if let Some(paths) = self.resolve_local(manifest) {
                tracing::info!(model_id, "artifacts found in {}", self.cache_dir.display());
                return Ok(paths);
            }
            tracing::warn!(model_id, "marker present but cache incomplete, re-fetching");
        }

        let mut paths = Vec::with_capacity(manifest.len());
        for artifact in manifest {
            paths.push(self.fetch(artifact).await?);
        }

        if let Some(parent) = marker.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        std::fs::write(&marker, model_id)
            .with_context(|| format!("failed to write marker {}", marker.display()))?;
        Ok(paths)
    }

    fn resolve_local(&self, manifest: &[Artifact]) -> Option<Vec<PathBuf>> {
        let cache = Cache::new(self.cache_dir.clone());
        manifest
            .iter()
            .map(|a| cache.repo(a.repo.clone()).get(&a.file))
            .collect()
    }

    async fn fetch(&self, artifact: &Artifact) -> Result<PathBuf> {
        let cached = Cache::new(self.cache_dir.clone())
            .repo(artifact.repo.clone())
            .get(&artifact.file);
        if let Some(path) = cached {
            return Ok(path);
        }
        let repo_id = artifact.repo.url();
        let api = self.api.as_ref().ok_or_else(|| {
            anyhow!(
                "{} from {} is not cached and downloads are disabled",
                artifact.file,
                repo_id
            )
        })?;
        tracing::info!("downloading {} from {}", artifact.file, repo_id);
        api.repo(artifact.repo.clone())
            .get(&artifact.file)
            .await
            .with_context(|| format!("failed to download {} from {}", artifact.file, repo_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hf_hub::RepoType;

    /// Lays out `file` for `repo_id` the way hf-hub stores a downloaded snapshot.
    fn seed_cache(root: &Path, repo_id: &str, file: &str) -> PathBuf {
        let repo_dir = root.join(format!("models--{}", repo_id.replace('/', "--")));
        std::fs::create_dir_all(repo_dir.join("refs")).unwrap();
        std::fs::write(repo_dir.join("refs").join("main"), "abc123").unwrap();
        let snapshot = repo_dir.join("snapshots").join("abc123");
        std::fs::create_dir_all(&snapshot).unwrap();
        let path = snapshot.join(file);
        std::fs::write(&path, b"weights").unwrap();
        path
    }

    fn manifest() -> Vec<Artifact> {
        vec![Artifact::new(
            Repo::new("acme/tiny".to_string(), RepoType::Model),
            "ae.safetensors",
        )]
    }

    #[test]
    fn marker_name_is_path_safe() {
        let store = ArtifactStore::offline("/tmp/cache");
        assert_eq!(
            store.marker_path("black-forest-labs/FLUX.1-schnell"),
            PathBuf::from("/tmp/cache/.kiln/black-forest-labs_FLUX.1-schnell.ready")
        );
    }

    #[tokio::test]
    async fn cached_artifacts_resolve_and_write_marker() {
        let dir = tempfile::tempdir().unwrap();
        let expected = seed_cache(dir.path(), "acme/tiny", "ae.safetensors");
        let store = ArtifactStore::offline(dir.path());

        let paths = store.ensure("acme/tiny", &manifest()).await.unwrap();
        assert_eq!(paths, vec![expected.clone()]);
        assert!(store.marker_path("acme/tiny").exists());

        let again = store.ensure("acme/tiny", &manifest()).await.unwrap();
        assert_eq!(again, vec![expected]);
    }

    #[tokio::test]
    async fn offline_miss_is_an_error_and_leaves_no_marker() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::offline(dir.path());

        let err = store.ensure("acme/tiny", &manifest()).await.unwrap_err();
        assert!(err.to_string().contains("ae.safetensors"));
        assert!(!store.marker_path("acme/tiny").exists());
    }
}
