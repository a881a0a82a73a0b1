//! Lifecycle of the loaded pipeline.

use std::future::Future;

use anyhow::Result;
use serde::Serialize;

use crate::{ModelLike, PipelineInput};

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "state", content = "message", rename_all = "lowercase")]
pub enum SessionState {
    Unloaded,
    Loading,
    Ready,
    Failed(String),
}

impl SessionState {
    pub fn status_line(&self) -> String {
        match self {
            SessionState::Unloaded => "Not loaded".to_string(),
            SessionState::Loading => "Loading...".to_string(),
            SessionState::Ready => "Ready".to_string(),
            SessionState::Failed(message) => format!("Error: {message}"),
        }
    }
}

/// Exclusively owned handle to at most one loaded pipeline.
pub struct ModelSession {
    state: SessionState,
    model: Option<Box<dyn ModelLike>>,
}

impl Default for ModelSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelSession {
    pub fn new() -> Self {
        Self {
            state: SessionState::Unloaded,
            model: None,
        }
    }

    /// Session that is already `Ready` with `model`.
    pub fn with_model(model: Box<dyn ModelLike>) -> Self {
        Self {
            state: SessionState::Ready,
            model: Some(model),
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    /// Loads the pipeline unless one is already loaded or loading, in which
    /// case the current state is returned untouched.
    pub async fn load<F, Fut>(&mut self, loader: F) -> &SessionState
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Box<dyn ModelLike>>>,
    {
        if self.begin_load() {
            let result = loader().await;
            self.finish_load(result);
        }
        &self.state
    }

    /// Like `begin_load`, but also starts over from `Ready` by dropping the
    /// loaded pipeline. Refuses while a load is in flight.
    pub fn begin_reload(&mut self) -> bool {
        if self.state == SessionState::Loading {
            return false;
        }
        self.model = None;
        self.state = SessionState::Loading;
        true
    }

    /// Moves to `Loading` and returns true when a load should start.
    pub fn begin_load(&mut self) -> bool {
        match self.state {
            SessionState::Ready | SessionState::Loading => false,
            SessionState::Unloaded | SessionState::Failed(_) => {
                self.state = SessionState::Loading;
                true
            }
        }
    }

    pub fn finish_load(&mut self, result: Result<Box<dyn ModelLike>>) {
        match result {
            Ok(model) => {
                tracing::info!("model loaded successfully");
                self.model = Some(model);
                self.state = SessionState::Ready;
            }
            Err(e) => {
                tracing::error!("loading error: {e:#}");
                self.model = None;
                self.state = SessionState::Failed(format!("{e:#}"));
            }
        }
    }

    /// Runs the pipeline; `None` when no pipeline is ready.
    pub(crate) fn run(&mut self, input: &PipelineInput) -> Option<Result<image::DynamicImage>> {
        if !self.is_ready() {
            return None;
        }
        self.model.as_mut().map(|model| model.run(input))
    }
}
