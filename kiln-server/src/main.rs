use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use hf_hub::api::tokio::ApiBuilder;
use kiln_core::{
    load_model, ArtifactStore, DeviceMap, ExecutionMode, Generator, LoadOptions, ModelSession,
    OutputStore, StatsProbe,
};
use tokio::{self, net::TcpListener};
use tracing_subscriber::EnvFilter;

mod routes;

use routes::{router, AppState, SharedState};

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Local Flux image generation studio")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Model to load
    #[arg(long, default_value = "black-forest-labs/FLUX.1-schnell")]
    model: String,

    /// Host address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 7860)]
    port: u16,

    /// Directory holding downloaded weights (defaults to the Hugging Face cache)
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Directory receiving generated images
    #[arg(long, default_value = "outputs")]
    output_dir: PathBuf,

    /// File name prefix for generated images
    #[arg(long, default_value = "flux")]
    prefix: String,

    /// Keep the text encoders on the accelerator instead of in host memory
    #[arg(long)]
    resident: bool,

    /// Never download, only use weights already in the cache
    #[arg(long)]
    offline: bool,

    /// Hugging Face access token for gated repositories
    #[arg(long, env = "HF_TOKEN", hide_env_values = true)]
    hf_token: Option<String>,

    /// Do not open the UI in a browser on startup
    #[arg(long)]
    no_browser: bool,
}

impl Args {
    fn load_options(&self) -> LoadOptions {
        LoadOptions {
            device_map: DeviceMap::from_cpu_flag(self.cpu),
            execution: if self.resident {
                ExecutionMode::Resident
            } else {
                ExecutionMode::Offloaded
            },
        }
    }

    fn artifact_store(&self) -> Result<ArtifactStore> {
        let cache_dir = match &self.cache_dir {
            Some(dir) => dir.clone(),
            None => hf_hub::Cache::from_env().path().clone(),
        };
        if self.offline {
            return Ok(ArtifactStore::offline(cache_dir));
        }
        let mut builder = ApiBuilder::new().with_cache_dir(cache_dir.clone());
        if let Some(token) = &self.hf_token {
            builder = builder.with_token(Some(token.clone()));
        }
        let api = builder.build().context("failed to create hf hub API")?;
        Ok(ArtifactStore::online(cache_dir, api))
    }
}

/// Loads the model into the shared session without holding its lock while weights load.
async fn load_session(state: &SharedState, args: &Args, reload: bool) {
    if !state.begin_load(reload).await {
        return;
    }
    tracing::info!("loading {}...", args.model);
    let result = match args.artifact_store() {
        Ok(store) => load_model(&args.model, &store, args.load_options()).await,
        Err(e) => Err(e),
    };
    state.finish_load(result).await;
}

/// Initial load, then one reload per `/api/reload` request.
async fn run_loader(state: SharedState, args: &Args) {
    load_session(&state, args, false).await;
    loop {
        state.reload.notified().await;
        load_session(&state, args, true).await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let outputs = OutputStore::new(&args.output_dir, &args.prefix)?;
    let generator = Generator::new(ModelSession::new(), outputs);
    let shared_state = Arc::new(AppState::new(generator, StatsProbe::detect(), &args.model));

    let app = router(shared_state.clone());

    // --- Start the server ---
    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    let url = format!("http://{}", listener.local_addr()?);
    tracing::info!("started server on {url}");

    if !args.no_browser {
        if let Err(e) = open::that(&url) {
            tracing::warn!("failed to open browser: {e}");
        }
    }

    let serve = async { axum::serve(listener, app.into_make_service()).await };
    tokio::select! {
        served = serve => served?,
        () = run_loader(shared_state, &args) => {}
    }

    Ok(())
}
