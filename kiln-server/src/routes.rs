use std::{io::Cursor, path::PathBuf, sync::Arc};

use anyhow::Result;
use axum::{
    extract::{DefaultBodyLimit, Json, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Router,
};
use base64::{prelude::BASE64_STANDARD, Engine};
use image::DynamicImage;
use kiln_core::{
    control, GenerationRequest, GenerationResult, Generator, ModelLike, SessionState, StatsProbe,
    StatsSnapshot,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, Notify};

const INDEX_HTML: &str = include_str!("../assets/index.html");
// Source images arrive base64-encoded inside the JSON body.
const MAX_BODY_BYTES: usize = 64 << 20;

// Application state shared by every handler.
pub struct AppState {
    pub generator: Arc<Mutex<Generator>>,
    pub stats: Arc<Mutex<StatsProbe>>,
    /// Mirror of the session state, readable while a generation holds `generator`.
    pub session_state: watch::Sender<SessionState>,
    /// Wakes the loader task for a reload.
    pub reload: Notify,
    pub output_dir: PathBuf,
    pub model: String,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(generator: Generator, stats: StatsProbe, model: impl Into<String>) -> Self {
        let output_dir = generator.outputs().dir().to_path_buf();
        let (session_state, _) = watch::channel(generator.session().state().clone());
        Self {
            generator: Arc::new(Mutex::new(generator)),
            stats: Arc::new(Mutex::new(stats)),
            session_state,
            reload: Notify::new(),
            output_dir,
            model: model.into(),
        }
    }

    /// Moves the session to `Loading`; false when no load should start.
    pub async fn begin_load(&self, reload: bool) -> bool {
        let mut generator = self.generator.lock().await;
        let session = generator.session_mut();
        let started = if reload {
            session.begin_reload()
        } else {
            session.begin_load()
        };
        if started {
            self.session_state.send_replace(session.state().clone());
        }
        started
    }

    pub async fn finish_load(&self, result: Result<Box<dyn ModelLike>>) {
        let mut generator = self.generator.lock().await;
        let session = generator.session_mut();
        session.finish_load(result);
        self.session_state.send_replace(session.state().clone());
    }
}

/// Body of `POST /v1/images/generations`; omitted fields take the UI defaults.
#[derive(Deserialize, Debug, Default)]
pub struct GenerateBody {
    pub prompt: String,
    /// Base64 source image, optionally as a `data:` URL.
    pub image: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub steps: Option<u32>,
    pub guidance: Option<f64>,
    pub seed: Option<i64>,
    pub strength: Option<f64>,
}

impl GenerateBody {
    pub fn into_request(self) -> Result<GenerationRequest> {
        let defaults = GenerationRequest::default();
        let source_image = match self.image.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(encoded) => Some(decode_image(encoded)?),
        };
        Ok(GenerationRequest {
            prompt: self.prompt,
            source_image,
            width: self.width.unwrap_or(defaults.width),
            height: self.height.unwrap_or(defaults.height),
            steps: self.steps.unwrap_or(defaults.steps),
            guidance: self.guidance.unwrap_or(defaults.guidance),
            seed: self.seed.or(defaults.seed),
            strength: self.strength.unwrap_or(defaults.strength),
        })
    }
}

fn decode_image(encoded: &str) -> Result<DynamicImage> {
    let payload = match encoded.split_once(',') {
        Some((header, data)) if header.starts_with("data:") => data,
        _ => encoded,
    };
    let bytes = BASE64_STANDARD.decode(payload)?;
    Ok(image::load_from_memory(&bytes)?)
}

fn image_to_base64_png(img: &DynamicImage) -> Result<String> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)?;
    Ok(BASE64_STANDARD.encode(&bytes))
}

#[derive(Serialize, Debug)]
pub struct GenerationResponse {
    pub image: Option<String>,
    pub status: String,
    pub seed: Option<u64>,
    pub path: Option<String>,
}

#[derive(Serialize)]
struct StatsResponse {
    html: String,
    snapshot: StatsSnapshot,
}

#[derive(Serialize)]
struct StatusResponse {
    model: String,
    status: String,
    #[serde(flatten)]
    state: SessionState,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": message.into() })),
    )
        .into_response()
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn generate_image_handler(
    State(state): State<SharedState>,
    Json(body): Json<GenerateBody>,
) -> Response {
    let request = match body.into_request() {
        Ok(request) => request,
        Err(e) => {
            return error_response(StatusCode::BAD_REQUEST, format!("invalid source image: {e}"))
        }
    };

    let generator = state.generator.clone();
    let result =
        tokio::task::spawn_blocking(move || generator.blocking_lock().generate(request)).await;
    let result = match result {
        Ok(result) => result,
        Err(e) => {
            tracing::error!("generation task failed: {e}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {e}"));
        }
    };

    let status = result.status_line();
    let seed = result.seed();
    let response = match result {
        GenerationResult::Success { image, path, .. } => match image_to_base64_png(&image) {
            Ok(encoded) => GenerationResponse {
                image: Some(encoded),
                status,
                seed,
                path: Some(path.display().to_string()),
            },
            Err(e) => GenerationResponse {
                image: None,
                status: format!("Error: {e:#}"),
                seed,
                path: Some(path.display().to_string()),
            },
        },
        GenerationResult::Failure { .. } => GenerationResponse {
            image: None,
            status,
            seed: None,
            path: None,
        },
    };
    Json(response).into_response()
}

async fn stats_handler(State(state): State<SharedState>) -> Response {
    let stats = state.stats.clone();
    match tokio::task::spawn_blocking(move || stats.blocking_lock().sample()).await {
        Ok(snapshot) => Json(StatsResponse {
            html: snapshot.to_html(),
            snapshot,
        })
        .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn status_handler(State(state): State<SharedState>) -> Json<StatusResponse> {
    let session_state = state.session_state.borrow().clone();
    Json(StatusResponse {
        model: state.model.clone(),
        status: session_state.status_line(),
        state: session_state,
    })
}

async fn reload_handler(State(state): State<SharedState>) -> Response {
    if *state.session_state.borrow() == SessionState::Loading {
        return error_response(StatusCode::CONFLICT, "model is already loading");
    }
    state.reload.notify_one();
    StatusCode::ACCEPTED.into_response()
}

async fn open_folder_handler(State(state): State<SharedState>) -> StatusCode {
    let dir = state.output_dir.clone();
    tokio::task::spawn_blocking(move || control::open_folder(&dir));
    StatusCode::NO_CONTENT
}

async fn shutdown_handler() -> StatusCode {
    tokio::spawn(async {
        control::shutdown();
    });
    StatusCode::NO_CONTENT
}

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/v1/images/generations", post(generate_image_handler))
        .route("/api/stats", get(stats_handler))
        .route("/api/status", get(status_handler))
        .route("/api/reload", post(reload_handler))
        .route("/api/open-folder", post(open_folder_handler))
        .route("/api/shutdown", post(shutdown_handler))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{header, Request},
    };
    use http_body_util::BodyExt;
    use kiln_core::{ModelSession, NoGpu, OutputStore};
    use serde_json::Value;
    use std::time::Duration;
    use tower::ServiceExt;

    use super::*;

    fn state(dir: &std::path::Path) -> SharedState {
        let generator = Generator::new(
            ModelSession::new(),
            OutputStore::new(dir, "flux").unwrap(),
        );
        Arc::new(AppState::new(
            generator,
            StatsProbe::new(Box::new(NoGpu)),
            "black-forest-labs/FLUX.1-schnell",
        ))
    }

    async fn json_body(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[test]
    fn body_defaults_match_the_ui() {
        let request = GenerateBody {
            prompt: "a red cube".into(),
            ..Default::default()
        }
        .into_request()
        .unwrap();
        assert_eq!((request.width, request.height), (1024, 1024));
        assert_eq!(request.steps, 4);
        assert_eq!(request.seed, Some(-1));
        assert!(request.source_image.is_none());
    }

    #[test]
    fn body_accepts_data_urls() {
        let png = image_to_base64_png(&DynamicImage::new_rgb8(8, 8)).unwrap();
        let request = GenerateBody {
            prompt: "p".into(),
            image: Some(format!("data:image/png;base64,{png}")),
            ..Default::default()
        }
        .into_request()
        .unwrap();
        assert_eq!(request.source_image.unwrap().width(), 8);
    }

    #[tokio::test]
    async fn serves_the_page() {
        let dir = tempfile::tempdir().unwrap();
        let response = router(state(dir.path()))
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn generation_before_load_reports_not_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let response = router(state(dir.path()))
            .oneshot(post_json(
                "/v1/images/generations",
                serde_json::json!({ "prompt": "a red cube", "seed": 42 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "Error: Model not loaded!");
        assert!(body["image"].is_null());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn bad_source_image_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let response = router(state(dir.path()))
            .oneshot(post_json(
                "/v1/images/generations",
                serde_json::json!({ "prompt": "x", "image": "not base64!" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn stats_without_accelerator() {
        let dir = tempfile::tempdir().unwrap();
        let response = router(state(dir.path()))
            .oneshot(Request::get("/api/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = json_body(response).await;
        assert!(body["html"].as_str().unwrap().contains("VRAM: N/A"));
        assert!(body["snapshot"]["gpu"].is_null());
    }

    #[tokio::test]
    async fn status_does_not_wait_for_a_running_generation() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        let _busy = state.generator.lock().await;

        let response = tokio::time::timeout(
            Duration::from_secs(5),
            router(state.clone()).oneshot(Request::get("/api/status").body(Body::empty()).unwrap()),
        )
        .await
        .expect("status blocked behind the generator lock")
        .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn load_progress_is_visible_in_status() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        let app = router(state.clone());

        assert!(state.begin_load(false).await);
        let response = app
            .clone()
            .oneshot(Request::get("/api/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(json_body(response).await["state"], "loading");

        state
            .finish_load(Err(anyhow::anyhow!("download error")))
            .await;
        let response = app
            .oneshot(Request::get("/api/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["state"], "failed");
        assert_eq!(body["status"], "Error: download error");
    }

    #[tokio::test]
    async fn reload_wakes_the_loader() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        let response = router(state.clone())
            .oneshot(post_json("/api/reload", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        tokio::time::timeout(Duration::from_secs(5), state.reload.notified())
            .await
            .expect("reload request did not reach the loader");
    }

    #[tokio::test]
    async fn reload_is_refused_while_loading() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        assert!(state.begin_load(false).await);
        assert!(!state.begin_load(true).await);
        let response = router(state)
            .oneshot(post_json("/api/reload", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn status_reports_session_state() {
        let dir = tempfile::tempdir().unwrap();
        let response = router(state(dir.path()))
            .oneshot(Request::get("/api/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["state"], "unloaded");
        assert_eq!(body["model"], "black-forest-labs/FLUX.1-schnell");
    }
}
