use std::io::Write;
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::Json;
use axum::routing::post;
use axum::Router;
use log::{error, info};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};

use crate::config::Settings;
use crate::db::shards::ShardBase;
use crate::error::EngineError;
use crate::pipeline;

const MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

struct AppState {
    settings: Settings,
    base: ShardBase,
}

/// Serve `POST /identify` until the process is stopped.
pub async fn serve(settings: Settings, base: ShardBase) -> anyhow::Result<()> {
    let origin: HeaderValue = settings.server.frontend_origin.parse()?;
    let cors = CorsLayer::new()
        .allow_origin(origin)
        .allow_methods(Any)
        .allow_headers(Any);

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let state = Arc::new(AppState { settings, base });

    let app = Router::new()
        .route("/identify", post(identify))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(cors)
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr.as_str()).await?;
    info!("listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Multipart form: `file` (audio bytes) and optional `duration` (seconds of
/// the clip to analyze). Returns the single highest-confidence match.
async fn identify(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> (StatusCode, Json<Value>) {
    match identify_inner(state, multipart).await {
        Ok(top) => (StatusCode::OK, Json(json!({ "matches": top }))),
        Err(EngineError::NotFound) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "detail": "No matches found." })),
        ),
        Err(e) => {
            error!("identify request failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "detail": e.to_string() })),
            )
        }
    }
}

async fn identify_inner(
    state: Arc<AppState>,
    mut multipart: Multipart,
) -> Result<crate::db::store::Match, EngineError> {
    let mut duration = 10.0f32;
    let mut upload: Option<(String, Vec<u8>)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| EngineError::Internal(format!("malformed multipart body: {e}")))?
    {
        let name = field.name().map(|s| s.to_string());
        match name.as_deref() {
            Some("file") => {
                let ext = field
                    .file_name()
                    .and_then(|n| n.rsplit_once('.').map(|(_, e)| e.to_string()))
                    .unwrap_or_else(|| "wav".to_string());
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| EngineError::Internal(format!("failed to read upload: {e}")))?;
                upload = Some((ext, bytes.to_vec()));
            }
            Some("duration") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| EngineError::Internal(format!("failed to read field: {e}")))?;
                duration = text
                    .parse()
                    .map_err(|_| EngineError::Config(format!("invalid duration '{text}'")))?;
            }
            _ => {}
        }
    }

    let (ext, bytes) =
        upload.ok_or_else(|| EngineError::Config("missing 'file' field".to_string()))?;
    info!("identify request: {} bytes, duration {duration}s", bytes.len());

    // The decoder works from a path, so the upload is spooled to a
    // temporary file carrying its original extension.
    let matches = tokio::task::spawn_blocking(move || {
        let mut tmp = tempfile::Builder::new()
            .suffix(&format!(".{ext}"))
            .tempfile()?;
        tmp.write_all(&bytes)?;

        let threshold = state.settings.matching.http_threshold;
        pipeline::identify_file(
            tmp.path(),
            &state.base,
            &state.settings,
            Some(duration),
            threshold,
        )
    })
    .await
    .map_err(|e| EngineError::Internal(format!("identification task failed: {e}")))??;

    matches.into_iter().next().ok_or(EngineError::NotFound)
}
