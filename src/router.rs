use std::net::TcpListener;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};

use crate::config;
use crate::encoder::MediaKind;
use crate::error::{ErrorKind, PipelineError};
use crate::inference::InferenceClient;
use crate::logger::Logger;
use crate::models::{
  AnalyzeResponse, CredentialStatus, ErrorResponse, ExemplarSummary, SetCredentialRequest, VideoAccepted,
};
use crate::orchestrator::{Orchestrator, UserImage};

pub struct RouterState<C> {
  pub started_at: Instant,
  pub orchestrator: Orchestrator<C>,
  pub default_credential: RwLock<Option<String>>,
  pub keyring_stored: RwLock<bool>,
  pub logger: Arc<Logger>,
  pub max_upload_bytes: usize,
}

pub fn build_router<C: InferenceClient + 'static>(state: RouterState<C>) -> Router {
  let limit = state.max_upload_bytes;
  Router::new()
    .route("/health", get(health::<C>))
    .route("/v1/exemplars", get(exemplars::<C>))
    .route("/v1/analyze", post(analyze::<C>))
    .route("/v1/video", post(video::<C>))
    .route("/v1/credential", get(credential_status::<C>).post(set_credential::<C>))
    .layer(DefaultBodyLimit::max(limit))
    .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
    .with_state(Arc::new(state))
}

pub async fn run_router<C: InferenceClient + 'static>(listener: TcpListener, state: RouterState<C>) -> anyhow::Result<()> {
  listener.set_nonblocking(true)?;
  let listener = tokio::net::TcpListener::from_std(listener)?;
  axum::serve(listener, build_router(state)).await?;
  Ok(())
}

async fn health<C: InferenceClient + 'static>(State(state): State<Arc<RouterState<C>>>) -> Json<serde_json::Value> {
  let uptime = state.started_at.elapsed().as_millis();
  Json(serde_json::json!({
    "status": "ok",
    "version": env!("CARGO_PKG_VERSION"),
    "uptime_ms": uptime
  }))
}

async fn exemplars<C: InferenceClient + 'static>(State(state): State<Arc<RouterState<C>>>) -> Json<Vec<ExemplarSummary>> {
  let list = state
    .orchestrator
    .corpus()
    .list_exemplars()
    .iter()
    .map(|e| ExemplarSummary {
      identifier: e.identifier.clone(),
      title: e.title.clone(),
    })
    .collect();
  Json(list)
}

#[derive(Default)]
struct AnalyzeForm {
  query: String,
  image: Option<UserImage>,
  api_key: Option<String>,
}

async fn read_analyze_form(mut multipart: Multipart) -> Result<AnalyzeForm, Response> {
  let mut form = AnalyzeForm::default();
  while let Some(field) = multipart.next_field().await.map_err(bad_multipart)? {
    let name = field.name().unwrap_or_default().to_string();
    match name.as_str() {
      "query" => form.query = field.text().await.map_err(bad_multipart)?,
      "api_key" => {
        let key = field.text().await.map_err(bad_multipart)?;
        if !key.trim().is_empty() {
          form.api_key = Some(key);
        }
      }
      "image_url" => {
        let url = field.text().await.map_err(bad_multipart)?;
        let url = url.trim();
        if !url.is_empty() && form.image.is_none() {
          form.image = Some(UserImage::Url(url.to_string()));
        }
      }
      "image" => {
        let file_name = field.file_name().map(str::to_string);
        if let Some(name) = file_name.as_deref() {
          if MediaKind::from_file_name(name) != Some(MediaKind::Image) {
            return Err(error_response(
              StatusCode::BAD_REQUEST,
              ErrorKind::UnsupportedMedia.code(),
              &format!("{name} is not a jpg or png image"),
            ));
          }
        }
        let bytes = field.bytes().await.map_err(bad_multipart)?;
        if !bytes.is_empty() {
          form.image = Some(UserImage::Upload {
            bytes: bytes.to_vec(),
            file_name,
          });
        }
      }
      _ => {}
    }
  }
  Ok(form)
}

async fn analyze<C: InferenceClient + 'static>(State(state): State<Arc<RouterState<C>>>, multipart: Multipart) -> Response {
  let form = match read_analyze_form(multipart).await {
    Ok(form) => form,
    Err(resp) => return resp,
  };

  let credential = match form.api_key {
    Some(key) => key,
    None => state.default_credential.read().await.clone().unwrap_or_default(),
  };

  match state
    .orchestrator
    .handle_request(&credential, &form.query, form.image)
    .await
  {
    Ok(answer) => (StatusCode::OK, Json(AnalyzeResponse { text: answer.text })).into_response(),
    Err(err) => pipeline_error_response(&err),
  }
}

async fn video<C: InferenceClient + 'static>(State(state): State<Arc<RouterState<C>>>, mut multipart: Multipart) -> Response {
  while let Some(mut field) = match multipart.next_field().await {
    Ok(field) => field,
    Err(err) => return bad_multipart(err),
  } {
    if field.name() != Some("video") {
      continue;
    }
    let file_name = field.file_name().unwrap_or_default().to_string();
    if MediaKind::from_file_name(&file_name) != Some(MediaKind::Video) {
      return error_response(
        StatusCode::BAD_REQUEST,
        ErrorKind::UnsupportedMedia.code(),
        "Upload an mp4, mov, avi or mkv video.",
      );
    }

    let mut bytes = 0u64;
    loop {
      match field.chunk().await {
        Ok(Some(chunk)) => bytes += chunk.len() as u64,
        Ok(None) => break,
        Err(err) => return bad_multipart(err),
      }
    }
    state.logger.info(&format!("video {file_name} received ({bytes} bytes), not analyzed"));
    return (
      StatusCode::OK,
      Json(VideoAccepted {
        accepted: true,
        file_name,
        bytes,
      }),
    )
      .into_response();
  }

  error_response(StatusCode::BAD_REQUEST, ErrorKind::MissingInput.code(), "No video field in upload.")
}

async fn credential_status<C: InferenceClient + 'static>(State(state): State<Arc<RouterState<C>>>) -> Json<CredentialStatus> {
  let stored = *state.keyring_stored.read().await;
  let available = stored || state.default_credential.read().await.is_some();
  Json(CredentialStatus { available, stored })
}

async fn set_credential<C: InferenceClient + 'static>(
  State(state): State<Arc<RouterState<C>>>,
  Json(req): Json<SetCredentialRequest>,
) -> Response {
  let key = req.key.trim().to_string();
  if key.is_empty() {
    return error_response(
      StatusCode::BAD_REQUEST,
      ErrorKind::MissingCredential.code(),
      "API key must not be empty.",
    );
  }
  if let Err(err) = config::store_credential(&key) {
    state.logger.error(&format!("keyring write failed: {err}"));
    return error_response(StatusCode::INTERNAL_SERVER_ERROR, "keyring_error", "Could not store the API key.");
  }
  *state.default_credential.write().await = Some(key);
  *state.keyring_stored.write().await = true;
  (
    StatusCode::OK,
    Json(CredentialStatus {
      available: true,
      stored: true,
    }),
  )
    .into_response()
}

fn status_for(kind: ErrorKind) -> StatusCode {
  match kind {
    ErrorKind::MissingCredential
    | ErrorKind::MissingInput
    | ErrorKind::ValidationError
    | ErrorKind::UnsupportedMedia => StatusCode::BAD_REQUEST,
    ErrorKind::RemoteError | ErrorKind::MalformedResponse => StatusCode::BAD_GATEWAY,
    ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
    ErrorKind::IoError => StatusCode::INTERNAL_SERVER_ERROR,
  }
}

fn pipeline_error_response(err: &PipelineError) -> Response {
  let kind = err.kind();
  error_response(status_for(kind), kind.code(), &err.to_string())
}

fn bad_multipart(err: axum::extract::multipart::MultipartError) -> Response {
  error_response(StatusCode::BAD_REQUEST, "bad_upload", &err.to_string())
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
  let body = Json(ErrorResponse {
    error: message.to_string(),
    code: code.to_string(),
  });
  (status, body).into_response()
}
