use crate::{
    ERROR_MARKER,
    captioner::{CaptionBackend, CaptionRequest, Captioner},
    engine::InferenceEngine,
    error::{CaptionError, EngineError},
    input::ImageInput,
    messages::{CaptionResponse, ErrorResponse, StatusResponse},
};
use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, State, multipart::MultipartRejection},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use std::sync::Arc;

/// Largest accepted upload.
pub const MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

/// Multipart field carrying the image file.
pub const IMAGE_FIELD: &str = "image";

const INDEX_HTML: &str = include_str!("index.html");

/// Shared state of the web server.
pub struct AppState<B: CaptionBackend + 'static> {
    engine: InferenceEngine<Captioner<B>>,
    model_name: String,
}

impl<B: CaptionBackend + 'static> AppState<B> {
    pub fn new(engine: InferenceEngine<Captioner<B>>, model_name: impl Into<String>) -> Self {
        Self {
            engine,
            model_name: model_name.into(),
        }
    }
}

/// Builds the routes: the form page, the caption endpoint and the status.
pub fn router<B: CaptionBackend + 'static>(state: Arc<AppState<B>>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/caption", post(post_caption::<B>))
        .route("/status", get(get_status::<B>))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn get_status<B: CaptionBackend + 'static>(
    State(state): State<Arc<AppState<B>>>,
) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: state.engine.state().as_str().to_string(),
        model_name: state.model_name.clone(),
    })
}

async fn post_caption<B: CaptionBackend + 'static>(
    State(state): State<Arc<AppState<B>>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    let mut multipart = match multipart {
        Ok(multipart) => multipart,
        Err(rejection) => return error_response(rejection.status(), rejection.body_text()),
    };
    let mut image = None;
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) if field.name() == Some(IMAGE_FIELD) => match field.bytes().await {
                Ok(bytes) => image = Some(bytes.to_vec()),
                Err(e) => return error_response(e.status(), e.body_text()),
            },
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(e) => return error_response(e.status(), e.body_text()),
        }
    }

    let Some(image) = image else {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("missing multipart field {IMAGE_FIELD:?}"),
        );
    };
    log::debug!("Received {} byte upload", image.len());

    let request = CaptionRequest {
        image: ImageInput::Encoded(image),
    };
    match state.engine.infer(request).await {
        Ok(result) => {
            log::info!(
                "Request {} captioned in {:?}",
                result.id,
                result.duration
            );
            Json(CaptionResponse {
                caption: result.response.text,
                request_id: result.id,
                run_id: result.response.run_id,
                duration_ms: result.duration.as_millis() as u64,
            })
            .into_response()
        }
        Err(EngineError::Model(e)) => {
            let status = match e {
                CaptionError::InvalidImage(_) => StatusCode::UNPROCESSABLE_ENTITY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (status, Json(ErrorResponse { error: e.user_message() })).into_response()
        }
        Err(e @ EngineError::Panicked(_)) => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
        Err(e @ EngineError::Stopped) => {
            log::error!("Caption request rejected: {e}");
            error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
    }
}

fn error_response(status: StatusCode, message: impl std::fmt::Display) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: format!("{ERROR_MARKER}{message}"),
        }),
    )
        .into_response()
}
