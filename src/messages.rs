use serde::{Deserialize, Serialize};

/// Body of a successful `POST /caption`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CaptionResponse {
    pub caption: String,
    pub request_id: u64,
    pub run_id: String,
    pub duration_ms: u64,
}

/// Body of any failed request. `error` starts with [`crate::ERROR_MARKER`].
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Body of `GET /status`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StatusResponse {
    pub status: String,
    pub model_name: String,
}
