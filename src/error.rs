use std::path::PathBuf;

/// Errors raised while turning one image into one caption.
///
/// Every failure inside the caption callback ends up here, so the caller can
/// tell a caption apart from a failure without inspecting the text.
#[derive(Debug, thiserror::Error)]
pub enum CaptionError {
    /// The input could not be converted to an RGB image.
    #[error("invalid image: {0}")]
    InvalidImage(String),

    /// Reading or writing a working-directory file failed.
    #[error("i/o error on {path}: {source}")]
    Io {
        /// The file that was being read or written.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The model failed while preprocessing or generating.
    #[error("inference failed: {0}")]
    Inference(#[from] candle_core::Error),

    /// The tokenizer failed to load or to decode the generated ids.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// Downloading model files from the hub failed.
    #[error("hub error: {0}")]
    Hub(String),

    /// Logging to the tracking store failed.
    #[error("tracking error: {0}")]
    Tracking(#[from] TrackingError),
}

impl CaptionError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Renders the error the way the web form shows it.
    pub fn user_message(&self) -> String {
        format!("{}{}", crate::ERROR_MARKER, self)
    }
}

/// Errors raised by a [`crate::tracking::TrackingStore`].
#[derive(Debug, thiserror::Error)]
pub enum TrackingError {
    /// Local store or artifact file access failed.
    #[error("i/o error on {path}: {source}")]
    Io {
        /// The file or directory involved.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The tracking server could not be reached.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The tracking server answered with a non-success status.
    #[error("tracking server returned {status}: {body}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body, as returned by the server.
        body: String,
    },

    /// Metadata could not be (de)serialized.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The run's artifact location is not one this store can write to.
    #[error("unsupported artifact uri: {0}")]
    UnsupportedArtifactUri(String),

    /// The named experiment or run does not exist in the store.
    #[error("not found: {0}")]
    NotFound(String),

    /// A param, metric or artifact name that cannot be stored safely.
    #[error("invalid key: {0:?}")]
    InvalidKey(String),
}

impl TrackingError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors returned by [`crate::engine::InferenceEngine::infer`].
#[derive(Debug, thiserror::Error)]
pub enum EngineError<E: std::error::Error + 'static> {
    /// The engine thread has stopped and can no longer take requests.
    #[error("inference engine stopped")]
    Stopped,

    /// The model returned an error for this request.
    #[error(transparent)]
    Model(E),

    /// The model panicked while handling this request.
    #[error("inference panicked: {0}")]
    Panicked(String),
}
