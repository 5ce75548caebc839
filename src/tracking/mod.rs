//! Experiment tracking: runs that group params, metrics and artifacts.
//!
//! A [`TrackingStore`] is the persistence backend. [`Tracker`] binds a store
//! to one experiment and hands out [`ActiveRun`] scopes.

mod file_store;
mod rest_store;

pub use file_store::FileStore;
pub use rest_store::RestStore;

use crate::error::TrackingError;
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

/// Environment variable consulted when no tracking URI is given.
pub const TRACKING_URI_ENV: &str = "MLFLOW_TRACKING_URI";

/// Store location used when neither the CLI nor the environment sets one.
pub const DEFAULT_TRACKING_URI: &str = "./mlruns";

/// Lifecycle status of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    /// The run is open.
    Running,
    /// The run ended normally.
    Finished,
    /// The run ended because of an error.
    Failed,
    /// The run was terminated from outside.
    Killed,
}

impl RunStatus {
    /// The status name used by the tracking API.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Finished => "FINISHED",
            RunStatus::Failed => "FAILED",
            RunStatus::Killed => "KILLED",
        }
    }
}

/// Identifies a run in its store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunInfo {
    /// Store-assigned run id.
    pub run_id: String,
    /// Experiment the run belongs to.
    pub experiment_id: String,
    /// Where the run's artifacts live.
    pub artifact_uri: String,
}

/// Persistence backend for experiments and runs.
pub trait TrackingStore: Send + Sync {
    /// Returns the id of the named experiment, creating it if needed.
    fn get_or_create_experiment(&self, name: &str) -> Result<String, TrackingError>;

    /// Opens a new run in the experiment.
    fn create_run(
        &self,
        experiment_id: &str,
        run_name: Option<&str>,
        start_time: i64,
    ) -> Result<RunInfo, TrackingError>;

    /// Records a param on the run.
    fn log_param(&self, run: &RunInfo, key: &str, value: &str) -> Result<(), TrackingError>;

    /// Records one metric value on the run.
    fn log_metric(
        &self,
        run: &RunInfo,
        key: &str,
        value: f64,
        timestamp: i64,
        step: i64,
    ) -> Result<(), TrackingError>;

    /// Attaches a local file to the run, under `artifact_path` if given.
    fn log_artifact(
        &self,
        run: &RunInfo,
        local_path: &Path,
        artifact_path: Option<&str>,
    ) -> Result<(), TrackingError>;

    /// Closes the run with the given status.
    fn end_run(&self, run: &RunInfo, status: RunStatus, end_time: i64)
    -> Result<(), TrackingError>;
}

/// Picks the tracking URI: explicit value, then environment, then default.
pub fn resolve_tracking_uri(explicit: Option<&str>) -> String {
    choose_tracking_uri(explicit, std::env::var(TRACKING_URI_ENV).ok())
}

fn choose_tracking_uri(explicit: Option<&str>, from_env: Option<String>) -> String {
    explicit
        .map(str::to_string)
        .or_else(|| from_env.filter(|v| !v.is_empty()))
        .unwrap_or_else(|| DEFAULT_TRACKING_URI.to_string())
}

/// Opens the store a tracking URI points at.
///
/// `http://` and `https://` URIs select the REST store; anything else is a
/// local directory, optionally written as a `file://` URI.
pub fn open_store(uri: &str) -> Result<Arc<dyn TrackingStore>, TrackingError> {
    if uri.starts_with("http://") || uri.starts_with("https://") {
        log::info!("Tracking to server {uri}");
        Ok(Arc::new(RestStore::new(uri)?))
    } else {
        let root = PathBuf::from(uri.strip_prefix("file://").unwrap_or(uri));
        log::info!("Tracking to local store {}", root.display());
        Ok(Arc::new(FileStore::new(root)?))
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// Keys become file names in the local store and path segments on the server.
pub(crate) fn validate_key(key: &str) -> Result<(), TrackingError> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if bad {
        Err(TrackingError::InvalidKey(key.to_string()))
    } else {
        Ok(())
    }
}

/// A store bound to one experiment.
#[derive(Clone)]
pub struct Tracker {
    store: Arc<dyn TrackingStore>,
    experiment_id: String,
}

impl Tracker {
    /// Selects the named experiment in the store, creating it if needed.
    pub fn new(store: Arc<dyn TrackingStore>, experiment_name: &str) -> Result<Self, TrackingError> {
        let experiment_id = store.get_or_create_experiment(experiment_name)?;
        log::info!("Using experiment {experiment_name:?} (id {experiment_id})");
        Ok(Self {
            store,
            experiment_id,
        })
    }

    /// The selected experiment's id.
    pub fn experiment_id(&self) -> &str {
        &self.experiment_id
    }

    /// Opens a run in the selected experiment.
    pub fn start_run(&self) -> Result<ActiveRun, TrackingError> {
        let info = self
            .store
            .create_run(&self.experiment_id, None, now_millis())?;
        log::debug!("Started run {}", info.run_id);
        Ok(ActiveRun {
            store: self.store.clone(),
            info,
            finished: false,
        })
    }
}

/// An open run. Close it with [`ActiveRun::finish`].
///
/// Dropping a run that was never finished ends it as
/// [`RunStatus::Failed`], so a run is never left open by an early return.
pub struct ActiveRun {
    store: Arc<dyn TrackingStore>,
    info: RunInfo,
    finished: bool,
}

impl ActiveRun {
    /// The run's identity in its store.
    pub fn info(&self) -> &RunInfo {
        &self.info
    }

    /// Shorthand for `info().run_id`.
    pub fn run_id(&self) -> &str {
        &self.info.run_id
    }

    /// Records a param.
    pub fn log_param(&self, key: &str, value: &str) -> Result<(), TrackingError> {
        self.store.log_param(&self.info, key, value)
    }

    /// Records a metric at step 0 with the current time.
    pub fn log_metric(&self, key: &str, value: f64) -> Result<(), TrackingError> {
        self.store
            .log_metric(&self.info, key, value, now_millis(), 0)
    }

    /// Attaches one file at the root of the run's artifacts.
    pub fn log_artifact(&self, local_path: &Path) -> Result<(), TrackingError> {
        self.store.log_artifact(&self.info, local_path, None)
    }

    /// Attaches one file below `artifact_path` in the run's artifacts.
    pub fn log_artifact_at(&self, local_path: &Path, artifact_path: &str) -> Result<(), TrackingError> {
        self.store
            .log_artifact(&self.info, local_path, Some(artifact_path))
    }

    /// Closes the run with the given status.
    pub fn finish(mut self, status: RunStatus) -> Result<(), TrackingError> {
        self.finished = true;
        log::debug!("Ending run {} as {}", self.info.run_id, status.as_str());
        self.store.end_run(&self.info, status, now_millis())
    }
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        log::warn!("Run {} dropped while open, marking it failed", self.info.run_id);
        if let Err(e) = self
            .store
            .end_run(&self.info, RunStatus::Failed, now_millis())
        {
            log::error!("Failed to close run {}: {e}", self.info.run_id);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Fresh directory under the system temp dir.
    pub(crate) fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "blip-captioner-{tag}-{}",
            uuid::Uuid::new_v4().simple()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// A [`scratch_dir`] that is removed on drop, pass or fail.
    pub(crate) struct ScratchDir(PathBuf);

    impl ScratchDir {
        pub(crate) fn new(tag: &str) -> Self {
            Self(scratch_dir(tag))
        }

        pub(crate) fn path(&self) -> &Path {
            &self.0
        }
    }

    impl std::ops::Deref for ScratchDir {
        type Target = Path;

        fn deref(&self) -> &Path {
            &self.0
        }
    }

    impl Drop for ScratchDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }

    #[test]
    fn rejects_path_like_keys() {
        for key in ["", "/abs", "a/../b", "..", "a//b", "win\\path"] {
            assert!(validate_key(key).is_err(), "{key:?} should be rejected");
        }
        for key in ["model_name", "output_length", "blip_model/weights"] {
            assert!(validate_key(key).is_ok(), "{key:?} should be accepted");
        }
    }

    #[test]
    fn explicit_tracking_uri_wins() {
        assert_eq!(resolve_tracking_uri(Some("http://mlflow:5000")), "http://mlflow:5000");
        assert_eq!(
            choose_tracking_uri(Some("./runs"), Some("http://env:5000".into())),
            "./runs"
        );
    }

    #[test]
    fn environment_then_default_tracking_uri() {
        assert_eq!(
            choose_tracking_uri(None, Some("http://env:5000".into())),
            "http://env:5000"
        );
        assert_eq!(choose_tracking_uri(None, Some(String::new())), DEFAULT_TRACKING_URI);
        assert_eq!(choose_tracking_uri(None, None), "./mlruns");
    }

    #[test]
    fn run_status_names() {
        assert_eq!(RunStatus::Finished.as_str(), "FINISHED");
        assert_eq!(
            serde_json::to_string(&RunStatus::Failed).unwrap(),
            "\"FAILED\""
        );
    }

    #[test_log::test]
    fn dropped_run_is_marked_failed() {
        let root = ScratchDir::new("drop");
        let store = Arc::new(FileStore::new(root.path()).unwrap());
        let tracker = Tracker::new(store.clone(), "drops").unwrap();

        let run = tracker.start_run().unwrap();
        let info = run.info().clone();
        drop(run);

        assert_eq!(store.run_status(&info).unwrap(), RunStatus::Failed);
    }

    #[test_log::test]
    fn artifacts_land_below_their_path() {
        let root = ScratchDir::new("artifacts");
        let src = ScratchDir::new("artifacts-src");
        std::fs::write(src.join("weights.bin"), b"w").unwrap();
        std::fs::write(src.join("vocab.txt"), b"v").unwrap();

        let store = Arc::new(FileStore::new(root.path()).unwrap());
        let tracker = Tracker::new(store.clone(), "snapshots").unwrap();
        let run = tracker.start_run().unwrap();
        run.log_artifact_at(&src.join("weights.bin"), "blip_model").unwrap();
        run.log_artifact_at(&src.join("vocab.txt"), "blip_model/tokenizer").unwrap();
        run.log_artifact(&src.join("vocab.txt")).unwrap();
        let artifacts = store.artifact_dir(run.info());
        run.finish(RunStatus::Finished).unwrap();

        assert_eq!(std::fs::read(artifacts.join("blip_model/weights.bin")).unwrap(), b"w");
        assert_eq!(
            std::fs::read(artifacts.join("blip_model/tokenizer/vocab.txt")).unwrap(),
            b"v"
        );
        assert!(artifacts.join("vocab.txt").exists());
    }
}
