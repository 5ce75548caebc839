use super::{RunInfo, RunStatus, TrackingStore, now_millis, validate_key};
use crate::error::TrackingError;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

const META_FILE: &str = "meta.json";
const DEFAULT_EXPERIMENT_ID: &str = "0";
const DEFAULT_EXPERIMENT_NAME: &str = "Default";

#[derive(Debug, Serialize, Deserialize)]
struct ExperimentMeta {
    experiment_id: String,
    name: String,
    artifact_location: String,
    lifecycle_stage: String,
    creation_time: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct RunMeta {
    run_id: String,
    run_name: String,
    experiment_id: String,
    status: RunStatus,
    start_time: i64,
    end_time: Option<i64>,
    artifact_uri: String,
    lifecycle_stage: String,
}

/// Tracking store kept in a local directory.
///
/// Layout, one directory per experiment and per run:
///
/// ```text
/// <root>/<experiment_id>/meta.json
/// <root>/<experiment_id>/<run_id>/meta.json
/// <root>/<experiment_id>/<run_id>/params/<key>
/// <root>/<experiment_id>/<run_id>/metrics/<key>   "<timestamp> <value> <step>" per line
/// <root>/<experiment_id>/<run_id>/artifacts/...
/// ```
pub struct FileStore {
    root: PathBuf,
    // Serialises experiment id allocation.
    create_lock: Mutex<()>,
}

impl FileStore {
    /// Opens (and if needed initialises) a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, TrackingError> {
        let store = Self {
            root: root.into(),
            create_lock: Mutex::new(()),
        };
        fs::create_dir_all(&store.root).map_err(|e| TrackingError::io(&store.root, e))?;
        if !store.root.join(DEFAULT_EXPERIMENT_ID).join(META_FILE).exists() {
            store.create_experiment(DEFAULT_EXPERIMENT_ID, DEFAULT_EXPERIMENT_NAME)?;
        }
        Ok(store)
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the run's files.
    pub fn run_dir(&self, run: &RunInfo) -> PathBuf {
        self.root.join(&run.experiment_id).join(&run.run_id)
    }

    /// Directory holding the run's artifacts.
    pub fn artifact_dir(&self, run: &RunInfo) -> PathBuf {
        self.run_dir(run).join("artifacts")
    }

    /// Reads a logged param back.
    pub fn param(&self, run: &RunInfo, key: &str) -> Result<String, TrackingError> {
        validate_key(key)?;
        let path = self.run_dir(run).join("params").join(key);
        fs::read_to_string(&path).map_err(|e| TrackingError::io(path, e))
    }

    /// Reads every value logged for a metric, oldest first.
    pub fn metric_history(&self, run: &RunInfo, key: &str) -> Result<Vec<f64>, TrackingError> {
        validate_key(key)?;
        let path = self.run_dir(run).join("metrics").join(key);
        let content = fs::read_to_string(&path).map_err(|e| TrackingError::io(&path, e))?;
        Ok(content
            .lines()
            .filter_map(|line| line.split_whitespace().nth(1)?.parse().ok())
            .collect())
    }

    /// Reads the run's current status.
    pub fn run_status(&self, run: &RunInfo) -> Result<RunStatus, TrackingError> {
        Ok(self.read_run_meta(run)?.status)
    }

    /// Looks an experiment up by name.
    pub fn find_experiment(&self, name: &str) -> Result<Option<String>, TrackingError> {
        Ok(self
            .experiments()?
            .into_iter()
            .find(|meta| meta.name == name)
            .map(|meta| meta.experiment_id))
    }

    /// Lists the run ids recorded under an experiment.
    pub fn list_runs(&self, experiment_id: &str) -> Result<Vec<RunInfo>, TrackingError> {
        let dir = self.root.join(experiment_id);
        let mut runs = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| TrackingError::io(&dir, e))? {
            let entry = entry.map_err(|e| TrackingError::io(&dir, e))?;
            let meta_path = entry.path().join(META_FILE);
            if entry.path().is_dir() && meta_path.exists() {
                let meta: RunMeta = read_json(&meta_path)?;
                runs.push(RunInfo {
                    run_id: meta.run_id,
                    experiment_id: meta.experiment_id,
                    artifact_uri: meta.artifact_uri,
                });
            }
        }
        Ok(runs)
    }

    fn experiments(&self) -> Result<Vec<ExperimentMeta>, TrackingError> {
        let mut experiments = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(|e| TrackingError::io(&self.root, e))? {
            let entry = entry.map_err(|e| TrackingError::io(&self.root, e))?;
            let meta_path = entry.path().join(META_FILE);
            if meta_path.exists() {
                experiments.push(read_json(&meta_path)?);
            }
        }
        Ok(experiments)
    }

    fn create_experiment(&self, id: &str, name: &str) -> Result<(), TrackingError> {
        let dir = self.root.join(id);
        fs::create_dir_all(&dir).map_err(|e| TrackingError::io(&dir, e))?;
        let meta = ExperimentMeta {
            experiment_id: id.to_string(),
            name: name.to_string(),
            artifact_location: dir.display().to_string(),
            lifecycle_stage: "active".to_string(),
            creation_time: now_millis(),
        };
        write_json(&dir.join(META_FILE), &meta)
    }

    fn read_run_meta(&self, run: &RunInfo) -> Result<RunMeta, TrackingError> {
        let path = self.run_dir(run).join(META_FILE);
        if !path.exists() {
            return Err(TrackingError::NotFound(format!("run {}", run.run_id)));
        }
        read_json(&path)
    }
}

impl TrackingStore for FileStore {
    fn get_or_create_experiment(&self, name: &str) -> Result<String, TrackingError> {
        let _guard = self.create_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let experiments = self.experiments()?;
        if let Some(meta) = experiments.iter().find(|meta| meta.name == name) {
            return Ok(meta.experiment_id.clone());
        }

        let next_id = experiments
            .iter()
            .filter_map(|meta| meta.experiment_id.parse::<u64>().ok())
            .max()
            .map_or(0, |max| max + 1)
            .to_string();
        log::info!("Creating experiment {name:?} with id {next_id}");
        self.create_experiment(&next_id, name)?;
        Ok(next_id)
    }

    fn create_run(
        &self,
        experiment_id: &str,
        run_name: Option<&str>,
        start_time: i64,
    ) -> Result<RunInfo, TrackingError> {
        let experiment_dir = self.root.join(experiment_id);
        if !experiment_dir.join(META_FILE).exists() {
            return Err(TrackingError::NotFound(format!("experiment {experiment_id}")));
        }

        let run_id = uuid::Uuid::new_v4().simple().to_string();
        let run_dir = experiment_dir.join(&run_id);
        for sub in ["params", "metrics", "artifacts"] {
            let dir = run_dir.join(sub);
            fs::create_dir_all(&dir).map_err(|e| TrackingError::io(&dir, e))?;
        }

        let artifact_uri = run_dir.join("artifacts").display().to_string();
        let meta = RunMeta {
            run_id: run_id.clone(),
            run_name: run_name.map_or_else(|| run_id[..8].to_string(), str::to_string),
            experiment_id: experiment_id.to_string(),
            status: RunStatus::Running,
            start_time,
            end_time: None,
            artifact_uri: artifact_uri.clone(),
            lifecycle_stage: "active".to_string(),
        };
        write_json(&run_dir.join(META_FILE), &meta)?;

        Ok(RunInfo {
            run_id,
            experiment_id: experiment_id.to_string(),
            artifact_uri,
        })
    }

    fn log_param(&self, run: &RunInfo, key: &str, value: &str) -> Result<(), TrackingError> {
        validate_key(key)?;
        let path = self.run_dir(run).join("params").join(key);
        ensure_parent(&path)?;
        fs::write(&path, value).map_err(|e| TrackingError::io(path, e))
    }

    fn log_metric(
        &self,
        run: &RunInfo,
        key: &str,
        value: f64,
        timestamp: i64,
        step: i64,
    ) -> Result<(), TrackingError> {
        validate_key(key)?;
        let path = self.run_dir(run).join("metrics").join(key);
        ensure_parent(&path)?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| TrackingError::io(&path, e))?;
        writeln!(file, "{timestamp} {value} {step}").map_err(|e| TrackingError::io(&path, e))
    }

    fn log_artifact(
        &self,
        run: &RunInfo,
        local_path: &Path,
        artifact_path: Option<&str>,
    ) -> Result<(), TrackingError> {
        let mut dest = self.artifact_dir(run);
        if let Some(artifact_path) = artifact_path {
            validate_key(artifact_path)?;
            dest.push(artifact_path);
        }
        fs::create_dir_all(&dest).map_err(|e| TrackingError::io(&dest, e))?;

        let file_name = local_path
            .file_name()
            .ok_or_else(|| TrackingError::InvalidKey(local_path.display().to_string()))?;
        let target = dest.join(file_name);
        fs::copy(local_path, &target).map_err(|e| TrackingError::io(local_path, e))?;
        log::debug!("Logged artifact {}", target.display());
        Ok(())
    }

    fn end_run(
        &self,
        run: &RunInfo,
        status: RunStatus,
        end_time: i64,
    ) -> Result<(), TrackingError> {
        let mut meta = self.read_run_meta(run)?;
        meta.status = status;
        meta.end_time = Some(end_time);
        write_json(&self.run_dir(run).join(META_FILE), &meta)
    }
}

fn ensure_parent(path: &Path) -> Result<(), TrackingError> {
    match path.parent() {
        Some(parent) => fs::create_dir_all(parent).map_err(|e| TrackingError::io(parent, e)),
        None => Ok(()),
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, TrackingError> {
    let bytes = fs::read(path).map_err(|e| TrackingError::io(path, e))?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrackingError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    fs::write(path, bytes).map_err(|e| TrackingError::io(path, e))
}
