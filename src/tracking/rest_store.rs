use super::{RunInfo, RunStatus, TrackingStore, validate_key};
use crate::error::TrackingError;
use reqwest::{
    StatusCode,
    blocking::{Client, Response},
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::json;
use std::path::Path;

const API_PREFIX: &str = "api/2.0/mlflow";
const ARTIFACTS_PREFIX: &str = "api/2.0/mlflow-artifacts/artifacts";
const PROXIED_SCHEME: &str = "mlflow-artifacts:";

#[derive(Deserialize)]
struct ExperimentEnvelope {
    experiment: ExperimentBody,
}

#[derive(Deserialize)]
struct ExperimentBody {
    experiment_id: String,
}

#[derive(Deserialize)]
struct CreateExperimentResponse {
    experiment_id: String,
}

#[derive(Deserialize)]
struct RunEnvelope {
    run: RunBody,
}

#[derive(Deserialize)]
struct RunBody {
    info: RunInfo,
}

#[derive(Serialize)]
struct CreateRun<'a> {
    experiment_id: &'a str,
    start_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    run_name: Option<&'a str>,
}

/// Tracking store backed by an MLflow tracking server's REST API.
///
/// Uses a blocking client, so calls must not be made from inside an async
/// runtime worker.
pub struct RestStore {
    base_url: String,
    client: Client,
}

impl RestStore {
    /// Connects to the tracking server at `base_url`.
    pub fn new(base_url: &str) -> Result<Self, TrackingError> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: Client::builder().build()?,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{API_PREFIX}/{path}", self.base_url)
    }

    fn post<B: Serialize, R: DeserializeOwned>(&self, path: &str, body: &B) -> Result<R, TrackingError> {
        let response = self.client.post(self.endpoint(path)).json(body).send()?;
        Ok(check(response)?.json()?)
    }

    fn post_unit<B: Serialize>(&self, path: &str, body: &B) -> Result<(), TrackingError> {
        let _: serde_json::Value = self.post(path, body)?;
        Ok(())
    }

    fn find_experiment(&self, name: &str) -> Result<Option<String>, TrackingError> {
        let response = self
            .client
            .get(self.endpoint("experiments/get-by-name"))
            .query(&[("experiment_name", name)])
            .send()?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let envelope: ExperimentEnvelope = check(response)?.json()?;
        Ok(Some(envelope.experiment.experiment_id))
    }
}

impl TrackingStore for RestStore {
    fn get_or_create_experiment(&self, name: &str) -> Result<String, TrackingError> {
        if let Some(id) = self.find_experiment(name)? {
            return Ok(id);
        }
        log::info!("Creating experiment {name:?} on tracking server");
        let created: CreateExperimentResponse =
            self.post("experiments/create", &json!({ "name": name }))?;
        Ok(created.experiment_id)
    }

    fn create_run(
        &self,
        experiment_id: &str,
        run_name: Option<&str>,
        start_time: i64,
    ) -> Result<RunInfo, TrackingError> {
        let envelope: RunEnvelope = self.post(
            "runs/create",
            &CreateRun {
                experiment_id,
                start_time,
                run_name,
            },
        )?;
        Ok(envelope.run.info)
    }

    fn log_param(&self, run: &RunInfo, key: &str, value: &str) -> Result<(), TrackingError> {
        self.post_unit(
            "runs/log-parameter",
            &json!({ "run_id": run.run_id, "key": key, "value": value }),
        )
    }

    fn log_metric(
        &self,
        run: &RunInfo,
        key: &str,
        value: f64,
        timestamp: i64,
        step: i64,
    ) -> Result<(), TrackingError> {
        self.post_unit(
            "runs/log-metric",
            &json!({
                "run_id": run.run_id,
                "key": key,
                "value": value,
                "timestamp": timestamp,
                "step": step,
            }),
        )
    }

    fn log_artifact(
        &self,
        run: &RunInfo,
        local_path: &Path,
        artifact_path: Option<&str>,
    ) -> Result<(), TrackingError> {
        if let Some(artifact_path) = artifact_path {
            validate_key(artifact_path)?;
        }
        let file_name = local_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| TrackingError::InvalidKey(local_path.display().to_string()))?;
        let relative = match artifact_path {
            Some(dir) => format!("{dir}/{file_name}"),
            None => file_name,
        };

        match ArtifactLocation::parse(&run.artifact_uri)? {
            ArtifactLocation::Proxied(root) => {
                let url = format!("{}/{ARTIFACTS_PREFIX}/{root}/{relative}", self.base_url);
                let body = std::fs::read(local_path).map_err(|e| TrackingError::io(local_path, e))?;
                log::debug!("Uploading artifact to {url}");
                check(self.client.put(url).body(body).send()?)?;
            }
            ArtifactLocation::Local(root) => {
                let target = Path::new(&root).join(&relative);
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| TrackingError::io(parent, e))?;
                }
                std::fs::copy(local_path, &target).map_err(|e| TrackingError::io(local_path, e))?;
            }
        }
        Ok(())
    }

    fn end_run(
        &self,
        run: &RunInfo,
        status: RunStatus,
        end_time: i64,
    ) -> Result<(), TrackingError> {
        self.post_unit(
            "runs/update",
            &json!({
                "run_id": run.run_id,
                "status": status.as_str(),
                "end_time": end_time,
            }),
        )
    }
}

/// Where a run's artifacts are written.
#[derive(Debug, PartialEq, Eq)]
enum ArtifactLocation {
    /// Path below the server's proxied artifact endpoint.
    Proxied(String),
    /// Directory on this machine.
    Local(String),
}

impl ArtifactLocation {
    fn parse(uri: &str) -> Result<Self, TrackingError> {
        if let Some(rest) = uri.strip_prefix(PROXIED_SCHEME) {
            // `mlflow-artifacts://host:port/path` names the server explicitly
            let path = match rest.strip_prefix("//") {
                Some(authority_and_path) => authority_and_path
                    .split_once('/')
                    .map_or("", |(_, path)| path),
                None => rest,
            };
            return Ok(Self::Proxied(path.trim_matches('/').to_string()));
        }
        if let Some(path) = uri.strip_prefix("file://") {
            return Ok(Self::Local(path.to_string()));
        }
        if uri.starts_with('/') {
            return Ok(Self::Local(uri.to_string()));
        }
        Err(TrackingError::UnsupportedArtifactUri(uri.to_string()))
    }
}

fn check(response: Response) -> Result<Response, TrackingError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    Err(TrackingError::Api {
        status: status.as_u16(),
        body,
    })
}
