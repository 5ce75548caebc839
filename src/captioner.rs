use crate::{
    engine::{InferenceModel, RequestMetadata},
    error::CaptionError,
    input::{ImageInput, RgbImage, decode_image, write_png},
    tracking::{ActiveRun, RunStatus, Tracker},
};
use serde_json::json;
use std::path::{Path, PathBuf};

/// Snapshot of the last input image, in the working directory.
pub const INPUT_IMAGE_FILE: &str = "input_image.png";
/// Snapshot of the last caption, in the working directory.
pub const OUTPUT_CAPTION_FILE: &str = "output_caption.txt";
/// Artifact path the model snapshot is logged under.
pub const MODEL_ARTIFACT_PATH: &str = "blip_model";
/// Descriptor written next to the model files in the snapshot.
pub const MODEL_DESCRIPTOR_FILE: &str = "MLmodel";

pub const PARAM_MODEL_NAME: &str = "model_name";
pub const PARAM_ERROR: &str = "error";
pub const METRIC_OUTPUT_LENGTH: &str = "output_length";

/// Something that turns an image into text.
pub trait CaptionBackend: Send {
    /// Generates a caption for one image.
    fn generate(&mut self, image: &RgbImage) -> Result<String, CaptionError>;
}

/// One caption request as queued on the engine.
#[derive(Debug, Clone)]
pub struct CaptionRequest {
    pub image: ImageInput,
}

/// What the engine keeps about a request while the image is consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptionMetadata {
    pub input_bytes: usize,
}

impl RequestMetadata for CaptionRequest {
    type Metadata = CaptionMetadata;

    fn metadata(&self) -> CaptionMetadata {
        CaptionMetadata {
            input_bytes: self.image.byte_len(),
        }
    }
}

/// A generated caption and the run it was logged in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caption {
    pub text: String,
    pub run_id: String,
}

/// The caption callback: every call is one tracked run.
///
/// Inside the run the input is snapshotted to [`INPUT_IMAGE_FILE`], the
/// backend generates the text, `model_name` and `output_length` are
/// recorded, and the text is snapshotted to [`OUTPUT_CAPTION_FILE`]. Both
/// snapshots are logged as artifacts and overwritten by the next call.
///
/// A failure anywhere is recorded as the `error` param, the run is closed as
/// failed, and the error is returned.
pub struct Captioner<B> {
    backend: B,
    tracker: Tracker,
    model_name: String,
    workdir: PathBuf,
}

impl<B: CaptionBackend> Captioner<B> {
    pub fn new(
        backend: B,
        tracker: Tracker,
        model_name: impl Into<String>,
        workdir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            backend,
            tracker,
            model_name: model_name.into(),
            workdir: workdir.into(),
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Captions one image inside its own run.
    pub fn caption(&mut self, input: ImageInput) -> Result<Caption, CaptionError> {
        let run = self.tracker.start_run()?;
        let run_id = run.run_id().to_string();

        match self.caption_in_run(&run, input) {
            Ok(text) => {
                run.finish(RunStatus::Finished)?;
                log::info!("Run {run_id} captioned: {text:?}");
                Ok(Caption { text, run_id })
            }
            Err(e) => {
                log::warn!("Run {run_id} failed: {e}");
                if let Err(log_err) = run.log_param(PARAM_ERROR, &e.to_string()) {
                    log::error!("Could not record error on run {run_id}: {log_err}");
                }
                if let Err(end_err) = run.finish(RunStatus::Failed) {
                    log::error!("Could not close run {run_id}: {end_err}");
                }
                Err(e)
            }
        }
    }

    fn caption_in_run(&mut self, run: &ActiveRun, input: ImageInput) -> Result<String, CaptionError> {
        let image = decode_image(input)?;
        log::debug!("Decoded {}x{} image", image.width(), image.height());

        let image_path = self.workdir.join(INPUT_IMAGE_FILE);
        write_png(&image_path, &image)?;
        run.log_artifact(&image_path)?;

        let text = self.backend.generate(&image)?;

        run.log_param(PARAM_MODEL_NAME, &self.model_name)?;
        run.log_metric(METRIC_OUTPUT_LENGTH, text.chars().count() as f64)?;

        let caption_path = self.workdir.join(OUTPUT_CAPTION_FILE);
        std::fs::write(&caption_path, &text).map_err(|e| CaptionError::io(&caption_path, e))?;
        run.log_artifact(&caption_path)?;

        Ok(text)
    }
}

impl<B: CaptionBackend> InferenceModel for Captioner<B> {
    type Request = CaptionRequest;
    type Response = Caption;
    type Error = CaptionError;

    fn run(&mut self, request: CaptionRequest) -> Result<Caption, CaptionError> {
        self.caption(request.image)
    }
}

/// Logs the model files as a reusable snapshot in a run of their own.
///
/// The files land under [`MODEL_ARTIFACT_PATH`] together with a small JSON
/// descriptor naming the model and its files. Returns the run id.
pub fn log_model_snapshot(
    tracker: &Tracker,
    model_name: &str,
    files: &[&Path],
    workdir: &Path,
) -> Result<String, CaptionError> {
    let run = tracker.start_run()?;
    run.log_param(PARAM_MODEL_NAME, model_name)?;

    let file_names: Vec<String> = files
        .iter()
        .filter_map(|path| path.file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .collect();
    let descriptor = json!({
        "flavor": "candle",
        "model_name": model_name,
        "run_id": run.run_id(),
        "files": file_names,
    });
    let descriptor_path = workdir.join(MODEL_DESCRIPTOR_FILE);
    std::fs::write(&descriptor_path, descriptor.to_string())
        .map_err(|e| CaptionError::io(&descriptor_path, e))?;
    run.log_artifact_at(&descriptor_path, MODEL_ARTIFACT_PATH)?;

    for file in files {
        log::info!("Logging model file {}", file.display());
        run.log_artifact_at(file, MODEL_ARTIFACT_PATH)?;
    }

    let run_id = run.run_id().to_string();
    run.finish(RunStatus::Finished)?;
    Ok(run_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::{FileStore, RunInfo, tests::scratch_dir};
    use std::{collections::VecDeque, sync::Arc};

    struct Scripted(VecDeque<Result<String, String>>);

    impl CaptionBackend for Scripted {
        fn generate(&mut self, _image: &RgbImage) -> Result<String, CaptionError> {
            match self.0.pop_front() {
                Some(Ok(text)) => Ok(text),
                Some(Err(msg)) => Err(CaptionError::Tokenizer(msg)),
                None => Err(CaptionError::Tokenizer("script exhausted".into())),
            }
        }
    }

    struct Fixture {
        root: PathBuf,
        workdir: PathBuf,
        store: Arc<FileStore>,
        captioner: Captioner<Scripted>,
    }

    impl Fixture {
        fn new(replies: Vec<Result<String, String>>) -> Self {
            let root = scratch_dir("captioner-store");
            let workdir = scratch_dir("captioner-work");
            let store = Arc::new(FileStore::new(&root).unwrap());
            let tracker = Tracker::new(store.clone(), "Image Captioning Experiment").unwrap();
            let captioner = Captioner::new(
                Scripted(replies.into()),
                tracker,
                "Salesforce/blip-image-captioning-base",
                &workdir,
            );
            Self {
                root,
                workdir,
                store,
                captioner,
            }
        }

        fn run(&self, run_id: &str) -> RunInfo {
            let exp = self
                .store
                .find_experiment("Image Captioning Experiment")
                .unwrap()
                .unwrap();
            self.store
                .list_runs(&exp)
                .unwrap()
                .into_iter()
                .find(|run| run.run_id == run_id)
                .unwrap()
        }

        fn only_run(&self) -> RunInfo {
            let exp = self
                .store
                .find_experiment("Image Captioning Experiment")
                .unwrap()
                .unwrap();
            let mut runs = self.store.list_runs(&exp).unwrap();
            assert_eq!(runs.len(), 1);
            runs.remove(0)
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.root);
            let _ = std::fs::remove_dir_all(&self.workdir);
        }
    }

    fn pixels(width: usize, height: usize, value: u8) -> ImageInput {
        ImageInput::Pixels {
            width,
            height,
            data: vec![value; width * height * 3],
        }
    }

    #[test_log::test]
    fn successful_call_logs_name_length_and_artifacts() {
        let mut fx = Fixture::new(vec![Ok("a dög on grass".into())]);

        let caption = fx.captioner.caption(pixels(224, 224, 90)).unwrap();
        assert_eq!(caption.text, "a dög on grass");

        let run = fx.run(&caption.run_id);
        assert_eq!(
            fx.store.param(&run, PARAM_MODEL_NAME).unwrap(),
            "Salesforce/blip-image-captioning-base"
        );
        assert_eq!(
            fx.store.metric_history(&run, METRIC_OUTPUT_LENGTH).unwrap(),
            vec![14.0]
        );
        assert_eq!(fx.store.run_status(&run).unwrap(), RunStatus::Finished);

        let artifacts = fx.store.artifact_dir(&run);
        assert_eq!(
            std::fs::read_to_string(artifacts.join(OUTPUT_CAPTION_FILE)).unwrap(),
            "a dög on grass"
        );
        assert!(artifacts.join(INPUT_IMAGE_FILE).exists());
    }

    #[test_log::test]
    fn consecutive_calls_overwrite_working_files() {
        let mut fx = Fixture::new(vec![
            Ok("a long first caption".into()),
            Ok("second".into()),
        ]);

        fx.captioner.caption(pixels(8, 8, 10)).unwrap();
        fx.captioner.caption(pixels(3, 2, 200)).unwrap();

        assert_eq!(
            std::fs::read_to_string(fx.workdir.join(OUTPUT_CAPTION_FILE)).unwrap(),
            "second"
        );
        let snapshot = image::open(fx.workdir.join(INPUT_IMAGE_FILE)).unwrap();
        assert_eq!((snapshot.width(), snapshot.height()), (3, 2));
    }

    #[test_log::test]
    fn malformed_input_is_an_error_and_recorded() {
        let mut fx = Fixture::new(vec![Ok("unused".into())]);

        let err = fx
            .captioner
            .caption(ImageInput::Pixels {
                width: 224,
                height: 224,
                data: vec![1, 2, 3],
            })
            .unwrap_err();
        assert!(matches!(err, CaptionError::InvalidImage(_)));
        assert!(err.user_message().starts_with("Error occurred:"));

        let run = fx.only_run();
        assert_eq!(fx.store.param(&run, PARAM_ERROR).unwrap(), err.to_string());
        assert!(fx.store.param(&run, PARAM_MODEL_NAME).is_err());
        assert_eq!(fx.store.run_status(&run).unwrap(), RunStatus::Failed);
        assert!(!fx.workdir.join(OUTPUT_CAPTION_FILE).exists());
    }

    #[test_log::test]
    fn backend_failure_keeps_input_snapshot() {
        let mut fx = Fixture::new(vec![Err("decoder blew up".into())]);

        let err = fx.captioner.caption(pixels(4, 4, 0)).unwrap_err();
        assert!(err.to_string().contains("decoder blew up"));

        let run = fx.only_run();
        assert!(fx.store.artifact_dir(&run).join(INPUT_IMAGE_FILE).exists());
        assert!(
            fx.store
                .param(&run, PARAM_ERROR)
                .unwrap()
                .contains("decoder blew up")
        );
        assert!(fx.store.metric_history(&run, METRIC_OUTPUT_LENGTH).is_err());
    }

    #[test_log::test]
    fn model_snapshot_lands_under_fixed_path() {
        let fx = Fixture::new(vec![]);
        let weights = fx.workdir.join("model.safetensors");
        let tokenizer = fx.workdir.join("tokenizer.json");
        std::fs::write(&weights, b"weights").unwrap();
        std::fs::write(&tokenizer, b"{}").unwrap();

        let run_id = log_model_snapshot(
            &fx.captioner.tracker,
            fx.captioner.model_name(),
            &[weights.as_path(), tokenizer.as_path()],
            &fx.workdir,
        )
        .unwrap();

        let run = fx.run(&run_id);
        let snapshot = fx.store.artifact_dir(&run).join(MODEL_ARTIFACT_PATH);
        assert_eq!(std::fs::read(snapshot.join("model.safetensors")).unwrap(), b"weights");
        assert!(snapshot.join("tokenizer.json").exists());
        let descriptor: serde_json::Value =
            serde_json::from_slice(&std::fs::read(snapshot.join(MODEL_DESCRIPTOR_FILE)).unwrap())
                .unwrap();
        assert_eq!(descriptor["files"][0], "model.safetensors");
        assert_eq!(fx.store.run_status(&run).unwrap(), RunStatus::Finished);
    }
}
