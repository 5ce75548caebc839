use crate::blip::DEFAULT_MODEL_ID;
use argh::FromArgs;
use std::path::PathBuf;

// defaults for the server
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 7860;
pub const DEFAULT_REVISION: &str = "main";
pub const DEFAULT_EXPERIMENT: &str = "Image Captioning Experiment";
pub const DEFAULT_MAX_TOKENS: usize = 20;

#[derive(FromArgs, Debug)]
/// Serves an image captioning model behind a web form and tracks every call.
pub struct ServerArgs {
    /// the host to run the server on
    #[argh(option, short = 'h', default = "DEFAULT_HOST.to_string()")]
    pub host: String,

    /// the port to run the server on
    #[argh(option, short = 'p', default = "DEFAULT_PORT")]
    pub port: u16,

    /// hub repository of the captioning model
    #[argh(option, default = "DEFAULT_MODEL_ID.to_string()")]
    pub model_id: String,

    /// hub revision to download
    #[argh(option, default = "DEFAULT_REVISION.to_string()")]
    pub revision: String,

    /// local safetensors weights, instead of downloading
    #[argh(option)]
    pub model_file: Option<PathBuf>,

    /// local tokenizer.json, instead of downloading
    #[argh(option)]
    pub tokenizer_file: Option<PathBuf>,

    /// maximum caption length in tokens, counting the start token
    #[argh(option, default = "DEFAULT_MAX_TOKENS")]
    pub max_tokens: usize,

    /// name of the tracking experiment
    #[argh(option, default = "DEFAULT_EXPERIMENT.to_string()")]
    pub experiment: String,

    /// tracking store: a directory or an http(s) tracking server
    /// (falls back to MLFLOW_TRACKING_URI, then ./mlruns)
    #[argh(option)]
    pub tracking_uri: Option<String>,

    /// directory the per-request snapshot files are written to
    #[argh(option, default = "PathBuf::from(\".\")")]
    pub workdir: PathBuf,

    /// run on the CPU even if a GPU is available
    #[argh(switch)]
    pub cpu: bool,
}

impl ServerArgs {
    /// Socket address string to bind.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Local model files, if both were given. Errors if only one was.
    pub fn local_files(&self) -> Result<Option<(PathBuf, PathBuf)>, String> {
        match (&self.model_file, &self.tokenizer_file) {
            (Some(weights), Some(tokenizer)) => Ok(Some((weights.clone(), tokenizer.clone()))),
            (None, None) => Ok(None),
            _ => Err("--model-file and --tokenizer-file must be given together".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<ServerArgs, argh::EarlyExit> {
        ServerArgs::from_args(&["blip-captioner"], args)
    }

    #[test]
    fn defaults_match_the_demo() {
        let args = parse(&[]).unwrap();
        assert_eq!(args.addr(), "127.0.0.1:7860");
        assert_eq!(args.model_id, "Salesforce/blip-image-captioning-base");
        assert_eq!(args.experiment, "Image Captioning Experiment");
        assert_eq!(args.max_tokens, 20);
        assert_eq!(args.workdir, PathBuf::from("."));
        assert!(args.tracking_uri.is_none());
        assert!(!args.cpu);
    }

    #[test]
    fn overrides_are_applied() {
        let args = parse(&[
            "--port",
            "9000",
            "--tracking-uri",
            "http://localhost:5000",
            "--cpu",
        ])
        .unwrap();
        assert_eq!(args.port, 9000);
        assert_eq!(args.tracking_uri.as_deref(), Some("http://localhost:5000"));
        assert!(args.cpu);
    }

    #[test]
    fn local_files_come_in_pairs() {
        let args = parse(&["--model-file", "w.safetensors"]).unwrap();
        assert!(args.local_files().is_err());

        let args = parse(&["--model-file", "w.safetensors", "--tokenizer-file", "t.json"]).unwrap();
        let (weights, tokenizer) = args.local_files().unwrap().unwrap();
        assert_eq!(weights, PathBuf::from("w.safetensors"));
        assert_eq!(tokenizer, PathBuf::from("t.json"));
    }
}
