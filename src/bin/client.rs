use argh::FromArgs;
use blip_captioner::{
    config::{DEFAULT_HOST, DEFAULT_PORT},
    messages::{CaptionResponse, ErrorResponse, StatusResponse},
    server::IMAGE_FIELD,
};
use reqwest::multipart::{Form, Part};
use std::path::PathBuf;

#[derive(FromArgs)]
/// Client for the captioning server
struct ClientArgs {
    /// the host to connect to
    #[argh(option, short = 'h', default = "DEFAULT_HOST.to_string()")]
    host: String,

    /// the port to connect to
    #[argh(option, short = 'p', default = "DEFAULT_PORT")]
    port: u16,

    /// command to execute: "caption" or "status"
    #[argh(subcommand)]
    command: ClientCommands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum ClientCommands {
    Caption(CaptionCommand),
    Status(StatusCommand),
}

#[derive(FromArgs)]
/// Upload an image and print its caption
#[argh(subcommand, name = "caption")]
struct CaptionCommand {
    /// the path to the image
    #[argh(option, short = 'i')]
    image_path: PathBuf,
}

#[derive(FromArgs)]
/// Print whether the server is busy
#[argh(subcommand, name = "status")]
struct StatusCommand {}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: ClientArgs = argh::from_env();

    let client = reqwest::Client::new();

    // format the host and port
    let addr = format!("{}:{}", args.host, args.port);

    match args.command {
        ClientCommands::Caption(command) => {
            let bytes = tokio::fs::read(&command.image_path).await?;
            let file_name = command
                .image_path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "image".to_string());
            let form = Form::new().part(IMAGE_FIELD, Part::bytes(bytes).file_name(file_name));

            log::debug!("Uploading {}", command.image_path.display());
            let response = client
                .post(format!("http://{}/caption", addr))
                .multipart(form)
                .send()
                .await?;

            if response.status().is_success() {
                let result = response.json::<CaptionResponse>().await?;
                println!("{}", result.caption);
                log::info!(
                    "request {} logged in run {} ({} ms)",
                    result.request_id,
                    result.run_id,
                    result.duration_ms
                );
            } else {
                let status = response.status();
                let result = response.json::<ErrorResponse>().await?;
                return Err(format!("{}: {}", status, result.error).into());
            }
        }
        ClientCommands::Status(_) => {
            let response = client
                .get(format!("http://{}/status", addr))
                .send()
                .await?;

            let result = response.json::<StatusResponse>().await?;
            println!("{} ({})", result.status, result.model_name);
        }
    }

    Ok(())
}
