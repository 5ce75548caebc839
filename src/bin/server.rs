use blip_captioner::{
    Captioner, InferenceEngine, Tracker,
    blip::{Blip, BlipFiles, select_device},
    config::ServerArgs,
    log_model_snapshot,
    server::{AppState, router},
    tracking::{open_store, resolve_tracking_uri},
};
use std::sync::Arc;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: ServerArgs = argh::from_env();

    // Startup runs before the async runtime exists: the REST tracking store
    // uses a blocking client.
    let tracking_uri = resolve_tracking_uri(args.tracking_uri.as_deref());
    let tracker = Tracker::new(open_store(&tracking_uri)?, &args.experiment)?;

    let files = match args.local_files()? {
        Some((weights, tokenizer)) => BlipFiles { weights, tokenizer },
        None => BlipFiles::from_hub(&args.model_id, &args.revision)?,
    };
    let device = select_device(args.cpu)?;
    log::info!("Loading {} on {:?}", args.model_id, device);
    let model = Blip::load(&files, device, args.max_tokens)?;

    std::fs::create_dir_all(&args.workdir)?;
    let snapshot_run = log_model_snapshot(&tracker, &args.model_id, &files.paths(), &args.workdir)?;
    log::info!("Model snapshot logged in run {snapshot_run}");

    let captioner = Captioner::new(model, tracker, args.model_id.clone(), args.workdir.clone());
    let state = Arc::new(AppState::new(InferenceEngine::new(captioner), args.model_id.clone()));
    let app = router(state);
    let addr = args.addr();

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        log::info!("🚀 Starting the server");
        log::info!("🔥 Listening on: http://{}", addr);
        log::info!("🔧 Press Ctrl+C to stop the server");

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        Ok::<(), Box<dyn std::error::Error>>(())
    })?;

    log::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for Ctrl+C: {e}");
        std::future::pending::<()>().await;
    }
}
