use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    load_settings, ClientSettings, DeliveryMode, HttpComputeService, SelectedFile,
    UploadController, View,
};
use tracing_subscriber::EnvFilter;

mod terminal_view;

use terminal_view::TerminalView;

#[derive(Parser, Debug)]
#[command(about = "Upload an address list and fetch commute times")]
struct Args {
    /// Overrides `server_url` from client.toml / the environment.
    #[arg(long, global = true)]
    server_url: Option<String>,
    /// `descriptor` or `direct_payload`.
    #[arg(long, global = true)]
    mode: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one calculation and save the result file.
    Calculate {
        #[arg(long)]
        address: String,
        /// Spreadsheet with an address column; exactly one is accepted.
        #[arg(long = "file", required = true)]
        files: Vec<PathBuf>,
        #[arg(long, default_value = ".")]
        output_dir: PathBuf,
    },
    /// Download the example input spreadsheet.
    Sample {
        #[arg(long, default_value = "sample.xlsx")]
        output: PathBuf,
    },
    /// Query the server health endpoint.
    Health,
}

fn resolve_settings(args: &Args) -> Result<ClientSettings> {
    let mut settings = load_settings();
    if let Some(url) = &args.server_url {
        settings.server_url = url.clone();
    }
    if let Some(mode) = &args.mode {
        settings.delivery_mode = DeliveryMode::parse(mode)
            .with_context(|| format!("unknown delivery mode '{mode}'"))?;
    }
    Ok(settings)
}

async fn read_selection(paths: &[PathBuf]) -> Result<Vec<SelectedFile>> {
    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        let content = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("upload.xlsx")
            .to_string();
        let mime = mime_guess::from_path(path).first_or_octet_stream();
        files.push(SelectedFile::new(filename, content).with_mime_type(mime.essence_str()));
    }
    Ok(files)
}

async fn calculate(
    settings: &ClientSettings,
    address: String,
    paths: Vec<PathBuf>,
    output_dir: PathBuf,
) -> Result<()> {
    let files = read_selection(&paths).await?;
    let view = Arc::new(TerminalView::new(address, files, output_dir));
    let controller = UploadController::from_settings(settings, Arc::clone(&view) as Arc<dyn View>)?;
    let http = HttpComputeService::from_settings(settings)?;

    controller.init().await;
    if !controller.validate() {
        controller.dispose().await;
        bail!("a non-empty --address and exactly one --file are required");
    }

    let outcome = run_and_fetch(&controller, &view, &http).await;
    controller.dispose().await;
    outcome?;
    tracing::info!(files = view.saved().len(), "done");
    Ok(())
}

/// Descriptor mode needs a second request for the artifact; direct payloads
/// were already saved by the view.
async fn run_and_fetch(
    controller: &UploadController,
    view: &TerminalView,
    http: &HttpComputeService,
) -> Result<()> {
    controller.start_calculation().await?;
    if controller.delivery_mode() == DeliveryMode::DirectPayload {
        return Ok(());
    }
    let filename = controller
        .result()
        .and_then(|r| r.filename().map(str::to_string))
        .unwrap_or_default();
    let url = controller.download_result()?;
    let bytes = http.fetch(&url).await?;
    let path = view.save(&filename, &bytes)?;
    println!("saved {}", path.display());
    Ok(())
}

async fn sample(settings: &ClientSettings, output: PathBuf) -> Result<()> {
    let view = Arc::new(TerminalView::new(String::new(), Vec::new(), PathBuf::from(".")));
    let controller = UploadController::from_settings(settings, Arc::clone(&view) as Arc<dyn View>)?;
    let http = HttpComputeService::from_settings(settings)?;

    let url = controller.download_sample();
    let bytes = http.fetch(&url).await?;
    tokio::fs::write(&output, &bytes)
        .await
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!("saved {}", output.display());
    Ok(())
}

async fn health(settings: &ClientSettings) -> Result<()> {
    let http = HttpComputeService::from_settings(settings)?;
    let status = http.health().await?;
    println!(
        "{} (api keys: {}, at {})",
        status.status, status.api_keys_available, status.timestamp
    );
    if !status.is_healthy() {
        bail!("server reports status '{}'", status.status);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();
    let settings = resolve_settings(&args)?;
    tracing::debug!(?settings, "settings resolved");

    match args.command {
        Command::Calculate {
            address,
            files,
            output_dir,
        } => calculate(&settings, address, files, output_dir).await,
        Command::Sample { output } => sample(&settings, output).await,
        Command::Health => health(&settings).await,
    }
}
