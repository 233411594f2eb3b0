//! CLI entry point for fydf-upload: send a file through the resumable API.

use std::path::PathBuf;

use clap::Parser;
use fydf::client::{ChunkedUploader, DEFAULT_CONCURRENCY};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fydf-upload", version, about = "Resumable chunked upload client for fydf")]
struct Cli {
    /// Server base URL.
    #[arg(long, default_value = "http://localhost:8000")]
    server: String,

    /// Bearer token identifying the uploader.
    #[arg(long, env = "FYDF_TOKEN")]
    token: String,

    /// Chunk requests in flight at once.
    #[arg(long, default_value_t = DEFAULT_CONCURRENCY)]
    concurrency: usize,

    /// Chunk size in bytes; the server default applies when omitted.
    #[arg(long)]
    chunk_size: Option<u64>,

    /// Name to store the file under; defaults to the local file name.
    #[arg(long)]
    name: Option<String>,

    /// File to upload.
    file: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let name = match cli.name {
        Some(name) => name,
        None => cli
            .file
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("cannot derive a name from {}", cli.file.display()))?,
    };

    let mut uploader =
        ChunkedUploader::new(cli.server, cli.token).with_concurrency(cli.concurrency);
    if let Some(chunk_size) = cli.chunk_size {
        uploader = uploader.with_chunk_size(chunk_size);
    }

    let report = uploader.upload(&cli.file, &name).await?;
    println!(
        "{name}: {} chunk(s), {} already on server, {} sent (session {})",
        report.total_chunks, report.skipped, report.sent, report.session_id
    );
    Ok(())
}
