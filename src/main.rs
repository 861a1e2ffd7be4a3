//! Copernicus Audit - compliance transcription and audit server.

use copernicus_audit::cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cli::run().await
}
