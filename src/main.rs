use anyhow::Result;
use busysync::cli;

#[tokio::main]
async fn main() -> Result<()> {
    cli::run().await
}
