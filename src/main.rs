use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    repoexport::cli::run().await
}
