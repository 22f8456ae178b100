use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    soulbrowser_control::cli::run().await
}
