use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    workflow_chat::cli::run_cli().await
}
