use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    pmd_server::run().await
}
