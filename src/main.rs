#[tokio::main]
async fn main() -> anyhow::Result<()> {
    gem::cli::run().await
}
