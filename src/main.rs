#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let code = ptb_cli::run().await?;
    std::process::exit(code);
}
