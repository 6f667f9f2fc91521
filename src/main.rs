#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = omrledger::run().await {
        eprintln!("omrledger fatal: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}
