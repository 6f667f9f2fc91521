#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = omrledger::run_worker().await {
        eprintln!("omrledger worker fatal: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}
