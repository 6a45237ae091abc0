use anyhow::{Context, Result};
use clap::Parser;

use chunkftp::cli::ServerOpts;
use chunkftp::server::Server;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = ServerOpts::parse().into_config()?;
    let mut server = Server::bind(cfg)?;

    let root = std::fs::canonicalize(&server.config().root)
        .with_context(|| format!("Failed to canonicalize root path: {}", server.config().root.display()))?;
    println!("Starting chunkftp server:");
    println!("  Root: {}", root.display());
    println!("  Bind: {}", server.local_addr()?);
    println!("  Storage: {}", server.config().storage_path().display());
    match server.config().max_clients {
        0 => println!("  Clients: unbounded"),
        n => println!("  Clients: up to {n}"),
    }

    // Plain TCP, no authentication
    if server.config().bind == "0.0.0.0" {
        eprintln!("WARNING: Binding to 0.0.0.0 exposes the server to all network interfaces");
        eprintln!("   Only use on trusted networks (LAN)");
    }

    server
        .shutdown_handle()
        .install_ctrlc()
        .context("Failed to install Ctrl-C handler")?;
    server.run()?;
    log::info!("server stopped");
    Ok(())
}
