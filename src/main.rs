//! chunkftp - interactive client for the chunked transfer server

use anyhow::{Context, Result};
use clap::Parser;

use chunkftp::cli::ClientOpts;
use chunkftp::client::Client;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cfg = ClientOpts::parse().into_config()?;
    if !cfg.download_dir.is_dir() {
        anyhow::bail!(
            "Error: Download directory does not exist: {}",
            cfg.download_dir.display()
        );
    }

    let mut client = Client::connect(cfg)?;
    client
        .shutdown_handle()
        .install_ctrlc()
        .context("Failed to install Ctrl-C handler")?;
    client.run()?;
    println!("Exiting...");
    Ok(())
}
