use anyhow::Result;
use appforge_server::{run_server_app, ServerArgs};
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "appforge-server")]
#[command(about = "Sandboxed runtime host for generated applications")]
pub struct Args {
    /// Address to listen on (overrides config file)
    #[arg(short, long)]
    pub bind: Option<String>,

    /// Path to a TOML config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    run_server_app(ServerArgs {
        bind_addr: args.bind,
        config_path: args.config,
        verbose: args.verbose,
    })
    .await
}
