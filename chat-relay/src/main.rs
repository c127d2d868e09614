use std::io::IsTerminal;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use chat_relay::{
    cli::{Cli, Command},
    client,
    relay::Relay,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(std::io::stdout().is_terminal())
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Relay(args) => {
            let listener = TcpListener::bind(args.listen)
                .await
                .with_context(|| format!("failed to bind {}", args.listen))?;
            let relay = Relay::new(listener);
            let addr = relay.local_addr()?;
            info!("relay listening on {}", addr);
            match relay.run_until_ctrl_c().await {
                Ok(stopped) => info!(?stopped, "relay exiting"),
                Err(err) => {
                    warn!("relay exited with error: {err:?}");
                    return Err(err);
                }
            }
        }
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}
