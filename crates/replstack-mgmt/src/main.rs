use anyhow::Result;
use clap::Parser;
use replstack_mgmt::Cli;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    tracing::debug!(command = ?cli.command, "rstack starting");

    match cli.run().await {
        Ok(json) => {
            println!("{}", json);
            Ok(())
        }
        Err(err) => {
            tracing::error!(error = %err, "pass aborted");
            Err(err)
        }
    }
}
