// Import and re-export the `error` module
pub use self::error::{Error, Result};
mod error;

use clap::Parser;
use cli::{Cli, Commands};
use commands::Context;

mod cli;
mod commands;
mod logging;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    dotenvy::dotenv().ok();
    logging::init()?;

    let args = Cli::parse();

    if let Commands::Version = args.command {
        println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config = args.connection.config()?;
    let ctx = Context::connect(config).await?;

    match &args.command {
        Commands::Migrate => commands::migrate(&ctx).await?,
        Commands::BootstrapKeys => commands::bootstrap_keys(&ctx).await?,
        Commands::RotateKeys => commands::rotate_keys(&ctx).await?,
        Commands::RetireKeys => commands::retire_keys(&ctx).await?,
        Commands::Sweep => commands::sweep(&ctx).await?,
        Commands::Jwks => commands::jwks(&ctx).await?,
        Commands::RegisterClient(client) => commands::register_client(&ctx, client).await?,
        Commands::Version => {}
    }

    ctx.pool.close().await;
    Ok(())
}
