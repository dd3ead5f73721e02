use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use monolink_core::{config::Config, server::Manager, Handler};
use monolink_services::{
    codec::{Frame, LengthDelimited},
    echo::EchoHandler,
};
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path of the config file
    #[clap(short, long, value_parser)]
    config: String,
}

#[monoio::main(timer_enabled = true)]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config).await?;
    tracing::debug!("loaded config: {config:?}");

    let handler: Arc<dyn Handler<Frame>> = Arc::new(EchoHandler::default());
    let manager = Manager::new(config.runtime);
    let join_handlers = manager.serve(config.server, LengthDelimited::default(), handler)?;
    tracing::info!("{} workers started", join_handlers.len());

    // Wait for workers
    for handle in join_handlers {
        if handle.join().is_err() {
            tracing::error!("worker thread panicked");
        }
    }
    Ok(())
}
