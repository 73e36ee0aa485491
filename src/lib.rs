pub mod api;
pub mod commands;
pub mod config;
pub mod connection;
pub mod error;
pub mod models;
pub mod normalize;
pub mod session;
pub mod sse;
pub mod state;
pub mod storage;
pub mod sync;

use clap::Parser;
use commands::Cli;
use config::ClientConfig;
use state::AppState;

pub async fn run() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    let cli = Cli::parse();
    let config = ClientConfig::from_env()?;
    log::info!(
        "Using store at {} against {}",
        config.database_path.display(),
        config.api_base_url
    );

    let state = AppState::new(config).await?;
    let result = commands::execute(&state, cli.command).await;
    state.session.registry().close_all();
    result
}
