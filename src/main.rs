mod booking;
mod config;
mod db;
mod directory;
mod error;
mod handlers;
mod ledger;
mod models;

use booking::BookingService;
use config::Config;
use db::BoxError;
use handlers::{router, AppState};
use ledger::init_ledger;

extern crate pretty_env_logger;
#[macro_use] extern crate log;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    pretty_env_logger::init();

    let config = Config::from_env()?;
    let (ledger, directory) = init_ledger(&config).await?;

    let state = AppState {
        bookings: BookingService::new(ledger).with_strict_transitions(config.strict_transitions),
        directory,
    };
    if config.strict_transitions {
        info!("Strict status transitions enabled");
    }

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!("Pandit Sewa API listening on {}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for ctrl-c: {}", e);
    }
}
