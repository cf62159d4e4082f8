use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use config::{Cli, Command, ServeArgs};
use state::State;

mod config;
mod duration;
mod logging;
mod notify;
mod notifying_store;
mod repl;
mod request;
mod resp_value;
mod response;
mod server;
mod state;
mod store;

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let state = Arc::new(State::new(args.mode));
    let drain = server::spawn_notification_drain(&state, args.delivery());

    let listener = TcpListener::bind(args.address()).await?;
    info!(address = %args.address(), mode = ?args.mode, "listening");

    server::run(listener, Arc::clone(&state), async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
        }
    })
    .await?;

    if let Some(store) = state.notifying_store() {
        // Closing the sink lets the drain finish what is queued and exit.
        store.unsubscribe();
    }
    if let Some(drain) = drain {
        drain.await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init()?;

    match Cli::parse().command {
        Command::Serve(args) => serve(args).await,
        Command::Repl(args) => repl::run(args).await,
    }
}
