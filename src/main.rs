use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use studypad::{load_settings, server, watcher, AppState, DEFAULT_SERVER_PORT};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("studypad=info")),
        )
        .init();

    let settings = load_settings();
    let port = settings.server_port.unwrap_or(DEFAULT_SERVER_PORT);

    let state = Arc::new(AppState::new(settings));
    state.init_search();

    if let Err(err) = watcher::start(&state) {
        tracing::warn!(%err, "file watcher unavailable");
    }

    server::serve(state, port).await
}
