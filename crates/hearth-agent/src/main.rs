//! Hearth agent launcher.

use clap::Parser;
use hearth_agent::cli::Args;
use hearth_agent::{AgentState, routes};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let settings = args.settings()?;
    tokio::fs::create_dir_all(&settings.data_dir).await?;
    info!(
        agent = %settings.name,
        data_dir = %settings.data_dir.display(),
        resources = settings.resources.len(),
        "Starting agent"
    );

    let state = AgentState::new(&settings);
    let app = routes::router(state).layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(settings.bind).await?;
    info!("Listening on {}", settings.bind);
    axum::serve(listener, app).await?;

    Ok(())
}
