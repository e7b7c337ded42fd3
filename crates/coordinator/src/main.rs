use std::net::SocketAddr;
use std::time::Duration;

use helpdesk_coordinator::{gateway, AppState, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "helpdesk_coordinator=info,tower_http=info".into()),
        )
        .init();

    let config = Config::from_env()?;
    let bind_address = config.bind_address.clone();
    let assign_interval = Duration::from_secs(config.assign_interval_seconds);
    let state = AppState::new(config);

    // Periodic pass: catches visitors who queued while no agent had
    // capacity, agents whose capacity freed up, and presence changes with
    // no disconnect edge (heartbeat expiry)
    let tick_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(assign_interval);
        loop {
            interval.tick().await;
            tick_state.refresh_presence().await;
            tick_state.assign_waiting_visitors().await;
        }
    });

    let app = gateway::router(state);
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    tracing::info!(address = %bind_address, "Coordinator listening");

    // Remote addresses feed the queue rate-limit fingerprint
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
