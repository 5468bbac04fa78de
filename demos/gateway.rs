//! Gateway node
//!
//! Configured from `RC_*` environment variables. For a single local node
//! without Redis:
//!
//! ```text
//! RC_STORE=memory RC_JWT_SECRET=dev cargo run --example gateway
//! ```
//!
//! Then connect with any WebSocket client to
//! `ws://localhost:5000/match?uid=<id>`.

use randchat_rs::{GatewayConfig, GatewayServer};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = GatewayConfig::from_env()?;
    let server = GatewayServer::connect(config).await?;

    // Memory mode has no other way to create users
    for name in ["alice", "bob"] {
        let user = server.gateway().users().create_user(name).await?;
        tracing::info!(user_id = user.id, name = name, "Demo user");
    }

    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}
