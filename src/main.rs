use anyhow::Context;
use credit_exchange::{bootstrap, config::Config, server};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,tower_http=debug,credit_exchange=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::from_env().context("failed to load configuration")?;

    init_tracing();

    info!("🚀 Starting Credit Exchange");

    let app = bootstrap::initialize_app(&config)
        .await
        .context("failed to initialize application")?;

    // Create HTTP server
    let router = server::create_app(
        app.state.clone(),
        app.rate_limiter.clone(),
        &config.cors_origins(),
    );

    // Run the Server
    let result = server::run_server(router, &config.bind_address).await;
    if let Err(e) = &result {
        error!("Server error: {}", e);
    }

    app.shutdown().await;
    info!("👋 Credit Exchange stopped");

    result
}
