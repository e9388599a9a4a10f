//! User service binary.

use anyhow::Context;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use user_service::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let config = Config::from_env().context("Failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("{},user_service=debug,sqlx=warn", config.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    config.validate().context("Invalid configuration")?;
    tracing::info!(
        topic = %config.kafka.topic,
        group_id = %config.kafka.group_id,
        http = %config.http.addr(),
        metrics = %config.metrics.addr(),
        "Starting user service"
    );

    user_service::app::run(config).await
}
