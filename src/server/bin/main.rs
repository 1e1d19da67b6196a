use anyhow::{Context, Result};
use sqlx::sqlite::SqlitePool;

use ems::api;
use ems::config::Settings;
use ems::db;
use ems::telemetry::{self, get_subscriber, init_subscriber};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::from_env()?;

    let provider = telemetry::init_tracer_provider(&settings.trace)?;
    let tracer = provider.as_ref().map(telemetry::tracer);
    let subscriber = get_subscriber(
        telemetry::SERVICE_NAME.into(),
        settings.log_filter.clone(),
        tracer,
    );
    init_subscriber(subscriber)?;

    if provider.is_none() {
        tracing::warn!("EMS_TRACE_TOKEN not set, spans will not be exported");
    }

    let pool = db::setup_pool(&settings.database_url)
        .await
        .context("Failed to open database pool")?;

    run(pool, &settings).await?;

    if let Some(provider) = provider {
        // Flushes whatever the batch processor still holds.
        if let Err(e) = provider.shutdown() {
            tracing::warn!(error = %e, "trace export did not shut down cleanly");
        }
    }

    Ok(())
}

async fn run(pool: SqlitePool, settings: &Settings) -> Result<()> {
    let routes = api::routes(pool.clone());

    let (addr, server) = warp::serve(routes)
        .try_bind_with_graceful_shutdown(settings.listen_addr, async {
            tokio::signal::ctrl_c().await.ok();
        })
        .with_context(|| format!("Failed to bind {}", settings.listen_addr))?;

    tracing::info!(%addr, "listening");
    server.await;

    pool.close().await;
    tracing::info!("shut down");

    Ok(())
}
