use std::sync::Arc;

use anyhow::Context;
use memberguard_infra::config;
use memberguard_observability::TracingOptions;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match config::load() {
        Ok(config) => config,
        Err(e) => {
            memberguard_observability::init();
            tracing::error!(error = %e, "configuration rejected");
            return Err(e).context("failed to load configuration");
        }
    };

    memberguard_observability::tracing::init(&TracingOptions {
        format: config.logging.format,
        default_filter: config.logging.filter.clone(),
    });

    let services = memberguard_api::app::services::build_services(&config)
        .context("failed to wire services")?;
    let app = memberguard_api::app::build_app(Arc::new(services));

    let bind_addr = config.http.bind_addr();
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
