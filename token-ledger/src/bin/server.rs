//! Token ledger server binary

use anyhow::Context;
use std::sync::Arc;
use token_ledger::{AesGcmCipher, Config, TokenLedgerEngine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());
    if std::env::var("TOKEN_LEDGER_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = match std::env::var("TOKEN_LEDGER_CONFIG") {
        Ok(path) => Config::from_file(&path)
            .with_context(|| format!("loading config from {}", path))?,
        Err(_) => Config::from_env().context("loading config from environment")?,
    };

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        "Starting token ledger server"
    );

    let master_key = config
        .master_key()
        .context("BYOK master key is required")?;
    let cipher = Arc::new(AesGcmCipher::new(&master_key));

    let metrics_addr = config.metrics_listen_addr.clone();
    let engine = TokenLedgerEngine::open(config, cipher)
        .await
        .context("opening token ledger")?;

    let listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("binding metrics listener on {}", metrics_addr))?;
    let router = engine.metrics().router();
    let metrics_server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "Metrics server failed");
        }
    });
    tracing::info!(addr = %metrics_addr, "Serving metrics at /metrics");

    let margins = engine.get_margins()?;
    tracing::info!(margins = margins.len(), "Token ledger ready");

    tokio::signal::ctrl_c().await?;

    metrics_server.abort();
    engine.shutdown().await?;
    tracing::info!("Token ledger server stopped");
    Ok(())
}
