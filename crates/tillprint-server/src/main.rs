// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Tillprint: receipt print-job dispatch and retry engine
//
// Entry point. Initialises logging and configuration, starts the dispatcher,
// and serves the HTTP API until Ctrl-C or SIGTERM.

mod api;
mod services;
mod state;

use std::process::ExitCode;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info};

use tillprint_core::ServiceConfig;
use tillprint_core::error::{Result, TillprintError};

use services::Engine;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Tillprint starting");

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "tillprint stopped with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let config = ServiceConfig::from_env()?;
    let engine = Engine::init(&config)?;

    let (stop, shutdown) = watch::channel(false);
    let dispatcher = tokio::spawn(Arc::clone(&engine.dispatcher).run(shutdown));

    let app = api::router(
        Arc::clone(&engine.state),
        api::cors_layer(&config.server.allowed_origins)?,
    );
    let listener = tokio::net::TcpListener::bind(config.server.listen_addr).await?;
    info!(addr = %config.server.listen_addr, "HTTP API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("HTTP API stopped, draining dispatcher");
    // The dispatcher may already have exited; a closed channel is fine.
    let _ = stop.send(true);
    dispatcher
        .await
        .map_err(|e| TillprintError::Store(format!("dispatcher task failed: {e}")))??;

    info!("Tillprint stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown requested");
}
