// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use anyhow::Context;
use std::env;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use logqueue::{Config, Engine};

enum Signal {
    Reload,
    Stop,
}

#[tokio::main]
pub async fn main() {
    let log_level = env::var("LOGQUEUE_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("hyper=off,{log_level}");

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    if let Err(e) = run().await {
        error!("logqueue agent failed: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = Config::from_env().context("Error loading configuration")?;
    let mut engine = Engine::start(config)
        .await
        .context("Error starting the queue engine")?;

    info!(
        source = ?engine.source_addr(),
        webhook = ?engine.webhook_addr(),
        metrics = ?engine.metrics_addr(),
        "logqueue agent started"
    );

    loop {
        match next_signal().await? {
            Signal::Reload => match Config::from_env() {
                Ok(config) => {
                    if let Err(e) = engine.reload(config).await {
                        error!("Error reloading configuration: {e}");
                    }
                }
                Err(e) => error!("Error loading configuration, keeping the running one: {e}"),
            },
            Signal::Stop => break,
        }
    }

    engine.stop().await.context("Error stopping the queue engine")?;
    Ok(())
}

#[cfg(unix)]
async fn next_signal() -> anyhow::Result<Signal> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup()).context("Error installing SIGHUP handler")?;
    let mut terminate =
        signal(SignalKind::terminate()).context("Error installing SIGTERM handler")?;
    tokio::select! {
        _ = hangup.recv() => {
            info!("SIGHUP received, reloading configuration");
            Ok(Signal::Reload)
        }
        _ = terminate.recv() => Ok(Signal::Stop),
        res = tokio::signal::ctrl_c() => {
            res.context("Error waiting for ctrl-c")?;
            Ok(Signal::Stop)
        }
    }
}

#[cfg(not(unix))]
async fn next_signal() -> anyhow::Result<Signal> {
    tokio::signal::ctrl_c()
        .await
        .context("Error waiting for ctrl-c")?;
    Ok(Signal::Stop)
}
