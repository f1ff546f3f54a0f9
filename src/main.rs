use std::io::IsTerminal;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use tokio::task::JoinSet;
use tracing::info;

use pgp_sendmail::cli::{Cli, read_message};
use pgp_sendmail::config::RelayConfig;
use pgp_sendmail::crypto::RpgpEngine;
use pgp_sendmail::delivery::dispatcher_for;
use pgp_sendmail::keystore::FsKeyStore;
use pgp_sendmail::listener::{serve_http, serve_smtp};
use pgp_sendmail::pipeline::Pipeline;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let default_filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut config = RelayConfig::from_env().context("Invalid configuration")?;
    cli.apply(&mut config);
    let config = Arc::new(config);

    let dispatcher = dispatcher_for(config.smart_host.as_ref());
    info!(
        dispatcher = dispatcher.name(),
        key_dir = %config.key_dir.display(),
        "Starting"
    );

    let pipeline = Arc::new(Pipeline::new(
        Arc::clone(&config),
        Arc::new(FsKeyStore::new(config.key_dir.clone())),
        Arc::new(RpgpEngine::new()),
        dispatcher,
    ));

    // ── Listeners ───────────────────────────────────────────────────────
    if cli.is_daemon() {
        let mut listeners = JoinSet::new();
        if cli.smtp {
            let (pipeline, addr) = (Arc::clone(&pipeline), config.smtp.bind.clone());
            listeners.spawn(async move { serve_smtp(pipeline, &addr).await });
        }
        if cli.http {
            let (pipeline, addr) = (Arc::clone(&pipeline), config.http.bind.clone());
            listeners.spawn(async move { serve_http(pipeline, &addr).await });
        }
        // Listeners only return on failure.
        while let Some(joined) = listeners.join_next().await {
            joined.context("Listener task panicked")??;
        }
        return Ok(());
    }

    // ── Stdin submission ────────────────────────────────────────────────
    if std::io::stdin().is_terminal() {
        bail!("Refusing to read a message from a terminal; pipe the message into sendmail");
    }
    let ignore_dots = cli.ignore_dots;
    let body =
        tokio::task::spawn_blocking(move || read_message(std::io::stdin().lock(), ignore_dots))
            .await
            .context("Stdin reader panicked")?
            .context("Failed to read message from stdin")?;

    let report = pipeline.submit(cli.submission(body)).await?;
    info!(envelopes = report.envelopes.len(), "Message delivered");
    Ok(())
}
