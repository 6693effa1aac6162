//! virtual-kubelet
//!
//! Registers a virtual node with the cluster and runs the pods scheduled
//! onto it on the selected provider.
//!
//! Exit codes follow the error kind that ended the process: 0 for a clean
//! shutdown, 1 fatal, 2 invalid input, 3 unauthorized or forbidden,
//! 4 unsupported, 5 not found, 6 transient.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vk_errdefs::{Error, ErrorKind, Result};

use vk_node_agent::config::{Cli, Config, LogFormat};
use vk_node_agent::control_plane::kubernetes::KubeControlPlane;
use vk_node_agent::server::{self, ServerState};
use vk_node_agent::{tls, Agent, AgentSettings};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_tracing(&cli.log_level, cli.log_format) {
        eprintln!("virtual-kubelet: {e:#}");
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(()) => {
            info!("Virtual kubelet shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) if e.is(ErrorKind::Cancelled) => {
            info!("Virtual kubelet cancelled during startup");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(kind = e.kind().as_str(), error = %e.report(), "Virtual kubelet failed");
            ExitCode::from(e.kind().exit_code().clamp(1, 255) as u8)
        }
    }
}

fn init_tracing(level: &str, format: LogFormat) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("invalid log level {level:?}"))?;
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()?,
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).try_init()?,
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::from_cli(cli)?;
    info!(
        node = %config.node_name,
        provider = %config.provider,
        os = %config.os,
        namespace = config.namespace.as_deref().unwrap_or("*"),
        "Configuration loaded"
    );

    // kube and the HTTP surface must agree on one process-wide provider.
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("A TLS crypto provider was already installed");
    }

    let provider = config.provider.build(&config.provider_init())?;
    let control_plane = Arc::new(
        KubeControlPlane::connect(
            config.kubeconfig.as_deref(),
            config.max_inflight_requests,
            config.request_timeout(),
        )
        .await?,
    );

    let root = CancellationToken::new();
    tokio::spawn({
        let root = root.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received shutdown signal"),
                Err(e) => warn!(error = %e, "Failed to listen for shutdown signal"),
            }
            root.cancel();
        }
    });

    let agent = Agent::new(AgentSettings::from(&config), control_plane, provider.clone())?;

    let tls = config.tls.as_ref().map(tls::acceptor).transpose()?;
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .map_err(|e| Error::wrap(e, format!("bind {}", config.listen_addr)))?;
    let router = server::router(ServerState {
        provider,
        ready: agent.readiness(),
        cancel: root.child_token(),
    });
    let server = tokio::spawn(server::serve(listener, router, tls, root.child_token()));

    let outcome = match agent.start(root.clone()).await {
        Ok(running) => running.wait().await,
        Err(e) => Err(e),
    };

    root.cancel();
    match tokio::time::timeout(config.shutdown_timeout, server).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => warn!(error = %e.report(), "Kubelet API ended with error"),
        Ok(Err(e)) => warn!(error = %e, "Kubelet API task failed"),
        Err(_) => warn!("Kubelet API did not stop in time"),
    }
    outcome
}
