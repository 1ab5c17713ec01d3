// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use remex_agent::{AgentConfig, AgentServer, AgentServices, RemoteExecutionDispatcher};
use remex_cas::{ContentServer, FileSystemContentStore};
use remex_logging::CliLoggingArgs;
use remex_proto::Endpoint;
use remex_sandbox::ProcessSandbox;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(long, env = "REMEX_AGENT_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address (unix:///path or tcp://host:port)
    #[arg(long, env = "REMEX_AGENT_ENDPOINT")]
    endpoint: Option<Endpoint>,

    /// Content store root directory
    #[arg(long, env = "REMEX_CAS_ROOT")]
    cas_root: Option<PathBuf>,

    /// Timeout for pips that do not carry their own
    #[arg(long, env = "REMEX_DEFAULT_TIMEOUT_SECS")]
    default_timeout_secs: Option<u64>,

    #[command(flatten)]
    logging: CliLoggingArgs,
}

impl Args {
    fn into_config(self) -> Result<AgentConfig> {
        let mut config = match &self.config {
            Some(path) => AgentConfig::load(path)?,
            None => AgentConfig::default(),
        };
        if let Some(endpoint) = self.endpoint {
            config.endpoint = endpoint;
        }
        if let Some(cas_root) = self.cas_root {
            config.cas_root = cas_root;
        }
        if let Some(secs) = self.default_timeout_secs {
            config.default_timeout_secs = secs;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    args.logging.init("remex-agent")?;
    let config = args.into_config()?;

    let span = tracing::info_span!("agent", component = "remex-agent");
    let _enter = span.enter();
    info!(
        operation = "start_agent",
        endpoint = %config.endpoint,
        cas_root = %config.cas_root.display(),
        "starting remote execution agent"
    );

    let store = Arc::new(FileSystemContentStore::open(&config.cas_root).await?);
    let content = ContentServer::new(store.clone(), config.staging_dir()).await?;
    let dispatcher = RemoteExecutionDispatcher::new(
        store,
        Arc::new(ProcessSandbox::new()),
        config.dispatcher_settings(),
    );
    let services = Arc::new(AgentServices {
        dispatcher,
        content,
        max_frame_bytes: config.max_frame_bytes,
    });

    let server = AgentServer::bind(&config.endpoint, services).await?;
    let shutdown = CancellationToken::new();
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let serve = server.run(shutdown.clone());
    tokio::pin!(serve);
    tokio::select! {
        result = &mut serve => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                return Err(e);
            }
            return Ok(());
        }
        _ = sigint.recv() => {
            info!(operation = "shutdown", signal = "SIGINT", "received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            info!(operation = "shutdown", signal = "SIGTERM", "received SIGTERM, shutting down");
        }
    }
    shutdown.cancel();
    serve.await
}
