use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use replicated_kv::api;
use replicated_kv::cli::Cli;
use replicated_kv::kv::FileStore;
use replicated_kv::log_store::FileLogStore;
use replicated_kv::replica::Replica;
use replicated_kv::transport::HttpTransport;
use replicated_kv::wal::WriteAheadLog;

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {err}");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = cli.replica_config()?;

    let store = FileLogStore::open(&cli.log)
        .with_context(|| format!("opening log {}", cli.log.display()))?;
    let wal = WriteAheadLog::open(Box::new(store)).context("recovering write-ahead log")?;
    let last = wal.last_op();
    info!(index = last.index, term = last.term, "recovered write-ahead log");

    let kv = FileStore::open(&cli.db).with_context(|| format!("opening store {}", cli.db.display()))?;
    let transport = HttpTransport::new(config.rpc_timeout)?;
    let peers = config.peers.len();
    let replica = Replica::new(config, wal, Arc::new(kv), Arc::new(transport))?;

    let listener = TcpListener::bind(cli.listen_addr())
        .await
        .with_context(|| format!("binding {}", cli.listen_addr()))?;
    info!(addr = %cli.addr, listen = %listener.local_addr()?, peers, "replica listening");

    let server = tokio::spawn(api::serve(listener, replica.clone(), shutdown_signal()));

    tokio::select! {
        outcome = replica.clone().run_until(shutdown_signal()) => {
            if let Err(err) = outcome {
                warn!("replica stopped: {err}");
                return Err(err.into());
            }
        }
        served = server => {
            match served {
                Ok(Ok(())) => info!("http server stopped"),
                Ok(Err(err)) => bail!("http server failed: {err}"),
                Err(err) => bail!("http server task failed: {err}"),
            }
        }
    }

    Ok(())
}
