//! escrowd — entry point.
//!
//! Wires the funding engine to its collaborators (SQLite datastore,
//! node-backed signer, JSON-RPC ledger transport) and runs the two
//! background workers: consistency reconciliation and expiry sweeps.
//! Goal/milestone operations themselves are library calls into
//! [`escrow_engine`], made by whatever application embeds it.

mod config;
mod errors;
mod signer;
mod store;

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use escrow_engine::escrow::EscrowCoordinator;
use escrow_engine::expiry::ExpiryMonitor;
use escrow_engine::ledger::{JsonRpcLedger, LedgerGateway, LedgerRpc};
use escrow_engine::reconcile::Reconciler;
use escrow_engine::signing::SigningProvider;
use escrow_engine::store::Datastore;

use config::Config;
use signer::NodeSigner;
use store::SqliteStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    // Load config from environment.
    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    // Set up the SQLite connection pool and run migrations.
    let pool = store::init_pool(&config.database_url).await?;
    let datastore: Arc<dyn Datastore> = Arc::new(SqliteStore::new(pool));

    // HTTP client shared between the ledger transport, signer, and faucet.
    let client = Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;

    let rpc: Arc<dyn LedgerRpc> = Arc::new(JsonRpcLedger::new(
        client.clone(),
        config.rpc_url.clone(),
        Duration::from_secs(config.submit_timeout_secs),
        Duration::from_millis(config.poll_interval_millis),
    ));

    let node_signer = NodeSigner::new(client, config.rpc_url.clone(), config.faucet_url.clone());
    if let (Some(address), Some(seed)) = (
        &config.funding_account_address,
        &config.funding_account_seed,
    ) {
        node_signer.register(address, seed);
        info!(address, "persistent funding account registered");
    }
    let signer: Arc<dyn SigningProvider> = Arc::new(node_signer);

    let gateway = Arc::new(LedgerGateway::new(rpc.clone(), signer));
    let coordinator = Arc::new(EscrowCoordinator::new(gateway));

    let shutdown = CancellationToken::new();

    // ─── Background reconciliation ────────────────────────
    let reconciler = Arc::new(Reconciler::new(datastore.clone(), rpc));
    let reconcile_task = tokio::spawn(reconciler.run(
        Duration::from_secs(config.reconcile_interval_secs),
        shutdown.clone(),
    ));

    // ─── Expiry sweeps ────────────────────────────────────
    let monitor = Arc::new(ExpiryMonitor::new(datastore, coordinator));
    let expiry_task = tokio::spawn(monitor.run(
        Duration::from_secs(config.expiry_interval_secs),
        shutdown.clone(),
    ));

    info!("escrowd running — ledger {}", config.rpc_url);

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    shutdown.cancel();
    let _ = reconcile_task.await;
    let _ = expiry_task.await;

    Ok(())
}
