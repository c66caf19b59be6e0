//! Service configuration loaded from environment variables.

use crate::errors::{Result, ServiceError};

#[derive(Debug, Clone)]
pub struct Config {
    /// Ledger node JSON-RPC endpoint.
    pub rpc_url: String,
    /// Test-network faucet for ephemeral funding accounts.
    pub faucet_url: String,
    /// Path to the SQLite database file.
    pub database_url: String,
    /// Long-lived sponsor funding account (optional; ephemeral accounts
    /// are used when unset).
    pub funding_account_address: Option<String>,
    /// Signing secret for the funding account, passed to the node's sign
    /// method. Custody stays with the node operator.
    pub funding_account_seed: Option<String>,
    /// How long to wait for a submission to reach a validated ledger.
    pub submit_timeout_secs: u64,
    /// Poll cadence while waiting for validation.
    pub poll_interval_millis: u64,
    /// Cadence of the background reconciliation worker.
    pub reconcile_interval_secs: u64,
    /// Cadence of the expiry sweep.
    pub expiry_interval_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            rpc_url: env_var("RPC_URL")
                .unwrap_or_else(|_| "https://s.altnet.rippletest.net:51234".to_string()),
            faucet_url: env_var("FAUCET_URL")
                .unwrap_or_else(|_| "https://faucet.altnet.rippletest.net/accounts".to_string()),
            database_url: env_var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./escrowd.db".to_string()),
            funding_account_address: env_var("FUNDING_ACCOUNT_ADDRESS").ok(),
            funding_account_seed: env_var("FUNDING_ACCOUNT_SEED").ok(),
            submit_timeout_secs: env_var("SUBMIT_TIMEOUT_SECS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .map_err(|_| ServiceError::Config("Invalid SUBMIT_TIMEOUT_SECS".to_string()))?,
            poll_interval_millis: env_var("POLL_INTERVAL_MILLIS")
                .unwrap_or_else(|_| "500".to_string())
                .parse()
                .map_err(|_| ServiceError::Config("Invalid POLL_INTERVAL_MILLIS".to_string()))?,
            reconcile_interval_secs: env_var("RECONCILE_INTERVAL_SECS")
                .unwrap_or_else(|_| "15".to_string())
                .parse()
                .map_err(|_| ServiceError::Config("Invalid RECONCILE_INTERVAL_SECS".to_string()))?,
            expiry_interval_secs: env_var("EXPIRY_INTERVAL_SECS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()
                .map_err(|_| ServiceError::Config("Invalid EXPIRY_INTERVAL_SECS".to_string()))?,
        })
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| ServiceError::Config(format!("Missing env var: {key}")))
}
