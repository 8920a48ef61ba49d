use crate::types::Principal;
use std::{path::PathBuf, time::Duration};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Network {
    Mainnet,
    Devnet,
    Testnet,
}

impl Network {
    pub fn default_rpc_url(self) -> &'static str {
        match self {
            Network::Mainnet => "https://api.mainnet-beta.solana.com",
            Network::Devnet => "https://api.devnet.solana.com",
            Network::Testnet => "https://api.testnet.solana.com",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Devnet => "devnet",
            Network::Testnet => "testnet",
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub network: Network,
    pub rpc_url: String,

    /// Named key identifier. Appears in logs and config; the seed itself is
    /// resolved from the environment or a file and never stored here.
    pub signing_key_id: String,

    pub state_file: PathBuf,

    /// Principal local daemon invocations act as.
    pub operator_principal: Principal,
    /// Optional initial admin; otherwise the first caller of
    /// `initialize_first_admin` becomes the first admin.
    pub initial_admin: Option<Principal>,

    pub webhook_url: Option<String>,
    pub license_url: Option<String>,

    /// Bound on every outcall.
    pub rpc_timeout: Duration,
    /// Cap on concurrent RPC submissions.
    pub max_in_flight_submissions: usize,
    /// How many times to poll `getSignatureStatuses` after a submit before
    /// classifying the transaction as Unknown.
    pub confirmation_polls: u32,
    pub confirmation_poll_interval: Duration,

    /// Concurrent dispatches across different subscriptions.
    pub max_concurrency: usize,

    /// Cycles consumed per dispatch attempt, and the amount credited by one
    /// auto-refill step.
    pub dispatch_cost_cycles: u64,
    pub auto_refill_amount: u64,

    pub once: bool,
    pub dry_run: bool,
}

impl ServiceConfig {
    /// Resolve the RPC endpoint: explicit flag, then `CADENCE_RPC_URL`, then
    /// the network default.
    pub fn resolve_rpc_url(network: Network, rpc_override: Option<String>) -> String {
        let url = rpc_override
            .or_else(|| std::env::var("CADENCE_RPC_URL").ok())
            .unwrap_or_else(|| network.default_rpc_url().to_string());

        if url.contains("api-key") || url.contains("apikey") {
            tracing::warn!(
                "RPC URL looks like it may contain an API key; consider using CADENCE_RPC_URL instead of committing it."
            );
        }

        url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_defaults() {
        assert!(Network::Mainnet.default_rpc_url().contains("mainnet"));
        assert!(Network::Devnet.default_rpc_url().contains("devnet"));
        assert!(Network::Testnet.default_rpc_url().contains("testnet"));
    }

    #[test]
    fn rpc_override_wins() {
        let url =
            ServiceConfig::resolve_rpc_url(Network::Devnet, Some("http://localhost:8899".into()));
        assert_eq!(url, "http://localhost:8899");
    }
}
