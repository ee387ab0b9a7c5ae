//! Network and contract configuration.
//!
//! Every deployment-specific value lives here: the RPC endpoint, the signing
//! account, each contract address, the collateral ratio and the polling and
//! retry tuning. Nothing else in the crate carries an address literal.

use crate::collateral::RoundingMode;
use crate::error::{Result, SahakariError};
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Default collateralization ratio, in percent
pub const DEFAULT_COLLATERAL_RATIO_PERCENT: u64 = 150;

/// Network type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// Ethereum mainnet
    Mainnet,
    /// Sepolia testnet
    Sepolia,
    /// Local development node (anvil / hardhat)
    Localhost,
    /// Custom network with a user-defined endpoint
    Custom,
}

impl Network {
    /// EIP-155 chain id, `None` for custom networks
    pub fn chain_id(&self) -> Option<u64> {
        match self {
            Network::Mainnet => Some(1),
            Network::Sepolia => Some(11_155_111),
            Network::Localhost => Some(31_337),
            Network::Custom => None,
        }
    }

    /// Default JSON-RPC URL for this network
    pub fn default_rpc_url(&self) -> &'static str {
        match self {
            Network::Mainnet => "https://ethereum-rpc.publicnode.com",
            Network::Sepolia => "https://ethereum-sepolia-rpc.publicnode.com",
            Network::Localhost => "http://127.0.0.1:8545",
            Network::Custom => "",
        }
    }
}

/// Addresses of the deployed contracts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractAddresses {
    /// MemberRegistry
    pub member_registry: Address,
    /// FundingPool
    pub funding_pool: Address,
    /// LoanManager
    pub loan_manager: Address,
    /// FinanceProcessor
    pub finance_processor: Address,
    /// EthPriceConsumerV3
    pub price_feed: Address,
    /// USDC ERC-20 token
    pub usdc_token: Address,
}

impl ContractAddresses {
    /// All addresses with a label, for validation and log filters
    pub fn labelled(&self) -> [(&'static str, Address); 6] {
        [
            ("member_registry", self.member_registry),
            ("funding_pool", self.funding_pool),
            ("loan_manager", self.loan_manager),
            ("finance_processor", self.finance_processor),
            ("price_feed", self.price_feed),
            ("usdc_token", self.usdc_token),
        ]
    }

    /// Contracts whose events the projection cache follows
    pub fn event_sources(&self) -> Vec<Address> {
        vec![
            self.member_registry,
            self.funding_pool,
            self.loan_manager,
            self.finance_processor,
        ]
    }
}

/// Dashboard a wallet is routed to. Display only, the contracts enforce access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DashboardRole {
    /// Administrator views
    Admin,
    /// Member views
    Member,
}

/// Configuration for the lending client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Network to connect to
    pub network: Network,

    /// JSON-RPC endpoint URL
    pub rpc_url: String,

    /// Expected chain id
    pub chain_id: u64,

    /// Account that signs transactions through the node
    pub account: Address,

    /// Contract deployment
    pub contracts: ContractAddresses,

    /// Collateral required, as a percentage of the principal
    #[serde(default = "default_ratio")]
    pub collateral_ratio_percent: u64,

    /// How integer division in the collateral formula is rounded
    #[serde(default)]
    pub rounding: RoundingMode,

    /// Wallets shown the admin dashboard
    #[serde(default)]
    pub admin_addresses: Vec<Address>,

    /// HTTP request timeout (in seconds)
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Maximum number of retries for failed reads
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Initial retry delay (in milliseconds)
    #[serde(default = "default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,

    /// Maximum retry delay (in milliseconds)
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Retry backoff multiplier
    #[serde(default = "default_retry_multiplier")]
    pub retry_multiplier: f64,

    /// Receipt polling interval (in milliseconds)
    #[serde(default = "default_tx_poll_interval_ms")]
    pub tx_poll_interval_ms: u64,

    /// Confirmation timeout (in seconds)
    #[serde(default = "default_tx_timeout_secs")]
    pub tx_timeout_secs: u64,

    /// Log polling interval (in milliseconds)
    #[serde(default = "default_event_poll_interval_ms")]
    pub event_poll_interval_ms: u64,

    /// Blocks per `eth_getLogs` request
    #[serde(default = "default_event_batch_blocks")]
    pub event_batch_blocks: u64,

    /// First block to scan for events, normally the contracts' deployment
    /// block. Without it the watcher starts at the chain head and never
    /// reports the projection as synced.
    #[serde(default)]
    pub event_start_block: Option<u64>,
}

fn default_ratio() -> u64 {
    DEFAULT_COLLATERAL_RATIO_PERCENT
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> usize {
    3
}
fn default_retry_initial_delay_ms() -> u64 {
    100
}
fn default_retry_max_delay_ms() -> u64 {
    5000
}
fn default_retry_multiplier() -> f64 {
    2.0
}
fn default_tx_poll_interval_ms() -> u64 {
    1000
}
fn default_tx_timeout_secs() -> u64 {
    120
}
fn default_event_poll_interval_ms() -> u64 {
    4000
}
fn default_event_batch_blocks() -> u64 {
    500
}

impl ClientConfig {
    /// Create a configuration for a preset network
    pub fn new(network: Network, account: Address, contracts: ContractAddresses) -> Self {
        Self {
            network,
            rpc_url: network.default_rpc_url().to_string(),
            chain_id: network.chain_id().unwrap_or_default(),
            account,
            contracts,
            collateral_ratio_percent: DEFAULT_COLLATERAL_RATIO_PERCENT,
            rounding: RoundingMode::default(),
            admin_addresses: Vec::new(),
            request_timeout_secs: default_request_timeout_secs(),
            max_retries: default_max_retries(),
            retry_initial_delay_ms: default_retry_initial_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            retry_multiplier: default_retry_multiplier(),
            tx_poll_interval_ms: default_tx_poll_interval_ms(),
            tx_timeout_secs: default_tx_timeout_secs(),
            event_poll_interval_ms: default_event_poll_interval_ms(),
            event_batch_blocks: default_event_batch_blocks(),
            event_start_block: None,
        }
    }

    /// Create configuration for Sepolia
    pub fn sepolia(account: Address, contracts: ContractAddresses) -> Self {
        Self::new(Network::Sepolia, account, contracts)
    }

    /// Create configuration for a local development node
    pub fn localhost(account: Address, contracts: ContractAddresses) -> Self {
        Self::new(Network::Localhost, account, contracts)
    }

    /// Create a custom configuration
    pub fn custom(
        rpc_url: String,
        chain_id: u64,
        account: Address,
        contracts: ContractAddresses,
    ) -> Result<Self> {
        if rpc_url.is_empty() {
            return Err(SahakariError::Config("RPC URL cannot be empty".to_string()));
        }
        if chain_id == 0 {
            return Err(SahakariError::Config(
                "Chain id must be greater than 0".to_string(),
            ));
        }

        let mut config = Self::new(Network::Custom, account, contracts);
        config.rpc_url = rpc_url;
        config.chain_id = chain_id;
        Ok(config)
    }

    /// Load from a TOML file overlaid with `SAHAKARI__*` environment variables
    ///
    /// Nested keys use a double underscore, e.g. `SAHAKARI__CONTRACTS__LOAN_MANAGER`.
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("SAHAKARI").separator("__"))
            .build()
            .map_err(|e| SahakariError::Config(e.to_string()))?;

        let mut loaded: ClientConfig = settings
            .try_deserialize()
            .map_err(|e| SahakariError::Config(e.to_string()))?;

        if loaded.rpc_url.is_empty() {
            loaded.rpc_url = loaded.network.default_rpc_url().to_string();
        }
        loaded.validate()?;
        Ok(loaded)
    }

    /// Parse a TOML document
    pub fn from_toml(source: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(source, config::FileFormat::Toml))
            .build()
            .map_err(|e| SahakariError::Config(e.to_string()))?;

        let loaded: ClientConfig = settings
            .try_deserialize()
            .map_err(|e| SahakariError::Config(e.to_string()))?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// HTTP request timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Set request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// Set maximum retries
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set retry delays
    pub fn with_retry_config(
        mut self,
        initial_delay_ms: u64,
        max_delay_ms: u64,
        multiplier: f64,
    ) -> Self {
        self.retry_initial_delay_ms = initial_delay_ms;
        self.retry_max_delay_ms = max_delay_ms;
        self.retry_multiplier = multiplier;
        self
    }

    /// Set receipt polling configuration
    pub fn with_tx_config(mut self, poll_interval_ms: u64, timeout_secs: u64) -> Self {
        self.tx_poll_interval_ms = poll_interval_ms;
        self.tx_timeout_secs = timeout_secs;
        self
    }

    /// Set log polling configuration
    pub fn with_event_config(mut self, poll_interval_ms: u64, batch_blocks: u64) -> Self {
        self.event_poll_interval_ms = poll_interval_ms;
        self.event_batch_blocks = batch_blocks;
        self
    }

    /// Scan events from `block` onwards
    pub fn with_event_start_block(mut self, block: u64) -> Self {
        self.event_start_block = Some(block);
        self
    }

    /// Set the collateralization ratio
    pub fn with_collateral_ratio(mut self, percent: u64) -> Self {
        self.collateral_ratio_percent = percent;
        self
    }

    /// Set the collateral rounding policy
    pub fn with_rounding(mut self, rounding: RoundingMode) -> Self {
        self.rounding = rounding;
        self
    }

    /// Set the wallets shown the admin dashboard
    pub fn with_admin_addresses(mut self, admins: Vec<Address>) -> Self {
        self.admin_addresses = admins;
        self
    }

    /// Which dashboard to show a wallet.
    ///
    /// Purely presentational: the contracts decide who may approve, disburse
    /// or liquidate, and no client operation consults this.
    pub fn dashboard_role(&self, wallet: Address) -> DashboardRole {
        if self.admin_addresses.contains(&wallet) {
            DashboardRole::Admin
        } else {
            DashboardRole::Member
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.rpc_url.is_empty() {
            return Err(SahakariError::Config("RPC URL cannot be empty".to_string()));
        }
        Url::parse(&self.rpc_url)?;
        if self.chain_id == 0 {
            return Err(SahakariError::Config(
                "Chain id must be greater than 0".to_string(),
            ));
        }
        if let Some(expected) = self.network.chain_id() {
            if expected != self.chain_id {
                return Err(SahakariError::Config(format!(
                    "Chain id {} does not match network {:?} ({})",
                    self.chain_id, self.network, expected
                )));
            }
        }
        if self.account.is_zero() {
            return Err(SahakariError::Config(
                "Signing account cannot be the zero address".to_string(),
            ));
        }
        for (label, address) in self.contracts.labelled() {
            if address.is_zero() {
                return Err(SahakariError::Config(format!(
                    "Contract address {} cannot be the zero address",
                    label
                )));
            }
        }
        if self.collateral_ratio_percent < 100 {
            return Err(SahakariError::Config(
                "Collateral ratio must be at least 100 percent".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(SahakariError::Config(
                "Request timeout must be greater than 0".to_string(),
            ));
        }
        if self.max_retries == 0 {
            return Err(SahakariError::Config(
                "Max retries must be greater than 0".to_string(),
            ));
        }
        if self.retry_initial_delay_ms == 0 {
            return Err(SahakariError::Config(
                "Retry initial delay must be greater than 0".to_string(),
            ));
        }
        if self.retry_multiplier <= 1.0 {
            return Err(SahakariError::Config(
                "Retry multiplier must be greater than 1.0".to_string(),
            ));
        }
        if self.tx_poll_interval_ms == 0 {
            return Err(SahakariError::Config(
                "Transaction poll interval must be greater than 0".to_string(),
            ));
        }
        if self.tx_timeout_secs == 0 {
            return Err(SahakariError::Config(
                "Transaction timeout must be greater than 0".to_string(),
            ));
        }
        if self.event_batch_blocks == 0 {
            return Err(SahakariError::Config(
                "Event batch size must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
