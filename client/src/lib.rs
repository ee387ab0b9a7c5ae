//! DeFi Sahakari lending client
//!
//! This library orchestrates the loan lifecycle of the Sahakari cooperative
//! lending contracts on Ethereum: collateral computation against a live
//! ETH/USD price, ERC-20 allowance management, the multi-step loan state
//! machine, and an in-memory projection of the contracts' events.
//!
//! The contracts are authoritative for every balance, allowance and loan
//! flag. The client re-reads them before each transition and holds only
//! advisory copies.
//!
//! # Features
//!
//! - **Collateral**: exact fixed-point computation at a configurable ratio, rounded up
//! - **Allowances**: approve exactly what a spend needs, serialized per (owner, spender, token)
//! - **Lifecycle**: request, approve, disburse, repay, return collateral, liquidate
//! - **Two-phase transactions**: submission and confirmation failures are reported separately
//! - **Events**: append-only projection with scoped subscriptions, fed by a log poller
//! - **Retry Logic**: exponential backoff for reads; transactions are never resent
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use sahakari_client::{ClientConfig, SahakariClient, Usdc};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     sahakari_client::init_tracing();
//!
//!     let config = ClientConfig::load("sahakari.toml")?;
//!     let client = SahakariClient::new(config)?;
//!     client.health_check().await?;
//!
//!     let quote = client.orchestrator().quote_collateral(Usdc::parse("1000")?).await?;
//!     println!("Collateral required: {} ETH", quote.collateral);
//!     Ok(())
//! }
//! ```
//!
//! # Examples
//!
//! ## Walk a loan through approval and disbursement
//!
//! ```rust,no_run
//! use sahakari_client::{ClientConfig, SahakariClient};
//! use ethers::types::Address;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = SahakariClient::new(ClientConfig::load("sahakari.toml")?)?;
//! let loans = client.orchestrator();
//! let borrower: Address = "0x1111111111111111111111111111111111111111".parse()?;
//!
//! loans.approve_loan(borrower, 0).await?;
//! loans.disburse_loan(borrower, 0).await?;
//! println!("State: {}", loans.loan_state(borrower, 0).await?);
//! # Ok(())
//! # }
//! ```
//!
//! ## Follow loan events
//!
//! ```rust,no_run
//! use sahakari_client::{ClientConfig, EventKind, SahakariClient};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = SahakariClient::new(ClientConfig::load("sahakari.toml")?)?;
//! let _subscription = client.events().subscribe(EventKind::LoanRequested, |record| {
//!     println!("#{} {}", record.observed_order, record.payload);
//! });
//!
//! let watcher = client.watcher()?;
//! watcher.poll_once().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod allowance;
pub mod amount;
pub mod codec;
pub mod collateral;
pub mod config;
pub mod error;
pub mod events;
pub mod ledger;
pub mod lifecycle;
pub mod locks;
pub mod monitor;
pub mod oracle;
pub mod retry;
pub mod rpc;
pub mod transaction;
pub mod types;
pub mod watcher;

// Re-export commonly used types
pub use allowance::{AllowanceManager, AllowanceOutcome};
pub use amount::{EthPrice, Usdc, Wei};
pub use collateral::{required_eth_collateral, CollateralQuote, RoundingMode};
pub use config::{ClientConfig, ContractAddresses, DashboardRole, Network};
pub use error::{ErrorPhase, Result, SahakariError};
pub use events::{EventKind, EventProjection, EventRecord, Subscription};
pub use ledger::{LedgerCall, LedgerService, RpcLedger};
pub use lifecycle::{LoanOrchestrator, LoanRequest};
pub use monitor::{MonitorOptions, MonitorResult, TransactionMonitor};
pub use oracle::PriceOracle;
pub use retry::RetryStrategy;
pub use rpc::{CallRequest, JsonRpcClient};
pub use transaction::TransactionManager;
pub use types::{
    Loan, LoanAction, LoanState, LoanView, Member, PendingTransaction, PoolBalances, PoolTotals,
    TokenPosition, TransactionHash, TransactionStatus, TxReceipt,
};
pub use watcher::EventWatcher;

use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Install a `tracing` subscriber filtered by `RUST_LOG`, `info` by default.
///
/// Does nothing if a global subscriber is already set.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Main client wiring the JSON-RPC ledger, the loan orchestrator and the
/// event projection from one [`ClientConfig`].
///
/// This is the primary entry point for interacting with the lending contracts.
#[derive(Clone)]
pub struct SahakariClient {
    /// JSON-RPC ledger
    ledger: Arc<RpcLedger>,
    /// Loan orchestrator
    orchestrator: LoanOrchestrator,
    /// Event projection
    events: EventProjection,
    /// Configuration
    config: Arc<ClientConfig>,
}

impl SahakariClient {
    /// Create a new client
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use sahakari_client::{ClientConfig, ContractAddresses, SahakariClient};
    /// use ethers::types::Address;
    ///
    /// let contracts = ContractAddresses {
    ///     member_registry: Address::repeat_byte(0x01),
    ///     funding_pool: Address::repeat_byte(0x02),
    ///     loan_manager: Address::repeat_byte(0x03),
    ///     finance_processor: Address::repeat_byte(0x04),
    ///     price_feed: Address::repeat_byte(0x05),
    ///     usdc_token: Address::repeat_byte(0x06),
    /// };
    /// let config = ClientConfig::localhost(Address::repeat_byte(0xaa), contracts);
    /// let client = SahakariClient::new(config).unwrap();
    /// ```
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;

        info!(
            "Initializing lending client for network {:?} (chain {})",
            config.network, config.chain_id
        );

        let rpc = JsonRpcClient::new(&config)?;
        let transactions = TransactionManager::new(rpc, &config);
        let ledger = Arc::new(RpcLedger::new(transactions, config.contracts));
        let events = EventProjection::new();
        let orchestrator =
            LoanOrchestrator::from_config(ledger.clone(), &config).with_events(events.clone());

        Ok(Self {
            ledger,
            orchestrator,
            events,
            config: Arc::new(config),
        })
    }

    /// Get the loan orchestrator
    pub fn orchestrator(&self) -> &LoanOrchestrator {
        &self.orchestrator
    }

    /// Get the event projection
    pub fn events(&self) -> &EventProjection {
        &self.events
    }

    /// Get the ledger
    pub fn ledger(&self) -> &RpcLedger {
        &self.ledger
    }

    /// Get the JSON-RPC client
    pub fn rpc(&self) -> &JsonRpcClient {
        self.ledger.transactions().rpc()
    }

    /// Event watcher feeding this client's projection, from the configured
    /// `event_start_block` when set
    pub fn watcher(&self) -> Result<EventWatcher> {
        EventWatcher::new(self.rpc().clone(), &self.config, self.events.clone())
    }

    /// Presentation role of `wallet`; never an access check
    pub fn dashboard_role(&self, wallet: ethers::types::Address) -> DashboardRole {
        self.config.dashboard_role(wallet)
    }

    /// Health check - verify the node answers with the configured chain id
    pub async fn health_check(&self) -> Result<u64> {
        let chain_id = self.rpc().health_check().await?;
        if chain_id != self.config.chain_id {
            error!(
                "Node reports chain {}, configured {}",
                chain_id, self.config.chain_id
            );
            return Err(SahakariError::Config(format!(
                "node reports chain id {}, expected {}",
                chain_id, self.config.chain_id
            )));
        }
        Ok(chain_id)
    }

    /// Get configuration
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}
