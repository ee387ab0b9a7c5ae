//! Transaction confirmation tracking.
//!
//! Polls `eth_getTransactionReceipt` until the transaction is mined or the
//! confirmation window closes. A timeout says nothing about the outcome: the
//! transaction may still be mined later.

use crate::config::ClientConfig;
use crate::error::{Result, SahakariError};
use crate::rpc::JsonRpcClient;
use crate::types::{TransactionStatus, TxReceipt};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Transaction monitor for tracking confirmation
#[derive(Clone)]
pub struct TransactionMonitor {
    /// JSON-RPC client
    rpc: JsonRpcClient,
    /// Default options
    defaults: MonitorOptions,
}

/// Monitoring options
#[derive(Debug, Clone)]
pub struct MonitorOptions {
    /// Poll interval (in milliseconds)
    pub poll_interval_ms: u64,
    /// Timeout (in seconds)
    pub timeout_secs: u64,
}

impl MonitorOptions {
    /// Create from client config
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            poll_interval_ms: config.tx_poll_interval_ms,
            timeout_secs: config.tx_timeout_secs,
        }
    }

    /// Set custom poll interval
    pub fn with_poll_interval(mut self, interval_ms: u64) -> Self {
        self.poll_interval_ms = interval_ms;
        self
    }

    /// Set custom timeout
    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }
}

/// Transaction monitoring result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorResult {
    /// Mined and executed
    Confirmed(TxReceipt),
    /// Mined and reverted
    Reverted(TxReceipt),
    /// Not mined within the window
    Timeout,
}

impl TransactionMonitor {
    /// Create a new transaction monitor
    pub fn new(rpc: JsonRpcClient, config: &ClientConfig) -> Self {
        Self {
            rpc,
            defaults: MonitorOptions::from_config(config),
        }
    }

    /// Default monitoring options
    pub fn default_options(&self) -> MonitorOptions {
        self.defaults.clone()
    }

    /// Poll until the transaction is mined or the window closes
    pub async fn monitor(&self, tx_hash: &str, options: MonitorOptions) -> Result<MonitorResult> {
        info!(
            "Monitoring transaction: {} (timeout: {}s)",
            tx_hash, options.timeout_secs
        );

        let start = Instant::now();
        let timeout = Duration::from_secs(options.timeout_secs);
        let poll_interval = Duration::from_millis(options.poll_interval_ms);

        loop {
            if start.elapsed() >= timeout {
                warn!("Transaction monitoring timed out: {}", tx_hash);
                return Ok(MonitorResult::Timeout);
            }

            match self.rpc.get_transaction_receipt(tx_hash).await {
                Ok(Some(receipt)) => match receipt.status {
                    TransactionStatus::Success => {
                        info!(
                            "Transaction confirmed: {} (block {:?})",
                            tx_hash, receipt.block_number
                        );
                        return Ok(MonitorResult::Confirmed(receipt));
                    }
                    TransactionStatus::Failed => {
                        warn!("Transaction reverted: {}", tx_hash);
                        return Ok(MonitorResult::Reverted(receipt));
                    }
                    TransactionStatus::Pending => {
                        debug!("Transaction still pending: {}", tx_hash);
                    }
                },
                Ok(None) => {
                    debug!("Transaction not yet mined: {}", tx_hash);
                }
                Err(e) => {
                    // the receipt read is itself retried; keep polling until the window closes
                    debug!("Error fetching receipt for {}: {:?}", tx_hash, e);
                }
            }

            sleep(poll_interval).await;
        }
    }

    /// Wait with default options and map the outcome onto the error taxonomy
    pub async fn wait_for_confirmation(&self, tx_hash: &str) -> Result<TxReceipt> {
        let options = self.default_options();
        let timeout_secs = options.timeout_secs;

        match self.monitor(tx_hash, options).await? {
            MonitorResult::Confirmed(receipt) => Ok(receipt),
            MonitorResult::Reverted(_) => Err(SahakariError::ConfirmationFailed {
                hash: tx_hash.to_string(),
                reason: "execution reverted".to_string(),
            }),
            MonitorResult::Timeout => Err(SahakariError::ConfirmationTimeout {
                hash: tx_hash.to_string(),
                secs: timeout_secs,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;

    #[test]
    fn test_monitor_options_from_config() {
        let config = test_config();
        let options = MonitorOptions::from_config(&config);
        assert_eq!(options.poll_interval_ms, config.tx_poll_interval_ms);
        assert_eq!(options.timeout_secs, config.tx_timeout_secs);
    }

    #[test]
    fn test_monitor_options_builder() {
        let options = MonitorOptions::from_config(&test_config())
            .with_poll_interval(500)
            .with_timeout(30);

        assert_eq!(options.poll_interval_ms, 500);
        assert_eq!(options.timeout_secs, 30);
    }
}
