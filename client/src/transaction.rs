//! Transaction submission and confirmation.
//!
//! Every state-changing call goes through two phases. [`TransactionManager::submit`]
//! hands the call to the node and returns as soon as a hash is known;
//! [`TransactionManager::confirm`] waits for the receipt. Callers can report
//! "submitted" and "confirmed" separately, and a failure in either phase is
//! distinguishable from the other.

use crate::config::ClientConfig;
use crate::error::Result;
use crate::monitor::TransactionMonitor;
use crate::rpc::{CallRequest, JsonRpcClient};
use crate::types::{PendingTransaction, TxReceipt};
use ethers::types::Address;
use tracing::{debug, info};

/// Transaction submitter bound to one signing account
#[derive(Clone)]
pub struct TransactionManager {
    /// JSON-RPC client
    rpc: JsonRpcClient,
    /// Receipt poller
    monitor: TransactionMonitor,
    /// Account the node signs for
    account: Address,
}

impl TransactionManager {
    /// Create a new transaction manager
    pub fn new(rpc: JsonRpcClient, config: &ClientConfig) -> Self {
        let monitor = TransactionMonitor::new(rpc.clone(), config);
        Self {
            rpc,
            monitor,
            account: config.account,
        }
    }

    /// Signing account
    pub fn account(&self) -> Address {
        self.account
    }

    /// Submit a call; returns once the node has accepted it.
    ///
    /// Sent exactly once. A rejected submission leaves no trace on-chain.
    pub async fn submit(
        &self,
        request: &CallRequest,
        function: &str,
    ) -> Result<PendingTransaction> {
        info!("Submitting {} from {:?}", function, self.account);

        let hash = self.rpc.send_transaction(self.account, request).await?;

        debug!("{} submitted as {}", function, hash);
        Ok(PendingTransaction {
            hash,
            function: function.to_string(),
        })
    }

    /// Wait for a submitted transaction to be mined successfully
    pub async fn confirm(&self, pending: &PendingTransaction) -> Result<TxReceipt> {
        let receipt = self.monitor.wait_for_confirmation(&pending.hash).await?;
        info!("{} confirmed in {}", pending.function, receipt.hash);
        Ok(receipt)
    }

    /// Read-only call against the latest block
    pub async fn call(&self, request: &CallRequest) -> Result<ethers::types::Bytes> {
        self.rpc.call(self.account, request).await
    }

    /// Get the JSON-RPC client
    pub fn rpc(&self) -> &JsonRpcClient {
        &self.rpc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;

    #[test]
    fn test_manager_uses_configured_account() {
        let config = test_config();
        let rpc = JsonRpcClient::new(&config).unwrap();
        let manager = TransactionManager::new(rpc, &config);
        assert_eq!(manager.account(), config.account);
    }
}
