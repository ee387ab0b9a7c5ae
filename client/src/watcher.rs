//! Log poller feeding the event projection.
//!
//! Fetches `eth_getLogs` for the lending contracts in block batches, decodes
//! known events and appends them to an [`EventProjection`]. The cursor lives
//! in memory only; [`EventWatcher::reset`] empties the projection and
//! rewinds the cursor, as a reconnect would.
//!
//! A watcher that started from a known block marks the projection synced
//! each time a poll reaches the chain head.

use crate::config::ClientConfig;
use crate::error::Result;
use crate::events::{EventDecoder, EventProjection};
use crate::rpc::JsonRpcClient;
use ethers::types::Address;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

/// Event watcher over JSON-RPC log polling
#[derive(Clone)]
pub struct EventWatcher {
    rpc: JsonRpcClient,
    decoder: Arc<EventDecoder>,
    projection: EventProjection,
    sources: Vec<Address>,
    batch_blocks: u64,
    poll_interval: Duration,
    start_block: Option<u64>,
    /// Next block to fetch
    cursor: Arc<Mutex<Option<u64>>>,
    is_running: Arc<RwLock<bool>>,
}

impl EventWatcher {
    /// Create a watcher for the configured contracts.
    ///
    /// Scanning begins at `event_start_block` when configured, otherwise at
    /// the chain head of the first poll.
    pub fn new(
        rpc: JsonRpcClient,
        config: &ClientConfig,
        projection: EventProjection,
    ) -> Result<Self> {
        Ok(Self {
            rpc,
            decoder: Arc::new(EventDecoder::new()?),
            projection,
            sources: config.contracts.event_sources(),
            batch_blocks: config.event_batch_blocks.max(1),
            poll_interval: Duration::from_millis(config.event_poll_interval_ms),
            start_block: config.event_start_block,
            cursor: Arc::new(Mutex::new(config.event_start_block)),
            is_running: Arc::new(RwLock::new(false)),
        })
    }

    /// Begin from a specific block instead of the chain head
    pub fn with_start_block(mut self, block: u64) -> Self {
        self.start_block = Some(block);
        self.cursor = Arc::new(Mutex::new(Some(block)));
        self
    }

    /// Projection this watcher feeds
    pub fn projection(&self) -> &EventProjection {
        &self.projection
    }

    /// Next block the watcher will fetch, if started
    pub async fn cursor(&self) -> Option<u64> {
        *self.cursor.lock().await
    }

    /// Fetch and record everything up to the chain head.
    ///
    /// Returns the number of events recorded. The cursor advances batch by
    /// batch, so a failure midway keeps what was already recorded.
    pub async fn poll_once(&self) -> Result<usize> {
        let mut cursor = self.cursor.lock().await;
        let head = self.rpc.block_number().await?;
        let from_block = cursor.unwrap_or(head);

        if from_block > head {
            debug!("No new blocks (next {}, head {})", from_block, head);
            *cursor = Some(from_block);
            self.mark_synced(head);
            return Ok(0);
        }

        let mut recorded = 0;
        let mut batch_start = from_block;
        while batch_start <= head {
            let batch_end = std::cmp::min(
                batch_start.saturating_add(self.batch_blocks - 1),
                head,
            );

            let logs = self
                .rpc
                .get_logs(&self.sources, batch_start, batch_end)
                .await?;

            for log in &logs {
                match self.decoder.decode(log) {
                    Ok(Some(event)) => {
                        debug!("Observed {} from {:?}", event.kind, event.contract);
                        self.projection.record(event);
                        recorded += 1;
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Undecodable log from {:?}: {}", log.address, e),
                }
            }

            *cursor = Some(batch_end + 1);
            batch_start = batch_end + 1;
        }

        if recorded > 0 {
            info!(
                "Recorded {} events from blocks {}-{}",
                recorded, from_block, head
            );
        }
        self.mark_synced(head);
        Ok(recorded)
    }

    fn mark_synced(&self, head: u64) {
        if self.start_block.is_some() {
            self.projection.mark_synced(head);
        }
    }

    /// Poll until [`EventWatcher::stop`] is called
    pub async fn run(&self) -> Result<()> {
        {
            let mut is_running = self.is_running.write().await;
            if *is_running {
                warn!("Event watcher is already running");
                return Ok(());
            }
            *is_running = true;
        }

        info!("Starting event watcher for {} contracts", self.sources.len());

        while *self.is_running.read().await {
            if let Err(e) = self.poll_once().await {
                error!("Event poll failed: {}", e);
            }
            sleep(self.poll_interval).await;
        }

        info!("Event watcher stopped");
        Ok(())
    }

    /// Stop a running watcher after its current poll
    pub async fn stop(&self) {
        *self.is_running.write().await = false;
        info!("Stopping event watcher");
    }

    /// Whether [`EventWatcher::run`] is active
    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    /// Empty the projection and rewind the cursor
    pub async fn reset(&self) {
        let mut cursor = self.cursor.lock().await;
        *cursor = self.start_block;
        self.projection.reset();
        info!("Event watcher reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;

    #[tokio::test]
    async fn test_watcher_starts_unpositioned() {
        let config = test_config();
        let rpc = JsonRpcClient::new(&config).unwrap();
        let watcher = EventWatcher::new(rpc, &config, EventProjection::new()).unwrap();

        assert_eq!(watcher.cursor().await, None);
        assert!(!watcher.is_running().await);
        assert!(!watcher.projection().is_synced());
        assert_eq!(watcher.sources.len(), 4);
    }

    #[tokio::test]
    async fn test_reset_rewinds_to_start_block() {
        let config = test_config();
        let rpc = JsonRpcClient::new(&config).unwrap();
        let watcher = EventWatcher::new(rpc, &config, EventProjection::new())
            .unwrap()
            .with_start_block(100);

        *watcher.cursor.lock().await = Some(250);
        watcher.reset().await;
        assert_eq!(watcher.cursor().await, Some(100));
    }

    #[tokio::test]
    async fn test_configured_start_block_positions_cursor() {
        let config = test_config().with_event_start_block(42);
        let rpc = JsonRpcClient::new(&config).unwrap();
        let watcher = EventWatcher::new(rpc, &config, EventProjection::new()).unwrap();

        assert_eq!(watcher.cursor().await, Some(42));
        watcher.reset().await;
        assert_eq!(watcher.cursor().await, Some(42));
    }
}
