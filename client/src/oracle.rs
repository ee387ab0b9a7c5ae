//! ETH/USD price reads.
//!
//! Every call reads the feed afresh. A price is never cached across
//! collateral computations.

use crate::amount::EthPrice;
use crate::error::{Result, SahakariError};
use crate::ledger::LedgerService;
use ethers::types::I256;
use std::sync::Arc;
use tracing::{debug, warn};

/// Price feed reader
#[derive(Clone)]
pub struct PriceOracle {
    ledger: Arc<dyn LedgerService>,
}

impl PriceOracle {
    /// Create a new oracle over the ledger's price feed
    pub fn new(ledger: Arc<dyn LedgerService>) -> Self {
        Self { ledger }
    }

    /// Latest ETH/USD price at 8 decimals.
    ///
    /// Fails with [`SahakariError::PriceUnavailable`] if the feed cannot be
    /// read and [`SahakariError::InvalidPrice`] if it answers zero or less.
    pub async fn latest_price(&self) -> Result<EthPrice> {
        let raw = self.ledger.latest_price().await.map_err(|e| {
            warn!("Price feed read failed: {}", e);
            SahakariError::PriceUnavailable(e.to_string())
        })?;

        let price = validate_price(raw)?;
        debug!("ETH/USD price: {}", price);
        Ok(price)
    }
}

fn validate_price(raw: I256) -> Result<EthPrice> {
    if raw <= I256::zero() {
        return Err(SahakariError::InvalidPrice(format!(
            "feed answered {}",
            raw
        )));
    }
    Ok(EthPrice::from_raw(raw.into_raw()))
}
