//! ERC-20 allowance management.
//!
//! Spending operations that move tokens on an owner's behalf first make sure
//! the spender's allowance covers the amount. The check, the approval and the
//! dependent spend run under one per-(owner, spender, token) lock, so two
//! concurrent operations cannot both observe a sufficient allowance and then
//! jointly overspend it. Locks exist only while held or awaited.

use crate::amount::Usdc;
use crate::error::{Result, SahakariError};
use crate::ledger::{LedgerCall, LedgerService};
use crate::locks::{KeyedGuard, KeyedLocks};
use crate::types::{TokenPosition, TxReceipt};
use ethers::types::{Address, U256};
use std::sync::Arc;
use tracing::{debug, info};

/// Identifies one allowance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllowanceKey {
    /// Token holder
    pub owner: Address,
    /// Contract allowed to spend
    pub spender: Address,
    /// ERC-20 token
    pub token: Address,
}

/// Exclusive hold on one allowance; dropping it releases the lock
pub struct AllowanceGuard {
    guard: KeyedGuard<AllowanceKey>,
}

impl AllowanceGuard {
    /// The allowance this guard covers
    pub fn key(&self) -> AllowanceKey {
        *self.guard.key()
    }
}

/// Result of [`AllowanceManager::ensure`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowanceOutcome {
    /// Existing allowance already covered the amount
    AlreadySufficient(U256),
    /// An approval was sent and confirmed
    Approved(TxReceipt),
}

/// Allowance checker and approver
#[derive(Clone)]
pub struct AllowanceManager {
    ledger: Arc<dyn LedgerService>,
    locks: KeyedLocks<AllowanceKey>,
}

impl AllowanceManager {
    /// Create a new allowance manager
    pub fn new(ledger: Arc<dyn LedgerService>) -> Self {
        Self {
            ledger,
            locks: KeyedLocks::new(),
        }
    }

    /// Acquire the lock for one allowance
    pub async fn lock(&self, owner: Address, spender: Address, token: Address) -> AllowanceGuard {
        let key = AllowanceKey {
            owner,
            spender,
            token,
        };
        AllowanceGuard {
            guard: self.locks.lock(key).await,
        }
    }

    /// Number of allowances currently locked or awaited
    pub fn active_locks(&self) -> usize {
        self.locks.len()
    }

    /// Current allowance
    pub async fn check(&self, owner: Address, spender: Address, token: Address) -> Result<U256> {
        self.ledger.allowance(token, owner, spender).await
    }

    /// Make sure the guarded allowance is at least `required`.
    ///
    /// When short, approves exactly `required` and waits for confirmation.
    /// Only the signing account's own allowances and the funding pool's
    /// allowance toward the loan manager can be raised from here; any other
    /// shortfall fails with [`SahakariError::AllowanceInsufficient`].
    pub async fn ensure(&self, guard: &AllowanceGuard, required: U256) -> Result<AllowanceOutcome> {
        let AllowanceKey {
            owner,
            spender,
            token,
        } = guard.key();

        let current = self.ledger.allowance(token, owner, spender).await?;
        if current >= required {
            debug!(
                "Allowance of {:?} over {:?} is {}, {} required",
                spender, owner, current, required
            );
            return Ok(AllowanceOutcome::AlreadySufficient(current));
        }

        let call = self
            .approval_call(guard.key(), required)
            .ok_or(SahakariError::AllowanceInsufficient {
                owner,
                spender,
                current,
                required,
            })?;

        info!(
            "Raising allowance of {:?} over {:?} from {} to {}",
            spender, owner, current, required
        );
        let pending = self.ledger.submit(call).await?;
        let receipt = self.ledger.confirm(&pending).await?;

        let updated = self.ledger.allowance(token, owner, spender).await?;
        if updated < required {
            return Err(SahakariError::AllowanceInsufficient {
                owner,
                spender,
                current: updated,
                required,
            });
        }

        Ok(AllowanceOutcome::Approved(receipt))
    }

    /// Lock, then ensure. For callers that do not spend under the same lock.
    pub async fn ensure_allowance(
        &self,
        owner: Address,
        spender: Address,
        token: Address,
        required: U256,
    ) -> Result<AllowanceOutcome> {
        let guard = self.lock(owner, spender, token).await;
        self.ensure(&guard, required).await
    }

    /// Fail unless the guarded allowance already covers `required`
    pub async fn require(&self, guard: &AllowanceGuard, required: U256) -> Result<()> {
        let AllowanceKey {
            owner,
            spender,
            token,
        } = guard.key();
        let current = self.ledger.allowance(token, owner, spender).await?;
        if current < required {
            return Err(SahakariError::AllowanceInsufficient {
                owner,
                spender,
                current,
                required,
            });
        }
        Ok(())
    }

    /// USDC balance and allowance of `owner` toward `spender`
    pub async fn token_position(&self, owner: Address, spender: Address) -> Result<TokenPosition> {
        let token = self.ledger.contracts().usdc_token;
        let balance = self.ledger.token_balance(token, owner).await?;
        let allowance = self.ledger.allowance(token, owner, spender).await?;

        Ok(TokenPosition {
            owner,
            spender,
            balance: Usdc::from_raw(balance),
            allowance: Usdc::from_raw(allowance),
        })
    }

    fn approval_call(&self, key: AllowanceKey, amount: U256) -> Option<LedgerCall> {
        let contracts = self.ledger.contracts();
        if key.owner == self.ledger.account() {
            Some(LedgerCall::ApproveToken {
                token: key.token,
                spender: key.spender,
                amount,
            })
        } else if key.owner == contracts.funding_pool
            && key.spender == contracts.loan_manager
            && key.token == contracts.usdc_token
        {
            Some(LedgerCall::ApproveLoanManager { amount })
        } else {
            None
        }
    }
}
