//! Loan lifecycle orchestration.
//!
//! [`LoanOrchestrator`] sequences the calls that move a loan through
//! `Requested → Approved → Disbursed → {Repaid | Liquidated}` and
//! `Repaid → CollateralReturned`, together with the member, pool and finance
//! processor operations around them.
//!
//! Every transition re-reads the loan from the ledger and checks the
//! precondition locally before anything is submitted, under a per-loan lock.
//! Nothing is retried automatically: after a failure, and above all after a
//! [`SahakariError::ConfirmationTimeout`], the caller re-reads state before
//! trying again.
//!
//! The remote loan record only carries the approved, disbursed and repaid
//! flags. `CollateralReturned` and `Liquidated` are tracked here once their
//! transactions confirm, and taken from the event projection when one is
//! attached. With a projection attached, repaying, returning collateral and
//! liquidating wait until it has synced, since an unsynced projection cannot
//! rule out that another process already settled the loan.

use crate::allowance::AllowanceManager;
use crate::amount::{Usdc, Wei};
use crate::collateral::{required_eth_collateral, CollateralQuote, RoundingMode};
use crate::config::ClientConfig;
use crate::error::{Result, SahakariError};
use crate::events::EventProjection;
use crate::ledger::{LedgerCall, LedgerService};
use crate::locks::{KeyedGuard, KeyedLocks};
use crate::oracle::PriceOracle;
use crate::types::{
    Loan, LoanAction, LoanState, LoanView, Member, PoolBalances, PoolTotals, TokenPosition,
    TxReceipt,
};
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

type LoanKey = (Address, u64);

/// Outcome of a confirmed loan request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanRequest {
    /// Price and collateral the request was built from
    pub quote: CollateralQuote,
    /// Confirmed receipt
    pub receipt: TxReceipt,
}

/// Loan lifecycle orchestrator
#[derive(Clone)]
pub struct LoanOrchestrator {
    ledger: Arc<dyn LedgerService>,
    oracle: PriceOracle,
    allowances: AllowanceManager,
    ratio_percent: u64,
    rounding: RoundingMode,
    events: Option<EventProjection>,
    /// Terminal states confirmed through this orchestrator
    settled: Arc<RwLock<HashMap<LoanKey, LoanState>>>,
    loan_locks: KeyedLocks<LoanKey>,
}

impl LoanOrchestrator {
    /// Create an orchestrator over `ledger`
    pub fn new(ledger: Arc<dyn LedgerService>, ratio_percent: u64, rounding: RoundingMode) -> Self {
        Self {
            oracle: PriceOracle::new(ledger.clone()),
            allowances: AllowanceManager::new(ledger.clone()),
            ledger,
            ratio_percent,
            rounding,
            events: None,
            settled: Arc::new(RwLock::new(HashMap::new())),
            loan_locks: KeyedLocks::new(),
        }
    }

    /// Create an orchestrator using the configured ratio and rounding
    pub fn from_config(ledger: Arc<dyn LedgerService>, config: &ClientConfig) -> Self {
        Self::new(ledger, config.collateral_ratio_percent, config.rounding)
    }

    /// Overlay terminal states observed by an event projection
    pub fn with_events(mut self, events: EventProjection) -> Self {
        self.events = Some(events);
        self
    }

    /// Get the ledger
    pub fn ledger(&self) -> &Arc<dyn LedgerService> {
        &self.ledger
    }

    /// Get the price oracle
    pub fn oracle(&self) -> &PriceOracle {
        &self.oracle
    }

    /// Get the allowance manager
    pub fn allowances(&self) -> &AllowanceManager {
        &self.allowances
    }

    /// Whether the attached event projection, if any, has synced
    pub fn events_synced(&self) -> bool {
        self.events.as_ref().map_or(true, EventProjection::is_synced)
    }

    /// Number of loans currently locked or awaited
    pub fn active_loan_locks(&self) -> usize {
        self.loan_locks.len()
    }

    // ----- collateral -----

    /// Collateral required for `usdc` at a freshly read price
    pub async fn quote_collateral(&self, usdc: Usdc) -> Result<CollateralQuote> {
        let price = self.oracle.latest_price().await?;
        let collateral = required_eth_collateral(usdc, price, self.ratio_percent, self.rounding)?;
        Ok(CollateralQuote {
            usdc,
            price,
            ratio_percent: self.ratio_percent,
            collateral,
        })
    }

    /// The loan manager's own figure, for display next to the local quote
    pub async fn remote_collateral(&self, usdc: Usdc) -> Result<Wei> {
        self.ledger.calculate_eth_collateral(usdc).await
    }

    // ----- loan reads -----

    /// Every loan of `borrower`, in request order
    pub async fn loans(&self, borrower: Address) -> Result<Vec<Loan>> {
        self.ledger.get_loans(borrower).await
    }

    /// One loan; [`SahakariError::NotFound`] if the index is absent
    pub async fn loan(&self, borrower: Address, index: u64) -> Result<Loan> {
        self.ledger
            .get_loans(borrower)
            .await?
            .into_iter()
            .find(|loan| loan.loan_index == index)
            .ok_or_else(|| {
                SahakariError::NotFound(format!("loan {} of {:?}", index, borrower))
            })
    }

    /// Current lifecycle state of one loan
    pub async fn loan_state(&self, borrower: Address, index: u64) -> Result<LoanState> {
        let loan = self.loan(borrower, index).await?;
        Ok(self.state_of(&loan).await)
    }

    /// Display rendering of every loan of `borrower`
    pub async fn loan_views(&self, borrower: Address) -> Result<Vec<LoanView>> {
        let loans = self.loans(borrower).await?;
        let mut views = Vec::with_capacity(loans.len());
        for loan in &loans {
            views.push(LoanView::new(loan, self.state_of(loan).await));
        }
        Ok(views)
    }

    async fn state_of(&self, loan: &Loan) -> LoanState {
        let key = (loan.borrower, loan.loan_index);
        if let Some(state) = self.settled.read().await.get(&key) {
            return *state;
        }
        self.events
            .as_ref()
            .and_then(|events| events.settled_state(loan.borrower, loan.loan_index))
            .unwrap_or_else(|| loan.state())
    }

    async fn lock_loan(&self, borrower: Address, index: u64) -> KeyedGuard<LoanKey> {
        self.loan_locks.lock((borrower, index)).await
    }

    /// Refuse `action` while an attached projection has not synced
    fn require_synced(&self, loan: &Loan, action: LoanAction) -> Result<()> {
        if self.events_synced() {
            return Ok(());
        }
        warn!(
            "Event history not synced, refusing to {} loan {} of {:?}",
            action, loan.loan_index, loan.borrower
        );
        Err(SahakariError::EventsNotSynced {
            borrower: loan.borrower,
            index: loan.loan_index,
            action,
        })
    }

    async fn settle(&self, loan: &Loan, action: LoanAction) {
        self.settled
            .write()
            .await
            .insert((loan.borrower, loan.loan_index), action.target());
    }

    /// Submit, then wait for confirmation. Failures are logged and returned.
    async fn execute(&self, call: LedgerCall) -> Result<TxReceipt> {
        let function = call.function_name();

        let pending = self.ledger.submit(call).await.map_err(|e| {
            error!("{} was not submitted: {}", function, e);
            e
        })?;
        info!("{} submitted as {}", function, pending.hash);

        let receipt = self.ledger.confirm(&pending).await.map_err(|e| {
            error!("{} ({}) did not confirm: {}", function, pending.hash, e);
            e
        })?;
        info!("{} confirmed", function);
        Ok(receipt)
    }

    // ----- lifecycle -----

    /// Request a loan of `usdc` for the signing account.
    ///
    /// The price is read afresh and the collateral, rounded per
    /// configuration, is attached to the request as value.
    pub async fn request_loan(&self, usdc: Usdc) -> Result<LoanRequest> {
        if usdc.is_zero() {
            return Err(SahakariError::InsufficientInput(
                "loan amount must be greater than zero".to_string(),
            ));
        }

        let quote = self.quote_collateral(usdc).await?;
        if quote.collateral.is_zero() {
            return Err(SahakariError::InsufficientInput(format!(
                "{} USDC requires no collateral at price {}",
                usdc, quote.price
            )));
        }

        info!(
            "Requesting {} USDC against {} ETH (price {})",
            usdc, quote.collateral, quote.price
        );
        let receipt = self
            .execute(LedgerCall::RequestLoan {
                amount: usdc,
                collateral: quote.collateral,
            })
            .await?;

        Ok(LoanRequest { quote, receipt })
    }

    /// `Requested → Approved`
    pub async fn approve_loan(&self, borrower: Address, index: u64) -> Result<TxReceipt> {
        let _guard = self.lock_loan(borrower, index).await;
        let loan = self.loan(borrower, index).await?;
        let state = self.state_of(&loan).await;
        if state != LoanState::Requested {
            return Err(SahakariError::AlreadyApproved { borrower, index });
        }

        self.execute(LedgerCall::ApproveLoan { borrower, index })
            .await
    }

    /// `Approved → Disbursed`, after the funding pool's allowance toward the
    /// loan manager covers the principal
    pub async fn disburse_loan(&self, borrower: Address, index: u64) -> Result<TxReceipt> {
        let _guard = self.lock_loan(borrower, index).await;
        let loan = self.loan(borrower, index).await?;
        match self.state_of(&loan).await {
            LoanState::Approved => {}
            LoanState::Requested => return Err(SahakariError::NotApproved { borrower, index }),
            from => {
                return Err(SahakariError::InvalidTransition {
                    from,
                    action: LoanAction::Disburse,
                })
            }
        }

        let contracts = self.ledger.contracts();
        let allowance = self
            .allowances
            .lock(
                contracts.funding_pool,
                contracts.loan_manager,
                contracts.usdc_token,
            )
            .await;
        self.allowances
            .ensure(&allowance, loan.principal.raw())
            .await?;

        self.execute(LedgerCall::DisburseLoan { borrower, index })
            .await
    }

    /// `Disbursed → Repaid` with one payment of the full repayment amount.
    ///
    /// Both allowance legs are checked first: the repayer's toward the loan
    /// manager (raised if short) and the loan manager's toward the funding
    /// pool (must already suffice).
    pub async fn repay_loan(&self, borrower: Address, index: u64, amount: Usdc) -> Result<TxReceipt> {
        if amount.is_zero() {
            return Err(SahakariError::InsufficientInput(
                "repayment amount must be greater than zero".to_string(),
            ));
        }

        let _guard = self.lock_loan(borrower, index).await;
        let loan = self.loan(borrower, index).await?;
        self.check_repayable(&loan, amount).await?;

        self.with_repayment_allowances(amount, || {
            self.execute(LedgerCall::RepayLoan {
                borrower,
                index,
                amount,
            })
        })
        .await
    }

    /// [`LoanOrchestrator::repay_loan`] with the amount read from the loan
    pub async fn repay_in_full(&self, borrower: Address, index: u64) -> Result<TxReceipt> {
        let loan = self.loan(borrower, index).await?;
        self.repay_loan(borrower, index, loan.repayment_amount)
            .await
    }

    /// `Repaid → CollateralReturned`
    pub async fn return_collateral(&self, borrower: Address, index: u64) -> Result<TxReceipt> {
        let _guard = self.lock_loan(borrower, index).await;
        let loan = self.loan(borrower, index).await?;
        match self.state_of(&loan).await {
            LoanState::Repaid => {}
            LoanState::Requested | LoanState::Approved | LoanState::Disbursed => {
                return Err(SahakariError::NotRepaid { borrower, index })
            }
            from => {
                return Err(SahakariError::InvalidTransition {
                    from,
                    action: LoanAction::ReturnCollateral,
                })
            }
        }
        self.require_synced(&loan, LoanAction::ReturnCollateral)?;

        let receipt = self
            .execute(LedgerCall::ReturnCollateral { borrower, index })
            .await?;
        self.settle(&loan, LoanAction::ReturnCollateral).await;
        Ok(receipt)
    }

    /// `Disbursed → Liquidated` through the finance processor, once overdue
    pub async fn liquidate_collateral(&self, borrower: Address, index: u64) -> Result<TxReceipt> {
        let now = u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default();
        self.liquidate_collateral_at(borrower, index, now).await
    }

    /// [`LoanOrchestrator::liquidate_collateral`] judged against `now` (unix seconds)
    pub async fn liquidate_collateral_at(
        &self,
        borrower: Address,
        index: u64,
        now: u64,
    ) -> Result<TxReceipt> {
        let _guard = self.lock_loan(borrower, index).await;
        let loan = self.loan(borrower, index).await?;
        match self.state_of(&loan).await {
            LoanState::Disbursed => {}
            LoanState::Requested | LoanState::Approved => {
                return Err(SahakariError::NotDisbursed { borrower, index })
            }
            from => {
                return Err(SahakariError::InvalidTransition {
                    from,
                    action: LoanAction::Liquidate,
                })
            }
        }
        self.require_synced(&loan, LoanAction::Liquidate)?;
        if !loan.is_overdue(now) {
            return Err(SahakariError::NotOverdue {
                borrower,
                index,
                due_date: loan.due_date,
            });
        }

        warn!(
            "Liquidating loan {} of {:?}, due {}",
            index, borrower, loan.due_date
        );
        let receipt = self
            .execute(LedgerCall::LiquidateCollateral { borrower, index })
            .await?;
        self.settle(&loan, LoanAction::Liquidate).await;
        Ok(receipt)
    }

    async fn check_repayable(&self, loan: &Loan, amount: Usdc) -> Result<()> {
        let (borrower, index) = (loan.borrower, loan.loan_index);
        match self.state_of(loan).await {
            LoanState::Disbursed => {}
            LoanState::Requested | LoanState::Approved => {
                return Err(SahakariError::NotDisbursed { borrower, index })
            }
            from => {
                return Err(SahakariError::InvalidTransition {
                    from,
                    action: LoanAction::Repay,
                })
            }
        }
        self.require_synced(loan, LoanAction::Repay)?;
        if amount != loan.repayment_amount {
            return Err(SahakariError::InsufficientInput(format!(
                "repayment must be the full {} USDC, got {}",
                loan.repayment_amount, amount
            )));
        }
        Ok(())
    }

    /// Run `spend` while both repayment allowance legs are held and verified
    async fn with_repayment_allowances<F, Fut>(&self, amount: Usdc, spend: F) -> Result<TxReceipt>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<TxReceipt>>,
    {
        let contracts = self.ledger.contracts();
        let repayer_leg = self
            .allowances
            .lock(
                self.ledger.account(),
                contracts.loan_manager,
                contracts.usdc_token,
            )
            .await;
        let pool_leg = self
            .allowances
            .lock(
                contracts.loan_manager,
                contracts.funding_pool,
                contracts.usdc_token,
            )
            .await;

        self.allowances.ensure(&repayer_leg, amount.raw()).await?;
        self.allowances.require(&pool_leg, amount.raw()).await?;
        debug!("Both repayment allowance legs cover {} USDC", amount);

        spend().await
    }

    // ----- finance processor -----

    /// Approve and disburse in one finance processor call; only from `Requested`
    pub async fn process_loan_approval(&self, borrower: Address, index: u64) -> Result<TxReceipt> {
        let _guard = self.lock_loan(borrower, index).await;
        let loan = self.loan(borrower, index).await?;
        if self.state_of(&loan).await != LoanState::Requested {
            return Err(SahakariError::AlreadyApproved { borrower, index });
        }

        let contracts = self.ledger.contracts();
        let allowance = self
            .allowances
            .lock(
                contracts.funding_pool,
                contracts.loan_manager,
                contracts.usdc_token,
            )
            .await;
        self.allowances
            .ensure(&allowance, loan.principal.raw())
            .await?;

        self.execute(LedgerCall::ProcessLoanApproval { borrower, index })
            .await
    }

    /// Repayment through the finance processor, same preconditions as
    /// [`LoanOrchestrator::repay_loan`]
    pub async fn process_loan_repayment(
        &self,
        borrower: Address,
        index: u64,
        amount: Usdc,
    ) -> Result<TxReceipt> {
        if amount.is_zero() {
            return Err(SahakariError::InsufficientInput(
                "repayment amount must be greater than zero".to_string(),
            ));
        }

        let _guard = self.lock_loan(borrower, index).await;
        let loan = self.loan(borrower, index).await?;
        self.check_repayable(&loan, amount).await?;

        self.with_repayment_allowances(amount, || {
            self.execute(LedgerCall::ProcessLoanRepayment {
                borrower,
                index,
                amount,
            })
        })
        .await
    }

    /// Accrue interest for a member
    pub async fn accrue_interest(&self, member: Address) -> Result<TxReceipt> {
        self.execute(LedgerCall::AccrueInterest { member }).await
    }

    /// Distribute accrued interest to members
    pub async fn distribute_interest(&self) -> Result<TxReceipt> {
        self.execute(LedgerCall::DistributeInterest).await
    }

    /// Interest accrued to a member
    pub async fn usdc_interest_accrued(&self, member: Address) -> Result<Usdc> {
        self.ledger.usdc_interest_accrued(member).await
    }

    // ----- members -----

    /// Register the signing account under `name`
    pub async fn register_member(&self, name: &str) -> Result<TxReceipt> {
        let name = name.trim();
        if name.is_empty() {
            return Err(SahakariError::InsufficientInput(
                "member name cannot be empty".to_string(),
            ));
        }
        self.execute(LedgerCall::RegisterMember {
            name: name.to_string(),
        })
        .await
    }

    /// Member record; [`SahakariError::NotFound`] if not registered
    pub async fn member(&self, address: Address) -> Result<Member> {
        let member = self.ledger.get_member(address).await?;
        if !member.is_registered {
            return Err(SahakariError::NotFound(format!("member {:?}", address)));
        }
        Ok(member)
    }

    /// Addresses of every registered member
    pub async fn all_members(&self) -> Result<Vec<Address>> {
        self.ledger.get_all_members().await
    }

    /// Whether `address` is a registered member
    pub async fn is_registered(&self, address: Address) -> Result<bool> {
        Ok(self.ledger.get_member(address).await?.is_registered)
    }

    // ----- funding pool -----

    /// Deposit USDC into the pool, raising the allowance first if needed
    pub async fn deposit_usdc(&self, amount: Usdc) -> Result<TxReceipt> {
        if amount.is_zero() {
            return Err(SahakariError::InsufficientInput(
                "deposit amount must be greater than zero".to_string(),
            ));
        }

        let contracts = self.ledger.contracts();
        let allowance = self
            .allowances
            .lock(
                self.ledger.account(),
                contracts.funding_pool,
                contracts.usdc_token,
            )
            .await;
        self.allowances.ensure(&allowance, amount.raw()).await?;

        self.execute(LedgerCall::DepositUsdc { amount }).await
    }

    /// Withdraw USDC from the pool
    pub async fn withdraw_usdc(&self, amount: Usdc) -> Result<TxReceipt> {
        if amount.is_zero() {
            return Err(SahakariError::InsufficientInput(
                "withdrawal amount must be greater than zero".to_string(),
            ));
        }
        self.execute(LedgerCall::WithdrawUsdc { amount }).await
    }

    /// Withdraw ETH from the pool
    pub async fn withdraw_eth(&self, amount: Wei) -> Result<TxReceipt> {
        if amount.is_zero() {
            return Err(SahakariError::InsufficientInput(
                "withdrawal amount must be greater than zero".to_string(),
            ));
        }
        self.execute(LedgerCall::WithdrawEth { amount }).await
    }

    /// Balances `account` holds in the pool
    pub async fn pool_balances(&self, account: Address) -> Result<PoolBalances> {
        let (usdc, eth) = futures::try_join!(
            self.ledger.pool_usdc_balance(account),
            self.ledger.pool_eth_balance(account)
        )?;
        Ok(PoolBalances { usdc, eth })
    }

    /// Pool-wide deposit totals
    pub async fn pool_totals(&self) -> Result<PoolTotals> {
        let (usdc, eth) = futures::try_join!(
            self.ledger.total_usdc_deposits(),
            self.ledger.total_eth_deposits()
        )?;
        Ok(PoolTotals { usdc, eth })
    }

    /// USDC balance and allowance of `owner` toward `spender`
    pub async fn token_position(&self, owner: Address, spender: Address) -> Result<TokenPosition> {
        self.allowances.token_position(owner, spender).await
    }
}
