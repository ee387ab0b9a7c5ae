//! In-memory ledger for orchestrator tests.
//!
//! Calls take effect when confirmed, not when submitted, and revert when
//! the contract-side precondition fails, the way the deployed contracts
//! would.

#![allow(dead_code)]

use async_trait::async_trait;
use ethers::types::{Address, I256, U256};
use sahakari_client::{
    ContractAddresses, LedgerCall, LedgerService, Loan, Member, PendingTransaction, Result,
    SahakariError, TransactionStatus, TxReceipt, Usdc, Wei,
};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

pub fn borrower() -> Address {
    Address::repeat_byte(0xaa)
}

pub const LOAN_TERM_SECS: u64 = 30 * 24 * 60 * 60;
pub const NOW: u64 = 1_700_000_000;

pub fn contracts() -> ContractAddresses {
    ContractAddresses {
        member_registry: Address::repeat_byte(0x01),
        funding_pool: Address::repeat_byte(0x02),
        loan_manager: Address::repeat_byte(0x03),
        finance_processor: Address::repeat_byte(0x04),
        price_feed: Address::repeat_byte(0x05),
        usdc_token: Address::repeat_byte(0x06),
    }
}

/// `$2,000` at 8 decimals
pub fn price_2000() -> I256 {
    I256::from(200_000_000_000i64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Next submission is refused by the signer
    RejectSubmission,
    /// Next confirmation reports a revert
    RevertConfirmation,
    /// Next confirmation times out
    TimeoutConfirmation,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerState {
    pub loans: HashMap<Address, Vec<Loan>>,
    pub members: Vec<Member>,
    /// (token, owner, spender) → allowance
    pub allowances: HashMap<(Address, Address, Address), U256>,
    /// (token, owner) → balance
    pub balances: HashMap<(Address, Address), U256>,
    pub pool_usdc: HashMap<Address, U256>,
    pub pool_eth: HashMap<Address, U256>,
    pub interest: HashMap<Address, U256>,
    pub collateral_returned: HashSet<(Address, u64)>,
    pub liquidated: HashSet<(Address, u64)>,
}

pub struct FakeLedger {
    account: Address,
    contracts: ContractAddresses,
    price: Mutex<Option<I256>>,
    state: Mutex<LedgerState>,
    pending: Mutex<HashMap<String, LedgerCall>>,
    submitted: Mutex<Vec<LedgerCall>>,
    failures: Mutex<Vec<Failure>>,
    price_reads: Mutex<usize>,
    next_hash: Mutex<u64>,
}

impl FakeLedger {
    /// Ledger for `borrower()` with 10,000 USDC in the wallet and the loan
    /// manager already allowed to move repayments into the pool
    pub fn new() -> Self {
        let contracts = contracts();
        let mut state = LedgerState::default();
        state.balances.insert(
            (contracts.usdc_token, borrower()),
            U256::from(10_000_000_000u64),
        );
        state.allowances.insert(
            (contracts.usdc_token, contracts.loan_manager, contracts.funding_pool),
            U256::MAX,
        );

        Self {
            account: borrower(),
            contracts,
            price: Mutex::new(Some(price_2000())),
            state: Mutex::new(state),
            pending: Mutex::new(HashMap::new()),
            submitted: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
            price_reads: Mutex::new(0),
            next_hash: Mutex::new(1),
        }
    }

    pub fn set_price(&self, price: Option<I256>) {
        *self.price.lock().unwrap() = price;
    }

    pub fn fail_next(&self, failure: Failure) {
        self.failures.lock().unwrap().push(failure);
    }

    pub fn set_allowance(&self, token: Address, owner: Address, spender: Address, amount: U256) {
        self.state
            .lock()
            .unwrap()
            .allowances
            .insert((token, owner, spender), amount);
    }

    pub fn allowance_of(&self, token: Address, owner: Address, spender: Address) -> U256 {
        self.state
            .lock()
            .unwrap()
            .allowances
            .get(&(token, owner, spender))
            .copied()
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> LedgerState {
        self.state.lock().unwrap().clone()
    }

    pub fn submitted(&self) -> Vec<LedgerCall> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn price_reads(&self) -> usize {
        *self.price_reads.lock().unwrap()
    }

    /// Insert a loan directly, bypassing the request flow
    pub fn insert_loan(&self, principal: u64, approved: bool, disbursed: bool, repaid: bool) -> u64 {
        let mut state = self.state.lock().unwrap();
        let loans = state.loans.entry(borrower()).or_default();
        let index = loans.len() as u64;
        loans.push(Loan {
            loan_index: index,
            borrower: borrower(),
            principal: Usdc::from(principal),
            eth_collateral: Wei::from(750_000_000_000_000_000),
            repayment_amount: Usdc::from(principal / 100 * 105),
            due_date: NOW + LOAN_TERM_SECS,
            is_approved: approved,
            is_disbursed: disbursed,
            is_repaid: repaid,
        });
        *state.pool_eth.entry(borrower()).or_default() += U256::from(750_000_000_000_000_000u64);
        index
    }

    fn take_failure(&self, wanted: &[Failure]) -> Option<Failure> {
        let mut failures = self.failures.lock().unwrap();
        let position = failures.iter().position(|f| wanted.contains(f))?;
        Some(failures.remove(position))
    }

    fn apply(&self, call: &LedgerCall) -> std::result::Result<(), String> {
        let usdc = self.contracts.usdc_token;
        let pool = self.contracts.funding_pool;
        let manager = self.contracts.loan_manager;
        let mut state = self.state.lock().unwrap();

        fn spend(
            state: &mut LedgerState,
            key: (Address, Address, Address),
            amount: U256,
        ) -> std::result::Result<(), String> {
            let allowance = state.allowances.entry(key).or_default();
            if *allowance < amount {
                return Err("ERC20: insufficient allowance".to_string());
            }
            *allowance -= amount;
            Ok(())
        }

        fn remaining(state: &LedgerState, key: (Address, Address, Address)) -> U256 {
            state.allowances.get(&key).copied().unwrap_or_default()
        }

        fn loan_mut<'a>(
            state: &'a mut LedgerState,
            borrower: Address,
            index: u64,
        ) -> std::result::Result<&'a mut Loan, String> {
            state
                .loans
                .get_mut(&borrower)
                .and_then(|loans| loans.get_mut(index as usize))
                .ok_or_else(|| "loan does not exist".to_string())
        }

        match call.clone() {
            LedgerCall::RegisterMember { name } => {
                state.members.push(Member {
                    address: self.account,
                    name,
                    is_registered: true,
                });
            }
            LedgerCall::DepositUsdc { amount } => {
                spend(&mut state, (usdc, self.account, pool), amount.raw())?;
                *state.balances.entry((usdc, self.account)).or_default() -= amount.raw();
                *state.pool_usdc.entry(self.account).or_default() += amount.raw();
            }
            LedgerCall::WithdrawUsdc { amount } => {
                let held = state.pool_usdc.entry(self.account).or_default();
                if *held < amount.raw() {
                    return Err("insufficient pool balance".to_string());
                }
                *held -= amount.raw();
            }
            LedgerCall::WithdrawEth { amount } => {
                let held = state.pool_eth.entry(self.account).or_default();
                if *held < amount.raw() {
                    return Err("insufficient pool balance".to_string());
                }
                *held -= amount.raw();
            }
            LedgerCall::ApproveToken {
                token,
                spender,
                amount,
            } => {
                state.allowances.insert((token, self.account, spender), amount);
            }
            LedgerCall::ApproveLoanManager { amount } => {
                state.allowances.insert((usdc, pool, manager), amount);
            }
            LedgerCall::RequestLoan { amount, collateral } => {
                let loans = state.loans.entry(self.account).or_default();
                let index = loans.len() as u64;
                loans.push(Loan {
                    loan_index: index,
                    borrower: self.account,
                    principal: amount,
                    eth_collateral: collateral,
                    repayment_amount: Usdc::from_raw(amount.raw() / 100 * 105),
                    due_date: NOW + LOAN_TERM_SECS,
                    is_approved: false,
                    is_disbursed: false,
                    is_repaid: false,
                });
                *state.pool_eth.entry(self.account).or_default() += collateral.raw();
            }
            LedgerCall::ApproveLoan { borrower, index } => {
                let loan = loan_mut(&mut state, borrower, index)?;
                if loan.is_approved {
                    return Err("loan already approved".to_string());
                }
                loan.is_approved = true;
            }
            LedgerCall::DisburseLoan { borrower, index }
            | LedgerCall::ProcessLoanApproval { borrower, index } => {
                let process = matches!(call, LedgerCall::ProcessLoanApproval { .. });
                let principal = {
                    let loan = loan_mut(&mut state, borrower, index)?;
                    if process {
                        if loan.is_approved {
                            return Err("loan already approved".to_string());
                        }
                    } else if !loan.is_approved || loan.is_disbursed {
                        return Err("loan not disbursable".to_string());
                    }
                    loan.principal.raw()
                };
                spend(&mut state, (usdc, pool, manager), principal)?;
                let loan = loan_mut(&mut state, borrower, index)?;
                loan.is_approved = true;
                loan.is_disbursed = true;
                *state.balances.entry((usdc, borrower)).or_default() += principal;
            }
            LedgerCall::RepayLoan {
                borrower,
                index,
                amount,
            }
            | LedgerCall::ProcessLoanRepayment {
                borrower,
                index,
                amount,
            } => {
                {
                    let loan = loan_mut(&mut state, borrower, index)?;
                    if !loan.is_disbursed || loan.is_repaid {
                        return Err("loan not repayable".to_string());
                    }
                }
                // both legs must clear before either allowance moves
                let legs = [(usdc, self.account, manager), (usdc, manager, pool)];
                if legs
                    .iter()
                    .any(|leg| remaining(&state, *leg) < amount.raw())
                {
                    return Err("ERC20: insufficient allowance".to_string());
                }
                for leg in legs {
                    spend(&mut state, leg, amount.raw())?;
                }
                *state.balances.entry((usdc, self.account)).or_default() -= amount.raw();
                loan_mut(&mut state, borrower, index)?.is_repaid = true;
            }
            LedgerCall::ReturnCollateral { borrower, index } => {
                let collateral = {
                    let loan = loan_mut(&mut state, borrower, index)?;
                    if !loan.is_repaid {
                        return Err("loan not repaid".to_string());
                    }
                    loan.eth_collateral.raw()
                };
                if state.collateral_returned.contains(&(borrower, index)) {
                    return Err("collateral already returned".to_string());
                }
                let held = state.pool_eth.entry(borrower).or_default();
                *held = held
                    .checked_sub(collateral)
                    .ok_or_else(|| "insufficient pool ETH".to_string())?;
                state.collateral_returned.insert((borrower, index));
            }
            LedgerCall::LiquidateCollateral { borrower, index } => {
                let loan = loan_mut(&mut state, borrower, index)?;
                if !loan.is_disbursed || loan.is_repaid {
                    return Err("loan not liquidatable".to_string());
                }
                if !state.liquidated.insert((borrower, index)) {
                    return Err("already liquidated".to_string());
                }
            }
            LedgerCall::AccrueInterest { member } => {
                *state.interest.entry(member).or_default() += U256::from(1_000_000u64);
            }
            LedgerCall::DistributeInterest => {}
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerService for FakeLedger {
    fn account(&self) -> Address {
        self.account
    }

    fn contracts(&self) -> &ContractAddresses {
        &self.contracts
    }

    async fn get_member(&self, address: Address) -> Result<Member> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .members
            .iter()
            .find(|m| m.address == address)
            .cloned()
            .unwrap_or(Member {
                address: Address::zero(),
                name: String::new(),
                is_registered: false,
            }))
    }

    async fn get_all_members(&self) -> Result<Vec<Address>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .members
            .iter()
            .map(|m| m.address)
            .collect())
    }

    async fn get_loans(&self, borrower: Address) -> Result<Vec<Loan>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .loans
            .get(&borrower)
            .cloned()
            .unwrap_or_default())
    }

    async fn allowance(&self, token: Address, owner: Address, spender: Address) -> Result<U256> {
        Ok(self.allowance_of(token, owner, spender))
    }

    async fn token_balance(&self, token: Address, owner: Address) -> Result<U256> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .balances
            .get(&(token, owner))
            .copied()
            .unwrap_or_default())
    }

    async fn pool_usdc_balance(&self, member: Address) -> Result<Usdc> {
        let state = self.state.lock().unwrap();
        Ok(Usdc::from_raw(
            state.pool_usdc.get(&member).copied().unwrap_or_default(),
        ))
    }

    async fn pool_eth_balance(&self, member: Address) -> Result<Wei> {
        let state = self.state.lock().unwrap();
        Ok(Wei::from_raw(
            state.pool_eth.get(&member).copied().unwrap_or_default(),
        ))
    }

    async fn total_usdc_deposits(&self) -> Result<Usdc> {
        let state = self.state.lock().unwrap();
        Ok(Usdc::from_raw(
            state
                .pool_usdc
                .values()
                .fold(U256::zero(), |acc, v| acc + *v),
        ))
    }

    async fn total_eth_deposits(&self) -> Result<Wei> {
        let state = self.state.lock().unwrap();
        Ok(Wei::from_raw(
            state.pool_eth.values().fold(U256::zero(), |acc, v| acc + *v),
        ))
    }

    async fn usdc_interest_accrued(&self, member: Address) -> Result<Usdc> {
        let state = self.state.lock().unwrap();
        Ok(Usdc::from_raw(
            state.interest.get(&member).copied().unwrap_or_default(),
        ))
    }

    async fn latest_price(&self) -> Result<I256> {
        *self.price_reads.lock().unwrap() += 1;
        self.price
            .lock()
            .unwrap()
            .ok_or_else(|| SahakariError::Rpc("execution reverted (code: 3)".to_string()))
    }

    async fn calculate_eth_collateral(&self, amount: Usdc) -> Result<Wei> {
        // floor, like the deployed contract
        let price = self.latest_price().await?.into_raw();
        Ok(Wei::from_raw(
            amount.raw() * U256::exp10(20) * U256::from(150u64) / (price * U256::from(100u64)),
        ))
    }

    async fn submit(&self, call: LedgerCall) -> Result<PendingTransaction> {
        if self.take_failure(&[Failure::RejectSubmission]).is_some() {
            return Err(SahakariError::SubmissionRejected(
                "User denied transaction signature.".to_string(),
            ));
        }

        let hash = {
            let mut next = self.next_hash.lock().unwrap();
            let hash = format!("0x{:064x}", *next);
            *next += 1;
            hash
        };
        self.submitted.lock().unwrap().push(call.clone());
        let function = call.function_name().to_string();
        self.pending.lock().unwrap().insert(hash.clone(), call);

        Ok(PendingTransaction { hash, function })
    }

    async fn confirm(&self, pending: &PendingTransaction) -> Result<TxReceipt> {
        let call = self
            .pending
            .lock()
            .unwrap()
            .remove(&pending.hash)
            .ok_or_else(|| SahakariError::TransactionNotFound(pending.hash.clone()))?;

        match self.take_failure(&[Failure::RevertConfirmation, Failure::TimeoutConfirmation]) {
            Some(Failure::RevertConfirmation) => {
                return Err(SahakariError::ConfirmationFailed {
                    hash: pending.hash.clone(),
                    reason: "execution reverted".to_string(),
                })
            }
            Some(Failure::TimeoutConfirmation) => {
                return Err(SahakariError::ConfirmationTimeout {
                    hash: pending.hash.clone(),
                    secs: 120,
                })
            }
            _ => {}
        }

        self.apply(&call)
            .map_err(|reason| SahakariError::ConfirmationFailed {
                hash: pending.hash.clone(),
                reason,
            })?;

        Ok(TxReceipt {
            hash: pending.hash.clone(),
            status: TransactionStatus::Success,
            block_number: Some(1),
            gas_used: Some(U256::from(21_000u64)),
        })
    }
}
