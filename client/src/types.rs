//! Common types used across the lending client.
//!
//! The remote contracts own every record here; the client only holds advisory
//! copies that are invalidated by any write.

use crate::amount::{Usdc, Wei};
use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Transaction hash type
pub type TransactionHash = String;

/// A registered cooperative member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Member wallet address
    pub address: Address,
    /// Display name given at registration
    pub name: String,
    /// Whether registration completed
    pub is_registered: bool,
}

/// A loan as recorded by the loan manager contract
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Loan {
    /// Position in the borrower's loan list
    pub loan_index: u64,
    /// Borrower address
    pub borrower: Address,
    /// Principal in USDC
    pub principal: Usdc,
    /// ETH locked as collateral
    pub eth_collateral: Wei,
    /// Amount due on repayment, principal plus interest
    pub repayment_amount: Usdc,
    /// Unix timestamp after which the loan is overdue
    pub due_date: u64,
    /// Approved by an administrator
    pub is_approved: bool,
    /// Principal released to the borrower
    pub is_disbursed: bool,
    /// Repayment received
    pub is_repaid: bool,
}

impl Loan {
    /// State derived from the remote flags alone
    pub fn state(&self) -> LoanState {
        if self.is_repaid {
            LoanState::Repaid
        } else if self.is_disbursed {
            LoanState::Disbursed
        } else if self.is_approved {
            LoanState::Approved
        } else {
            LoanState::Requested
        }
    }

    /// Whether `now` (unix seconds) is past the due date
    pub fn is_overdue(&self, now: u64) -> bool {
        now > self.due_date
    }
}

/// Lifecycle state of a loan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoanState {
    /// Requested by the borrower, awaiting approval
    Requested,
    /// Approved, awaiting disbursement
    Approved,
    /// Principal released
    Disbursed,
    /// Repaid in full, collateral still held
    Repaid,
    /// Collateral sent back to the borrower
    CollateralReturned,
    /// Collateral seized after the due date
    Liquidated,
}

impl LoanState {
    /// States reachable in one step from this one
    pub fn successors(&self) -> &'static [LoanState] {
        match self {
            LoanState::Requested => &[LoanState::Approved],
            LoanState::Approved => &[LoanState::Disbursed],
            LoanState::Disbursed => &[LoanState::Repaid, LoanState::Liquidated],
            LoanState::Repaid => &[LoanState::CollateralReturned],
            LoanState::CollateralReturned | LoanState::Liquidated => &[],
        }
    }

    /// Whether no further transition is possible
    pub fn is_terminal(&self) -> bool {
        self.successors().is_empty()
    }

    /// Whether `next` is reachable in one step
    pub fn can_transition_to(&self, next: LoanState) -> bool {
        self.successors().contains(&next)
    }
}

impl fmt::Display for LoanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoanState::Requested => "REQUESTED",
            LoanState::Approved => "APPROVED",
            LoanState::Disbursed => "DISBURSED",
            LoanState::Repaid => "REPAID",
            LoanState::CollateralReturned => "COLLATERAL_RETURNED",
            LoanState::Liquidated => "LIQUIDATED",
        };
        write!(f, "{}", name)
    }
}

/// A state-changing action on a loan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoanAction {
    /// Requested → Approved
    Approve,
    /// Approved → Disbursed
    Disburse,
    /// Disbursed → Repaid
    Repay,
    /// Repaid → CollateralReturned
    ReturnCollateral,
    /// Disbursed → Liquidated
    Liquidate,
}

impl LoanAction {
    /// State the action moves a loan into
    pub fn target(&self) -> LoanState {
        match self {
            LoanAction::Approve => LoanState::Approved,
            LoanAction::Disburse => LoanState::Disbursed,
            LoanAction::Repay => LoanState::Repaid,
            LoanAction::ReturnCollateral => LoanState::CollateralReturned,
            LoanAction::Liquidate => LoanState::Liquidated,
        }
    }
}

impl fmt::Display for LoanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoanAction::Approve => "approve",
            LoanAction::Disburse => "disburse",
            LoanAction::Repay => "repay",
            LoanAction::ReturnCollateral => "return collateral of",
            LoanAction::Liquidate => "liquidate",
        };
        write!(f, "{}", name)
    }
}

/// Loan rendered for display
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanView {
    /// Position in the borrower's loan list
    pub loan_index: u64,
    /// Borrower address, full hex
    pub borrower: String,
    /// Principal, e.g. `"1000"`
    pub principal_usdc: String,
    /// Collateral, e.g. `"0.75"`
    pub collateral_eth: String,
    /// Repayment amount
    pub repayment_usdc: String,
    /// Due date as RFC 3339, empty if unrepresentable
    pub due_date: String,
    /// Lifecycle state
    pub state: LoanState,
}

impl LoanView {
    /// Render a loan in the given state
    pub fn new(loan: &Loan, state: LoanState) -> Self {
        let due_date = i64::try_from(loan.due_date)
            .ok()
            .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_default();

        Self {
            loan_index: loan.loan_index,
            borrower: format!("{:?}", loan.borrower),
            principal_usdc: loan.principal.to_string(),
            collateral_eth: loan.eth_collateral.to_string(),
            repayment_usdc: loan.repayment_amount.to_string(),
            due_date,
            state,
        }
    }
}

/// Handle for a transaction accepted by the node but not yet confirmed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTransaction {
    /// Transaction hash
    pub hash: TransactionHash,
    /// Contract function invoked, for logging
    pub function: String,
}

/// Transaction status enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionStatus {
    /// Not mined yet
    Pending,
    /// Mined and executed
    Success,
    /// Mined and reverted
    Failed,
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionStatus::Pending => write!(f, "PENDING"),
            TransactionStatus::Success => write!(f, "SUCCESS"),
            TransactionStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Mined transaction receipt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    /// Transaction hash
    pub hash: TransactionHash,
    /// Execution outcome
    pub status: TransactionStatus,
    /// Block the transaction was included in
    pub block_number: Option<u64>,
    /// Gas consumed
    pub gas_used: Option<U256>,
}

/// Event log as returned by `eth_getLogs`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLog {
    /// Emitting contract
    pub address: Address,
    /// Indexed topics, the first being the event signature hash
    pub topics: Vec<H256>,
    /// ABI-encoded non-indexed parameters
    pub data: Bytes,
    /// Block number, absent for pending logs
    pub block_number: Option<u64>,
    /// Transaction hash
    pub transaction_hash: Option<TransactionHash>,
    /// Position within the block
    pub log_index: Option<u64>,
}

/// USDC balance and allowance of an account toward a spender
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPosition {
    /// Token holder
    pub owner: Address,
    /// Spender the allowance is granted to
    pub spender: Address,
    /// Wallet balance
    pub balance: Usdc,
    /// Current allowance
    pub allowance: Usdc,
}

/// Balances a member holds inside the funding pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolBalances {
    /// USDC deposited
    pub usdc: Usdc,
    /// ETH deposited or locked
    pub eth: Wei,
}

/// Pool-wide deposit totals
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolTotals {
    /// Total USDC deposits
    pub usdc: Usdc,
    /// Total ETH deposits
    pub eth: Wei,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loan(approved: bool, disbursed: bool, repaid: bool) -> Loan {
        Loan {
            loan_index: 0,
            borrower: Address::repeat_byte(0x11),
            principal: Usdc::from(1_000_000_000),
            eth_collateral: Wei::from(750_000_000_000_000_000),
            repayment_amount: Usdc::from(1_050_000_000),
            due_date: 1_700_000_000,
            is_approved: approved,
            is_disbursed: disbursed,
            is_repaid: repaid,
        }
    }

    #[test]
    fn test_state_from_flags() {
        assert_eq!(loan(false, false, false).state(), LoanState::Requested);
        assert_eq!(loan(true, false, false).state(), LoanState::Approved);
        assert_eq!(loan(true, true, false).state(), LoanState::Disbursed);
        assert_eq!(loan(true, true, true).state(), LoanState::Repaid);
    }

    #[test]
    fn test_transitions_are_one_directional() {
        assert_eq!(LoanState::Requested.successors(), &[LoanState::Approved]);
        assert_eq!(LoanState::Approved.successors(), &[LoanState::Disbursed]);
        assert!(LoanState::Disbursed.can_transition_to(LoanState::Repaid));
        assert!(LoanState::Disbursed.can_transition_to(LoanState::Liquidated));
        assert!(!LoanState::Repaid.can_transition_to(LoanState::Disbursed));
        assert!(LoanState::CollateralReturned.is_terminal());
        assert!(LoanState::Liquidated.is_terminal());
    }

    #[test]
    fn test_overdue() {
        let l = loan(true, true, false);
        assert!(!l.is_overdue(1_700_000_000));
        assert!(l.is_overdue(1_700_000_001));
    }

    #[test]
    fn test_loan_view() {
        let view = LoanView::new(&loan(true, false, false), LoanState::Approved);
        assert_eq!(view.principal_usdc, "1000");
        assert_eq!(view.collateral_eth, "0.75");
        assert_eq!(view.repayment_usdc, "1050");
        assert_eq!(view.due_date, "2023-11-14T22:13:20+00:00");
        assert_eq!(
            view.borrower,
            "0x1111111111111111111111111111111111111111"
        );
    }

    #[test]
    fn test_transaction_status_serde() {
        let json = serde_json::to_string(&TransactionStatus::Success).unwrap();
        assert_eq!(json, "\"SUCCESS\"");
    }
}
