//! Error types for the lending client.
//!
//! Errors fall into four phases: local precondition failures caught before any
//! remote call, submission failures (the signer or node refused the
//! transaction), confirmation failures (the transaction was mined and reverted,
//! or its outcome is unknown), and transport failures talking to the node.

use crate::types::{LoanAction, LoanState};
use ethers::types::{Address, U256};
use thiserror::Error;

/// Main error type for lending client operations
#[derive(Error, Debug)]
pub enum SahakariError {
    /// Price feed could not be read
    #[error("ETH price unavailable: {0}")]
    PriceUnavailable(String),

    /// Price is zero, negative or otherwise unusable
    #[error("Invalid ETH price: {0}")]
    InvalidPrice(String),

    /// Amount or other input is missing, zero or malformed
    #[error("Insufficient input: {0}")]
    InsufficientInput(String),

    /// Allowance is below what the dependent operation needs
    #[error("Allowance of {spender:?} over {owner:?} is {current}, {required} required")]
    AllowanceInsufficient {
        /// Token owner
        owner: Address,
        /// Spender contract
        spender: Address,
        /// Allowance currently held by the ledger
        current: U256,
        /// Allowance the operation needs
        required: U256,
    },

    /// Loan or member absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// Loan has already been approved
    #[error("Loan {index} of {borrower:?} is already approved")]
    AlreadyApproved {
        /// Borrower address
        borrower: Address,
        /// Loan index
        index: u64,
    },

    /// Loan has not been approved yet
    #[error("Loan {index} of {borrower:?} is not approved")]
    NotApproved {
        /// Borrower address
        borrower: Address,
        /// Loan index
        index: u64,
    },

    /// Loan has not been disbursed yet
    #[error("Loan {index} of {borrower:?} is not disbursed")]
    NotDisbursed {
        /// Borrower address
        borrower: Address,
        /// Loan index
        index: u64,
    },

    /// Loan has not been repaid yet
    #[error("Loan {index} of {borrower:?} is not repaid")]
    NotRepaid {
        /// Borrower address
        borrower: Address,
        /// Loan index
        index: u64,
    },

    /// Loan is not past its due date
    #[error("Loan {index} of {borrower:?} is not overdue (due at {due_date})")]
    NotOverdue {
        /// Borrower address
        borrower: Address,
        /// Loan index
        index: u64,
        /// Unix timestamp of the due date
        due_date: u64,
    },

    /// Action is not valid from the loan's current state
    #[error("Cannot {action} a loan in state {from}")]
    InvalidTransition {
        /// State the loan is in
        from: LoanState,
        /// Attempted action
        action: LoanAction,
    },

    /// Signer or node refused the transaction before it reached the chain
    #[error("Transaction submission rejected: {0}")]
    SubmissionRejected(String),

    /// Node may or may not have accepted the transaction
    #[error("Transaction submission outcome unknown: {0}, re-read state before retrying")]
    SubmissionUnknown(String),

    /// Transaction was mined and reverted
    #[error("Transaction {hash} failed on-chain: {reason}")]
    ConfirmationFailed {
        /// Transaction hash
        hash: String,
        /// Failure reason reported by the node
        reason: String,
    },

    /// Transaction outcome unknown after the confirmation window
    #[error("Transaction {hash} unconfirmed after {secs} seconds, re-read state before retrying")]
    ConfirmationTimeout {
        /// Transaction hash
        hash: String,
        /// Seconds waited
        secs: u64,
    },

    /// Event history has not been replayed up to the chain head, so a
    /// terminal state reached earlier could be missing
    #[error("Cannot {action} loan {index} of {borrower:?} before the event history is synced")]
    EventsNotSynced {
        /// Borrower address
        borrower: Address,
        /// Loan index
        index: u64,
        /// Attempted action
        action: LoanAction,
    },

    /// Fixed-point arithmetic overflowed 256 bits
    #[error("Arithmetic overflow: {0}")]
    ArithmeticOverflow(String),

    /// JSON-RPC error returned by the node
    #[error("RPC error: {0}")]
    Rpc(String),

    /// Network communication error
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Transaction receipt not available yet
    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    /// ABI encoding or decoding failed
    #[error("ABI error: {0}")]
    Abi(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Rate limit exceeded
    #[error("Rate limit exceeded, retry after {0} seconds")]
    RateLimitExceeded(u64),

    /// Max retries exceeded
    #[error("Max retries ({0}) exceeded")]
    MaxRetriesExceeded(usize),

    /// Invalid response from the node
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// URL parse error
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),
}

/// Result type alias for lending client operations
pub type Result<T> = std::result::Result<T, SahakariError>;

/// Where in an operation an error arose
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPhase {
    /// Caught locally before any remote write
    Local,
    /// Refused before reaching the chain
    Submission,
    /// Reverted on-chain or outcome unknown
    Confirmation,
    /// Failure talking to the node
    Transport,
}

impl SahakariError {
    /// Classify the error by the phase it arose in
    pub fn phase(&self) -> ErrorPhase {
        match self {
            SahakariError::InvalidPrice(_)
            | SahakariError::InsufficientInput(_)
            | SahakariError::AllowanceInsufficient { .. }
            | SahakariError::NotFound(_)
            | SahakariError::AlreadyApproved { .. }
            | SahakariError::NotApproved { .. }
            | SahakariError::NotDisbursed { .. }
            | SahakariError::NotRepaid { .. }
            | SahakariError::NotOverdue { .. }
            | SahakariError::InvalidTransition { .. }
            | SahakariError::EventsNotSynced { .. }
            | SahakariError::ArithmeticOverflow(_)
            | SahakariError::Config(_) => ErrorPhase::Local,
            SahakariError::SubmissionRejected(_) => ErrorPhase::Submission,
            SahakariError::SubmissionUnknown(_)
            | SahakariError::ConfirmationFailed { .. }
            | SahakariError::ConfirmationTimeout { .. } => ErrorPhase::Confirmation,
            _ => ErrorPhase::Transport,
        }
    }

    /// Whether the error is a loan state precondition violation
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            SahakariError::AlreadyApproved { .. }
                | SahakariError::NotApproved { .. }
                | SahakariError::NotDisbursed { .. }
                | SahakariError::NotRepaid { .. }
                | SahakariError::NotOverdue { .. }
                | SahakariError::InvalidTransition { .. }
        )
    }

    /// Whether the transaction may have been mined despite the error
    pub fn is_outcome_unknown(&self) -> bool {
        matches!(
            self,
            SahakariError::SubmissionUnknown(_) | SahakariError::ConfirmationTimeout { .. }
        )
    }

    /// Short message suitable for showing to the user
    pub fn user_message(&self) -> String {
        if self.is_outcome_unknown() {
            return format!("The transaction may still go through. {}", self);
        }
        match self.phase() {
            ErrorPhase::Local => self.to_string(),
            ErrorPhase::Submission => {
                format!("The transaction was not sent. {}", self)
            }
            ErrorPhase::Confirmation => {
                format!("The transaction did not complete. {}", self)
            }
            ErrorPhase::Transport => {
                format!("Could not reach the network. {}", self)
            }
        }
    }
}

/// Error context for retryable operations
#[derive(Debug, Clone, Default)]
pub struct RetryContext {
    /// Number of attempts made
    pub attempts: usize,
    /// Last error encountered
    pub last_error: String,
    /// Total time spent waiting between attempts (in milliseconds)
    pub total_time_ms: u64,
}

impl RetryContext {
    /// Create a new retry context
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an attempt
    pub fn record_attempt(&mut self, error: &str, duration_ms: u64) {
        self.attempts += 1;
        self.last_error = error.to_string();
        self.total_time_ms += duration_ms;
    }
}
