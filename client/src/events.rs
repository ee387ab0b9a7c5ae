//! Event projection cache.
//!
//! Ledger events are decoded from raw logs and appended to an in-memory log
//! per event type, in the order they are observed. The log is not
//! deduplicated, not persisted, and starts empty after every
//! [`EventProjection::reset`]. It is an audit trail for display; balances and
//! loan state must still be read from the ledger.

use crate::error::{Result, SahakariError};
use crate::types::{LoanState, RawLog, TransactionHash};
use chrono::{DateTime, Utc};
use ethers::abi::{self, Event as AbiEvent, Token};
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, trace};

/// Events emitted by the lending contracts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// FundingPool: ETH deposited
    EthDeposited,
    /// FundingPool: USDC deposited
    UsdcDeposited,
    /// FundingPool: ETH withdrawn
    EthWithdrawn,
    /// FundingPool: USDC withdrawn
    UsdcWithdrawn,
    /// FundingPool: interest paid out
    InterestPaid,
    /// FundingPool / FinanceProcessor: collateral seized
    CollateralLiquidated,
    /// FundingPool: member registered
    MemberRegistered,
    /// FundingPool: USDC sent out
    UsdcTransferred,
    /// LoanManager
    LoanRequested,
    /// LoanManager
    LoanApproved,
    /// LoanManager
    LoanDisbursed,
    /// LoanManager
    LoanRepaid,
    /// LoanManager
    CollateralReturned,
    /// FinanceProcessor
    InterestAccrued,
}

impl EventKind {
    /// Every known event
    pub const ALL: [EventKind; 14] = [
        EventKind::EthDeposited,
        EventKind::UsdcDeposited,
        EventKind::EthWithdrawn,
        EventKind::UsdcWithdrawn,
        EventKind::InterestPaid,
        EventKind::CollateralLiquidated,
        EventKind::MemberRegistered,
        EventKind::UsdcTransferred,
        EventKind::LoanRequested,
        EventKind::LoanApproved,
        EventKind::LoanDisbursed,
        EventKind::LoanRepaid,
        EventKind::CollateralReturned,
        EventKind::InterestAccrued,
    ];

    /// Solidity event name
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::EthDeposited => "EthDeposited",
            EventKind::UsdcDeposited => "UsdcDeposited",
            EventKind::EthWithdrawn => "EthWithdrawn",
            EventKind::UsdcWithdrawn => "UsdcWithdrawn",
            EventKind::InterestPaid => "InterestPaid",
            EventKind::CollateralLiquidated => "CollateralLiquidated",
            EventKind::MemberRegistered => "MemberRegistered",
            EventKind::UsdcTransferred => "UsdcTransferred",
            EventKind::LoanRequested => "LoanRequested",
            EventKind::LoanApproved => "LoanApproved",
            EventKind::LoanDisbursed => "LoanDisbursed",
            EventKind::LoanRepaid => "LoanRepaid",
            EventKind::CollateralReturned => "CollateralReturned",
            EventKind::InterestAccrued => "InterestAccrued",
        }
    }

    /// Human-readable ABI declaration
    pub fn declaration(&self) -> &'static str {
        match self {
            EventKind::EthDeposited => "event EthDeposited(address indexed member, uint256 amount)",
            EventKind::UsdcDeposited => {
                "event UsdcDeposited(address indexed member, uint256 amount)"
            }
            EventKind::EthWithdrawn => "event EthWithdrawn(address indexed member, uint256 amount)",
            EventKind::UsdcWithdrawn => {
                "event UsdcWithdrawn(address indexed member, uint256 amount)"
            }
            EventKind::InterestPaid => "event InterestPaid(address indexed member, uint256 amount)",
            EventKind::CollateralLiquidated => {
                "event CollateralLiquidated(address indexed borrower, uint256 loanIndex, uint256 ethAmount, uint256 usdcAmount)"
            }
            EventKind::MemberRegistered => {
                "event MemberRegistered(address indexed member, string name)"
            }
            EventKind::UsdcTransferred => {
                "event UsdcTransferred(address indexed to, uint256 amount)"
            }
            EventKind::LoanRequested => {
                "event LoanRequested(address indexed borrower, uint256 loanIndex, uint256 amount, uint256 ethCollateral)"
            }
            EventKind::LoanApproved => {
                "event LoanApproved(address indexed borrower, uint256 loanIndex)"
            }
            EventKind::LoanDisbursed => {
                "event LoanDisbursed(address indexed borrower, uint256 loanIndex, uint256 amount)"
            }
            EventKind::LoanRepaid => {
                "event LoanRepaid(address indexed borrower, uint256 loanIndex, uint256 amount)"
            }
            EventKind::CollateralReturned => {
                "event CollateralReturned(address indexed borrower, uint256 loanIndex, uint256 ethCollateral)"
            }
            EventKind::InterestAccrued => {
                "event InterestAccrued(address indexed member, uint256 amount)"
            }
        }
    }

    /// Terminal loan state the event settles a loan into, if any
    pub fn settles_into(&self) -> Option<LoanState> {
        match self {
            EventKind::CollateralReturned => Some(LoanState::CollateralReturned),
            EventKind::CollateralLiquidated => Some(LoanState::Liquidated),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// An event decoded from a log, not yet recorded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEvent {
    /// Event type
    pub kind: EventKind,
    /// Emitting contract
    pub contract: Address,
    /// Decoded parameters by name
    pub payload: Value,
    /// Borrower, for loan events
    pub borrower: Option<Address>,
    /// Loan index, for loan events
    pub loan_index: Option<u64>,
    /// Transaction that emitted the event
    pub transaction_hash: Option<TransactionHash>,
    /// Block the event was mined in
    pub block_number: Option<u64>,
}

/// An event as held in the projection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Event type
    pub event_type: EventKind,
    /// Decoded parameters by name
    pub payload: Value,
    /// Position in observation order, across all types
    pub observed_order: u64,
    /// Emitting contract
    pub contract: Address,
    /// Borrower, for loan events
    pub borrower: Option<Address>,
    /// Loan index, for loan events
    pub loan_index: Option<u64>,
    /// Transaction that emitted the event
    pub transaction_hash: Option<TransactionHash>,
    /// Block the event was mined in
    pub block_number: Option<u64>,
    /// Wall-clock time of observation
    pub observed_at: DateTime<Utc>,
}

/// Decodes raw logs of the known events
pub struct EventDecoder {
    events: HashMap<H256, (EventKind, AbiEvent)>,
}

impl EventDecoder {
    /// Build a decoder for every [`EventKind`]
    pub fn new() -> Result<Self> {
        let declarations: Vec<&str> = EventKind::ALL.iter().map(|k| k.declaration()).collect();
        let abi = abi::parse_abi(&declarations)
            .map_err(|e| SahakariError::Abi(format!("Invalid event declaration: {}", e)))?;

        let mut events = HashMap::new();
        for kind in EventKind::ALL {
            let event = abi
                .event(kind.name())
                .map_err(|e| SahakariError::Abi(format!("{}: {}", kind, e)))?
                .clone();
            events.insert(event.signature(), (kind, event));
        }

        Ok(Self { events })
    }

    /// Topic hash of an event
    pub fn topic(&self, kind: EventKind) -> Option<H256> {
        self.events
            .iter()
            .find(|(_, (k, _))| *k == kind)
            .map(|(topic, _)| *topic)
    }

    /// Decode a log; `None` for logs of unknown events
    pub fn decode(&self, log: &RawLog) -> Result<Option<LedgerEvent>> {
        let Some(topic) = log.topics.first() else {
            return Ok(None);
        };
        let Some((kind, event)) = self.events.get(topic) else {
            trace!("Skipping log with unknown topic {:?}", topic);
            return Ok(None);
        };

        let decoded = event
            .parse_log(abi::RawLog {
                topics: log.topics.clone(),
                data: log.data.to_vec(),
            })
            .map_err(|e| SahakariError::Abi(format!("Failed to decode {}: {}", kind, e)))?;

        let mut payload = Map::new();
        let mut borrower = None;
        let mut loan_index = None;
        for param in decoded.params {
            match (param.name.as_str(), &param.value) {
                ("borrower", Token::Address(a)) => borrower = Some(*a),
                ("loanIndex", Token::Uint(i)) if *i <= U256::from(u64::MAX) => {
                    loan_index = Some(i.as_u64())
                }
                _ => {}
            }
            payload.insert(param.name, token_to_json(&param.value));
        }

        Ok(Some(LedgerEvent {
            kind: *kind,
            contract: log.address,
            payload: Value::Object(payload),
            borrower,
            loan_index,
            transaction_hash: log.transaction_hash.clone(),
            block_number: log.block_number,
        }))
    }
}

fn token_to_json(token: &Token) -> Value {
    match token {
        Token::Address(addr) => Value::String(format!("{:?}", addr)),
        Token::Uint(val) => Value::String(val.to_string()),
        Token::Int(val) => Value::String(ethers::types::I256::from_raw(*val).to_string()),
        Token::Bool(b) => Value::Bool(*b),
        Token::String(s) => Value::String(s.clone()),
        Token::Bytes(b) | Token::FixedBytes(b) => Value::String(format!("0x{}", hex::encode(b))),
        Token::Array(tokens) | Token::FixedArray(tokens) | Token::Tuple(tokens) => {
            Value::Array(tokens.iter().map(token_to_json).collect())
        }
    }
}

/// Callback invoked for each recorded event of a subscribed type
pub type EventHandler = Arc<dyn Fn(&EventRecord) + Send + Sync>;

#[derive(Default)]
struct ProjectionState {
    logs: HashMap<EventKind, Vec<EventRecord>>,
    handlers: HashMap<EventKind, Vec<(u64, EventHandler)>>,
    next_order: u64,
    next_handler_id: u64,
    synced_through: Option<u64>,
}

fn lock(state: &Mutex<ProjectionState>) -> MutexGuard<'_, ProjectionState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Append-only, per-type event log with subscriptions
#[derive(Clone, Default)]
pub struct EventProjection {
    state: Arc<Mutex<ProjectionState>>,
}

/// Scoped subscription; unsubscribes when dropped
#[must_use = "dropping a subscription unsubscribes its handler"]
pub struct Subscription {
    state: Weak<Mutex<ProjectionState>>,
    kind: EventKind,
    id: u64,
}

impl Subscription {
    /// Event type subscribed to
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Unsubscribe now
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(state) = self.state.upgrade() {
            let mut state = lock(&state);
            if let Some(handlers) = state.handlers.get_mut(&self.kind) {
                handlers.retain(|(id, _)| *id != self.id);
            }
            debug!("Unsubscribed handler {} from {}", self.id, self.kind);
        }
    }
}

impl EventProjection {
    /// Create an empty projection
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events of `kind` until the returned handle is dropped
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&EventRecord) + Send + Sync + 'static,
    {
        let mut state = lock(&self.state);
        let id = state.next_handler_id;
        state.next_handler_id += 1;
        state
            .handlers
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        debug!("Subscribed handler {} to {}", id, kind);

        Subscription {
            state: Arc::downgrade(&self.state),
            kind,
            id,
        }
    }

    /// Append an observed event and notify its subscribers
    pub fn record(&self, event: LedgerEvent) -> EventRecord {
        let (record, handlers) = {
            let mut state = lock(&self.state);
            let record = EventRecord {
                event_type: event.kind,
                payload: event.payload,
                observed_order: state.next_order,
                contract: event.contract,
                borrower: event.borrower,
                loan_index: event.loan_index,
                transaction_hash: event.transaction_hash,
                block_number: event.block_number,
                observed_at: Utc::now(),
            };
            state.next_order += 1;
            state
                .logs
                .entry(event.kind)
                .or_default()
                .push(record.clone());
            let handlers: Vec<EventHandler> = state
                .handlers
                .get(&event.kind)
                .map(|hs| hs.iter().map(|(_, h)| h.clone()).collect())
                .unwrap_or_default();
            (record, handlers)
        };

        // handlers run unlocked so they may read the projection
        for handler in handlers {
            handler(&record);
        }
        record
    }

    /// Recorded events of one type, in observation order
    pub fn log(&self, kind: EventKind) -> Vec<EventRecord> {
        lock(&self.state)
            .logs
            .get(&kind)
            .cloned()
            .unwrap_or_default()
    }

    /// Every recorded event, in observation order
    pub fn all(&self) -> Vec<EventRecord> {
        let state = lock(&self.state);
        let mut records: Vec<EventRecord> = state.logs.values().flatten().cloned().collect();
        records.sort_by_key(|r| r.observed_order);
        records
    }

    /// Recorded events concerning one borrower, in observation order
    pub fn log_for_borrower(&self, borrower: Address) -> Vec<EventRecord> {
        self.all()
            .into_iter()
            .filter(|r| r.borrower == Some(borrower))
            .collect()
    }

    /// Terminal state observed for a loan, if any
    pub fn settled_state(&self, borrower: Address, loan_index: u64) -> Option<LoanState> {
        let state = lock(&self.state);
        [EventKind::CollateralLiquidated, EventKind::CollateralReturned]
            .into_iter()
            .find(|kind| {
                state.logs.get(kind).is_some_and(|records| {
                    records.iter().any(|r| {
                        r.borrower == Some(borrower) && r.loan_index == Some(loan_index)
                    })
                })
            })
            .and_then(|kind| kind.settles_into())
    }

    /// Number of recorded events
    pub fn len(&self) -> usize {
        lock(&self.state).logs.values().map(Vec::len).sum()
    }

    /// Whether nothing has been recorded
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of live subscriptions for `kind`
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        lock(&self.state).handlers.get(&kind).map_or(0, Vec::len)
    }

    /// Record that every log from the scan's first block up to `block` has
    /// been applied
    pub fn mark_synced(&self, block: u64) {
        let mut state = lock(&self.state);
        if state.synced_through.map_or(true, |through| block > through) {
            state.synced_through = Some(block);
        }
    }

    /// Last block the projection is known to be complete through
    pub fn synced_through(&self) -> Option<u64> {
        lock(&self.state).synced_through
    }

    /// Whether a history scan has caught up with the chain head at least once.
    ///
    /// Until then [`EventProjection::settled_state`] can miss terminal
    /// states reached before this process started.
    pub fn is_synced(&self) -> bool {
        self.synced_through().is_some()
    }

    /// Drop every recorded event and the sync marker; subscriptions stay
    pub fn reset(&self) {
        let mut state = lock(&self.state);
        state.logs.clear();
        state.next_order = 0;
        state.synced_through = None;
        debug!("Event projection reset");
    }
}
