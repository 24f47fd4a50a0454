use crate::direct_trade::DirectTradeStatus;
use crate::item::ItemStatus;
use crate::ledger::TransactionStatus;
use crate::processor::ProcessorError;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Listing has no seller")]
    MissingSeller,
    #[error("Listing has no title")]
    MissingTitle,
    #[error("Listing price is set to zero")]
    ZeroPrice,
    #[error("Listing offers no shipping method")]
    NoShippingTypes,
    #[error("A cancellation reason is required")]
    EmptyReason,
    #[error("Courier and tracking number are required")]
    MissingShipment,
    #[error("Order id is required")]
    MissingOrderId,
    #[error("Payment amount {got} does not match the listed price {expected}")]
    AmountMismatch { expected: u64, got: u64 },
    #[error("Order {got} does not match the open transaction order {expected}")]
    OrderMismatch { expected: String, got: String },
    #[error("No funds are held for an item that is {status}")]
    NotDisputable { status: ItemStatus },
    #[error("Unknown item list type {0}")]
    UnknownItemsType(String),
}

/// Coarse classification a caller uses to decide whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidTransition,
    Conflict,
    NotAuthorized,
    PaymentProcessor,
    Persistence,
    NotFound,
    Validation,
}

#[derive(thiserror::Error, Debug)]
pub enum EscrowError {
    #[error("cannot move from {from} to {to}")]
    InvalidTransition { from: ItemStatus, to: ItemStatus },
    #[error("cannot move a direct trade from {from} to {to}")]
    InvalidTradeTransition {
        from: DirectTradeStatus,
        to: DirectTradeStatus,
    },
    #[error("cannot move a transaction from {from} to {to}")]
    InvalidLedgerTransition {
        from: TransactionStatus,
        to: TransactionStatus,
    },
    #[error("item is {current}, shipment can only be registered while payment is held")]
    NotInPayHoldState { current: ItemStatus },
    #[error("item status changed: expected {expected}, found {actual}")]
    StaleState {
        expected: ItemStatus,
        actual: ItemStatus,
    },
    #[error("a {operation} is already in progress for this item")]
    SettlementInProgress { operation: String },
    #[error("item is already reserved by {winner}")]
    AlreadyReserved { winner: String },
    #[error("not authorized: {0}")]
    NotAuthorized(String),
    #[error("payment processor error: {0}")]
    PaymentProcessor(#[from] ProcessorError),
    #[error("persistence error: {0}")]
    Persistence(#[from] sled::Error),
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("record codec error: {0}")]
    Codec(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type EscrowResult<T> = Result<T, EscrowError>;

impl EscrowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EscrowError::InvalidTransition { .. }
            | EscrowError::InvalidTradeTransition { .. }
            | EscrowError::InvalidLedgerTransition { .. }
            | EscrowError::NotInPayHoldState { .. } => ErrorKind::InvalidTransition,
            EscrowError::StaleState { .. }
            | EscrowError::AlreadyReserved { .. }
            | EscrowError::SettlementInProgress { .. } => ErrorKind::Conflict,
            EscrowError::NotAuthorized(_) => ErrorKind::NotAuthorized,
            EscrowError::PaymentProcessor(_) => ErrorKind::PaymentProcessor,
            EscrowError::Persistence(_) | EscrowError::Codec(_) | EscrowError::Internal(_) => {
                ErrorKind::Persistence
            }
            EscrowError::NotFound { .. } => ErrorKind::NotFound,
            EscrowError::Validation(_) => ErrorKind::Validation,
        }
    }

    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::PaymentProcessor | ErrorKind::Persistence
        )
    }

    /// Message safe to show an end user. Processor and store internals are
    /// never surfaced.
    pub fn user_message(&self) -> String {
        match self {
            EscrowError::PaymentProcessor(_) => "payment step failed, please retry".to_string(),
            EscrowError::Persistence(_) | EscrowError::Codec(_) | EscrowError::Internal(_) => {
                "service temporarily unavailable, please retry".to_string()
            }
            EscrowError::StaleState { .. }
            | EscrowError::AlreadyReserved { .. }
            | EscrowError::SettlementInProgress { .. } => {
                "someone else already acted on this item".to_string()
            }
            other => other.to_string(),
        }
    }
}
