//! Boundary to the external payment processor
//!
//! The processor (Toss Payments in production) captures funds at checkout and
//! is told to either release them to the seller or refund them to the buyer.
//! Both calls carry an idempotency key so a retried settlement never moves
//! money twice.
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessorError {
    #[error("processor rejected the request: {0}")]
    Rejected(String),
    #[error("processor unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementRequest {
    pub order_id: String,
    pub amount: u64,
    pub idempotency_key: String,
}

pub trait PaymentProcessor: Send + Sync {
    /// Pay the held amount out to the seller.
    fn release(&self, request: &SettlementRequest) -> Result<(), ProcessorError>;
    /// Return the held amount to the buyer.
    fn refund(&self, request: &SettlementRequest, reason: &str) -> Result<(), ProcessorError>;
}

#[derive(Debug, Default)]
struct SandboxLedger {
    released: HashMap<String, u64>,
    refunded: HashMap<String, u64>,
    seen_keys: HashMap<String, u64>,
    calls: usize,
    fail_next: Option<ProcessorError>,
}

/// In-process processor for development and tests. Honours idempotency keys
/// the way the real gateway does and can be told to fail the next call.
#[derive(Debug, Default)]
pub struct SandboxProcessor {
    ledger: Mutex<SandboxLedger>,
}

impl SandboxProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next release or refund fail with `error`.
    pub fn fail_next(&self, error: ProcessorError) {
        self.with_ledger(|ledger| ledger.fail_next = Some(error));
    }

    pub fn released_total(&self, order_id: &str) -> u64 {
        self.with_ledger(|ledger| ledger.released.get(order_id).copied().unwrap_or(0))
    }

    pub fn refunded_total(&self, order_id: &str) -> u64 {
        self.with_ledger(|ledger| ledger.refunded.get(order_id).copied().unwrap_or(0))
    }

    /// Number of calls that reached the processor, including failed ones.
    pub fn calls(&self) -> usize {
        self.with_ledger(|ledger| ledger.calls)
    }

    fn with_ledger<T>(&self, f: impl FnOnce(&mut SandboxLedger) -> T) -> T {
        let mut guard = self
            .ledger
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    fn settle(&self, request: &SettlementRequest, refund: bool) -> Result<(), ProcessorError> {
        self.with_ledger(|ledger| {
            ledger.calls += 1;
            if let Some(error) = ledger.fail_next.take() {
                return Err(error);
            }
            if ledger.seen_keys.contains_key(&request.idempotency_key) {
                return Ok(());
            }
            ledger
                .seen_keys
                .insert(request.idempotency_key.clone(), request.amount);
            let book = if refund {
                &mut ledger.refunded
            } else {
                &mut ledger.released
            };
            *book.entry(request.order_id.clone()).or_insert(0) += request.amount;
            Ok(())
        })
    }
}

impl PaymentProcessor for SandboxProcessor {
    fn release(&self, request: &SettlementRequest) -> Result<(), ProcessorError> {
        tracing::debug!(order_id = %request.order_id, amount = request.amount, "sandbox release");
        self.settle(request, false)
    }

    fn refund(&self, request: &SettlementRequest, reason: &str) -> Result<(), ProcessorError> {
        tracing::debug!(
            order_id = %request.order_id,
            amount = request.amount,
            reason,
            "sandbox refund"
        );
        self.settle(request, true)
    }
}
