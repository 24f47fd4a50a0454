//! Payment ledger entries
use super::error::{EscrowError, EscrowResult};
use super::types::TimeStamp;
use super::utils::{TRANSACTION_HRP, new_uuid_to_bech32};
use chrono::Utc;
use std::fmt;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    PaidHold,
    #[n(2)]
    Shipped,
    #[n(3)]
    Delivered,
    #[n(4)]
    Released,
    #[n(5)]
    Refunded,
    #[n(6)]
    Cancelled,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::PaidHold => "paid_hold",
            TransactionStatus::Shipped => "shipped",
            TransactionStatus::Delivered => "delivered",
            TransactionStatus::Released => "released",
            TransactionStatus::Refunded => "refunded",
            TransactionStatus::Cancelled => "cancelled",
        }
    }

    /// No further writes are accepted once a transaction gets here.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Released | TransactionStatus::Refunded | TransactionStatus::Cancelled
        )
    }

    pub fn can_advance(from: TransactionStatus, to: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (from, to),
            (Pending, PaidHold)
                | (Pending, Cancelled)
                | (PaidHold, Shipped)
                | (PaidHold, Refunded)
                | (Shipped, Delivered)
                | (Shipped, Refunded)
                | (Delivered, Released)
        )
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub product_id: String,
    #[n(2)]
    pub buyer_uid: String,
    #[n(3)]
    pub amount: u64,
    #[n(4)]
    pub status: TransactionStatus,
    #[n(5)]
    pub escrow_enabled: bool,
    #[n(6)]
    pub tracking_number: Option<String>,
    #[n(7)]
    pub order_id: String, // processor-side order reference
    #[n(8)]
    pub created_at: TimeStamp<Utc>,
    #[n(9)]
    pub courier: Option<String>,
    #[n(10)]
    pub released_amount: u64,
    #[n(11)]
    pub refunded_amount: u64,
    #[n(12)]
    pub updated_at: TimeStamp<Utc>,
    #[n(13)]
    pub disputed: bool,
}

impl Transaction {
    /// A fresh `pending` entry, opened when the buyer starts checkout.
    pub fn open(
        product_id: &str,
        buyer_uid: &str,
        amount: u64,
        order_id: &str,
        escrow_enabled: bool,
    ) -> EscrowResult<Self> {
        let now = TimeStamp::new();
        Ok(Self {
            id: new_uuid_to_bech32(TRANSACTION_HRP)?,
            product_id: product_id.to_string(),
            buyer_uid: buyer_uid.to_string(),
            amount,
            status: TransactionStatus::Pending,
            escrow_enabled,
            tracking_number: None,
            order_id: order_id.to_string(),
            created_at: now.clone(),
            courier: None,
            released_amount: 0,
            refunded_amount: 0,
            updated_at: now,
            disputed: false,
        })
    }

    /// Copy of this entry moved to `to`. Terminal entries are immutable.
    pub fn advance(&self, to: TransactionStatus) -> EscrowResult<Transaction> {
        if !TransactionStatus::can_advance(self.status, to) {
            return Err(EscrowError::InvalidLedgerTransition {
                from: self.status,
                to,
            });
        }
        let mut next = self.clone();
        next.status = to;
        next.updated_at = TimeStamp::new();
        match to {
            TransactionStatus::Released => next.released_amount = next.amount,
            TransactionStatus::Refunded => next.refunded_amount = next.amount,
            _ => {}
        }
        Ok(next)
    }
}
