//! Administrative audit log
//!
//! Append-only. One entry per privileged attempt, written whether the
//! operation succeeded or not. Each entry carries a sha256 digest of its own
//! CBOR body so an edited record can be detected.
use super::error::EscrowResult;
use super::store::{MarketStore, encode};
use super::types::{Actor, RequestMeta, TimeStamp};
use chrono::Utc;
use std::collections::BTreeMap;
use std::time::Instant;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub enum AuditAction {
    #[n(0)]
    RegisterShipment,
    #[n(1)]
    ConfirmPurchase,
    #[n(2)]
    CancelTransaction,
    #[n(3)]
    OpenTransaction,
    #[n(4)]
    AuthorizePayment,
    #[n(5)]
    ConfirmDelivery,
    #[n(6)]
    AutoConfirmPurchase,
    #[n(7)]
    EscalateDispute,
    #[n(8)]
    Custom(#[n(0)] String),
}

impl AuditAction {
    pub fn tag(&self) -> &str {
        match self {
            AuditAction::RegisterShipment => "register_shipment",
            AuditAction::ConfirmPurchase => "confirm_purchase",
            AuditAction::CancelTransaction => "cancel_transaction",
            AuditAction::OpenTransaction => "open_transaction",
            AuditAction::AuthorizePayment => "authorize_payment",
            AuditAction::ConfirmDelivery => "confirm_delivery",
            AuditAction::AutoConfirmPurchase => "auto_confirm_purchase",
            AuditAction::EscalateDispute => "escalate_dispute",
            AuditAction::Custom(tag) => tag,
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetType {
    #[n(0)]
    User,
    #[n(1)]
    Product,
    #[n(2)]
    System,
    #[n(3)]
    Report,
    #[n(4)]
    Dispute,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditStatus {
    #[n(0)]
    Success,
    #[n(1)]
    Failure,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct AuditLogEntry {
    #[n(0)]
    pub admin_uid: String,
    #[n(1)]
    pub admin_nickname: String,
    #[n(2)]
    pub action: AuditAction,
    #[n(3)]
    pub target_type: TargetType,
    #[n(4)]
    pub target_id: Option<String>,
    #[n(5)]
    pub details: BTreeMap<String, String>,
    #[n(6)]
    pub status: AuditStatus,
    #[n(7)]
    pub error_message: Option<String>,
    #[n(8)]
    pub timestamp: TimeStamp<Utc>,
    #[n(9)]
    pub ip_address: Option<String>,
    #[n(10)]
    pub user_agent: Option<String>,
    #[n(11)]
    pub digest: String, // sha256 of this entry encoded with an empty digest
}

impl AuditLogEntry {
    fn body_digest(&self) -> EscrowResult<String> {
        let mut body = self.clone();
        body.digest = String::new();
        let cbor = encode(&body)?;
        Ok(sha256::digest(&cbor))
    }

    fn seal(mut self) -> EscrowResult<Self> {
        self.digest = self.body_digest()?;
        Ok(self)
    }
}

/// What is being done, by whom, to what. Shared by every entry an operation
/// writes.
#[derive(Debug, Clone)]
pub struct AuditMeta {
    pub actor: Actor,
    pub action: AuditAction,
    pub target_type: TargetType,
    pub target_id: Option<String>,
    pub details: BTreeMap<String, String>,
    pub request: RequestMeta,
}

impl AuditMeta {
    pub fn new(actor: &Actor, action: AuditAction, target_type: TargetType) -> Self {
        Self {
            actor: actor.clone(),
            action,
            target_type,
            target_id: None,
            details: BTreeMap::new(),
            request: RequestMeta::default(),
        }
    }
    pub fn target(mut self, target_id: impl Into<String>) -> Self {
        self.target_id = Some(target_id.into());
        self
    }
    pub fn detail(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.details.insert(key.into(), value.to_string());
        self
    }
    pub fn request(mut self, request: &RequestMeta) -> Self {
        self.request = request.clone();
        self
    }
}

pub struct AuditLog<'a> {
    store: &'a MarketStore,
}

impl<'a> AuditLog<'a> {
    pub fn new(store: &'a MarketStore) -> Self {
        Self { store }
    }

    pub fn log_admin_action(
        &self,
        meta: &AuditMeta,
        status: AuditStatus,
        error_message: Option<String>,
    ) -> EscrowResult<AuditLogEntry> {
        let entry = AuditLogEntry {
            admin_uid: meta.actor.id.clone(),
            admin_nickname: meta
                .actor
                .nickname
                .clone()
                .unwrap_or_else(|| meta.actor.id.clone()),
            action: meta.action.clone(),
            target_type: meta.target_type,
            target_id: meta.target_id.clone(),
            details: meta.details.clone(),
            status,
            error_message,
            timestamp: TimeStamp::new(),
            ip_address: meta.request.ip_address.clone(),
            user_agent: meta.request.user_agent.clone(),
            digest: String::new(),
        }
        .seal()?;
        self.store.append_audit(&entry)?;
        Ok(entry)
    }

    /// Run `operation` and record its outcome.
    ///
    /// The operation's own result is returned unchanged. If the audit write
    /// itself fails the operation's outcome still stands and the failure is
    /// reported through tracing.
    pub fn with_admin_audit<T, F>(&self, meta: AuditMeta, operation: F) -> EscrowResult<T>
    where
        F: FnOnce() -> EscrowResult<T>,
    {
        let started = Instant::now();
        let result = operation();
        let elapsed = started.elapsed().as_millis();

        let written = match &result {
            Ok(_) => {
                let meta = meta.clone().detail("duration_ms", elapsed);
                self.log_admin_action(&meta, AuditStatus::Success, None)
            }
            Err(err) => {
                tracing::warn!(
                    action = meta.action.tag(),
                    target_id = ?meta.target_id,
                    error = %err,
                    "privileged action failed"
                );
                self.log_admin_action(&meta, AuditStatus::Failure, Some(err.to_string()))
            }
        };
        if let Err(audit_err) = written {
            tracing::error!(
                action = meta.action.tag(),
                target_id = ?meta.target_id,
                error = %audit_err,
                "audit write failed; operation outcome kept"
            );
        }
        result
    }

    pub fn entries(&self) -> EscrowResult<Vec<AuditLogEntry>> {
        self.store.audit_entries()
    }

    pub fn entries_for_target(&self, target_id: &str) -> EscrowResult<Vec<AuditLogEntry>> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|entry| entry.target_id.as_deref() == Some(target_id))
            .collect())
    }

    pub fn len(&self) -> usize {
        self.store.audit_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the entry still matches the digest it was sealed with.
    pub fn verify(&self, entry: &AuditLogEntry) -> bool {
        entry
            .body_digest()
            .map(|digest| digest == entry.digest)
            .unwrap_or(false)
    }
}
