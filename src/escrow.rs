//! Escrow settlement functions
//!
//! The only code allowed to move an item into, through or out of a
//! payment-bearing status. Each call is wrapped in
//! [`AuditLog::with_admin_audit`](crate::audit::AuditLog::with_admin_audit) so
//! exactly one audit entry is written per call.
//!
//! Every call first takes the item's settlement claim, a compare-and-swap
//! entry in the store that at most one settlement holds at a time. Under the
//! claim the order is always: read and validate stored state, call the
//! processor, then commit item and ledger together. A processor failure
//! returns before anything is written and frees the claim. If money moved but
//! the commit did not land, the claim is left orphaned so only a retry of the
//! same operation can touch the item again.
use super::audit::{AuditAction, AuditMeta, TargetType};
use super::context::MarketContext;
use super::error::{EscrowError, EscrowResult, ValidationError};
use super::item::{Item, ItemStatus};
use super::ledger::{Transaction, TransactionStatus};
use super::lifecycle::{ActorRole, ensure_legal, role_of};
use super::processor::SettlementRequest;
use super::store::{IndexUpdate, MarketStore, SettlementCommit};
use super::types::{ActorKind, Caller, TimeStamp};
use super::utils::idempotency_key;
use chrono::Utc;
use std::time::Duration;

const CLAIM_ATTEMPTS: u32 = 200;
const CLAIM_BACKOFF: Duration = Duration::from_millis(10);
const ORPHANED: &str = "orphaned:";

/// Outcome of one pass of the auto-confirmation sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub confirmed: Vec<String>,
    pub skipped_disputed: Vec<String>,
    pub failed: Vec<(String, String)>,
}

// Exclusive right to settle one item, released on drop.
struct SettlementClaim<'s> {
    store: &'s MarketStore,
    item_id: String,
    operation: &'static str,
    held: bool,
}

impl SettlementClaim<'_> {
    fn orphan(mut self) {
        self.held = false;
        let orphaned = format!("{ORPHANED}{}", self.operation);
        match self
            .store
            .transfer_claim(&self.item_id, self.operation, &orphaned)
        {
            Ok(None) => {}
            Ok(Some(holder)) => tracing::error!(
                item_id = %self.item_id,
                holder = %holder,
                "claim lost before it could be orphaned"
            ),
            Err(err) => tracing::error!(
                item_id = %self.item_id,
                error = %err,
                "failed to orphan settlement claim"
            ),
        }
    }
}

impl Drop for SettlementClaim<'_> {
    fn drop(&mut self) {
        if !self.held {
            return;
        }
        if let Err(err) = self.store.release_claim(&self.item_id, self.operation) {
            tracing::error!(
                item_id = %self.item_id,
                operation = self.operation,
                error = %err,
                "failed to release settlement claim"
            );
        }
    }
}

pub struct EscrowSettlement<'a> {
    ctx: &'a MarketContext,
}

impl<'a> EscrowSettlement<'a> {
    pub fn new(ctx: &'a MarketContext) -> Self {
        Self { ctx }
    }

    fn audited<T>(
        &self,
        action: AuditAction,
        target_type: TargetType,
        item_id: &str,
        caller: &Caller,
        details: &[(&str, &str)],
        operation: impl FnOnce() -> EscrowResult<T>,
    ) -> EscrowResult<T> {
        let mut meta = AuditMeta::new(&caller.actor, action, target_type)
            .target(item_id)
            .request(&caller.request);
        for (key, value) in details {
            meta = meta.detail(*key, value);
        }
        self.ctx.audit().with_admin_audit(meta, operation)
    }

    /// Wait for the item's settlement claim. Another live settlement is
    /// waited out; an orphaned one only yields to a retry of itself.
    fn claim(&self, item_id: &str, operation: &'static str) -> EscrowResult<SettlementClaim<'a>> {
        let store = self.ctx.store();
        let acquired = || SettlementClaim {
            store,
            item_id: item_id.to_string(),
            operation,
            held: true,
        };
        let orphaned = format!("{ORPHANED}{operation}");

        for _ in 0..CLAIM_ATTEMPTS {
            match store.try_claim(item_id, operation)? {
                None => return Ok(acquired()),
                Some(holder) if holder == orphaned => {
                    if store.transfer_claim(item_id, &holder, operation)?.is_none() {
                        tracing::warn!(item_id, operation, "retry took over orphaned claim");
                        return Ok(acquired());
                    }
                }
                Some(holder) if holder.starts_with(ORPHANED) => {
                    return Err(EscrowError::SettlementInProgress {
                        operation: holder.trim_start_matches(ORPHANED).to_string(),
                    });
                }
                Some(_) => std::thread::sleep(CLAIM_BACKOFF),
            }
        }
        let holder = store.claim_holder(item_id)?;
        Err(EscrowError::SettlementInProgress {
            operation: holder.unwrap_or_else(|| operation.to_string()),
        })
    }

    fn active_transaction(&self, item_id: &str) -> EscrowResult<Transaction> {
        self.ctx
            .store()
            .active_transaction_for(item_id)?
            .ok_or_else(|| EscrowError::NotFound {
                kind: "active transaction",
                id: item_id.to_string(),
            })
    }

    fn commit(
        &self,
        previous: Item,
        next: Item,
        transactions: Vec<Transaction>,
        index: IndexUpdate,
    ) -> EscrowResult<()> {
        self.ctx.store().commit_settlement(&SettlementCommit {
            previous,
            next,
            transactions,
            index,
        })
    }

    /// Buyer starts checkout on a reserved item. Any earlier pending entry for
    /// the item is cancelled in the same commit.
    pub fn open_transaction(
        &self,
        item_id: &str,
        order_id: &str,
        amount: u64,
        escrow_enabled: bool,
        caller: &Caller,
    ) -> EscrowResult<Transaction> {
        self.audited(
            AuditAction::OpenTransaction,
            TargetType::Product,
            item_id,
            caller,
            &[("order_id", order_id)],
            || {
                if order_id.trim().is_empty() {
                    return Err(ValidationError::MissingOrderId.into());
                }
                let _claim = self.claim(item_id, "checkout")?;
                let item = self.ctx.store().load_item(item_id)?;
                let role = role_of(&item, &caller.actor);
                if !matches!(role, ActorRole::Buyer | ActorRole::Admin) {
                    return Err(EscrowError::NotAuthorized(
                        "only the reserving buyer can check out".into(),
                    ));
                }
                if item.status != ItemStatus::Reserved {
                    return Err(EscrowError::InvalidTransition {
                        from: item.status,
                        to: ItemStatus::PaidHold,
                    });
                }
                if amount != item.price {
                    return Err(ValidationError::AmountMismatch {
                        expected: item.price,
                        got: amount,
                    }
                    .into());
                }

                let mut ledger = vec![];
                if let Some(existing) = self.ctx.store().active_transaction_for(item_id)? {
                    if existing.order_id == order_id {
                        return Ok(existing);
                    }
                    ledger.push(existing.advance(TransactionStatus::Cancelled)?);
                }
                let buyer = item.buyer_id.clone().unwrap_or_default();
                let txn = Transaction::open(item_id, &buyer, amount, order_id, escrow_enabled)?;
                ledger.push(txn.clone());

                let mut next = item.clone();
                next.updated_at = TimeStamp::new();
                self.commit(item, next, ledger, IndexUpdate::Bind(txn.id.clone()))?;
                tracing::info!(item_id, order_id, amount, "checkout opened");
                Ok(txn)
            },
        )
    }

    /// Processor callback: funds for `order_id` are captured and held.
    /// Replayed callbacks for the same order succeed without writing.
    pub fn authorize_payment(
        &self,
        item_id: &str,
        order_id: &str,
        caller: &Caller,
    ) -> EscrowResult<Transaction> {
        self.audited(
            AuditAction::AuthorizePayment,
            TargetType::Product,
            item_id,
            caller,
            &[("order_id", order_id)],
            || {
                let _claim = self.claim(item_id, "authorization")?;
                let item = self.ctx.store().load_item(item_id)?;
                let role = role_of(&item, &caller.actor);
                let txn = self.active_transaction(item_id)?;
                if txn.order_id != order_id {
                    return Err(ValidationError::OrderMismatch {
                        expected: txn.order_id,
                        got: order_id.to_string(),
                    }
                    .into());
                }
                if item.status == ItemStatus::PaidHold && txn.status == TransactionStatus::PaidHold
                {
                    return Ok(txn);
                }
                ensure_legal(item.status, ItemStatus::PaidHold, role)?;

                let held = txn.advance(TransactionStatus::PaidHold)?;
                let next = item.moved_to(ItemStatus::PaidHold, None);
                self.commit(item, next, vec![held.clone()], IndexUpdate::Keep)?;
                tracing::info!(item_id, order_id, amount = held.amount, "payment held in escrow");
                Ok(held)
            },
        )
    }

    pub fn register_shipment(
        &self,
        item_id: &str,
        chat_id: &str,
        courier: &str,
        tracking_number: &str,
        caller: &Caller,
    ) -> EscrowResult<Transaction> {
        self.audited(
            AuditAction::RegisterShipment,
            TargetType::Product,
            item_id,
            caller,
            &[
                ("chat_id", chat_id),
                ("courier", courier),
                ("tracking_number", tracking_number),
            ],
            || {
                if courier.trim().is_empty() || tracking_number.trim().is_empty() {
                    return Err(ValidationError::MissingShipment.into());
                }
                let _claim = self.claim(item_id, "shipment")?;
                let item = self.ctx.store().load_item(item_id)?;
                let role = role_of(&item, &caller.actor);
                if !matches!(role, ActorRole::Seller | ActorRole::Admin) {
                    return Err(EscrowError::NotAuthorized(
                        "only the seller can register a shipment".into(),
                    ));
                }
                if item.status != ItemStatus::PaidHold {
                    return Err(EscrowError::NotInPayHoldState {
                        current: item.status,
                    });
                }
                ensure_legal(ItemStatus::PaidHold, ItemStatus::Shipping, role)?;

                let mut shipped = self
                    .active_transaction(item_id)?
                    .advance(TransactionStatus::Shipped)?;
                shipped.courier = Some(courier.trim().to_string());
                shipped.tracking_number = Some(tracking_number.trim().to_string());

                let next = item.moved_to(ItemStatus::Shipping, None);
                self.commit(item, next, vec![shipped.clone()], IndexUpdate::Keep)?;
                tracing::info!(item_id, chat_id, courier, "shipment registered");
                Ok(shipped)
            },
        )
    }

    /// Carrier or buyer reports the parcel delivered. No funds move.
    pub fn confirm_delivery(
        &self,
        item_id: &str,
        chat_id: &str,
        caller: &Caller,
    ) -> EscrowResult<Item> {
        self.audited(
            AuditAction::ConfirmDelivery,
            TargetType::Product,
            item_id,
            caller,
            &[("chat_id", chat_id)],
            || {
                let _claim = self.claim(item_id, "delivery")?;
                let item = self.ctx.store().load_item(item_id)?;
                let role = role_of(&item, &caller.actor);
                if item.status == ItemStatus::EscrowCompleted
                    && matches!(role, ActorRole::Buyer | ActorRole::System | ActorRole::Admin)
                {
                    return Ok(item);
                }
                ensure_legal(item.status, ItemStatus::EscrowCompleted, role)?;

                let delivered = self
                    .active_transaction(item_id)?
                    .advance(TransactionStatus::Delivered)?;
                let next = item.moved_to(ItemStatus::EscrowCompleted, None);
                self.commit(item, next.clone(), vec![delivered], IndexUpdate::Keep)?;
                tracing::info!(item_id, chat_id, "delivery confirmed");
                Ok(next)
            },
        )
    }

    /// Release held funds to the seller and close the sale.
    ///
    /// Idempotent: on an item that is already `sold` the released ledger entry
    /// is returned and the processor is not called again. A confirmation that
    /// waited on another one's claim finds `sold` and returns the same entry.
    pub fn confirm_purchase(
        &self,
        item_id: &str,
        chat_id: &str,
        caller: &Caller,
    ) -> EscrowResult<Transaction> {
        let action = match caller.actor.kind {
            ActorKind::System => AuditAction::AutoConfirmPurchase,
            _ => AuditAction::ConfirmPurchase,
        };
        self.audited(
            action,
            TargetType::Product,
            item_id,
            caller,
            &[("chat_id", chat_id)],
            || {
                let claim = self.claim(item_id, "release")?;
                let item = self.ctx.store().load_item(item_id)?;
                let role = role_of(&item, &caller.actor);
                if !matches!(role, ActorRole::Buyer | ActorRole::System | ActorRole::Admin) {
                    return Err(EscrowError::NotAuthorized(
                        "only the buyer can confirm a purchase".into(),
                    ));
                }
                match item.status {
                    ItemStatus::Sold => return self.released_transaction(item_id),
                    ItemStatus::Shipping => {
                        ensure_legal(ItemStatus::Shipping, ItemStatus::EscrowCompleted, role)?
                    }
                    ItemStatus::EscrowCompleted => {}
                    other => {
                        return Err(EscrowError::InvalidTransition {
                            from: other,
                            to: ItemStatus::Sold,
                        });
                    }
                }
                ensure_legal(ItemStatus::EscrowCompleted, ItemStatus::Sold, role)?;

                let txn = self.active_transaction(item_id)?;
                if txn.disputed && role == ActorRole::System {
                    return Err(EscrowError::NotAuthorized(
                        "transaction is under dispute".into(),
                    ));
                }
                self.ctx.processor().release(&SettlementRequest {
                    order_id: txn.order_id.clone(),
                    amount: txn.amount,
                    idempotency_key: idempotency_key("release", &txn.order_id),
                })?;

                let delivered = match txn.status {
                    TransactionStatus::Shipped => txn.advance(TransactionStatus::Delivered)?,
                    _ => txn,
                };
                let released = delivered.advance(TransactionStatus::Released)?;
                let next = item.moved_to(ItemStatus::Sold, None);
                let ledger = vec![released.clone()];
                if let Err(err) = self.commit(item, next, ledger, IndexUpdate::Clear) {
                    tracing::error!(
                        item_id,
                        order_id = %released.order_id,
                        error = %err,
                        "funds released but commit failed; item held for a retry"
                    );
                    claim.orphan();
                    return Err(err);
                }
                tracing::info!(
                    item_id,
                    chat_id,
                    amount = released.released_amount,
                    "funds released to seller"
                );
                Ok(released)
            },
        )
    }

    fn released_transaction(&self, item_id: &str) -> EscrowResult<Transaction> {
        self.ctx
            .store()
            .transactions_for_item(item_id)?
            .into_iter()
            .rev()
            .find(|txn| txn.status == TransactionStatus::Released)
            .ok_or_else(|| EscrowError::NotFound {
                kind: "released transaction",
                id: item_id.to_string(),
            })
    }

    /// Undo a deal. Before payment the reservation is released and the item is
    /// listed again; after payment the processor refunds the buyer first.
    pub fn cancel_transaction(
        &self,
        item_id: &str,
        chat_id: &str,
        reason: &str,
        caller: &Caller,
    ) -> EscrowResult<Item> {
        self.audited(
            AuditAction::CancelTransaction,
            TargetType::Product,
            item_id,
            caller,
            &[("chat_id", chat_id), ("reason", reason)],
            || {
                if reason.trim().is_empty() {
                    return Err(ValidationError::EmptyReason.into());
                }
                let claim = self.claim(item_id, "refund")?;
                let item = self.ctx.store().load_item(item_id)?;
                let role = role_of(&item, &caller.actor);
                if role == ActorRole::Neither {
                    return Err(EscrowError::NotAuthorized(
                        "only the buyer or seller can cancel".into(),
                    ));
                }

                match item.status {
                    ItemStatus::Reserved => {
                        ensure_legal(ItemStatus::Reserved, ItemStatus::Active, role)?;
                        let (ledger, index) =
                            match self.ctx.store().active_transaction_for(item_id)? {
                                Some(txn) => (
                                    vec![txn.advance(TransactionStatus::Cancelled)?],
                                    IndexUpdate::Clear,
                                ),
                                None => (vec![], IndexUpdate::Keep),
                            };
                        let next = item.moved_to(ItemStatus::Active, None);
                        self.commit(item, next.clone(), ledger, index)?;
                        tracing::info!(
                            item_id,
                            chat_id,
                            reason,
                            "reservation cancelled, item relisted"
                        );
                        Ok(next)
                    }
                    ItemStatus::PaidHold | ItemStatus::Shipping => {
                        ensure_legal(item.status, ItemStatus::Refunded, role)?;
                        let txn = self.active_transaction(item_id)?;
                        self.ctx.processor().refund(
                            &SettlementRequest {
                                order_id: txn.order_id.clone(),
                                amount: txn.amount,
                                idempotency_key: idempotency_key("refund", &txn.order_id),
                            },
                            reason,
                        )?;

                        let refunded = txn.advance(TransactionStatus::Refunded)?;
                        let next = item.moved_to(ItemStatus::Refunded, None);
                        let order_id = refunded.order_id.clone();
                        if let Err(err) =
                            self.commit(item, next.clone(), vec![refunded], IndexUpdate::Clear)
                        {
                            tracing::error!(
                                item_id,
                                order_id = %order_id,
                                error = %err,
                                "refund sent but commit failed; item held for a retry"
                            );
                            claim.orphan();
                            return Err(err);
                        }
                        tracing::info!(item_id, chat_id, reason, "payment refunded");
                        Ok(next)
                    }
                    other => Err(EscrowError::InvalidTransition {
                        from: other,
                        to: ItemStatus::Cancelled,
                    }),
                }
            },
        )
    }

    /// Flag a funded deal for manual review. Status is unchanged; the sweep
    /// stops auto-releasing the funds.
    pub fn escalate_dispute(
        &self,
        item_id: &str,
        chat_id: &str,
        reason: &str,
        caller: &Caller,
    ) -> EscrowResult<Transaction> {
        self.audited(
            AuditAction::EscalateDispute,
            TargetType::Dispute,
            item_id,
            caller,
            &[("chat_id", chat_id), ("reason", reason)],
            || {
                if reason.trim().is_empty() {
                    return Err(ValidationError::EmptyReason.into());
                }
                let _claim = self.claim(item_id, "dispute")?;
                let item = self.ctx.store().load_item(item_id)?;
                if matches!(role_of(&item, &caller.actor), ActorRole::Neither) {
                    return Err(EscrowError::NotAuthorized(
                        "only the buyer or seller can open a dispute".into(),
                    ));
                }
                if !matches!(
                    item.status,
                    ItemStatus::PaidHold | ItemStatus::Shipping | ItemStatus::EscrowCompleted
                ) {
                    return Err(ValidationError::NotDisputable {
                        status: item.status,
                    }
                    .into());
                }

                let mut txn = self.active_transaction(item_id)?;
                txn.disputed = true;
                txn.updated_at = TimeStamp::new();
                let mut next = item.clone();
                next.updated_at = TimeStamp::new();
                self.commit(item, next, vec![txn.clone()], IndexUpdate::Keep)?;
                tracing::warn!(item_id, chat_id, reason, "dispute escalated");
                Ok(txn)
            },
        )
    }

    /// Confirm every shipment left unanswered for longer than the configured
    /// window, acting as the system. Disputed deals are left alone.
    pub fn sweep_overdue_shipments(&self, now: &TimeStamp<Utc>) -> EscrowResult<SweepReport> {
        let window = self.ctx.config().auto_confirm_after();
        let overdue = self.ctx.store().find_items(|item| {
            matches!(
                item.status,
                ItemStatus::Shipping | ItemStatus::EscrowCompleted
            ) && item.updated_at.elapsed_until(now) >= window
        })?;

        let system = Caller::system();
        let mut report = SweepReport::default();
        for item in overdue {
            if let Some(txn) = self.ctx.store().active_transaction_for(&item.id)?
                && txn.disputed
            {
                report.skipped_disputed.push(item.id);
                continue;
            }
            match self.confirm_purchase(&item.id, "", &system) {
                Ok(_) => report.confirmed.push(item.id),
                Err(err) => report.failed.push((item.id, err.to_string())),
            }
        }
        tracing::info!(
            confirmed = report.confirmed.len(),
            skipped = report.skipped_disputed.len(),
            failed = report.failed.len(),
            "auto-confirm sweep finished"
        );
        Ok(report)
    }
}
