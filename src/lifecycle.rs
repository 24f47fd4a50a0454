//! Item status state machine
//!
//! The legal-transition table is a total function over
//! `(from, to, role)`. Everything that moves an item consults it, whether the
//! move is a plain reservation release or a settlement step.
use super::error::{EscrowError, EscrowResult};
use super::item::{Item, ItemStatus};
use super::ledger::TransactionStatus;
use super::store::{IndexUpdate, MarketStore, SettlementCommit};
use super::types::{Actor, ActorKind};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActorRole {
    Buyer,
    Seller,
    Admin,
    System,
    Neither,
}

impl ActorRole {
    pub const ALL: [ActorRole; 5] = [
        ActorRole::Buyer,
        ActorRole::Seller,
        ActorRole::Admin,
        ActorRole::System,
        ActorRole::Neither,
    ];

    fn is_party(&self) -> bool {
        matches!(self, ActorRole::Buyer | ActorRole::Seller)
    }

    fn is_privileged(&self) -> bool {
        matches!(self, ActorRole::Admin | ActorRole::System)
    }
}

impl fmt::Display for ActorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActorRole::Buyer => "buyer",
            ActorRole::Seller => "seller",
            ActorRole::Admin => "admin",
            ActorRole::System => "system",
            ActorRole::Neither => "neither",
        };
        f.write_str(name)
    }
}

/// The one place an actor's relation to an item is decided.
pub fn role_of(item: &Item, actor: &Actor) -> ActorRole {
    match actor.kind {
        ActorKind::Admin => ActorRole::Admin,
        ActorKind::System => ActorRole::System,
        ActorKind::User if actor.id == item.seller_id => ActorRole::Seller,
        ActorKind::User if item.buyer_id.as_deref() == Some(actor.id.as_str()) => ActorRole::Buyer,
        ActorKind::User => ActorRole::Neither,
    }
}

pub fn is_legal_transition(from: ItemStatus, to: ItemStatus, role: ActorRole) -> bool {
    use ItemStatus::*;

    match (from, to) {
        (Active, Reserved) => role.is_party(),
        // reservation released before any money moved
        (Reserved, Active) => role.is_party() || role.is_privileged(),
        (Reserved, PaidHold) => role.is_privileged(),
        (PaidHold, Shipping) => matches!(role, ActorRole::Seller | ActorRole::Admin),
        (Shipping, EscrowCompleted) | (EscrowCompleted, Sold) => {
            matches!(role, ActorRole::Buyer) || role.is_privileged()
        }
        (Reserved, Cancelled) => role.is_party() || role.is_privileged(),
        (PaidHold | Shipping, Cancelled) => role.is_privileged(),
        (PaidHold | Shipping, Refunded) => role.is_party() || role.is_privileged(),
        _ => false,
    }
}

/// Targets reachable from `current` for `role`.
pub fn valid_targets(current: ItemStatus, role: ActorRole) -> Vec<ItemStatus> {
    ItemStatus::ALL
        .into_iter()
        .filter(|to| is_legal_transition(current, *to, role))
        .collect()
}

pub(crate) fn ensure_legal(from: ItemStatus, to: ItemStatus, role: ActorRole) -> EscrowResult<()> {
    if is_legal_transition(from, to, role) {
        Ok(())
    } else {
        Err(EscrowError::InvalidTransition { from, to })
    }
}

#[derive(Debug, Clone)]
pub struct TransitionRequest {
    pub item_id: String,
    pub from_expected: ItemStatus,
    pub to: ItemStatus,
    pub actor: Actor,
}

pub struct ItemLifecycle<'a> {
    store: &'a MarketStore,
}

impl<'a> ItemLifecycle<'a> {
    pub fn new(store: &'a MarketStore) -> Self {
        Self { store }
    }

    /// Apply a non-financial transition.
    ///
    /// Moves into or out of payment-bearing states belong to the settlement
    /// functions and reservations to the reservation guard; both are refused
    /// here after the legality check. A pending ledger entry on a released
    /// reservation is cancelled in the same commit.
    pub fn transition(&self, request: &TransitionRequest) -> EscrowResult<Item> {
        let item = self.store.load_item(&request.item_id)?;
        let role = role_of(&item, &request.actor);
        ensure_legal(request.from_expected, request.to, role)?;

        if item.status != request.from_expected {
            return Err(EscrowError::StaleState {
                expected: request.from_expected,
                actual: item.status,
            });
        }
        if request.from_expected.is_payment_bearing() || request.to.is_payment_bearing() {
            return Err(EscrowError::NotAuthorized(format!(
                "{} to {} is a settlement step",
                request.from_expected, request.to
            )));
        }
        if request.to == ItemStatus::Reserved {
            return Err(EscrowError::NotAuthorized(
                "reservations are made through the reservation guard".into(),
            ));
        }

        let pending = self.store.active_transaction_for(&item.id)?;
        let (transactions, index) = match pending {
            Some(txn) => (
                vec![txn.advance(TransactionStatus::Cancelled)?],
                IndexUpdate::Clear,
            ),
            None => (vec![], IndexUpdate::Keep),
        };
        let next = item.moved_to(request.to, None);
        self.store.commit_settlement(&SettlementCommit {
            previous: item,
            next: next.clone(),
            transactions,
            index,
        })?;

        tracing::info!(
            item_id = %next.id,
            from = %request.from_expected,
            to = %request.to,
            role = %role,
            "item transition"
        );
        Ok(next)
    }
}
