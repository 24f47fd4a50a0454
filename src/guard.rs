//! Reservation guard
//!
//! Binds one buyer to an `active` item. The compare-and-swap on the stored
//! item record is the only synchronisation; of any number of concurrent
//! callers exactly one observes its own write.
use super::error::{EscrowError, EscrowResult};
use super::item::{Item, ItemStatus};
use super::lifecycle::{ActorRole, ensure_legal};
use super::store::{MarketStore, SwapOutcome};
use super::types::Actor;

pub struct ReservationGuard<'a> {
    store: &'a MarketStore,
}

impl<'a> ReservationGuard<'a> {
    pub fn new(store: &'a MarketStore) -> Self {
        Self { store }
    }

    /// Buyer reserves the item for themselves.
    pub fn reserve(&self, item_id: &str, buyer_id: &str) -> EscrowResult<Item> {
        self.bind(item_id, buyer_id, ActorRole::Buyer)
    }

    /// Seller accepts a buyer's purchase application.
    pub fn approve_application(
        &self,
        item_id: &str,
        buyer_id: &str,
        seller: &Actor,
    ) -> EscrowResult<Item> {
        let item = self.store.load_item(item_id)?;
        if seller.id != item.seller_id {
            return Err(EscrowError::NotAuthorized(
                "only the seller can approve an application".into(),
            ));
        }
        self.bind(item_id, buyer_id, ActorRole::Seller)
    }

    fn bind(&self, item_id: &str, buyer_id: &str, role: ActorRole) -> EscrowResult<Item> {
        loop {
            let (raw, current) = self.store.load_item_raw(item_id)?;
            if current.seller_id == buyer_id {
                return Err(EscrowError::NotAuthorized(
                    "sellers cannot reserve their own listing".into(),
                ));
            }
            if current.status != ItemStatus::Active {
                return Err(Self::rejection(&current, buyer_id));
            }
            ensure_legal(ItemStatus::Active, ItemStatus::Reserved, role)?;

            let next = current.moved_to(ItemStatus::Reserved, Some(buyer_id.to_string()));
            match self.store.swap_item(&raw, &next)? {
                SwapOutcome::Swapped => {
                    tracing::info!(item_id, buyer_id, "item reserved");
                    return Ok(next);
                }
                SwapOutcome::Conflict(None) => {
                    return Err(EscrowError::NotFound {
                        kind: "item",
                        id: item_id.to_string(),
                    });
                }
                SwapOutcome::Conflict(Some(observed)) if observed.status != ItemStatus::Active => {
                    tracing::debug!(item_id, buyer_id, "lost reservation race");
                    return Err(Self::rejection(&observed, buyer_id));
                }
                // record changed without leaving `active`; try again on the fresh copy
                SwapOutcome::Conflict(Some(_)) => continue,
            }
        }
    }

    fn rejection(current: &Item, buyer_id: &str) -> EscrowError {
        match &current.buyer_id {
            Some(winner) if winner != buyer_id => EscrowError::AlreadyReserved {
                winner: winner.clone(),
            },
            _ => EscrowError::InvalidTransition {
                from: current.status,
                to: ItemStatus::Reserved,
            },
        }
    }
}
