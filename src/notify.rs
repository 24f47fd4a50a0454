//! Change feed over item records for read-side consumers (chat, my-items)
use super::error::EscrowResult;
use super::item::{Item, ItemStatus};
use super::store::decode;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemChange {
    pub item_id: String,
    pub status: ItemStatus,
    pub buyer_id: Option<String>,
}

/// System message a chat consumer posts into the deal's thread.
pub fn system_message(status: ItemStatus) -> Option<&'static str> {
    match status {
        ItemStatus::Reserved => Some("The item has been reserved for you."),
        ItemStatus::PaidHold => Some("Payment is held safely until you confirm delivery."),
        ItemStatus::Shipping => Some("The seller has shipped the item."),
        ItemStatus::EscrowCompleted => Some("Delivery confirmed. Please confirm your purchase."),
        ItemStatus::Sold => Some("Purchase confirmed. Payment released to the seller."),
        ItemStatus::Cancelled => Some("This deal was cancelled."),
        ItemStatus::Refunded => Some("The payment was refunded."),
        ItemStatus::Active => None,
    }
}

pub struct ItemFeed {
    subscriber: sled::Subscriber,
}

impl ItemFeed {
    pub(crate) fn new(subscriber: sled::Subscriber) -> Self {
        Self { subscriber }
    }

    /// Next item write, or `None` if nothing arrived within `timeout`.
    pub fn next_change(&mut self, timeout: Duration) -> EscrowResult<Option<ItemChange>> {
        loop {
            match self.subscriber.next_timeout(timeout) {
                Ok(sled::Event::Insert { value, .. }) => {
                    let item: Item = decode(&value)?;
                    return Ok(Some(ItemChange {
                        item_id: item.id,
                        status: item.status,
                        buyer_id: item.buyer_id,
                    }));
                }
                // items are never removed; ignore anything else
                Ok(sled::Event::Remove { .. }) => continue,
                Err(_) => return Ok(None),
            }
        }
    }
}
