//! Listings and their lifecycle status
use super::error::{EscrowResult, ValidationError};
use super::types::TimeStamp;
use super::utils::{ITEM_HRP, new_uuid_to_bech32};
use chrono::Utc;
use std::fmt;

#[derive(
    minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub enum ItemStatus {
    #[n(0)]
    Active,
    #[n(1)]
    Reserved,
    #[n(2)]
    PaidHold,
    #[n(3)]
    Shipping,
    #[n(4)]
    EscrowCompleted,
    #[n(5)]
    Sold,
    #[n(6)]
    Cancelled,
    #[n(7)]
    Refunded,
}

impl ItemStatus {
    pub const ALL: [ItemStatus; 8] = [
        ItemStatus::Active,
        ItemStatus::Reserved,
        ItemStatus::PaidHold,
        ItemStatus::Shipping,
        ItemStatus::EscrowCompleted,
        ItemStatus::Sold,
        ItemStatus::Cancelled,
        ItemStatus::Refunded,
    ];

    /// Statuses of an item somebody is actively buying.
    pub const IN_PROGRESS: [ItemStatus; 4] = [
        ItemStatus::Reserved,
        ItemStatus::PaidHold,
        ItemStatus::Shipping,
        ItemStatus::EscrowCompleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Active => "active",
            ItemStatus::Reserved => "reserved",
            ItemStatus::PaidHold => "paid_hold",
            ItemStatus::Shipping => "shipping",
            ItemStatus::EscrowCompleted => "escrow_completed",
            ItemStatus::Sold => "sold",
            ItemStatus::Cancelled => "cancelled",
            ItemStatus::Refunded => "refunded",
        }
    }

    /// Funds are captured, or have been settled, while the item is here.
    pub fn is_payment_bearing(&self) -> bool {
        matches!(
            self,
            ItemStatus::PaidHold
                | ItemStatus::Shipping
                | ItemStatus::EscrowCompleted
                | ItemStatus::Sold
                | ItemStatus::Refunded
        )
    }

    /// Whether an item in this status must carry a bound buyer.
    pub fn requires_buyer(&self) -> bool {
        !matches!(self, ItemStatus::Active | ItemStatus::Cancelled)
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(
    minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub enum ShippingType {
    #[n(0)]
    Parcel,
    #[n(1)]
    Meetup,
    #[n(2)]
    Freight,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    #[n(0)]
    Guitar,
    #[n(1)]
    Bass,
    #[n(2)]
    Keyboard,
    #[n(3)]
    Drums,
    #[n(4)]
    Wind,
    #[n(5)]
    Strings,
    #[n(6)]
    Audio,
    #[n(7)]
    Other,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Item {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub seller_id: String,
    #[n(2)]
    pub buyer_id: Option<String>,
    #[n(3)]
    pub price: u64, // KRW, no minor unit
    #[n(4)]
    pub status: ItemStatus,
    #[n(5)]
    pub shipping_types: Vec<ShippingType>,
    #[n(6)]
    pub created_at: TimeStamp<Utc>,
    #[n(7)]
    pub updated_at: TimeStamp<Utc>,
    #[n(8)]
    pub title: String,
    #[n(9)]
    pub category: Category,
}

impl Item {
    pub fn is_party(&self, user_id: &str) -> bool {
        self.seller_id == user_id || self.buyer_id.as_deref() == Some(user_id)
    }

    /// `buyer_id` is bound exactly when the status requires one.
    pub fn buyer_binding_holds(&self) -> bool {
        self.status.requires_buyer() == self.buyer_id.is_some()
    }

    /// Copy of this item moved to `status`, with the buyer binding adjusted.
    pub(crate) fn moved_to(&self, status: ItemStatus, buyer_id: Option<String>) -> Item {
        let mut next = self.clone();
        next.status = status;
        next.buyer_id = if status.requires_buyer() {
            buyer_id.or_else(|| self.buyer_id.clone())
        } else {
            None
        };
        next.updated_at = TimeStamp::new();
        next
    }
}

// Seller-side draft of a new listing
#[derive(Debug, Default, Clone)]
pub struct ItemDraft {
    seller_id: Option<String>,
    title: Option<String>,
    category: Option<Category>,
    price: u64,
    shipping_types: Vec<ShippingType>,
}

impl ItemDraft {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_seller(mut self, seller_id: impl Into<String>) -> Self {
        self.seller_id = Some(seller_id.into());
        self
    }
    pub fn set_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
    pub fn set_category(mut self, category: Category) -> Self {
        self.category = Some(category);
        self
    }
    pub fn set_price(mut self, price: u64) -> Self {
        self.price = price;
        self
    }
    pub fn add_shipping_type(mut self, shipping: ShippingType) -> Self {
        if !self.shipping_types.contains(&shipping) {
            self.shipping_types.push(shipping);
            self.shipping_types.sort();
        }
        self
    }

    /// Checks fields and produces an `active` listing with a fresh id.
    pub fn validate_and_finalise(self) -> EscrowResult<Item> {
        let seller_id = self
            .seller_id
            .filter(|s| !s.trim().is_empty())
            .ok_or(ValidationError::MissingSeller)?;
        let title = self
            .title
            .filter(|t| !t.trim().is_empty())
            .ok_or(ValidationError::MissingTitle)?;
        if self.price == 0 {
            return Err(ValidationError::ZeroPrice.into());
        }
        if self.shipping_types.is_empty() {
            return Err(ValidationError::NoShippingTypes.into());
        }

        let now = TimeStamp::new();
        Ok(Item {
            id: new_uuid_to_bech32(ITEM_HRP)?,
            seller_id,
            buyer_id: None,
            price: self.price,
            status: ItemStatus::Active,
            shipping_types: self.shipping_types,
            created_at: now.clone(),
            updated_at: now,
            title,
            category: self.category.unwrap_or(Category::Other),
        })
    }
}
