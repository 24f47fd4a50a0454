//! Read-side classification of a user's items
//!
//! Pure queries. Nothing here can change an item's status.
use super::error::{EscrowError, EscrowResult, ValidationError};
use super::item::{Item, ItemStatus};
use super::store::MarketStore;
use std::collections::HashSet;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MyItemsType {
    All,
    Selling,
    Buying,
    Trading,
    Sold,
    PaymentCompleted,
}

impl FromStr for MyItemsType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(MyItemsType::All),
            "selling" => Ok(MyItemsType::Selling),
            "buying" => Ok(MyItemsType::Buying),
            "trading" => Ok(MyItemsType::Trading),
            "sold" => Ok(MyItemsType::Sold),
            "payment_completed" => Ok(MyItemsType::PaymentCompleted),
            other => Err(ValidationError::UnknownItemsType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Party {
    Seller,
    Buyer,
    Either,
}

#[derive(Debug, Clone, Copy)]
struct BucketQuery {
    party: Party,
    statuses: &'static [ItemStatus],
}

impl BucketQuery {
    fn matches(&self, item: &Item, user_id: &str) -> bool {
        let party = match self.party {
            Party::Seller => item.seller_id == user_id,
            Party::Buyer => item.buyer_id.as_deref() == Some(user_id),
            Party::Either => item.is_party(user_id),
        };
        party && self.statuses.contains(&item.status)
    }
}

const SELLING: BucketQuery = BucketQuery {
    party: Party::Seller,
    statuses: &[ItemStatus::Active],
};
const TRADING: BucketQuery = BucketQuery {
    party: Party::Either,
    statuses: &ItemStatus::IN_PROGRESS,
};
const BUYING: BucketQuery = BucketQuery {
    party: Party::Buyer,
    statuses: &ItemStatus::IN_PROGRESS,
};
const SOLD: BucketQuery = BucketQuery {
    party: Party::Either,
    statuses: &[ItemStatus::Sold],
};
const PAYMENT_COMPLETED: BucketQuery = BucketQuery {
    party: Party::Seller,
    statuses: &[ItemStatus::EscrowCompleted],
};

impl MyItemsType {
    fn queries(self) -> Vec<BucketQuery> {
        match self {
            MyItemsType::All => vec![SELLING, TRADING, BUYING, SOLD, PAYMENT_COMPLETED],
            MyItemsType::Selling => vec![SELLING],
            MyItemsType::Buying => vec![BUYING],
            MyItemsType::Trading => vec![TRADING],
            MyItemsType::Sold => vec![SOLD],
            MyItemsType::PaymentCompleted => vec![PAYMENT_COMPLETED],
        }
    }
}

pub struct MyItems<'a> {
    store: &'a MarketStore,
}

impl<'a> MyItems<'a> {
    pub fn new(store: &'a MarketStore) -> Self {
        Self { store }
    }

    /// Items in the requested buckets, de-duplicated and newest first. Bucket
    /// queries run on scoped threads when more than one is needed.
    pub fn get_my_items(&self, user_id: &str, kind: MyItemsType) -> EscrowResult<Vec<Item>> {
        let queries = kind.queries();
        let buckets: Vec<EscrowResult<Vec<Item>>> = if queries.len() == 1 {
            vec![self.run(user_id, queries[0])]
        } else {
            std::thread::scope(|scope| {
                let handles: Vec<_> = queries
                    .iter()
                    .map(|query| scope.spawn(move || self.run(user_id, *query)))
                    .collect();
                handles
                    .into_iter()
                    .map(|handle| {
                        handle.join().unwrap_or_else(|_| {
                            Err(EscrowError::Internal(anyhow::anyhow!(
                                "item query thread panicked"
                            )))
                        })
                    })
                    .collect()
            })
        };

        let mut seen = HashSet::new();
        let mut items = vec![];
        for bucket in buckets {
            for item in bucket? {
                if seen.insert(item.id.clone()) {
                    items.push(item);
                }
            }
        }
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(items)
    }

    fn run(&self, user_id: &str, query: BucketQuery) -> EscrowResult<Vec<Item>> {
        self.store.find_items(|item| query.matches(item, user_id))
    }
}
