//! Process-wide handles, built once at start-up and passed to every call
use super::audit::AuditLog;
use super::config::MarketConfig;
use super::direct_trade::DirectTrades;
use super::error::EscrowResult;
use super::escrow::EscrowSettlement;
use super::guard::ReservationGuard;
use super::item::{Item, ItemDraft};
use super::lifecycle::ItemLifecycle;
use super::my_items::MyItems;
use super::notify::ItemFeed;
use super::processor::PaymentProcessor;
use super::store::MarketStore;
use std::sync::Arc;

pub struct MarketContext {
    store: MarketStore,
    processor: Arc<dyn PaymentProcessor>,
    config: MarketConfig,
}

impl MarketContext {
    pub fn new(
        db: Arc<sled::Db>,
        processor: Arc<dyn PaymentProcessor>,
        config: MarketConfig,
    ) -> EscrowResult<Self> {
        Ok(Self {
            store: MarketStore::open(db)?,
            processor,
            config,
        })
    }

    /// Open the database named by `config.db_path`.
    pub fn open(config: MarketConfig, processor: Arc<dyn PaymentProcessor>) -> EscrowResult<Self> {
        let db = sled::open(&config.db_path)?;
        tracing::info!(path = %config.db_path.display(), "market store opened");
        Self::new(Arc::new(db), processor, config)
    }

    pub fn store(&self) -> &MarketStore {
        &self.store
    }

    pub fn processor(&self) -> &dyn PaymentProcessor {
        self.processor.as_ref()
    }

    pub fn config(&self) -> &MarketConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> ItemLifecycle<'_> {
        ItemLifecycle::new(&self.store)
    }

    pub fn guard(&self) -> ReservationGuard<'_> {
        ReservationGuard::new(&self.store)
    }

    pub fn audit(&self) -> AuditLog<'_> {
        AuditLog::new(&self.store)
    }

    pub fn escrow(&self) -> EscrowSettlement<'_> {
        EscrowSettlement::new(self)
    }

    pub fn direct_trades(&self) -> DirectTrades<'_> {
        DirectTrades::new(&self.store)
    }

    pub fn my_items(&self) -> MyItems<'_> {
        MyItems::new(&self.store)
    }

    pub fn item_feed(&self) -> ItemFeed {
        ItemFeed::new(self.store.watch_items())
    }

    /// Validate a seller's draft and store it as an `active` listing.
    pub fn create_item(&self, draft: ItemDraft) -> EscrowResult<Item> {
        let item = draft.validate_and_finalise()?;
        self.store.insert_item(&item)?;
        tracing::info!(
            item_id = %item.id,
            seller_id = %item.seller_id,
            price = item.price,
            "listing created"
        );
        Ok(item)
    }
}
