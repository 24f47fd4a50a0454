use anyhow::Context;
use chrono::{TimeDelta, Utc};
use instrument_escrow::audit::{AuditAction, AuditStatus};
use instrument_escrow::config::MarketConfig;
use instrument_escrow::context::MarketContext;
use instrument_escrow::error::{ErrorKind, EscrowError};
use instrument_escrow::item::{Category, Item, ItemDraft, ItemStatus, ShippingType};
use instrument_escrow::ledger::TransactionStatus;
use instrument_escrow::my_items::MyItemsType;
use instrument_escrow::processor::{
    PaymentProcessor, ProcessorError, SandboxProcessor, SettlementRequest,
};
use instrument_escrow::types::{Actor, Caller, RequestMeta, TimeStamp};
use instrument_escrow::utils::{self, USER_HRP};
use std::sync::{Arc, Barrier};
use std::time::Duration;

use tempfile::tempdir; // Use for test db cleanup.

const PRICE: u64 = 1_250_000;

struct Market {
    _dir: tempfile::TempDir,
    ctx: Arc<MarketContext>,
    processor: Arc<SandboxProcessor>,
    seller: String,
    buyer: String,
    item: Item,
}

// Gateway that takes its time, so settlements overlap.
struct SlowProcessor(Arc<SandboxProcessor>);

impl SlowProcessor {
    const DELAY: Duration = Duration::from_millis(100);
}

impl PaymentProcessor for SlowProcessor {
    fn release(&self, request: &SettlementRequest) -> Result<(), ProcessorError> {
        std::thread::sleep(Self::DELAY);
        self.0.release(request)
    }

    fn refund(&self, request: &SettlementRequest, reason: &str) -> Result<(), ProcessorError> {
        std::thread::sleep(Self::DELAY);
        self.0.refund(request, reason)
    }
}

fn market(name: &str) -> anyhow::Result<Market> {
    market_with(name, |sandbox| sandbox)
}

// Every test gets its own sled database in a temp dir; sled holds a file
// lock so databases cannot be shared between tests.
fn market_with(
    name: &str,
    gateway: impl FnOnce(Arc<SandboxProcessor>) -> Arc<dyn PaymentProcessor>,
) -> anyhow::Result<Market> {
    let dir = tempdir()?;
    let db_path = dir.path().join(name);
    let db = Arc::new(sled::open(&db_path)?);
    let processor = Arc::new(SandboxProcessor::new());
    let config = MarketConfig::new(db_path, "test_ck_sandbox").with_auto_confirm_days(7);
    let ctx = MarketContext::new(db, gateway(processor.clone()), config)?;

    let seller = utils::new_uuid_to_bech32(USER_HRP)?;
    let buyer = utils::new_uuid_to_bech32(USER_HRP)?;
    let item = ctx.create_item(
        ItemDraft::new()
            .set_seller(seller.as_str())
            .set_title("Gibson Les Paul Standard 2019")
            .set_category(Category::Guitar)
            .set_price(PRICE)
            .add_shipping_type(ShippingType::Parcel)
            .add_shipping_type(ShippingType::Meetup),
    )?;

    Ok(Market {
        _dir: dir,
        ctx: Arc::new(ctx),
        processor,
        seller,
        buyer,
        item,
    })
}

fn user(id: &str) -> Caller {
    Caller::new(Actor::user(id)).with_request(RequestMeta::new("203.0.113.7", "market-ios/4.2"))
}

/// Reserve, check out and capture payment: leaves the item in `paid_hold`.
fn pay(m: &Market, order_id: &str) -> anyhow::Result<()> {
    m.ctx.guard().reserve(&m.item.id, &m.buyer)?;
    m.ctx
        .escrow()
        .open_transaction(&m.item.id, order_id, PRICE, true, &user(&m.buyer))?;
    m.ctx
        .escrow()
        .authorize_payment(&m.item.id, order_id, &Caller::system())?;
    Ok(())
}

/// Pay and ship with a slow gateway: leaves the item in `shipping`.
fn slow_shipped_market(name: &str, order_id: &str) -> anyhow::Result<Market> {
    let m = market_with(name, |sandbox| Arc::new(SlowProcessor(sandbox)))?;
    pay(&m, order_id)?;
    m.ctx
        .escrow()
        .register_shipment(&m.item.id, "chat_r", "Hanjin", "5550-9", &user(&m.seller))?;
    Ok(m)
}

fn ids(items: &[Item]) -> Vec<&str> {
    items.iter().map(|item| item.id.as_str()).collect()
}

#[test]
fn escrow_purchase_end_to_end() -> anyhow::Result<()> {
    let m = market("test_end_to_end.db")?;
    let escrow = m.ctx.escrow();
    let item_id = m.item.id.as_str();

    let reserved = m.ctx.guard().reserve(item_id, &m.buyer)?;
    assert_eq!(reserved.status, ItemStatus::Reserved);
    assert_eq!(reserved.buyer_id.as_deref(), Some(m.buyer.as_str()));

    escrow
        .open_transaction(item_id, "order-e2e", PRICE, true, &user(&m.buyer))
        .context("checkout failed: ")?;
    let held = escrow.authorize_payment(item_id, "order-e2e", &Caller::system())?;
    assert_eq!(held.status, TransactionStatus::PaidHold);
    assert_eq!(m.ctx.store().load_item(item_id)?.status, ItemStatus::PaidHold);

    let buying = m.ctx.my_items().get_my_items(&m.buyer, MyItemsType::Buying)?;
    assert_eq!(ids(&buying), vec![item_id]);

    let shipped = escrow
        .register_shipment(item_id, "chat_1", "CJ Logistics", "6891-2231-0042", &user(&m.seller))
        .context("shipment failed: ")?;
    assert_eq!(shipped.tracking_number.as_deref(), Some("6891-2231-0042"));
    assert_eq!(m.ctx.store().load_item(item_id)?.status, ItemStatus::Shipping);

    escrow.confirm_delivery(item_id, "chat_1", &user(&m.buyer))?;
    let completed = m
        .ctx
        .my_items()
        .get_my_items(&m.seller, MyItemsType::PaymentCompleted)?;
    assert_eq!(ids(&completed), vec![item_id]);

    let released = escrow
        .confirm_purchase(item_id, "chat_1", &user(&m.buyer))
        .context("confirmation failed: ")?;
    assert_eq!(released.status, TransactionStatus::Released);
    assert_eq!(released.released_amount, PRICE);
    assert_eq!(m.processor.released_total("order-e2e"), PRICE);
    let completed = m
        .ctx
        .my_items()
        .get_my_items(&m.seller, MyItemsType::PaymentCompleted)?;
    assert!(completed.is_empty());

    let sold = m.ctx.store().load_item(item_id)?;
    assert_eq!(sold.status, ItemStatus::Sold);
    assert!(sold.buyer_binding_holds());
    for user_id in [&m.seller, &m.buyer] {
        let items = m.ctx.my_items().get_my_items(user_id, MyItemsType::Sold)?;
        assert_eq!(ids(&items), vec![item_id]);
    }

    Ok(())
}

#[test]
fn refund_then_shipment_is_rejected() -> anyhow::Result<()> {
    let m = market("test_refund.db")?;
    pay(&m, "order-refund")?;

    let refunded = m.ctx.escrow().cancel_transaction(
        &m.item.id,
        "chat_2",
        "changed my mind",
        &user(&m.buyer),
    )?;
    assert_eq!(refunded.status, ItemStatus::Refunded);
    assert_eq!(m.processor.refunded_total("order-refund"), PRICE);
    assert_eq!(m.processor.released_total("order-refund"), 0);

    let err = m
        .ctx
        .escrow()
        .register_shipment(&m.item.id, "chat_2", "CJ Logistics", "1234", &user(&m.seller))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidTransition);
    assert_eq!(m.ctx.store().load_item(&m.item.id)?.status, ItemStatus::Refunded);

    let history = m.ctx.store().transactions_for_item(&m.item.id)?;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, TransactionStatus::Refunded);
    assert_eq!(history[0].refunded_amount, PRICE);

    Ok(())
}

#[test]
fn cancel_before_payment_relists_the_item() -> anyhow::Result<()> {
    let m = market("test_relist.db")?;
    m.ctx.guard().reserve(&m.item.id, &m.buyer)?;
    m.ctx
        .escrow()
        .open_transaction(&m.item.id, "order-relist", PRICE, true, &user(&m.buyer))?;

    let relisted = m.ctx.escrow().cancel_transaction(
        &m.item.id,
        "chat_3",
        "buyer stopped answering",
        &user(&m.seller),
    )?;
    assert_eq!(relisted.status, ItemStatus::Active);
    assert!(relisted.buyer_id.is_none());
    assert!(m.ctx.store().active_transaction_for(&m.item.id)?.is_none());
    assert_eq!(m.processor.calls(), 0);

    let other = utils::new_uuid_to_bech32(USER_HRP)?;
    let again = m.ctx.guard().reserve(&m.item.id, &other)?;
    assert_eq!(again.buyer_id.as_deref(), Some(other.as_str()));

    Ok(())
}

#[test]
fn confirm_purchase_releases_funds_once() -> anyhow::Result<()> {
    let m = market("test_idempotent_confirm.db")?;
    pay(&m, "order-once")?;
    m.ctx
        .escrow()
        .register_shipment(&m.item.id, "chat_4", "Hanjin", "5550-1", &user(&m.seller))?;

    let first = m
        .ctx
        .escrow()
        .confirm_purchase(&m.item.id, "chat_4", &user(&m.buyer))?;
    let second = m
        .ctx
        .escrow()
        .confirm_purchase(&m.item.id, "chat_4", &user(&m.buyer))?;

    assert_eq!(first.id, second.id);
    assert_eq!(m.processor.released_total("order-once"), PRICE);
    assert_eq!(m.processor.calls(), 1);
    assert_eq!(m.ctx.store().load_item(&m.item.id)?.status, ItemStatus::Sold);

    Ok(())
}

#[test]
fn racing_confirmations_credit_the_seller_once() -> anyhow::Result<()> {
    let m = market("test_racing_confirm.db")?;
    pay(&m, "order-race")?;
    m.ctx
        .escrow()
        .register_shipment(&m.item.id, "chat_5", "Hanjin", "5550-2", &user(&m.seller))?;

    let barrier = Barrier::new(2);
    let callers = [user(&m.buyer), Caller::system()];
    let results: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = callers
            .iter()
            .map(|caller| {
                let barrier = &barrier;
                let ctx = &m.ctx;
                let item_id = m.item.id.as_str();
                scope.spawn(move || {
                    barrier.wait();
                    ctx.escrow().confirm_purchase(item_id, "chat_5", caller)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for result in &results {
        assert!(result.is_ok(), "{result:?}");
    }
    assert_eq!(m.processor.released_total("order-race"), PRICE);
    assert_eq!(m.ctx.store().load_item(&m.item.id)?.status, ItemStatus::Sold);

    Ok(())
}

#[test]
fn release_and_refund_race_moves_money_once() -> anyhow::Result<()> {
    let m = slow_shipped_market("test_release_refund_race.db", "order-rr")?;
    let barrier = Barrier::new(2);
    let buyer = user(&m.buyer);
    let item_id = m.item.id.as_str();

    let (confirmed, cancelled) = std::thread::scope(|scope| {
        let confirm = scope.spawn(|| {
            barrier.wait();
            m.ctx.escrow().confirm_purchase(item_id, "chat_r", &buyer)
        });
        let cancel = scope.spawn(|| {
            barrier.wait();
            m.ctx
                .escrow()
                .cancel_transaction(item_id, "chat_r", "seller went quiet", &buyer)
        });
        (confirm.join().unwrap(), cancel.join().unwrap())
    });

    assert_ne!(confirmed.is_ok(), cancelled.is_ok());
    let released = m.processor.released_total("order-rr");
    let refunded = m.processor.refunded_total("order-rr");
    assert_eq!(released + refunded, PRICE);
    assert_eq!(m.processor.calls(), 1);

    let item = m.ctx.store().load_item(item_id)?;
    match (confirmed, cancelled) {
        (Ok(_), Err(err)) => {
            assert_eq!(err.kind(), ErrorKind::InvalidTransition);
            assert_eq!(item.status, ItemStatus::Sold);
            assert_eq!(released, PRICE);
        }
        (Err(err), Ok(_)) => {
            assert_eq!(err.kind(), ErrorKind::InvalidTransition);
            assert_eq!(item.status, ItemStatus::Refunded);
            assert_eq!(refunded, PRICE);
        }
        other => panic!("expected exactly one settlement, got {other:?}"),
    }
    assert!(m.ctx.store().active_transaction_for(item_id)?.is_none());

    Ok(())
}

#[test]
fn dispute_racing_auto_confirm_never_lands_after_release() -> anyhow::Result<()> {
    let m = slow_shipped_market("test_dispute_race.db", "order-dr")?;
    let barrier = Barrier::new(2);
    let buyer = user(&m.buyer);
    let system = Caller::system();
    let item_id = m.item.id.as_str();

    let (confirmed, disputed) = std::thread::scope(|scope| {
        let confirm = scope.spawn(|| {
            barrier.wait();
            m.ctx.escrow().confirm_purchase(item_id, "", &system)
        });
        let dispute = scope.spawn(|| {
            barrier.wait();
            m.ctx
                .escrow()
                .escalate_dispute(item_id, "chat_r", "pickup is dead", &buyer)
        });
        (confirm.join().unwrap(), dispute.join().unwrap())
    });

    assert_ne!(confirmed.is_ok(), disputed.is_ok());
    let item = m.ctx.store().load_item(item_id)?;
    if disputed.is_ok() {
        assert_eq!(m.processor.released_total("order-dr"), 0);
        assert_eq!(item.status, ItemStatus::Shipping);
        assert!(m.ctx.store().active_transaction_for(item_id)?.is_some_and(|t| t.disputed));
    } else {
        assert_eq!(m.processor.released_total("order-dr"), PRICE);
        assert_eq!(item.status, ItemStatus::Sold);
    }

    Ok(())
}

#[test]
fn processor_failure_leaves_state_and_one_failure_entry() -> anyhow::Result<()> {
    let m = market("test_processor_failure.db")?;
    pay(&m, "order-fail")?;
    let before = m.ctx.store().load_item(&m.item.id)?;
    let audit_before = m.ctx.audit().len();

    m.processor
        .fail_next(ProcessorError::Unavailable("gateway timeout".into()));
    let err = m
        .ctx
        .escrow()
        .cancel_transaction(&m.item.id, "chat_6", "item damaged", &user(&m.buyer))
        .unwrap_err();

    assert!(matches!(err, EscrowError::PaymentProcessor(_)));
    assert_eq!(err.user_message(), "payment step failed, please retry");
    assert!(err.is_retryable());
    assert_eq!(m.ctx.store().load_item(&m.item.id)?, before);
    assert_eq!(
        m.ctx.store().active_transaction_for(&m.item.id)?.map(|t| t.status),
        Some(TransactionStatus::PaidHold)
    );

    assert_eq!(m.ctx.audit().len(), audit_before + 1);
    let cancels: Vec<_> = m
        .ctx
        .audit()
        .entries_for_target(&m.item.id)?
        .into_iter()
        .filter(|entry| entry.action == AuditAction::CancelTransaction)
        .collect();
    assert_eq!(cancels.len(), 1);
    assert_eq!(cancels[0].status, AuditStatus::Failure);
    assert!(cancels[0].error_message.is_some());

    // a retry goes through once the processor recovers
    m.ctx
        .escrow()
        .cancel_transaction(&m.item.id, "chat_6", "item damaged", &user(&m.buyer))?;
    assert_eq!(m.processor.refunded_total("order-fail"), PRICE);

    Ok(())
}

#[test]
fn every_settlement_call_writes_one_audit_entry() -> anyhow::Result<()> {
    let m = market("test_audit_completeness.db")?;
    let escrow = m.ctx.escrow();
    let item_id = m.item.id.as_str();
    m.ctx.guard().reserve(item_id, &m.buyer)?;

    escrow.open_transaction(item_id, "order-audit", PRICE, true, &user(&m.buyer))?;
    assert_eq!(m.ctx.audit().len(), 1);
    escrow.authorize_payment(item_id, "order-audit", &Caller::system())?;
    assert_eq!(m.ctx.audit().len(), 2);
    // wrong actor: rejected but still recorded
    let rejected = escrow.register_shipment(item_id, "chat_7", "CJ", "1", &user(&m.buyer));
    assert_eq!(rejected.unwrap_err().kind(), ErrorKind::NotAuthorized);
    assert_eq!(m.ctx.audit().len(), 3);
    escrow.register_shipment(item_id, "chat_7", "CJ", "1", &user(&m.seller))?;
    assert_eq!(m.ctx.audit().len(), 4);
    escrow.confirm_purchase(item_id, "chat_7", &user(&m.buyer))?;
    assert_eq!(m.ctx.audit().len(), 5);

    let entries = m.ctx.audit().entries_for_target(item_id)?;
    assert_eq!(entries.len(), 5);
    assert!(entries.iter().all(|entry| m.ctx.audit().verify(entry)));
    assert_eq!(entries[0].ip_address.as_deref(), Some("203.0.113.7"));
    assert!(entries[4].details.contains_key("duration_ms"));

    Ok(())
}

#[test]
fn concurrent_reservations_have_one_winner() -> anyhow::Result<()> {
    let m = market("test_double_reservation.db")?;
    let rival = utils::new_uuid_to_bech32(USER_HRP)?;
    let buyers = [m.buyer.clone(), rival];
    let barrier = Barrier::new(buyers.len());

    let results: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = buyers
            .iter()
            .map(|buyer| {
                let barrier = &barrier;
                let ctx = &m.ctx;
                let item_id = m.item.id.as_str();
                scope.spawn(move || {
                    barrier.wait();
                    ctx.guard().reserve(item_id, buyer)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    let winner = winners[0].buyer_id.clone().unwrap();

    let loser = results.iter().find_map(|r| r.as_ref().err()).unwrap();
    match loser {
        EscrowError::AlreadyReserved { winner: reported } => assert_eq!(reported, &winner),
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(
        m.ctx.store().load_item(&m.item.id)?.buyer_id,
        Some(winner)
    );

    Ok(())
}

#[test]
fn sweep_confirms_overdue_and_skips_disputes() -> anyhow::Result<()> {
    let m = market("test_sweep.db")?;
    pay(&m, "order-sweep")?;
    m.ctx
        .escrow()
        .register_shipment(&m.item.id, "chat_8", "Lotte", "77-1", &user(&m.seller))?;

    let disputed = m.ctx.create_item(
        ItemDraft::new()
            .set_seller(m.seller.as_str())
            .set_title("Roland Juno-106")
            .set_category(Category::Keyboard)
            .set_price(PRICE)
            .add_shipping_type(ShippingType::Freight),
    )?;
    m.ctx.guard().reserve(&disputed.id, &m.buyer)?;
    m.ctx
        .escrow()
        .open_transaction(&disputed.id, "order-dispute", PRICE, true, &user(&m.buyer))?;
    m.ctx
        .escrow()
        .authorize_payment(&disputed.id, "order-dispute", &Caller::system())?;
    m.ctx
        .escrow()
        .register_shipment(&disputed.id, "chat_9", "Lotte", "77-2", &user(&m.seller))?;
    m.ctx.escrow().escalate_dispute(
        &disputed.id,
        "chat_9",
        "arrived with a cracked panel",
        &user(&m.buyer),
    )?;

    // nothing is overdue yet
    let report = m.ctx.escrow().sweep_overdue_shipments(&TimeStamp::new())?;
    assert!(report.confirmed.is_empty());

    let later = TimeStamp::from(Utc::now() + TimeDelta::days(8));
    let report = m.ctx.escrow().sweep_overdue_shipments(&later)?;
    assert_eq!(report.confirmed, vec![m.item.id.clone()]);
    assert_eq!(report.skipped_disputed, vec![disputed.id.clone()]);
    assert!(report.failed.is_empty());

    assert_eq!(m.ctx.store().load_item(&m.item.id)?.status, ItemStatus::Sold);
    assert_eq!(m.ctx.store().load_item(&disputed.id)?.status, ItemStatus::Shipping);
    assert_eq!(m.processor.released_total("order-sweep"), PRICE);
    assert_eq!(m.processor.released_total("order-dispute"), 0);

    let auto = m
        .ctx
        .audit()
        .entries_for_target(&m.item.id)?
        .into_iter()
        .filter(|entry| entry.action == AuditAction::AutoConfirmPurchase)
        .count();
    assert_eq!(auto, 1);

    Ok(())
}

#[test]
fn item_feed_reports_reservation() -> anyhow::Result<()> {
    let m = market("test_item_feed.db")?;
    let mut feed = m.ctx.item_feed();
    m.ctx.guard().reserve(&m.item.id, &m.buyer)?;

    let change = feed
        .next_change(std::time::Duration::from_secs(2))?
        .context("no change observed")?;
    assert_eq!(change.item_id, m.item.id);
    assert_eq!(change.status, ItemStatus::Reserved);
    assert_eq!(change.buyer_id.as_deref(), Some(m.buyer.as_str()));

    Ok(())
}
