//! sled-backed record store
//!
//! Every write that changes an item's status goes through one of two
//! conditional primitives: [`MarketStore::swap_item`] (a compare-and-swap on the
//! encoded item record) or [`MarketStore::commit_settlement`] (a serializable
//! transaction across the item, ledger and index trees that re-checks the item
//! record before writing). There is no read-then-write path.
use super::audit::AuditLogEntry;
use super::direct_trade::DirectTradeState;
use super::error::{EscrowError, EscrowResult};
use super::item::Item;
use super::ledger::Transaction;
use sled::transaction::{ConflictableTransactionError, TransactionError, abort};
use sled::{IVec, Transactional, Tree};
use std::sync::Arc;

const ITEMS: &str = "items";
const TRANSACTIONS: &str = "transactions";
const ACTIVE_TRANSACTIONS: &str = "active_transactions";
const DIRECT_TRADES: &str = "direct_trades";
const AUDIT_LOGS: &str = "admin_audit_logs";
const SETTLEMENT_CLAIMS: &str = "settlement_claims";

pub(crate) fn encode<T: minicbor::Encode<()>>(value: &T) -> EscrowResult<Vec<u8>> {
    minicbor::to_vec(value).map_err(|e| EscrowError::Codec(e.to_string()))
}

pub(crate) fn decode<T: for<'b> minicbor::Decode<'b, ()>>(bytes: &[u8]) -> EscrowResult<T> {
    minicbor::decode(bytes).map_err(|e| EscrowError::Codec(e.to_string()))
}

/// Result of a compare-and-swap on an item record.
#[derive(Debug)]
pub(crate) enum SwapOutcome {
    Swapped,
    // the record that was found instead of the expected one
    Conflict(Option<Item>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum IndexUpdate {
    Keep,
    Bind(String),
    Clear,
}

/// One atomic unit: item record, ledger entries and the active-transaction
/// index. Applied only if the stored item still equals `previous`.
#[derive(Debug)]
pub(crate) struct SettlementCommit {
    pub previous: Item,
    pub next: Item,
    pub transactions: Vec<Transaction>,
    pub index: IndexUpdate,
}

pub struct MarketStore {
    db: Arc<sled::Db>,
    items: Tree,
    transactions: Tree,
    active_transactions: Tree,
    direct_trades: Tree,
    audit_logs: Tree,
    claims: Tree,
}

impl MarketStore {
    /// Opens every tree. Settlement claims left behind by a previous process
    /// are dropped: sled's file lock means their holders are gone.
    pub fn open(db: Arc<sled::Db>) -> EscrowResult<Self> {
        let claims = db.open_tree(SETTLEMENT_CLAIMS)?;
        if !claims.is_empty() {
            tracing::warn!(
                count = claims.len(),
                "dropping settlement claims from a previous run"
            );
            claims.clear()?;
        }
        Ok(Self {
            items: db.open_tree(ITEMS)?,
            transactions: db.open_tree(TRANSACTIONS)?,
            active_transactions: db.open_tree(ACTIVE_TRANSACTIONS)?,
            direct_trades: db.open_tree(DIRECT_TRADES)?,
            audit_logs: db.open_tree(AUDIT_LOGS)?,
            claims,
            db,
        })
    }

    // ITEMS

    /// Insert a new listing. Fails if the id is already taken.
    pub fn insert_item(&self, item: &Item) -> EscrowResult<()> {
        let bytes = encode(item)?;
        match self
            .items
            .compare_and_swap(item.id.as_bytes(), None as Option<&[u8]>, Some(bytes))?
        {
            Ok(()) => Ok(()),
            Err(_) => Err(anyhow::anyhow!("item {} already exists", item.id).into()),
        }
    }

    pub fn load_item(&self, item_id: &str) -> EscrowResult<Item> {
        self.load_item_raw(item_id).map(|(_, item)| item)
    }

    pub(crate) fn load_item_raw(&self, item_id: &str) -> EscrowResult<(IVec, Item)> {
        let raw = self
            .items
            .get(item_id.as_bytes())?
            .ok_or_else(|| EscrowError::NotFound {
                kind: "item",
                id: item_id.to_string(),
            })?;
        let item = decode(&raw)?;
        Ok((raw, item))
    }

    /// Replace the item record only if it is still byte-identical to `current`.
    pub(crate) fn swap_item(&self, current: &IVec, next: &Item) -> EscrowResult<SwapOutcome> {
        let bytes = encode(next)?;
        match self
            .items
            .compare_and_swap(next.id.as_bytes(), Some(current), Some(bytes))?
        {
            Ok(()) => Ok(SwapOutcome::Swapped),
            Err(cas) => {
                let observed = cas.current.map(|raw| decode::<Item>(&raw)).transpose()?;
                Ok(SwapOutcome::Conflict(observed))
            }
        }
    }

    /// Items matching `predicate`, decoded lazily from a full scan.
    pub fn find_items<F>(&self, predicate: F) -> EscrowResult<Vec<Item>>
    where
        F: Fn(&Item) -> bool,
    {
        let mut found = vec![];
        for raw in self.items.iter().values() {
            let item: Item = decode(&raw?)?;
            if predicate(&item) {
                found.push(item);
            }
        }
        Ok(found)
    }

    pub(crate) fn watch_items(&self) -> sled::Subscriber {
        self.items.watch_prefix(b"")
    }

    // LEDGER

    pub fn load_transaction(&self, transaction_id: &str) -> EscrowResult<Transaction> {
        let raw = self
            .transactions
            .get(transaction_id.as_bytes())?
            .ok_or_else(|| EscrowError::NotFound {
                kind: "transaction",
                id: transaction_id.to_string(),
            })?;
        decode(&raw)
    }

    /// The single non-terminal transaction bound to an item, if any.
    pub fn active_transaction_for(&self, item_id: &str) -> EscrowResult<Option<Transaction>> {
        match self.active_transactions.get(item_id.as_bytes())? {
            Some(id) => {
                let id = String::from_utf8(id.to_vec())
                    .map_err(|e| EscrowError::Codec(e.to_string()))?;
                self.load_transaction(&id).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Every ledger entry ever written for an item, oldest first.
    pub fn transactions_for_item(&self, item_id: &str) -> EscrowResult<Vec<Transaction>> {
        let mut found = vec![];
        for raw in self.transactions.iter().values() {
            let txn: Transaction = decode(&raw?)?;
            if txn.product_id == item_id {
                found.push(txn);
            }
        }
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(found)
    }

    pub(crate) fn commit_settlement(&self, commit: &SettlementCommit) -> EscrowResult<()> {
        let item_key = commit.next.id.clone();
        let item_bytes = encode(&commit.next)?;
        let ledger = commit
            .transactions
            .iter()
            .map(|txn| Ok((txn.id.clone(), encode(txn)?)))
            .collect::<EscrowResult<Vec<_>>>()?;

        let outcome = (&self.items, &self.transactions, &self.active_transactions).transaction(
            |(items, txns, index)| {
                let Some(raw) = items.get(item_key.as_bytes())? else {
                    return abort(EscrowError::NotFound {
                        kind: "item",
                        id: item_key.clone(),
                    });
                };
                let current: Item = decode(&raw).map_err(ConflictableTransactionError::Abort)?;
                if current != commit.previous {
                    return abort(EscrowError::StaleState {
                        expected: commit.previous.status,
                        actual: current.status,
                    });
                }

                items.insert(item_key.as_bytes(), item_bytes.clone())?;
                for (id, bytes) in &ledger {
                    txns.insert(id.as_bytes(), bytes.clone())?;
                }
                match &commit.index {
                    IndexUpdate::Keep => {}
                    IndexUpdate::Bind(id) => {
                        index.insert(item_key.as_bytes(), id.as_bytes())?;
                    }
                    IndexUpdate::Clear => {
                        index.remove(item_key.as_bytes())?;
                    }
                }
                Ok(())
            },
        );

        outcome.map_err(|e| match e {
            TransactionError::Abort(e) => e,
            TransactionError::Storage(e) => e.into(),
        })
    }

    // SETTLEMENT CLAIMS

    /// Claim the item for `holder`, or return whoever holds it already.
    pub(crate) fn try_claim(&self, item_id: &str, holder: &str) -> EscrowResult<Option<String>> {
        self.swap_claim(item_id, None, Some(holder))
    }

    /// Hand a claim from `from` to `to`; returns the actual holder on mismatch.
    pub(crate) fn transfer_claim(
        &self,
        item_id: &str,
        from: &str,
        to: &str,
    ) -> EscrowResult<Option<String>> {
        self.swap_claim(item_id, Some(from), Some(to))
    }

    /// Drop the claim if `holder` still owns it.
    pub(crate) fn release_claim(&self, item_id: &str, holder: &str) -> EscrowResult<()> {
        self.swap_claim(item_id, Some(holder), None).map(|_| ())
    }

    pub(crate) fn claim_holder(&self, item_id: &str) -> EscrowResult<Option<String>> {
        self.claims
            .get(item_id.as_bytes())?
            .map(|raw| {
                String::from_utf8(raw.to_vec()).map_err(|e| EscrowError::Codec(e.to_string()))
            })
            .transpose()
    }

    fn swap_claim(
        &self,
        item_id: &str,
        expected: Option<&str>,
        next: Option<&str>,
    ) -> EscrowResult<Option<String>> {
        match self.claims.compare_and_swap(
            item_id.as_bytes(),
            expected.map(str::as_bytes),
            next.map(str::as_bytes),
        )? {
            Ok(()) => Ok(None),
            Err(cas) => Ok(Some(
                cas.current
                    .map(|raw| String::from_utf8_lossy(&raw).into_owned())
                    .unwrap_or_default(),
            )),
        }
    }

    // DIRECT TRADES

    /// Returns the stored state, inserting `initial` first if the chat has none.
    pub(crate) fn direct_trade_or_init(
        &self,
        chat_id: &str,
        initial: &DirectTradeState,
    ) -> EscrowResult<DirectTradeState> {
        let bytes = encode(initial)?;
        match self.direct_trades.compare_and_swap(
            chat_id.as_bytes(),
            None as Option<&[u8]>,
            Some(bytes),
        )? {
            Ok(()) => Ok(initial.clone()),
            Err(cas) => match cas.current {
                Some(raw) => decode(&raw),
                None => Ok(initial.clone()),
            },
        }
    }

    pub(crate) fn put_direct_trade(
        &self,
        chat_id: &str,
        state: &DirectTradeState,
    ) -> EscrowResult<()> {
        self.direct_trades.insert(chat_id.as_bytes(), encode(state)?)?;
        Ok(())
    }

    // AUDIT

    /// Appends under a monotonically increasing key so iteration is write order.
    pub(crate) fn append_audit(&self, entry: &AuditLogEntry) -> EscrowResult<u64> {
        let id = self.db.generate_id()?;
        self.audit_logs.insert(id.to_be_bytes(), encode(entry)?)?;
        Ok(id)
    }

    pub(crate) fn audit_entries(&self) -> EscrowResult<Vec<AuditLogEntry>> {
        self.audit_logs
            .iter()
            .values()
            .map(|raw| decode(&raw?))
            .collect()
    }

    pub(crate) fn audit_len(&self) -> usize {
        self.audit_logs.len()
    }
}
