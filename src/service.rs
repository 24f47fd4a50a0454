//! Service layer API the RPC handlers call into
use super::context::MarketContext;
use super::direct_trade::{DirectTradeState, DirectTradeStatus, TradeRole};
use super::error::{EscrowError, EscrowResult};
use super::item::Item;
use super::ledger::Transaction;
use super::my_items::MyItemsType;
use super::types::Caller;
use std::sync::Arc;

/// Envelope returned to RPC clients. `error` is always safe to show a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> From<EscrowResult<T>> for RpcResponse<T> {
    fn from(result: EscrowResult<T>) -> Self {
        match result {
            Ok(data) => Self {
                success: true,
                data: Some(data),
                error: None,
            },
            Err(err) => {
                tracing::warn!(kind = ?err.kind(), error = %err, "rpc call failed");
                Self {
                    success: false,
                    data: None,
                    error: Some(err.user_message()),
                }
            }
        }
    }
}

pub struct MarketService {
    ctx: Arc<MarketContext>,
}

impl MarketService {
    pub fn new(ctx: Arc<MarketContext>) -> Self {
        Self { ctx }
    }

    pub fn register_shipment(
        &self,
        item_id: &str,
        chat_id: &str,
        courier: &str,
        tracking_number: &str,
        caller: &Caller,
    ) -> RpcResponse<Transaction> {
        self.ctx
            .escrow()
            .register_shipment(item_id, chat_id, courier, tracking_number, caller)
            .into()
    }

    pub fn confirm_purchase(
        &self,
        item_id: &str,
        chat_id: &str,
        caller: &Caller,
    ) -> RpcResponse<Transaction> {
        self.ctx
            .escrow()
            .confirm_purchase(item_id, chat_id, caller)
            .into()
    }

    pub fn cancel_transaction(
        &self,
        item_id: &str,
        chat_id: &str,
        reason: &str,
        caller: &Caller,
    ) -> RpcResponse<Item> {
        self.ctx
            .escrow()
            .cancel_transaction(item_id, chat_id, reason, caller)
            .into()
    }

    /// `items_type` is the raw list name sent by the client.
    pub fn get_my_items(&self, user_id: &str, items_type: &str) -> RpcResponse<Vec<Item>> {
        items_type
            .parse::<MyItemsType>()
            .map_err(EscrowError::from)
            .and_then(|kind| self.ctx.my_items().get_my_items(user_id, kind))
            .into()
    }

    pub fn get_direct_trade_state(&self, chat_id: &str) -> RpcResponse<DirectTradeState> {
        self.ctx
            .direct_trades()
            .get_direct_trade_state(chat_id)
            .into()
    }

    pub fn update_direct_trade_state(
        &self,
        chat_id: &str,
        new_status: DirectTradeStatus,
        user_id: &str,
        role: TradeRole,
        notes: Option<&str>,
    ) -> RpcResponse<DirectTradeState> {
        self.ctx
            .direct_trades()
            .update_direct_trade_state(chat_id, new_status, user_id, role, notes)
            .into()
    }
}
