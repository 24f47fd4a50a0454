//! In-person trades tied to a chat thread
//!
//! No money is held, so there is no settlement and no conditional write: the
//! rule table is checked and the new state overwrites the old one.
use super::error::{EscrowError, EscrowResult};
use super::store::MarketStore;
use super::types::TimeStamp;
use chrono::Utc;
use std::fmt;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DirectTradeStatus {
    #[n(0)]
    Waiting,
    #[n(1)]
    Trading,
    #[n(2)]
    Completed,
}

impl DirectTradeStatus {
    pub const ALL: [DirectTradeStatus; 3] = [
        DirectTradeStatus::Waiting,
        DirectTradeStatus::Trading,
        DirectTradeStatus::Completed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DirectTradeStatus::Waiting => "waiting",
            DirectTradeStatus::Trading => "trading",
            DirectTradeStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for DirectTradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TradeRole {
    Buyer,
    Seller,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeTrigger {
    TradeStarted,
    TradeCompleted,
    TradeCancelled,
}

impl TradeTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeTrigger::TradeStarted => "trade_started",
            TradeTrigger::TradeCompleted => "trade_completed",
            TradeTrigger::TradeCancelled => "trade_cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TradeTransition {
    pub from: DirectTradeStatus,
    pub to: DirectTradeStatus,
    pub trigger: TradeTrigger,
    pub roles: &'static [TradeRole],
}

const EITHER_PARTY: &[TradeRole] = &[TradeRole::Buyer, TradeRole::Seller];

pub static TRADE_TRANSITIONS: [TradeTransition; 3] = [
    TradeTransition {
        from: DirectTradeStatus::Waiting,
        to: DirectTradeStatus::Trading,
        trigger: TradeTrigger::TradeStarted,
        roles: EITHER_PARTY,
    },
    TradeTransition {
        from: DirectTradeStatus::Trading,
        to: DirectTradeStatus::Completed,
        trigger: TradeTrigger::TradeCompleted,
        roles: EITHER_PARTY,
    },
    TradeTransition {
        from: DirectTradeStatus::Trading,
        to: DirectTradeStatus::Waiting,
        trigger: TradeTrigger::TradeCancelled,
        roles: EITHER_PARTY,
    },
];

fn find_transition(
    from: DirectTradeStatus,
    to: DirectTradeStatus,
    role: TradeRole,
) -> Option<TradeTransition> {
    TRADE_TRANSITIONS
        .iter()
        .find(|t| t.from == from && t.to == to && t.roles.contains(&role))
        .copied()
}

pub fn can_transition(from: DirectTradeStatus, to: DirectTradeStatus, role: TradeRole) -> bool {
    find_transition(from, to, role).is_some()
}

pub fn valid_transitions(current: DirectTradeStatus, role: TradeRole) -> Vec<TradeTransition> {
    TRADE_TRANSITIONS
        .iter()
        .filter(|t| t.from == current && t.roles.contains(&role))
        .copied()
        .collect()
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct DirectTradeState {
    #[n(0)]
    pub status: DirectTradeStatus,
    #[n(1)]
    pub updated_at: TimeStamp<Utc>,
    #[n(2)]
    pub updated_by: String,
    #[n(3)]
    pub notes: Option<String>,
}

impl DirectTradeState {
    fn initial() -> Self {
        Self {
            status: DirectTradeStatus::Waiting,
            updated_at: TimeStamp::new(),
            updated_by: String::new(),
            notes: None,
        }
    }
}

pub struct DirectTrades<'a> {
    store: &'a MarketStore,
}

impl<'a> DirectTrades<'a> {
    pub fn new(store: &'a MarketStore) -> Self {
        Self { store }
    }

    /// Current state of the chat's trade, created as `waiting` on first read.
    pub fn get_direct_trade_state(&self, chat_id: &str) -> EscrowResult<DirectTradeState> {
        self.store
            .direct_trade_or_init(chat_id, &DirectTradeState::initial())
    }

    pub fn update_direct_trade_state(
        &self,
        chat_id: &str,
        new_status: DirectTradeStatus,
        user_id: &str,
        role: TradeRole,
        notes: Option<&str>,
    ) -> EscrowResult<DirectTradeState> {
        let current = self.get_direct_trade_state(chat_id)?;
        let Some(transition) = find_transition(current.status, new_status, role) else {
            return Err(EscrowError::InvalidTradeTransition {
                from: current.status,
                to: new_status,
            });
        };

        let next = DirectTradeState {
            status: new_status,
            updated_at: TimeStamp::new(),
            updated_by: user_id.to_string(),
            notes: notes.map(str::to_string),
        };
        self.store.put_direct_trade(chat_id, &next)?;
        tracing::info!(
            chat_id,
            user_id,
            trigger = transition.trigger.as_str(),
            "direct trade {} -> {}",
            current.status,
            new_status
        );
        Ok(next)
    }
}
