pub mod audit;
pub mod config;
pub mod context;
pub mod direct_trade;
pub mod error;
pub mod escrow;
pub mod guard;
pub mod item;
pub mod ledger;
pub mod lifecycle;
pub mod logging;
pub mod my_items;
pub mod notify;
pub mod processor;
pub mod service;
pub mod store;
pub mod types;
pub mod utils;
