//! Identifier and key helpers

use bech32::Bech32m;
use uuid7::uuid7;

/// Prefixes used for the ids this crate mints.
pub const ITEM_HRP: &str = "item_";
pub const TRANSACTION_HRP: &str = "txn_";
pub const USER_HRP: &str = "user_";

// construct a fresh time-ordered id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

/// Key handed to the payment processor so a retried release or refund of the
/// same order is recognised as the same request.
pub fn idempotency_key(operation: &str, order_id: &str) -> String {
    sha256::digest(format!("{operation}:{order_id}").as_str())
}
