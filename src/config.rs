//! Runtime configuration
use anyhow::Context;
use chrono::TimeDelta;
use dotenv::dotenv;
use std::env;
use std::fmt;
use std::path::PathBuf;

pub const DEFAULT_AUTO_CONFIRM_DAYS: i64 = 7;
pub const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Clone)]
pub struct MarketConfig {
    pub db_path: PathBuf,
    pub toss_client_key: String,
    /// Days after which an undisputed shipment is confirmed on the buyer's behalf.
    pub auto_confirm_days: i64,
    pub log_level: String,
}

impl MarketConfig {
    pub fn new(db_path: impl Into<PathBuf>, toss_client_key: impl Into<String>) -> Self {
        Self {
            db_path: db_path.into(),
            toss_client_key: toss_client_key.into(),
            auto_confirm_days: DEFAULT_AUTO_CONFIRM_DAYS,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }

    pub fn with_auto_confirm_days(mut self, days: i64) -> Self {
        self.auto_confirm_days = days;
        self
    }

    /// Reads `MARKET_DB_PATH`, `TOSS_CLIENT_KEY`, `ESCROW_AUTO_CONFIRM_DAYS`
    /// and `MARKET_LOG_LEVEL`, after loading a `.env` file if one exists.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv().ok();

        let db_path = env::var("MARKET_DB_PATH").context("MARKET_DB_PATH is not set")?;
        let toss_client_key = env::var("TOSS_CLIENT_KEY").context("TOSS_CLIENT_KEY is not set")?;
        let auto_confirm_days = match env::var("ESCROW_AUTO_CONFIRM_DAYS") {
            Ok(raw) => raw
                .parse::<i64>()
                .with_context(|| format!("ESCROW_AUTO_CONFIRM_DAYS is not a number: {raw}"))?,
            Err(_) => DEFAULT_AUTO_CONFIRM_DAYS,
        };
        if auto_confirm_days <= 0 {
            anyhow::bail!("ESCROW_AUTO_CONFIRM_DAYS must be positive, got {auto_confirm_days}");
        }
        let log_level =
            env::var("MARKET_LOG_LEVEL").unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string());

        Ok(Self {
            db_path: db_path.into(),
            toss_client_key,
            auto_confirm_days,
            log_level,
        })
    }

    pub fn auto_confirm_after(&self) -> TimeDelta {
        TimeDelta::days(self.auto_confirm_days)
    }
}

// keep the client key out of logs
impl fmt::Debug for MarketConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MarketConfig")
            .field("db_path", &self.db_path)
            .field("toss_client_key", &"<redacted>")
            .field("auto_confirm_days", &self.auto_confirm_days)
            .field("log_level", &self.log_level)
            .finish()
    }
}
