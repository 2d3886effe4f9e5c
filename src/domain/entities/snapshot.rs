//! Canonical account snapshot, independent of the terminal generation that produced it

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::account::Login;

/// Direction / kind of a position, pending order or deal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeSide {
    Buy,
    Sell,
    BuyLimit,
    SellLimit,
    BuyStop,
    SellStop,
    BuyStopLimit,
    SellStopLimit,
}

impl TradeSide {
    /// Map the terminal's numeric order type code
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(TradeSide::Buy),
            1 => Some(TradeSide::Sell),
            2 => Some(TradeSide::BuyLimit),
            3 => Some(TradeSide::SellLimit),
            4 => Some(TradeSide::BuyStop),
            5 => Some(TradeSide::SellStop),
            6 => Some(TradeSide::BuyStopLimit),
            7 => Some(TradeSide::SellStopLimit),
            _ => None,
        }
    }

    /// Map a textual type label ("BUY", "sell_limit", "Buy Stop", "ORDER_TYPE_SELL")
    pub fn from_label(label: &str) -> Option<Self> {
        let normalized = label
            .trim()
            .to_ascii_lowercase()
            .replace([' ', '-'], "_");
        let normalized = normalized
            .strip_prefix("order_type_")
            .or_else(|| normalized.strip_prefix("position_type_"))
            .or_else(|| normalized.strip_prefix("deal_type_"))
            .unwrap_or(normalized.as_str());

        match normalized {
            "buy" => Some(TradeSide::Buy),
            "sell" => Some(TradeSide::Sell),
            "buy_limit" => Some(TradeSide::BuyLimit),
            "sell_limit" => Some(TradeSide::SellLimit),
            "buy_stop" => Some(TradeSide::BuyStop),
            "sell_stop" => Some(TradeSide::SellStop),
            "buy_stop_limit" => Some(TradeSide::BuyStopLimit),
            "sell_stop_limit" => Some(TradeSide::SellStopLimit),
            _ => None,
        }
    }

    pub fn is_buy(&self) -> bool {
        matches!(
            self,
            TradeSide::Buy | TradeSide::BuyLimit | TradeSide::BuyStop | TradeSide::BuyStopLimit
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub ticket: u64,
    pub symbol: String,
    pub side: TradeSide,
    pub volume: f64,
    pub open_price: f64,
    pub current_price: f64,
    pub profit: f64,
    pub swap: f64,
    pub commission: f64,
    pub open_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOrder {
    pub ticket: u64,
    pub symbol: String,
    pub side: TradeSide,
    pub volume: f64,
    pub price: f64,
    pub time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedDeal {
    pub ticket: u64,
    pub symbol: String,
    pub side: TradeSide,
    pub volume: f64,
    pub open_price: f64,
    pub close_price: f64,
    pub open_time: Option<DateTime<Utc>>,
    pub close_time: Option<DateTime<Utc>>,
    pub profit: f64,
    pub swap: f64,
    pub commission: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceOperationKind {
    Deposit,
    Withdrawal,
}

impl BalanceOperationKind {
    /// Classify an unlabeled ledger entry by the sign of its amount
    pub fn from_amount(amount: f64) -> Self {
        if amount < 0.0 {
            BalanceOperationKind::Withdrawal
        } else {
            BalanceOperationKind::Deposit
        }
    }
}

/// Non-trade ledger entry (deposit or withdrawal)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceOperation {
    pub ticket: u64,
    pub kind: BalanceOperationKind,
    /// Signed amount, negative for withdrawals
    pub amount: f64,
    pub time: Option<DateTime<Utc>>,
    pub comment: String,
}

/// Writer generation a snapshot file was produced by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaVersion {
    /// No closed deals / balance operations, numeric type codes
    Legacy,
    /// Full history arrays, textual type labels
    Current,
}

/// Latest normalized state of one trading account.
///
/// Instances are immutable once built; the store replaces the whole record
/// on every successful read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub login: Login,
    pub broker: String,
    pub server: String,
    pub balance: f64,
    pub equity: f64,
    pub margin: f64,
    pub free_margin: f64,
    pub margin_level: f64,
    pub profit: f64,
    pub currency: String,
    pub leverage: u32,
    /// Producer-reported time
    pub timestamp: DateTime<Utc>,
    pub positions: Vec<Position>,
    pub pending_orders: Vec<PendingOrder>,
    pub closed_deals: Vec<ClosedDeal>,
    pub balance_operations: Vec<BalanceOperation>,
    /// Reader-observed time
    pub ingested_at: DateTime<Utc>,
    pub schema: SchemaVersion,
}

/// Wall-clock staleness threshold from a configured interval
pub fn staleness_window(threshold: std::time::Duration) -> Duration {
    Duration::from_std(threshold).unwrap_or_else(|_| Duration::days(365))
}

impl AccountSnapshot {
    /// Producer timestamp older than `threshold` relative to `now`
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        now - self.timestamp > threshold
    }

    /// Age of the producer timestamp in whole seconds (negative under clock skew)
    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.timestamp).num_seconds()
    }

    pub fn has_zero_balance(&self) -> bool {
        self.balance.abs() < f64::EPSILON
    }

    /// Net external funding: deposits minus withdrawals
    pub fn net_deposits(&self) -> f64 {
        self.balance_operations.iter().map(|op| op.amount).sum()
    }

    /// Closed deals ordered most recent first, bounded by `limit`
    pub fn recent_deals(&self, limit: usize) -> Vec<ClosedDeal> {
        let mut deals = self.closed_deals.clone();
        deals.sort_by(|a, b| {
            b.close_time
                .cmp(&a.close_time)
                .then_with(|| b.ticket.cmp(&a.ticket))
        });
        deals.truncate(limit);
        deals
    }
}
