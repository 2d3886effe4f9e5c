//! Snapshot normalization
//!
//! The terminal-side writer has shipped two generations of its JSON layout.
//! Both are read into one permissive raw shape, the generation is detected
//! from the document, and a per-generation mapping function produces the
//! canonical [`AccountSnapshot`]. All functions here are pure.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::domain::entities::account::{AccountRegistryEntry, Login};
use crate::domain::entities::snapshot::{
    AccountSnapshot, BalanceOperation, BalanceOperationKind, ClosedDeal, PendingOrder, Position,
    SchemaVersion, TradeSide,
};
use crate::domain::errors::SnapshotParseError;

/// Timestamps arrive as unix seconds, unix milliseconds or text
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawTime {
    Unix(f64),
    Text(String),
}

/// Trade type as numeric terminal code or textual label
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawSide {
    Code(i64),
    Label(String),
}

#[derive(Debug, Deserialize)]
struct RawPosition {
    #[serde(default)]
    ticket: u64,
    #[serde(default)]
    symbol: String,
    #[serde(default, rename = "type", alias = "position_type")]
    side: Option<RawSide>,
    #[serde(default)]
    volume: f64,
    #[serde(default, alias = "price_open")]
    open_price: f64,
    #[serde(default, alias = "price_current")]
    current_price: f64,
    #[serde(default)]
    profit: f64,
    #[serde(default)]
    swap: f64,
    #[serde(default)]
    commission: f64,
    #[serde(default, alias = "time")]
    open_time: Option<RawTime>,
}

#[derive(Debug, Deserialize)]
struct RawOrder {
    #[serde(default)]
    ticket: u64,
    #[serde(default)]
    symbol: String,
    #[serde(default, rename = "type", alias = "order_type")]
    side: Option<RawSide>,
    #[serde(default, alias = "volume_current")]
    volume: f64,
    #[serde(default, alias = "price_open")]
    price: f64,
    #[serde(default, alias = "time_setup")]
    time: Option<RawTime>,
}

#[derive(Debug, Deserialize)]
struct RawDeal {
    #[serde(default)]
    ticket: u64,
    #[serde(default)]
    symbol: String,
    #[serde(default, rename = "type", alias = "deal_type")]
    side: Option<RawSide>,
    #[serde(default)]
    volume: f64,
    #[serde(default)]
    open_price: f64,
    #[serde(default)]
    close_price: f64,
    #[serde(default)]
    open_time: Option<RawTime>,
    #[serde(default)]
    close_time: Option<RawTime>,
    #[serde(default)]
    profit: f64,
    #[serde(default)]
    swap: f64,
    #[serde(default)]
    commission: f64,
}

#[derive(Debug, Deserialize)]
struct RawBalanceOperation {
    #[serde(default)]
    ticket: u64,
    #[serde(default, rename = "type")]
    label: Option<String>,
    #[serde(default)]
    amount: f64,
    #[serde(default)]
    time: Option<RawTime>,
    #[serde(default)]
    comment: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawSnapshot {
    #[serde(default, alias = "login")]
    account: Option<Login>,
    #[serde(default)]
    server: Option<String>,
    #[serde(default)]
    balance: Option<f64>,
    #[serde(default)]
    equity: Option<f64>,
    #[serde(default)]
    margin: Option<f64>,
    #[serde(default, alias = "margin_free")]
    free_margin: Option<f64>,
    #[serde(default)]
    margin_level: Option<f64>,
    #[serde(default)]
    profit: Option<f64>,
    #[serde(default)]
    leverage: Option<u32>,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    timestamp: Option<RawTime>,
    #[serde(default)]
    positions: Option<Vec<RawPosition>>,
    #[serde(default)]
    orders: Option<Vec<RawOrder>>,
    #[serde(default, alias = "closed_trades")]
    closed_deals: Option<Vec<RawDeal>>,
    #[serde(default)]
    balance_operations: Option<Vec<RawBalanceOperation>>,
}

/// Guess the writer generation of a parsed document
pub fn detect_schema(doc: &Value) -> SchemaVersion {
    let has_history = ["closed_deals", "closed_trades", "balance_operations"]
        .iter()
        .any(|key| doc.get(key).is_some());
    if has_history {
        return SchemaVersion::Current;
    }

    let first_type = ["positions", "orders"].iter().find_map(|key| {
        doc.get(key)
            .and_then(Value::as_array)
            .and_then(|items| items.first())
            .and_then(|item| item.get("type"))
    });
    match first_type {
        Some(Value::String(_)) => SchemaVersion::Current,
        _ => SchemaVersion::Legacy,
    }
}

/// Parse and normalize one snapshot file body for `entry`
pub fn parse_snapshot(
    bytes: &[u8],
    entry: &AccountRegistryEntry,
    ingested_at: DateTime<Utc>,
) -> Result<AccountSnapshot, SnapshotParseError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Err(SnapshotParseError::Empty);
    }

    let doc: Value = serde_json::from_slice(bytes)?;
    let schema = detect_schema(&doc);
    let raw: RawSnapshot = serde_json::from_value(doc)?;

    match schema {
        SchemaVersion::Legacy => normalize_legacy(raw, entry, ingested_at),
        SchemaVersion::Current => normalize_current(raw, entry, ingested_at),
    }
}

fn normalize_legacy(
    raw: RawSnapshot,
    entry: &AccountRegistryEntry,
    ingested_at: DateTime<Utc>,
) -> Result<AccountSnapshot, SnapshotParseError> {
    let mut snapshot = normalize_header(&raw, entry, ingested_at, SchemaVersion::Legacy)?;
    snapshot.positions = map_positions(raw.positions, legacy_side);
    snapshot.pending_orders = map_orders(raw.orders, legacy_side);
    Ok(snapshot)
}

fn normalize_current(
    raw: RawSnapshot,
    entry: &AccountRegistryEntry,
    ingested_at: DateTime<Utc>,
) -> Result<AccountSnapshot, SnapshotParseError> {
    let mut snapshot = normalize_header(&raw, entry, ingested_at, SchemaVersion::Current)?;
    snapshot.positions = map_positions(raw.positions, current_side);
    snapshot.pending_orders = map_orders(raw.orders, current_side);
    snapshot.closed_deals = map_deals(raw.closed_deals);
    snapshot.balance_operations = map_balance_operations(raw.balance_operations);
    Ok(snapshot)
}

fn normalize_header(
    raw: &RawSnapshot,
    entry: &AccountRegistryEntry,
    ingested_at: DateTime<Utc>,
    schema: SchemaVersion,
) -> Result<AccountSnapshot, SnapshotParseError> {
    let login = raw.account.ok_or(SnapshotParseError::MissingField("account"))?;
    if login != entry.login {
        return Err(SnapshotParseError::LoginMismatch {
            expected: entry.login,
            found: login,
        });
    }
    let balance = raw.balance.ok_or(SnapshotParseError::MissingField("balance"))?;
    let equity = raw.equity.ok_or(SnapshotParseError::MissingField("equity"))?;
    let timestamp = match &raw.timestamp {
        Some(time) => parse_time(time)
            .ok_or_else(|| SnapshotParseError::InvalidTimestamp(format!("{:?}", time)))?,
        None => return Err(SnapshotParseError::MissingField("timestamp")),
    };

    Ok(AccountSnapshot {
        login,
        broker: entry.broker.clone(),
        server: raw.server.clone().unwrap_or_else(|| entry.server.clone()),
        balance,
        equity,
        margin: raw.margin.unwrap_or_default(),
        free_margin: raw.free_margin.unwrap_or_default(),
        margin_level: raw.margin_level.unwrap_or_default(),
        profit: raw.profit.unwrap_or_default(),
        currency: raw.currency.clone().unwrap_or_default(),
        leverage: raw.leverage.unwrap_or_default(),
        timestamp,
        positions: Vec::new(),
        pending_orders: Vec::new(),
        closed_deals: Vec::new(),
        balance_operations: Vec::new(),
        ingested_at,
        schema,
    })
}

/// Older writers emit the numeric terminal code
fn legacy_side(raw: &RawSide) -> Option<TradeSide> {
    match raw {
        RawSide::Code(code) => TradeSide::from_code(*code),
        RawSide::Label(label) => label
            .trim()
            .parse::<i64>()
            .ok()
            .and_then(TradeSide::from_code)
            .or_else(|| TradeSide::from_label(label)),
    }
}

fn current_side(raw: &RawSide) -> Option<TradeSide> {
    match raw {
        RawSide::Label(label) => TradeSide::from_label(label),
        RawSide::Code(code) => TradeSide::from_code(*code),
    }
}

fn map_positions(
    raw: Option<Vec<RawPosition>>,
    side_of: fn(&RawSide) -> Option<TradeSide>,
) -> Vec<Position> {
    raw.unwrap_or_default()
        .into_iter()
        .filter_map(|p| {
            let Some(side) = p.side.as_ref().and_then(side_of) else {
                warn!("Skipping position {} with unknown type {:?}", p.ticket, p.side);
                return None;
            };
            Some(Position {
                ticket: p.ticket,
                symbol: p.symbol,
                side,
                volume: p.volume,
                open_price: p.open_price,
                current_price: p.current_price,
                profit: p.profit,
                swap: p.swap,
                commission: p.commission,
                open_time: p.open_time.as_ref().and_then(parse_time),
            })
        })
        .collect()
}

fn map_orders(
    raw: Option<Vec<RawOrder>>,
    side_of: fn(&RawSide) -> Option<TradeSide>,
) -> Vec<PendingOrder> {
    raw.unwrap_or_default()
        .into_iter()
        .filter_map(|o| {
            let Some(side) = o.side.as_ref().and_then(side_of) else {
                warn!("Skipping order {} with unknown type {:?}", o.ticket, o.side);
                return None;
            };
            Some(PendingOrder {
                ticket: o.ticket,
                symbol: o.symbol,
                side,
                volume: o.volume,
                price: o.price,
                time: o.time.as_ref().and_then(parse_time),
            })
        })
        .collect()
}

fn map_deals(raw: Option<Vec<RawDeal>>) -> Vec<ClosedDeal> {
    raw.unwrap_or_default()
        .into_iter()
        .filter_map(|d| {
            let Some(side) = d.side.as_ref().and_then(current_side) else {
                warn!("Skipping deal {} with unknown type {:?}", d.ticket, d.side);
                return None;
            };
            Some(ClosedDeal {
                ticket: d.ticket,
                symbol: d.symbol,
                side,
                volume: d.volume,
                open_price: d.open_price,
                close_price: d.close_price,
                open_time: d.open_time.as_ref().and_then(parse_time),
                close_time: d.close_time.as_ref().and_then(parse_time),
                profit: d.profit,
                swap: d.swap,
                commission: d.commission,
            })
        })
        .collect()
}

fn map_balance_operations(raw: Option<Vec<RawBalanceOperation>>) -> Vec<BalanceOperation> {
    raw.unwrap_or_default()
        .into_iter()
        .map(|op| {
            let label = op.label.as_deref().map(|l| l.trim().to_ascii_lowercase());
            let kind = match label.as_deref() {
                Some("deposit") => BalanceOperationKind::Deposit,
                Some("withdrawal") | Some("withdraw") => BalanceOperationKind::Withdrawal,
                _ => BalanceOperationKind::from_amount(op.amount),
            };
            let amount = match kind {
                BalanceOperationKind::Deposit => op.amount.abs(),
                BalanceOperationKind::Withdrawal => -op.amount.abs(),
            };
            BalanceOperation {
                ticket: op.ticket,
                kind,
                amount,
                time: op.time.as_ref().and_then(parse_time),
                comment: op.comment.unwrap_or_default(),
            }
        })
        .collect()
}

/// Unix seconds above this are taken as milliseconds
const UNIX_MILLIS_CUTOFF: f64 = 100_000_000_000.0;

const TEXT_FORMATS: [&str; 4] = [
    "%Y.%m.%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
];

fn parse_time(raw: &RawTime) -> Option<DateTime<Utc>> {
    match raw {
        RawTime::Unix(value) if value.is_finite() && *value >= 0.0 => {
            let millis = if *value >= UNIX_MILLIS_CUTOFF {
                *value as i64
            } else {
                (*value * 1000.0) as i64
            };
            Utc.timestamp_millis_opt(millis).single()
        }
        RawTime::Unix(_) => None,
        RawTime::Text(text) => {
            let text = text.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
                return Some(dt.with_timezone(&Utc));
            }
            TEXT_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
                .map(|naive| Utc.from_utc_datetime(&naive))
        }
    }
}
