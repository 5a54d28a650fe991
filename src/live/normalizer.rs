use crate::error::ClientError;
use crate::live::types::{
    Agent, AgentStatus, LogEntry, Normalized, NormalizedUpdate, PartialLogUpdate, Position,
    SnapshotSource, Trade,
};
use serde_json::{Map, Value};
use std::collections::HashSet;

pub const HEARTBEAT_TYPE: &str = "ping";
pub const INIT_TYPE: &str = "init";
pub const LOG_EVENT_TYPES: [&str; 2] = ["ai_log", "log"];
pub const TRADE_EVENT_TYPES: [&str; 2] = ["trade_update", "trade_executed"];

const SNAPSHOT_MARKER_KEYS: [&str; 3] = ["portfolio_value", "portfolio_balance", "total_pnl"];

/// Field names used by steady-state snapshots and by `init` frames.
struct SnapshotShape {
    portfolio_value: &'static [&'static str],
    total_pnl: &'static [&'static str],
    agents: &'static [&'static str],
    positions: &'static [&'static str],
    trades: &'static [&'static str],
    logs: &'static [&'static str],
}

const STEADY_SHAPE: SnapshotShape = SnapshotShape {
    portfolio_value: &["portfolio_value", "portfolio_balance"],
    total_pnl: &["total_pnl"],
    agents: &["agents"],
    positions: &["open_positions", "positions"],
    trades: &["recent_trades", "trades"],
    logs: &["logs", "ai_logs"],
};

const INIT_SHAPE: SnapshotShape = SnapshotShape {
    portfolio_value: &["total_balance", "balance"],
    total_pnl: &["total_pnl", "pnl"],
    agents: &["agents"],
    positions: &["positions"],
    trades: &["recent_trades"],
    logs: &["ai_logs", "logs"],
};

pub fn parse_frame(payload: &mut [u8]) -> Result<Value, ClientError> {
    Ok(simd_json::serde::from_slice::<Value>(payload)?)
}

/// Decodes and classifies one transport frame. Decode failures come back as
/// `Unrecognized` so a bad frame never interrupts the stream.
pub fn normalize_frame(payload: &mut [u8]) -> Normalized {
    match parse_frame(payload) {
        Ok(raw) => normalize(&raw),
        Err(error) => Normalized::Unrecognized {
            reason: format!("malformed frame: {error}"),
        },
    }
}

pub fn normalize(raw: &Value) -> Normalized {
    let Some(object) = raw.as_object() else {
        return Normalized::Unrecognized {
            reason: "frame is not a json object".to_string(),
        };
    };

    match object.get("type") {
        None | Some(Value::Null) => classify_untyped(object),
        Some(Value::String(kind)) => classify_typed(kind, object),
        Some(_) => Normalized::Unrecognized {
            reason: "non-string type discriminator".to_string(),
        },
    }
}

fn classify_typed(kind: &str, object: &Map<String, Value>) -> Normalized {
    if kind == HEARTBEAT_TYPE {
        return Normalized::Heartbeat;
    }

    if TRADE_EVENT_TYPES.contains(&kind) {
        return match trade_from(event_body(object)) {
            Some(trade) => Normalized::Event(PartialLogUpdate::Trade(trade)),
            None => Normalized::Unrecognized {
                reason: format!("{kind} event without a symbol"),
            },
        };
    }

    if LOG_EVENT_TYPES.contains(&kind) {
        return match log_from(event_body(object)) {
            Some(entry) => Normalized::Event(PartialLogUpdate::Log(entry)),
            None => Normalized::Unrecognized {
                reason: format!("{kind} event without a message"),
            },
        };
    }

    if kind == INIT_TYPE {
        return Normalized::Snapshot(snapshot_from(
            event_body(object),
            &INIT_SHAPE,
            SnapshotSource::Init,
        ));
    }

    Normalized::Unrecognized {
        reason: format!("unknown message type '{kind}'"),
    }
}

fn classify_untyped(object: &Map<String, Value>) -> Normalized {
    let looks_like_snapshot = SNAPSHOT_MARKER_KEYS
        .iter()
        .any(|key| object.get(*key).is_some_and(is_numeric));

    if looks_like_snapshot {
        return Normalized::Snapshot(snapshot_from(object, &STEADY_SHAPE, SnapshotSource::Steady));
    }

    Normalized::Unrecognized {
        reason: "no type discriminator and no snapshot fields".to_string(),
    }
}

/// Event payloads arrive either wrapped in `data` or flattened.
fn event_body(object: &Map<String, Value>) -> &Map<String, Value> {
    object
        .get("data")
        .and_then(Value::as_object)
        .unwrap_or(object)
}

fn snapshot_from(
    object: &Map<String, Value>,
    shape: &SnapshotShape,
    source: SnapshotSource,
) -> NormalizedUpdate {
    NormalizedUpdate {
        source,
        portfolio_value: present_number(object, shape.portfolio_value),
        total_pnl: present_number(object, shape.total_pnl),
        agents: first_present(object, shape.agents).map(agents_from),
        open_positions: first_present(object, shape.positions)
            .map(|value| objects(value).filter_map(position_from).collect()),
        recent_trades: first_present(object, shape.trades)
            .map(|value| objects(value).filter_map(trade_from).collect()),
        logs: first_present(object, shape.logs)
            .map(|value| objects(value).filter_map(log_from).collect()),
    }
}

/// Accepts either a list of agents or an object keyed by agent id. Ids stay
/// unique: the first occurrence wins.
fn agents_from(value: &Value) -> Vec<Agent> {
    let mut seen = HashSet::new();
    let candidates: Vec<(Option<&str>, &Map<String, Value>)> = match value {
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_object)
            .map(|item| (None, item))
            .collect(),
        Value::Object(entries) => entries
            .iter()
            .filter_map(|(key, item)| item.as_object().map(|item| (Some(key.as_str()), item)))
            .collect(),
        _ => Vec::new(),
    };

    candidates
        .into_iter()
        .filter_map(|(key, item)| agent_from(key, item))
        .filter(|agent| seen.insert(agent.id.clone()))
        .collect()
}

fn agent_from(key: Option<&str>, object: &Map<String, Value>) -> Option<Agent> {
    let id = text(object, &["id", "agent_id"])
        .or_else(|| key.map(str::to_string))
        .or_else(|| text(object, &["name"]))?;
    let name = text(object, &["name", "display_name"]).unwrap_or_else(|| id.clone());

    Some(Agent {
        status: text(object, &["status"])
            .map(|raw| AgentStatus::parse_lenient(&raw))
            .unwrap_or_default(),
        pnl: number(object, &["pnl", "total_pnl"]),
        pnl_percent: number(object, &["pnl_percent", "pnl_pct", "pnlPercent"]),
        win_rate: number(object, &["win_rate", "winRate"]),
        allocation: number(object, &["allocation"]),
        id,
        name,
    })
}

fn position_from(object: &Map<String, Value>) -> Option<Position> {
    Some(Position {
        symbol: text(object, &["symbol"])?,
        side: text(object, &["side"])
            .map(|side| side.to_ascii_uppercase())
            .unwrap_or_default(),
        size: number(object, &["size", "quantity", "qty"]),
        entry_price: number(object, &["entry_price", "entryPrice"]),
        mark_price: number(object, &["mark_price", "current_price", "markPrice"]),
        pnl: number(object, &["pnl", "unrealized_pnl"]),
        leverage: number(object, &["leverage"]),
        agent_id: text(object, &["agent_id", "agent"]),
    })
}

fn trade_from(object: &Map<String, Value>) -> Option<Trade> {
    Some(Trade {
        id: text(object, &["id", "trade_id", "order_id"]),
        symbol: text(object, &["symbol"])?,
        side: text(object, &["side"])
            .map(|side| side.to_ascii_uppercase())
            .unwrap_or_default(),
        price: number(object, &["price", "avg_price", "fill_price"]),
        quantity: number(object, &["filled_quantity", "quantity", "qty", "size"]),
        pnl: number(object, &["pnl", "realized_pnl"]),
        agent_id: text(object, &["agent_id", "agent"]),
        executed_at_ms: timestamp_ms(object, &["timestamp", "executed_at", "time"]),
    })
}

fn log_from(object: &Map<String, Value>) -> Option<LogEntry> {
    Some(LogEntry {
        id: text(object, &["id", "log_id"]),
        agent: text(object, &["agent", "agent_name", "agent_id"]),
        level: text(object, &["level", "severity"])
            .map(|level| level.to_ascii_lowercase())
            .unwrap_or_else(|| "info".to_string()),
        message: text(object, &["message", "msg", "text", "content"])?,
        logged_at_ms: timestamp_ms(object, &["timestamp", "time"]),
    })
}

fn objects(value: &Value) -> impl Iterator<Item = &Map<String, Value>> {
    value
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(Value::as_object)
}

fn first_present<'a>(object: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| object.get(*key))
        .find(|value| !value.is_null())
}

fn present_number(object: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    first_present(object, keys).map(|value| coerce_number(Some(value)))
}

fn number(object: &Map<String, Value>, keys: &[&str]) -> f64 {
    coerce_number(first_present(object, keys))
}

fn text(object: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    first_present(object, keys).and_then(|value| match value {
        Value::String(raw) => Some(raw.trim().to_string()).filter(|raw| !raw.is_empty()),
        Value::Number(raw) => Some(raw.to_string()),
        _ => None,
    })
}

/// Epoch numbers below 1e12 are read as seconds.
fn timestamp_ms(object: &Map<String, Value>, keys: &[&str]) -> Option<i64> {
    let raw = coerce_number(first_present(object, keys));
    if raw <= 0.0 {
        return None;
    }
    let millis = if raw < 1e12 { raw * 1_000.0 } else { raw };
    Some(millis.round().min(i64::MAX as f64) as i64)
}

fn is_numeric(value: &Value) -> bool {
    match value {
        Value::Number(_) => true,
        Value::String(raw) => raw.trim().parse::<f64>().is_ok(),
        _ => false,
    }
}

/// Parses as a number, falling back to 0 for absent, non-numeric or
/// non-finite input.
pub fn coerce_number(value: Option<&Value>) -> f64 {
    let parsed = match value {
        Some(Value::Number(raw)) => raw.as_f64(),
        Some(Value::String(raw)) => raw.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|value| value.is_finite()).unwrap_or(0.0)
}
