use crate::config::RetentionLimits;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
    Polling,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Polling => "polling",
        }
    }

    /// Only an open socket counts as live; polling and closed states may lag.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Open)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Active,
    #[default]
    Idle,
    Trading,
    Analyzing,
    Stopped,
}

impl AgentStatus {
    /// Unknown labels collapse to `Idle`.
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "active" | "running" => Self::Active,
            "trading" => Self::Trading,
            "analyzing" | "analysing" => Self::Analyzing,
            "stopped" | "paused" => Self::Stopped,
            _ => Self::Idle,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub status: AgentStatus,
    pub pnl: f64,
    pub pnl_percent: f64,
    pub win_rate: f64,
    pub allocation: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub symbol: String,
    pub side: String,
    pub size: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub pnl: f64,
    pub leverage: f64,
    /// Weak reference to the owning agent; the agent may not be in `agents`.
    pub agent_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    pub id: Option<String>,
    pub symbol: String,
    pub side: String,
    pub price: f64,
    pub quantity: f64,
    pub pnl: f64,
    pub agent_id: Option<String>,
    pub executed_at_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub id: Option<String>,
    pub agent: Option<String>,
    pub level: String,
    pub message: String,
    pub logged_at_ms: Option<i64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioPoint {
    pub t: i64,
    pub value: f64,
}

/// Identity used to drop re-delivered entries. `None` when the payload has
/// neither an id nor a timestamp; such entries are never treated as repeats.
pub trait IdempotencyKey {
    fn idempotency_key(&self) -> Option<String>;
}

impl IdempotencyKey for Trade {
    fn idempotency_key(&self) -> Option<String> {
        if let Some(id) = &self.id {
            return Some(format!("id:{id}"));
        }
        self.executed_at_ms.map(|executed_at_ms| {
            format!(
                "trade:{executed_at_ms}:{}:{}:{}:{}",
                self.symbol, self.side, self.price, self.quantity
            )
        })
    }
}

impl IdempotencyKey for LogEntry {
    fn idempotency_key(&self) -> Option<String> {
        if let Some(id) = &self.id {
            return Some(format!("id:{id}"));
        }
        self.logged_at_ms.map(|logged_at_ms| {
            format!(
                "log:{logged_at_ms}:{}:{}",
                self.agent.as_deref().unwrap_or_default(),
                self.message
            )
        })
    }
}

/// Newest-first sequence that evicts its oldest entry on overflow.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundedFeed<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> BoundedFeed<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn newest(&self) -> Option<&T> {
        self.items.front()
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.items.get(index)
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + '_ {
        self.items.iter()
    }

    /// Prepends `item` and returns the evicted oldest entry, if any.
    pub fn push_front(&mut self, item: T) -> Option<T> {
        self.items.push_front(item);
        if self.items.len() > self.capacity {
            return self.items.pop_back();
        }
        None
    }

    /// Replaces the contents with `items` (given newest-first), keeping the
    /// first `capacity` entries.
    pub fn replace<I>(&mut self, items: I)
    where
        I: IntoIterator<Item = T>,
    {
        self.items.clear();
        self.items.extend(items.into_iter().take(self.capacity));
    }

    pub fn to_vec(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.items.iter().cloned().collect()
    }
}

impl<T: IdempotencyKey> BoundedFeed<T> {
    pub fn contains_key(&self, key: &str) -> bool {
        self.items
            .iter()
            .any(|item| item.idempotency_key().as_deref() == Some(key))
    }

    /// Prepends unless an entry with the same key is already retained.
    /// Keyless entries are always prepended.
    pub fn push_front_unique(&mut self, item: T) -> bool {
        if let Some(key) = item.idempotency_key() {
            if self.contains_key(&key) {
                return false;
            }
        }
        self.push_front(item);
        true
    }

    /// Like `replace`, dropping later duplicates of an already seen key.
    pub fn replace_unique<I>(&mut self, items: I)
    where
        I: IntoIterator<Item = T>,
    {
        let mut seen = std::collections::HashSet::new();
        let deduped: Vec<T> = items
            .into_iter()
            .filter(|item| match item.idempotency_key() {
                Some(key) => seen.insert(key),
                None => true,
            })
            .collect();
        self.replace(deduped);
    }
}

impl<T: Serialize> Serialize for BoundedFeed<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_seq(self.items.iter())
    }
}

/// Reconciled dashboard state handed to consumers.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalState {
    pub connection: ConnectionState,
    pub portfolio_value: f64,
    pub total_pnl: f64,
    pub agents: Vec<Agent>,
    pub open_positions: Vec<Position>,
    pub recent_trades: BoundedFeed<Trade>,
    pub logs: BoundedFeed<LogEntry>,
    pub portfolio_history: BoundedFeed<PortfolioPoint>,
    /// Unix ms at which the last update was accepted; 0 until the first one.
    pub last_updated_ms: i64,
}

impl CanonicalState {
    pub fn new(retention: RetentionLimits) -> Self {
        Self {
            connection: ConnectionState::Connecting,
            portfolio_value: 0.0,
            total_pnl: 0.0,
            agents: Vec::new(),
            open_positions: Vec::new(),
            recent_trades: BoundedFeed::new(retention.trades),
            logs: BoundedFeed::new(retention.logs),
            portfolio_history: BoundedFeed::new(retention.portfolio_history),
            last_updated_ms: 0,
        }
    }

    pub fn has_data(&self) -> bool {
        self.last_updated_ms > 0
    }
}

impl Default for CanonicalState {
    fn default() -> Self {
        Self::new(RetentionLimits::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotSource {
    Init,
    Steady,
}

/// Snapshot reshaped into canonical fields. `None` means the field was absent
/// from the payload and the previous value must be kept.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedUpdate {
    pub source: SnapshotSource,
    pub portfolio_value: Option<f64>,
    pub total_pnl: Option<f64>,
    pub agents: Option<Vec<Agent>>,
    pub open_positions: Option<Vec<Position>>,
    pub recent_trades: Option<Vec<Trade>>,
    pub logs: Option<Vec<LogEntry>>,
}

impl NormalizedUpdate {
    pub fn empty(source: SnapshotSource) -> Self {
        Self {
            source,
            portfolio_value: None,
            total_pnl: None,
            agents: None,
            open_positions: None,
            recent_trades: None,
            logs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PartialLogUpdate {
    Trade(Trade),
    Log(LogEntry),
}

#[derive(Debug, Clone, PartialEq)]
pub enum StateUpdate {
    Snapshot(NormalizedUpdate),
    Event(PartialLogUpdate),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    Snapshot(NormalizedUpdate),
    Event(PartialLogUpdate),
    Heartbeat,
    Unrecognized { reason: String },
}

impl Normalized {
    pub fn into_state_update(self) -> Option<StateUpdate> {
        match self {
            Self::Snapshot(update) => Some(StateUpdate::Snapshot(update)),
            Self::Event(event) => Some(StateUpdate::Event(event)),
            Self::Heartbeat | Self::Unrecognized { .. } => None,
        }
    }
}
