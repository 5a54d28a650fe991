use crate::live::types::{
    AgentStatus, CanonicalState, ConnectionState, IdempotencyKey, PartialLogUpdate, Position,
    StateUpdate, Trade,
};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
struct Delayed<T> {
    accepted_at_ms: i64,
    value: T,
}

/// Withholds entries until `delay` has elapsed since they were accepted.
/// Release is a pure function of (acceptance time, current time), so a reader
/// that comes back after a pause sees every elapsed entry at once, in order.
/// `capacity` bounds the released entries kept; withheld entries are never
/// evicted.
#[derive(Debug, Clone)]
pub struct DelayBuffer<T> {
    delay_ms: i64,
    capacity: usize,
    entries: VecDeque<Delayed<T>>,
}

impl<T> DelayBuffer<T> {
    pub fn new(delay: Duration, capacity: usize) -> Self {
        Self {
            delay_ms: delay.as_millis().min(i64::MAX as u128) as i64,
            capacity: capacity.max(1),
            entries: VecDeque::new(),
        }
    }

    pub fn delay_ms(&self) -> i64 {
        self.delay_ms
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Acceptance times are clamped to be non-decreasing so release order
    /// always matches acceptance order. Released entries beyond `capacity`
    /// (as of this acceptance) are dropped oldest first.
    pub fn accept(&mut self, value: T, accepted_at_ms: i64) {
        let accepted_at_ms = self
            .entries
            .back()
            .map(|last| accepted_at_ms.max(last.accepted_at_ms))
            .unwrap_or(accepted_at_ms);
        self.entries.push_back(Delayed {
            accepted_at_ms,
            value,
        });
        self.prune_released(accepted_at_ms, self.capacity);
    }

    fn is_released(&self, entry: &Delayed<T>, now_ms: i64) -> bool {
        now_ms.saturating_sub(entry.accepted_at_ms) >= self.delay_ms
    }

    /// Released entries, oldest acceptance first.
    pub fn peek(&self, now_ms: i64) -> Vec<&T> {
        self.entries
            .iter()
            .take_while(|entry| self.is_released(entry, now_ms))
            .map(|entry| &entry.value)
            .collect()
    }

    pub fn latest_released(&self, now_ms: i64) -> Option<&T> {
        self.entries
            .iter()
            .take_while(|entry| self.is_released(entry, now_ms))
            .last()
            .map(|entry| &entry.value)
    }

    pub fn withheld(&self, now_ms: i64) -> usize {
        self.entries
            .iter()
            .filter(|entry| !self.is_released(entry, now_ms))
            .count()
    }

    /// Unix ms at which the next withheld entry becomes visible.
    pub fn next_release_at(&self, now_ms: i64) -> Option<i64> {
        self.entries
            .iter()
            .find(|entry| !self.is_released(entry, now_ms))
            .map(|entry| entry.accepted_at_ms.saturating_add(self.delay_ms))
    }

    /// Drops released entries beyond the newest `keep` released ones.
    pub fn prune_released(&mut self, now_ms: i64, keep: usize) {
        let released = self
            .entries
            .iter()
            .take_while(|entry| self.is_released(entry, now_ms))
            .count();
        let excess = released.saturating_sub(keep);
        self.entries.drain(..excess);
    }

    pub fn iter_all(&self) -> impl Iterator<Item = &T> + '_ {
        self.entries.iter().map(|entry| &entry.value)
    }
}

/// Builds a delayed view over `source`, given as (accepted_at_ms, value)
/// pairs in acceptance order.
pub fn wrap<T, I>(source: I, delay: Duration) -> DelayBuffer<T>
where
    I: IntoIterator<Item = (i64, T)>,
{
    let source: Vec<(i64, T)> = source.into_iter().collect();
    let mut buffer = DelayBuffer::new(delay, source.len());
    for (accepted_at_ms, value) in source {
        buffer.accept(value, accepted_at_ms);
    }
    buffer
}

/// Public-facing projection: aggregates pass through, positions and trades
/// are only shown once the privacy delay has elapsed.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PublicView {
    pub connection: ConnectionState,
    pub portfolio_value: f64,
    pub total_pnl: f64,
    pub agent_count: usize,
    pub active_agent_count: usize,
    pub average_win_rate: f64,
    pub open_positions: Vec<Position>,
    /// Newest first.
    pub recent_trades: Vec<Trade>,
    pub withheld_trades: usize,
    pub delay_ms: i64,
    pub as_of_ms: i64,
}

#[derive(Debug, Clone)]
pub struct PrivacyBuffer {
    positions: DelayBuffer<Vec<Position>>,
    trades: DelayBuffer<Trade>,
    trade_capacity: usize,
}

impl PrivacyBuffer {
    pub fn new(delay: Duration, trade_capacity: usize) -> Self {
        Self {
            positions: DelayBuffer::new(delay, 1),
            trades: DelayBuffer::new(delay, trade_capacity),
            trade_capacity,
        }
    }

    /// Records the sensitive parts of an update the reconciler accepted.
    pub fn record(&mut self, update: &StateUpdate, accepted_at_ms: i64) {
        match update {
            StateUpdate::Snapshot(snapshot) => {
                if let Some(positions) = &snapshot.open_positions {
                    self.positions.accept(positions.clone(), accepted_at_ms);
                }
                if let Some(trades) = &snapshot.recent_trades {
                    // Snapshot lists are newest-first; accept oldest first.
                    for trade in trades.iter().rev() {
                        if !self.is_buffered(trade) {
                            self.trades.accept(trade.clone(), accepted_at_ms);
                        }
                    }
                }
            }
            StateUpdate::Event(PartialLogUpdate::Trade(trade)) => {
                if trade.idempotency_key().is_none() || !self.is_buffered(trade) {
                    self.trades.accept(trade.clone(), accepted_at_ms);
                }
            }
            StateUpdate::Event(PartialLogUpdate::Log(_)) => {}
        }
    }

    /// Keyed trades match by key; snapshot lists repeat keyless trades
    /// verbatim, so those match by value.
    fn is_buffered(&self, trade: &Trade) -> bool {
        match trade.idempotency_key() {
            Some(key) => self.trades.iter_all().any(|existing| {
                existing.idempotency_key().as_deref() == Some(key.as_str())
            }),
            None => self.trades.iter_all().any(|existing| existing == trade),
        }
    }

    pub fn view(&self, state: &CanonicalState, now_ms: i64) -> PublicView {
        let active_agent_count = state
            .agents
            .iter()
            .filter(|agent| agent.status != AgentStatus::Stopped)
            .count();
        let average_win_rate = if state.agents.is_empty() {
            0.0
        } else {
            state.agents.iter().map(|agent| agent.win_rate).sum::<f64>()
                / state.agents.len() as f64
        };

        PublicView {
            connection: state.connection,
            portfolio_value: state.portfolio_value,
            total_pnl: state.total_pnl,
            agent_count: state.agents.len(),
            active_agent_count,
            average_win_rate,
            open_positions: self
                .positions
                .latest_released(now_ms)
                .cloned()
                .unwrap_or_default(),
            // Only trades the canonical state still holds are published.
            recent_trades: self
                .trades
                .peek(now_ms)
                .into_iter()
                .rev()
                .filter(|trade| state.recent_trades.iter().any(|held| held == *trade))
                .take(self.trade_capacity)
                .cloned()
                .collect(),
            withheld_trades: self.trades.withheld(now_ms),
            delay_ms: self.trades.delay_ms(),
            as_of_ms: now_ms,
        }
    }

    pub fn next_release_at(&self, now_ms: i64) -> Option<i64> {
        match (
            self.positions.next_release_at(now_ms),
            self.trades.next_release_at(now_ms),
        ) {
            (Some(left), Some(right)) => Some(left.min(right)),
            (left, right) => left.or(right),
        }
    }
}
