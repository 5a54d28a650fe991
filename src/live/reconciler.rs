use crate::live::types::{
    CanonicalState, IdempotencyKey, NormalizedUpdate, PartialLogUpdate, PortfolioPoint,
    StateUpdate,
};

/// Outcome of merging one update, used for logging and the warm-start cache.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    SnapshotApplied { portfolio_point: Option<PortfolioPoint> },
    EventApplied,
    DuplicateEvent { key: String },
}

/// Pure merge of `update` into `state`. `accepted_at_ms` is the local time the
/// update was accepted; payload timestamps are never trusted for freshness.
pub fn apply(
    state: &CanonicalState,
    update: StateUpdate,
    accepted_at_ms: i64,
) -> (CanonicalState, ApplyOutcome) {
    let mut next = state.clone();
    let outcome = match update {
        StateUpdate::Snapshot(snapshot) => apply_snapshot(&mut next, snapshot, accepted_at_ms),
        StateUpdate::Event(event) => apply_event(&mut next, event),
    };

    if !matches!(outcome, ApplyOutcome::DuplicateEvent { .. }) {
        next.last_updated_ms = accepted_at_ms;
    }
    (next, outcome)
}

fn apply_snapshot(
    state: &mut CanonicalState,
    snapshot: NormalizedUpdate,
    accepted_at_ms: i64,
) -> ApplyOutcome {
    if let Some(value) = snapshot.portfolio_value {
        state.portfolio_value = value;
    }
    if let Some(total_pnl) = snapshot.total_pnl {
        state.total_pnl = total_pnl;
    }
    if let Some(agents) = snapshot.agents {
        state.agents = agents;
    }
    if let Some(positions) = snapshot.open_positions {
        state.open_positions = positions;
    }
    if let Some(trades) = snapshot.recent_trades {
        state.recent_trades.replace_unique(trades);
    }
    if let Some(logs) = snapshot.logs {
        state.logs.replace_unique(logs);
    }

    let portfolio_point = snapshot.portfolio_value.map(|value| PortfolioPoint {
        t: accepted_at_ms,
        value,
    });
    if let Some(point) = portfolio_point {
        state.portfolio_history.push_front(point);
    }

    ApplyOutcome::SnapshotApplied { portfolio_point }
}

fn apply_event(state: &mut CanonicalState, event: PartialLogUpdate) -> ApplyOutcome {
    let (key, inserted) = match event {
        PartialLogUpdate::Trade(trade) => {
            let key = trade.idempotency_key();
            (key, state.recent_trades.push_front_unique(trade))
        }
        PartialLogUpdate::Log(entry) => {
            let key = entry.idempotency_key();
            (key, state.logs.push_front_unique(entry))
        }
    };

    match key {
        Some(key) if !inserted => ApplyOutcome::DuplicateEvent { key },
        _ => ApplyOutcome::EventApplied,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetentionLimits;
    use crate::live::types::{Agent, AgentStatus, LogEntry, Position, SnapshotSource, Trade};

    fn trade(id: &str) -> Trade {
        Trade {
            id: Some(id.to_string()),
            symbol: "BTCUSDT".to_string(),
            side: "BUY".to_string(),
            price: 50_000.0,
            quantity: 0.01,
            pnl: 0.0,
            agent_id: None,
            executed_at_ms: None,
        }
    }

    fn agent(id: &str, pnl: f64) -> Agent {
        Agent {
            id: id.to_string(),
            name: id.to_uppercase(),
            status: AgentStatus::Active,
            pnl,
            pnl_percent: 0.0,
            win_rate: 0.5,
            allocation: 0.1,
        }
    }

    fn steady() -> NormalizedUpdate {
        NormalizedUpdate::empty(SnapshotSource::Steady)
    }

    #[test]
    fn absent_snapshot_fields_keep_previous_values() {
        let state = CanonicalState::default();
        let mut first = steady();
        first.portfolio_value = Some(1_000.0);
        first.total_pnl = Some(50.0);
        first.agents = Some(vec![agent("a", 1.0)]);
        let (state, _) = apply(&state, StateUpdate::Snapshot(first), 10);

        let mut second = steady();
        second.total_pnl = Some(75.0);
        let (state, _) = apply(&state, StateUpdate::Snapshot(second), 20);

        assert_eq!(state.portfolio_value, 1_000.0);
        assert_eq!(state.total_pnl, 75.0);
        assert_eq!(state.agents, vec![agent("a", 1.0)]);
        assert_eq!(state.last_updated_ms, 20);
    }

    #[test]
    fn arrays_are_replaced_wholesale() {
        let state = CanonicalState::default();
        let mut first = steady();
        first.agents = Some(vec![agent("a", 1.0), agent("b", 2.0)]);
        first.open_positions = Some(vec![Position {
            symbol: "ETHUSDT".to_string(),
            side: "LONG".to_string(),
            size: 1.0,
            entry_price: 3_000.0,
            mark_price: 3_010.0,
            pnl: 10.0,
            leverage: 2.0,
            agent_id: Some("a".to_string()),
        }]);
        let (state, _) = apply(&state, StateUpdate::Snapshot(first), 10);

        let mut second = steady();
        second.agents = Some(vec![agent("b", 5.0)]);
        second.open_positions = Some(Vec::new());
        let (state, _) = apply(&state, StateUpdate::Snapshot(second), 20);

        assert_eq!(state.agents, vec![agent("b", 5.0)]);
        assert!(state.open_positions.is_empty());
    }

    #[test]
    fn events_prepend_and_truncate() {
        let retention = RetentionLimits {
            trades: 2,
            logs: 2,
            portfolio_history: 2,
        };
        let mut state = CanonicalState::new(retention);
        for id in ["t1", "t2", "t3"] {
            let (next, outcome) = apply(
                &state,
                StateUpdate::Event(PartialLogUpdate::Trade(trade(id))),
                1,
            );
            assert_eq!(outcome, ApplyOutcome::EventApplied);
            state = next;
        }

        let ids: Vec<_> = state
            .recent_trades
            .iter()
            .filter_map(|trade| trade.id.clone())
            .collect();
        assert_eq!(ids, vec!["t3".to_string(), "t2".to_string()]);
    }

    #[test]
    fn redelivered_events_are_dropped_without_touching_state() {
        let state = CanonicalState::default();
        let (state, _) = apply(
            &state,
            StateUpdate::Event(PartialLogUpdate::Trade(trade("t1"))),
            5,
        );
        let (state, outcome) = apply(
            &state,
            StateUpdate::Event(PartialLogUpdate::Trade(trade("t1"))),
            9,
        );

        assert_eq!(
            outcome,
            ApplyOutcome::DuplicateEvent {
                key: "id:t1".to_string()
            }
        );
        assert_eq!(state.recent_trades.len(), 1);
        assert_eq!(state.last_updated_ms, 5);
    }

    #[test]
    fn repeated_fills_without_id_or_timestamp_are_kept() {
        let fill = || {
            let mut raw = br#"{"type":"trade_executed","data":{"symbol":"BTCUSDT","side":"BUY","price":50000,"filled_quantity":0.01}}"#.to_vec();
            crate::live::normalizer::normalize_frame(&mut raw)
                .into_state_update()
                .expect("trade frame should normalize")
        };

        let state = CanonicalState::default();
        let (state, first) = apply(&state, fill(), 1);
        let (state, second) = apply(&state, fill(), 2);

        assert_eq!(first, ApplyOutcome::EventApplied);
        assert_eq!(second, ApplyOutcome::EventApplied);
        assert_eq!(state.recent_trades.len(), 2);
        assert_eq!(state.last_updated_ms, 2);
    }

    #[test]
    fn snapshot_trade_lists_are_authoritative_and_deduplicated() {
        let state = CanonicalState::default();
        let (state, _) = apply(
            &state,
            StateUpdate::Event(PartialLogUpdate::Trade(trade("old"))),
            1,
        );

        let mut init = NormalizedUpdate::empty(SnapshotSource::Init);
        init.recent_trades = Some(vec![trade("t2"), trade("t1"), trade("t2")]);
        init.logs = Some(vec![LogEntry {
            id: None,
            agent: None,
            level: "info".to_string(),
            message: "booted".to_string(),
            logged_at_ms: None,
        }]);
        let (state, _) = apply(&state, StateUpdate::Snapshot(init), 2);

        let ids: Vec<_> = state
            .recent_trades
            .iter()
            .filter_map(|trade| trade.id.clone())
            .collect();
        assert_eq!(ids, vec!["t2".to_string(), "t1".to_string()]);
        assert_eq!(state.logs.len(), 1);
    }

    #[test]
    fn portfolio_history_records_accept_time() {
        let state = CanonicalState::default();
        let mut update = steady();
        update.portfolio_value = Some(900.0);
        let (state, outcome) = apply(&state, StateUpdate::Snapshot(update), 42);

        let point = PortfolioPoint { t: 42, value: 900.0 };
        assert_eq!(
            outcome,
            ApplyOutcome::SnapshotApplied {
                portfolio_point: Some(point)
            }
        );
        assert_eq!(state.portfolio_history.newest(), Some(&point));
    }

    #[test]
    fn apply_leaves_the_input_state_untouched() {
        let state = CanonicalState::default();
        let mut update = steady();
        update.portfolio_value = Some(1.0);
        let _ = apply(&state, StateUpdate::Snapshot(update), 1);
        assert_eq!(state, CanonicalState::default());
    }
}
