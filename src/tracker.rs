//! Per (rule, address) sliding-window offense counting.
//!
//! States: absent -> tracking(count, last_seen) -> absent. The entry is removed
//! the moment a ban fires; whether an address is banned lives in the ban store,
//! not here.

use chrono::NaiveDateTime;
use std::collections::HashMap;
use std::net::IpAddr;

/// Window and threshold of the rule an offense belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub window_seconds: u64,
    pub threshold: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffenseState {
    pub attempt_count: u32,
    pub last_seen: Option<NaiveDateTime>,
}

/// Outcome of recording one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// First sighting; establishes the window baseline, no credit
    Baseline,
    /// Gap exceeded the window; no credit
    Expired,
    /// Counted within the window, still below threshold
    Counted(u32),
    /// Threshold reached; the tracking entry has been removed
    Ban { attempts: u32 },
}

#[derive(Debug, Default)]
pub struct OffenseTracker {
    rules: HashMap<String, HashMap<IpAddr, OffenseState>>,
}

impl OffenseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a matching event at `at` for `address` under `rule`.
    ///
    /// The first event never counts. Later events count only when they
    /// arrive within the window of the previous one; `last_seen` always moves.
    pub fn record(&mut self, rule: &str, address: IpAddr, at: NaiveDateTime, limits: Limits) -> Transition {
        let states = self.rules.entry(rule.to_string()).or_default();

        let Some(state) = states.get_mut(&address) else {
            states.insert(
                address,
                OffenseState {
                    attempt_count: 0,
                    last_seen: Some(at),
                },
            );
            return Transition::Baseline;
        };

        let previous = state.last_seen.replace(at);
        let Some(previous) = previous else {
            return Transition::Baseline;
        };

        let gap = (at - previous).num_seconds();
        if gap > limits.window_seconds as i64 {
            return Transition::Expired;
        }

        state.attempt_count += 1;
        if state.attempt_count >= limits.threshold {
            let attempts = state.attempt_count;
            states.remove(&address);
            return Transition::Ban { attempts };
        }

        Transition::Counted(state.attempt_count)
    }

    /// Drop any tracking for an address under a rule
    pub fn forget(&mut self, rule: &str, address: IpAddr) {
        if let Some(states) = self.rules.get_mut(rule) {
            states.remove(&address);
        }
    }

    pub fn state(&self, rule: &str, address: IpAddr) -> Option<&OffenseState> {
        self.rules.get(rule).and_then(|states| states.get(&address))
    }

    /// Number of tracked (rule, address) pairs
    pub fn len(&self) -> usize {
        self.rules.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
