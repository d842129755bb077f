//! Per-symbol admission filter (throttle + minimum relative move)

use std::collections::HashMap;
use tickrelay_config::FilterConfig;

use crate::message::Tick;

/// What the filter remembers about one stream key.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SymbolState {
    pub last_price: Option<f64>,
    pub last_sent_at: Option<i64>,
}

/// Decides whether a tick is interesting enough to forward.
///
/// The move is measured against the most recent *observed* price, so `last_price` advances on
/// every tick while `last_sent_at` only advances on admission.
#[derive(Debug)]
pub struct AdmissionFilter {
    throttle_ms: i64,
    min_pct_move: f64,
    states: HashMap<String, SymbolState>,
}

impl AdmissionFilter {
    pub fn new(throttle_ms: u64, min_pct_move: f64) -> Self {
        Self {
            throttle_ms: i64::try_from(throttle_ms).unwrap_or(i64::MAX),
            min_pct_move,
            states: HashMap::new(),
        }
    }

    pub fn from_config(config: &FilterConfig) -> Self {
        Self::new(config.throttle_ms, config.min_pct_move)
    }

    /// Decide admission and record the observation. Uses `tick.observed_at` as "now".
    pub fn admit(&mut self, tick: &Tick) -> bool {
        if !tick.price.is_finite() || tick.price <= 0.0 {
            return false;
        }

        let now = tick.observed_at;
        let state = self.states.entry(tick.state_key()).or_default();

        let dt_ok = match state.last_sent_at {
            Some(sent_at) => now.saturating_sub(sent_at) >= self.throttle_ms,
            None => true,
        };

        let pct_ok = match state.last_price {
            Some(prev) if prev > 0.0 => (tick.price / prev - 1.0).abs() >= self.min_pct_move,
            _ => true,
        };

        state.last_price = Some(tick.price);

        let admitted = dt_ok && pct_ok;
        if admitted {
            state.last_sent_at = Some(now);
        }
        admitted
    }

    pub fn state(&self, key: &str) -> Option<&SymbolState> {
        self.states.get(key)
    }

    pub fn tracked(&self) -> usize {
        self.states.len()
    }
}
