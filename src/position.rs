// =============================================================================
// Position model and book
// =============================================================================
//
// One position per coin, keyed by symbol — the map structure itself enforces
// the at-most-one invariant. All money fields are decimals; the book is the
// only place positions mutate, and the executor is the only caller.
//
// Life-cycle:
//   open -> (pyramid add)* -> first target hit (50 % off, trailing armed)
//        -> closed (stop loss / profit target / mean reversion / manual)
//
// Trailing invariant: once the first target has been hit the stop only ever
// moves up, anchored at highestSinceEntry * (1 - trailingStopPct).
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::factors::ProfitTargetMode;
use crate::regime::Regime;

/// A single open long position.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub coin: String,
    pub entry_price: Decimal,
    /// Remaining open size (reduced by partial exits).
    pub size: Decimal,
    pub entry_time: DateTime<Utc>,
    pub regime_at_entry: Regime,
    pub entry_score: f64,
    pub stop_loss_price: Decimal,
    pub first_target_price: Decimal,
    pub second_target_price: Decimal,
    pub profit_target_mode: ProfitTargetMode,
    pub first_target_hit: bool,
    /// Highest price observed since entry; never below `entry_price`.
    pub highest_since_entry: Decimal,
    /// 1..=3 — pyramiding adds taken so far.
    pub entries_taken: u8,
    #[serde(default)]
    pub last_exit_reason: Option<String>,
}

impl Position {
    /// Build a freshly opened position.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        coin: &str,
        entry_price: Decimal,
        size: Decimal,
        stop_loss_price: Decimal,
        first_target_price: Decimal,
        second_target_price: Decimal,
        profit_target_mode: ProfitTargetMode,
        regime_at_entry: Regime,
        entry_score: f64,
        entry_time: DateTime<Utc>,
    ) -> Self {
        Self {
            coin: coin.to_string(),
            entry_price,
            size,
            entry_time,
            regime_at_entry,
            entry_score,
            stop_loss_price,
            first_target_price,
            second_target_price,
            profit_target_mode,
            first_target_hit: false,
            highest_since_entry: entry_price,
            entries_taken: 1,
            last_exit_reason: None,
        }
    }

    /// Record an observed price: track the high-water mark and, once the
    /// first target has been hit, ratchet the trailing stop. The stop never
    /// decreases.
    pub fn observe_price(&mut self, price: Decimal, trailing_stop_pct: Decimal) {
        if price > self.highest_since_entry {
            self.highest_since_entry = price;
        }
        if self.first_target_hit {
            let candidate = self.highest_since_entry * (Decimal::ONE - trailing_stop_pct);
            if candidate > self.stop_loss_price {
                debug!(
                    coin = %self.coin,
                    stop = %candidate,
                    high = %self.highest_since_entry,
                    "trailing stop raised"
                );
                self.stop_loss_price = candidate;
            }
        }
    }

    /// Record a first-target partial fill: shrink the size, arm the trailing
    /// stop, and ratchet it immediately from the fill price.
    pub fn record_partial_exit(
        &mut self,
        sold_qty: Decimal,
        fill_price: Decimal,
        trailing_stop_pct: Decimal,
    ) {
        self.size -= sold_qty;
        self.first_target_hit = true;
        self.observe_price(fill_price, trailing_stop_pct);
    }

    /// Fold a pyramid add into the position: volume-weighted average entry,
    /// bumped entry counter, and the high-water mark reset to the new
    /// combined average so the trailing anchor reflects the blended basis.
    pub fn apply_add(&mut self, add_price: Decimal, add_size: Decimal) {
        let old_notional = self.entry_price * self.size;
        let add_notional = add_price * add_size;
        let new_size = self.size + add_size;
        if new_size > Decimal::ZERO {
            self.entry_price = (old_notional + add_notional) / new_size;
        }
        self.size = new_size;
        self.entries_taken = self.entries_taken.saturating_add(1).min(3);
        self.highest_since_entry = self.entry_price;
    }
}

// =============================================================================
// PositionBook
// =============================================================================

/// Thread-safe owner of all open positions, keyed by coin symbol.
pub struct PositionBook {
    open: RwLock<HashMap<String, Position>>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self {
            open: RwLock::new(HashMap::new()),
        }
    }

    /// Restore positions from persisted state on startup.
    pub fn restore(&self, positions: Vec<Position>) {
        let mut map = self.open.write();
        for pos in positions {
            map.insert(pos.coin.clone(), pos);
        }
    }

    /// Insert a new position. Fails when the coin already has one — the
    /// at-most-one invariant is enforced here, not at the call sites.
    pub fn insert(&self, pos: Position) -> Result<(), Position> {
        let mut map = self.open.write();
        if map.contains_key(&pos.coin) {
            return Err(pos);
        }
        info!(
            coin = %pos.coin,
            entry = %pos.entry_price,
            size = %pos.size,
            stop = %pos.stop_loss_price,
            "position opened"
        );
        map.insert(pos.coin.clone(), pos);
        Ok(())
    }

    pub fn get(&self, coin: &str) -> Option<Position> {
        self.open.read().get(coin).cloned()
    }

    pub fn contains(&self, coin: &str) -> bool {
        self.open.read().contains_key(coin)
    }

    pub fn count(&self) -> usize {
        self.open.read().len()
    }

    /// Snapshot of all open positions (sorted by coin for stable output).
    pub fn snapshot(&self) -> Vec<Position> {
        let mut all: Vec<Position> = self.open.read().values().cloned().collect();
        all.sort_by(|a, b| a.coin.cmp(&b.coin));
        all
    }

    /// Remove and return a position on full close.
    pub fn remove(&self, coin: &str) -> Option<Position> {
        self.open.write().remove(coin)
    }

    /// Mutate a position in place under the write lock. Returns `false` when
    /// the coin has no open position.
    pub fn with_mut<F>(&self, coin: &str, f: F) -> bool
    where
        F: FnOnce(&mut Position),
    {
        let mut map = self.open.write();
        match map.get_mut(coin) {
            Some(pos) => {
                f(pos);
                true
            }
            None => false,
        }
    }
}

impl Default for PositionBook {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PositionBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionBook")
            .field("open", &self.open.read().len())
            .finish()
    }
}
