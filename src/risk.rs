// =============================================================================
// Risk Ledger — portfolio-wide loss accounting and entry suppression
// =============================================================================
//
// Tracks realized PnL against starting capital and enforces the loss-driven
// entry gates:
//
//   Daily loss   — entries stop once the day's realized loss reaches the cap;
//                  the counter resets when the UTC date rolls over.
//   Observation  — after N consecutive losing full exits the engine enters
//                  observation mode: new entries are suppressed while exits
//                  proceed normally. The next profitable close (full or
//                  partial) clears it.
//
// A separate read-only latch covers the Auth failure posture: the engine keeps
// analyzing but refuses to open anything.
//
// The ledger holds its lock only across in-memory mutation.
// =============================================================================

use std::sync::Arc;

use parking_lot::RwLock;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::Clock;

/// Why an entry was refused by the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryBlock {
    DailyLossLimit,
    ObservationMode,
    ReadOnly,
}

impl std::fmt::Display for EntryBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DailyLossLimit => write!(f, "daily_loss_limit"),
            Self::ObservationMode => write!(f, "observation_mode"),
            Self::ReadOnly => write!(f, "read_only"),
        }
    }
}

/// Serializable view of the ledger for `engine_state.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskSnapshot {
    /// Signed percent of capital realized today (negative when losing).
    pub daily_loss_pct: f64,
    pub consecutive_losses: u32,
    pub observation_mode: bool,
}

struct Inner {
    daily_pnl: Decimal,
    consecutive_losses: u32,
    observation_mode: bool,
    read_only: bool,
    current_date: String,
}

/// Shared risk state, constructed once and handed to both the executor (which
/// records results) and the portfolio manager (which gates entries).
pub struct RiskLedger {
    state: RwLock<Inner>,
    capital: Decimal,
    max_daily_loss_pct: f64,
    max_consecutive_losses: u32,
    clock: Arc<dyn Clock>,
}

impl RiskLedger {
    pub fn new(
        capital: Decimal,
        max_daily_loss_pct: f64,
        max_consecutive_losses: u32,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let today = clock.now().format("%Y-%m-%d").to_string();
        Self {
            state: RwLock::new(Inner {
                daily_pnl: Decimal::ZERO,
                consecutive_losses: 0,
                observation_mode: false,
                read_only: false,
                current_date: today,
            }),
            capital,
            max_daily_loss_pct,
            max_consecutive_losses,
            clock,
        }
    }

    /// Restore counters from persisted engine state on startup.
    pub fn restore(&self, daily_loss_pct: f64, consecutive_losses: u32, observation_mode: bool) {
        let mut s = self.state.write();
        s.daily_pnl = self.capital
            * Decimal::try_from(daily_loss_pct / 100.0).unwrap_or(Decimal::ZERO);
        s.consecutive_losses = consecutive_losses;
        s.observation_mode = observation_mode;
    }

    /// Latch the no-new-orders posture (missing/invalid credentials).
    pub fn set_read_only(&self, read_only: bool) {
        self.state.write().read_only = read_only;
        if read_only {
            warn!("risk ledger latched read-only: entries suppressed");
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.state.read().read_only
    }

    // -------------------------------------------------------------------------
    // Trade results
    // -------------------------------------------------------------------------

    /// Record a realized close. `full_exit` distinguishes a position fully
    /// closed from a partial take-profit: only losing *full* exits count
    /// toward the consecutive-loss streak, while any profitable close clears
    /// it (and observation mode with it).
    pub fn record_realized(&self, pnl: Decimal, full_exit: bool) {
        self.maybe_reset_daily();
        let mut s = self.state.write();
        s.daily_pnl += pnl;

        if pnl > Decimal::ZERO {
            if s.observation_mode {
                info!("profitable close — observation mode cleared");
            }
            s.consecutive_losses = 0;
            s.observation_mode = false;
        } else if pnl < Decimal::ZERO && full_exit {
            s.consecutive_losses += 1;
            if s.consecutive_losses >= self.max_consecutive_losses && !s.observation_mode {
                s.observation_mode = true;
                warn!(
                    consecutive_losses = s.consecutive_losses,
                    limit = self.max_consecutive_losses,
                    "entering observation mode — new entries suppressed"
                );
            }
        }
    }

    // -------------------------------------------------------------------------
    // Entry gate
    // -------------------------------------------------------------------------

    /// Check the ledger's share of the entry gates. Position-count and
    /// already-in-position checks belong to the portfolio manager.
    pub fn can_open(&self) -> Result<(), EntryBlock> {
        self.maybe_reset_daily();
        let s = self.state.read();

        if s.read_only {
            return Err(EntryBlock::ReadOnly);
        }
        if s.observation_mode {
            return Err(EntryBlock::ObservationMode);
        }

        let loss_pct = Self::pnl_pct(s.daily_pnl, self.capital);
        if loss_pct <= -self.max_daily_loss_pct {
            return Err(EntryBlock::DailyLossLimit);
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Snapshots
    // -------------------------------------------------------------------------

    pub fn snapshot(&self) -> RiskSnapshot {
        self.maybe_reset_daily();
        let s = self.state.read();
        RiskSnapshot {
            daily_loss_pct: Self::pnl_pct(s.daily_pnl, self.capital),
            consecutive_losses: s.consecutive_losses,
            observation_mode: s.observation_mode,
        }
    }

    /// Today's realized PnL in quote currency.
    pub fn daily_pnl(&self) -> Decimal {
        self.maybe_reset_daily();
        self.state.read().daily_pnl
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn pnl_pct(pnl: Decimal, capital: Decimal) -> f64 {
        if capital <= Decimal::ZERO {
            return 0.0;
        }
        (pnl / capital).to_f64().unwrap_or(0.0) * 100.0
    }

    /// Reset the daily PnL when the UTC date changes. The loss streak and
    /// observation mode deliberately survive the rollover — only a profitable
    /// close clears them.
    fn maybe_reset_daily(&self) {
        let today = self.clock.now().format("%Y-%m-%d").to_string();
        {
            let s = self.state.read();
            if s.current_date == today {
                return;
            }
        }
        let mut s = self.state.write();
        if s.current_date != today {
            info!(
                old_date = %s.current_date,
                new_date = %today,
                "date rolled — resetting daily loss counter"
            );
            s.daily_pnl = Decimal::ZERO;
            s.current_date = today;
        }
    }
}

impl std::fmt::Debug for RiskLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.state.read();
        f.debug_struct("RiskLedger")
            .field("capital", &self.capital)
            .field("daily_pnl", &s.daily_pnl)
            .field("consecutive_losses", &s.consecutive_losses)
            .field("observation_mode", &s.observation_mode)
            .field("read_only", &s.read_only)
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::test_clock::FixedClock;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn ledger_with_clock() -> (RiskLedger, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(
            chrono::Utc.with_ymd_and_hms(2025, 6, 2, 9, 0, 0).unwrap(),
        ));
        let ledger = RiskLedger::new(dec!(1000000), 3.0, 3, clock.clone());
        (ledger, clock)
    }

    #[test]
    fn fresh_ledger_allows_entries() {
        let (ledger, _) = ledger_with_clock();
        assert!(ledger.can_open().is_ok());
    }

    #[test]
    fn observation_after_three_full_losses() {
        let (ledger, _) = ledger_with_clock();

        ledger.record_realized(dec!(-10000), true);
        ledger.record_realized(dec!(-10000), true);
        assert!(ledger.can_open().is_ok());

        ledger.record_realized(dec!(-10000), true);
        assert_eq!(ledger.can_open(), Err(EntryBlock::ObservationMode));
        assert!(ledger.snapshot().observation_mode);
    }

    #[test]
    fn profitable_partial_clears_observation() {
        let (ledger, _) = ledger_with_clock();
        for _ in 0..3 {
            ledger.record_realized(dec!(-10000), true);
        }
        assert_eq!(ledger.can_open(), Err(EntryBlock::ObservationMode));

        // A profitable SELL_PARTIAL (+2 %) resets the streak.
        ledger.record_realized(dec!(20000), false);
        assert!(ledger.can_open().is_ok());
        assert_eq!(ledger.snapshot().consecutive_losses, 0);
    }

    #[test]
    fn losing_partial_does_not_count_toward_streak() {
        let (ledger, _) = ledger_with_clock();
        ledger.record_realized(dec!(-5000), false);
        ledger.record_realized(dec!(-5000), false);
        ledger.record_realized(dec!(-5000), false);
        assert_eq!(ledger.snapshot().consecutive_losses, 0);
        assert!(ledger.can_open().is_ok());
    }

    #[test]
    fn daily_loss_cap_blocks_entries() {
        let (ledger, _) = ledger_with_clock();
        // -3 % of 1,000,000 = -30,000 — exactly at the cap.
        ledger.record_realized(dec!(-30000), true);
        assert_eq!(ledger.can_open(), Err(EntryBlock::DailyLossLimit));
    }

    #[test]
    fn daily_loss_just_inside_cap_allows() {
        let (ledger, _) = ledger_with_clock();
        ledger.record_realized(dec!(-29999), true);
        assert!(ledger.can_open().is_ok());
    }

    #[test]
    fn date_rollover_resets_daily_but_not_streak() {
        let (ledger, clock) = ledger_with_clock();
        ledger.record_realized(dec!(-30000), true);
        ledger.record_realized(dec!(-1000), true);
        ledger.record_realized(dec!(-1000), true);
        assert_eq!(ledger.can_open(), Err(EntryBlock::ObservationMode));

        clock.set(chrono::Utc.with_ymd_and_hms(2025, 6, 3, 0, 5, 0).unwrap());
        // Daily PnL is back to zero...
        assert_eq!(ledger.daily_pnl(), Decimal::ZERO);
        // ...but observation mode still stands until a profitable close.
        assert_eq!(ledger.can_open(), Err(EntryBlock::ObservationMode));

        ledger.record_realized(dec!(500), true);
        assert!(ledger.can_open().is_ok());
    }

    #[test]
    fn read_only_latch() {
        let (ledger, _) = ledger_with_clock();
        ledger.set_read_only(true);
        assert_eq!(ledger.can_open(), Err(EntryBlock::ReadOnly));
        ledger.set_read_only(false);
        assert!(ledger.can_open().is_ok());
    }

    #[test]
    fn restore_roundtrip() {
        let (ledger, _) = ledger_with_clock();
        ledger.restore(-1.5, 2, false);
        let snap = ledger.snapshot();
        assert!((snap.daily_loss_pct - -1.5).abs() < 1e-9);
        assert_eq!(snap.consecutive_losses, 2);
        assert!(!snap.observation_mode);
    }
}
