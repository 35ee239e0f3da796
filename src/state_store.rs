// =============================================================================
// State Store — durable engine state with atomic writes and a file lock
// =============================================================================
//
// Every durable file is JSON with camelCase keys (the dashboard reads these
// files directly, so the shapes are an external contract):
//
//   engine_state.json         risk counters, last factors/regimes, positions
//   positions.json            open positions only (corrupt => fatal)
//   dynamic_factors.json      last factors record for inspection
//   transaction_journal.json  append-only order journal
//   daily_history.json        initial capital + one snapshot per trading day
//   performance_history.json  per-trade realized outcomes
//
// Writes go through a same-directory temp file that is fsynced and renamed
// into place, so a crash leaves either the old or the new file, never a
// partial one. An advisory lock on engine.lock stops two engines from racing
// on the same directory.
//
// Missing or corrupt peripheral files are replaced with defaults under a
// warning; only a corrupt positions.json is fatal, because silently dropping
// open positions would desynchronize the engine from the exchange.
// =============================================================================

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{info, warn};

use crate::errors::EngineError;
use crate::factors::FactorsRecord;
use crate::position::Position;
use crate::regime::Regime;
use crate::risk::RiskSnapshot;
use crate::types::Side;

pub const ENGINE_STATE_FILE: &str = "engine_state.json";
pub const POSITIONS_FILE: &str = "positions.json";
pub const FACTORS_FILE: &str = "dynamic_factors.json";
pub const JOURNAL_FILE: &str = "transaction_journal.json";
pub const DAILY_HISTORY_FILE: &str = "daily_history.json";
pub const PERFORMANCE_FILE: &str = "performance_history.json";
const LOCK_FILE: &str = "engine.lock";

// =============================================================================
// Persisted shapes
// =============================================================================

/// One journal row. Immutable once written; the journal only ever appends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub timestamp: DateTime<Utc>,
    pub coin: String,
    pub side: Side,
    pub qty: Decimal,
    pub price: Decimal,
    pub fee: Decimal,
    pub reason: String,
    pub regime: Regime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realized_pnl: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pnl_pct: Option<f64>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionJournal {
    pub transactions: Vec<Transaction>,
}

/// Per-trade realized outcome for analytics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeOutcome {
    pub coin: String,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub qty: Decimal,
    pub realized_pnl: Decimal,
    pub pnl_pct: f64,
    pub holding_secs: i64,
    pub regime_at_entry: Regime,
    pub exit_reason: String,
    pub closed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceHistory {
    pub trades: Vec<TradeOutcome>,
}

/// One row per trading day for the dashboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailySnapshot {
    /// "YYYY-MM-DD".
    pub date: String,
    pub total_assets: Decimal,
    pub daily_pnl: Decimal,
    pub daily_pnl_pct: f64,
    pub cumulative_pnl_pct: f64,
    pub position_count: u32,
    pub trades_today: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyHistory {
    pub initial_capital: Decimal,
    pub snapshots: Vec<DailySnapshot>,
}

/// Everything the engine needs to resume after a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineState {
    pub updated_at: DateTime<Utc>,
    pub positions: Vec<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_factors: Option<FactorsRecord>,
    #[serde(default)]
    pub last_regime_per_coin: HashMap<String, Regime>,
    pub daily_loss_pct: f64,
    pub consecutive_losses: u32,
    pub observation_mode: bool,
    pub consecutive_timeout_cycles: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_rebalance_month: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_emergency_rebalance_month: Option<String>,
}

impl EngineState {
    pub fn from_parts(
        positions: Vec<Position>,
        last_factors: Option<FactorsRecord>,
        last_regime_per_coin: HashMap<String, Regime>,
        risk: &RiskSnapshot,
        consecutive_timeout_cycles: u32,
        last_rebalance_month: Option<String>,
        last_emergency_rebalance_month: Option<String>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            updated_at,
            positions,
            last_factors,
            last_regime_per_coin,
            daily_loss_pct: risk.daily_loss_pct,
            consecutive_losses: risk.consecutive_losses,
            observation_mode: risk.observation_mode,
            consecutive_timeout_cycles,
            last_rebalance_month,
            last_emergency_rebalance_month,
        }
    }
}

impl Default for EngineState {
    fn default() -> Self {
        Self {
            updated_at: Utc::now(),
            positions: Vec::new(),
            last_factors: None,
            last_regime_per_coin: HashMap::new(),
            daily_loss_pct: 0.0,
            consecutive_losses: 0,
            observation_mode: false,
            consecutive_timeout_cycles: 0,
            last_rebalance_month: None,
            last_emergency_rebalance_month: None,
        }
    }
}

// =============================================================================
// StateStore
// =============================================================================

/// Owner of the state directory. Holding the struct holds the lock.
pub struct StateStore {
    dir: PathBuf,
    _lock: File,
}

impl StateStore {
    /// Open (creating if needed) the state directory and take the advisory
    /// lock. Fails when another engine already holds it.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create state dir {}", dir.display()))?;

        let lock_path = dir.join(LOCK_FILE);
        let lock = File::create(&lock_path)
            .with_context(|| format!("failed to create lock file {}", lock_path.display()))?;
        lock.try_lock_exclusive().with_context(|| {
            format!(
                "another engine holds the lock on {} — refusing to start",
                lock_path.display()
            )
        })?;

        info!(dir = %dir.display(), "state store opened");
        Ok(Self { dir, _lock: lock })
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    // -------------------------------------------------------------------------
    // Atomic write primitive
    // -------------------------------------------------------------------------

    /// Serialize `value` and move it into place via temp-file + fsync +
    /// rename. A crash at any point leaves the previous file intact.
    fn atomic_write<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let content = serde_json::to_string_pretty(value)
            .with_context(|| format!("failed to serialize {name}"))?;

        let mut tmp = NamedTempFile::new_in(&self.dir)
            .with_context(|| format!("failed to create temp file for {name}"))?;
        tmp.write_all(content.as_bytes())
            .with_context(|| format!("failed to write temp file for {name}"))?;
        tmp.as_file()
            .sync_all()
            .with_context(|| format!("failed to fsync temp file for {name}"))?;
        tmp.persist(self.path(name))
            .with_context(|| format!("failed to rename temp file into {name}"))?;

        Ok(())
    }

    /// Load `name`, or build a default under a warning when the file is
    /// missing or unreadable. Peripheral files never crash the engine.
    fn load_or_default<T: DeserializeOwned + Default>(&self, name: &str) -> T {
        let path = self.path(name);
        match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(value) => value,
                Err(e) => {
                    warn!(file = name, error = %e, "corrupt state file — reinitializing with defaults");
                    T::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => T::default(),
            Err(e) => {
                warn!(file = name, error = %e, "unreadable state file — reinitializing with defaults");
                T::default()
            }
        }
    }

    // -------------------------------------------------------------------------
    // Engine state + positions
    // -------------------------------------------------------------------------

    pub fn save_engine_state(&self, state: &EngineState) -> Result<()> {
        self.atomic_write(ENGINE_STATE_FILE, state)?;
        self.atomic_write(POSITIONS_FILE, &state.positions)
    }

    pub fn load_engine_state(&self) -> EngineState {
        self.load_or_default(ENGINE_STATE_FILE)
    }

    /// Load open positions. Unlike every other file, a present-but-corrupt
    /// positions file is fatal: resuming without the position table would
    /// leave live holdings unmanaged.
    pub fn load_positions(&self) -> Result<Vec<Position>, EngineError> {
        let path = self.path(POSITIONS_FILE);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(EngineError::StateCorruption {
                    file: POSITIONS_FILE.to_string(),
                    cause: e.to_string(),
                })
            }
        };
        serde_json::from_str(&content).map_err(|e| EngineError::StateCorruption {
            file: POSITIONS_FILE.to_string(),
            cause: e.to_string(),
        })
    }

    // -------------------------------------------------------------------------
    // Factors
    // -------------------------------------------------------------------------

    pub fn save_factors(&self, record: &FactorsRecord) -> Result<()> {
        self.atomic_write(FACTORS_FILE, record)
    }

    // -------------------------------------------------------------------------
    // Journal / performance / daily history
    // -------------------------------------------------------------------------

    pub fn append_transaction(&self, tx: Transaction) -> Result<()> {
        let mut journal: TransactionJournal = self.load_or_default(JOURNAL_FILE);
        journal.transactions.push(tx);
        self.atomic_write(JOURNAL_FILE, &journal)
    }

    pub fn load_journal(&self) -> TransactionJournal {
        self.load_or_default(JOURNAL_FILE)
    }

    pub fn append_trade_outcome(&self, outcome: TradeOutcome) -> Result<()> {
        let mut history: PerformanceHistory = self.load_or_default(PERFORMANCE_FILE);
        history.trades.push(outcome);
        self.atomic_write(PERFORMANCE_FILE, &history)
    }

    pub fn load_performance(&self) -> PerformanceHistory {
        self.load_or_default(PERFORMANCE_FILE)
    }

    /// Append a daily snapshot, initializing the history header on first use.
    pub fn append_daily_snapshot(
        &self,
        initial_capital: Decimal,
        snapshot: DailySnapshot,
    ) -> Result<()> {
        let mut history: DailyHistory = self.load_or_default(DAILY_HISTORY_FILE);
        if history.initial_capital == Decimal::ZERO {
            history.initial_capital = initial_capital;
        }
        // One row per date: a rewrite on the same day replaces the old row.
        history.snapshots.retain(|s| s.date != snapshot.date);
        history.snapshots.push(snapshot);
        self.atomic_write(DAILY_HISTORY_FILE, &history)
    }

    pub fn load_daily_history(&self) -> DailyHistory {
        self.load_or_default(DAILY_HISTORY_FILE)
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("dir", &self.dir)
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::factors::ProfitTargetMode;
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    fn store() -> (StateStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        (store, dir)
    }

    fn sample_position() -> Position {
        Position::open(
            "BTC",
            dec!(100),
            dec!(2),
            dec!(96.25),
            dec!(105.625),
            dec!(109.375),
            ProfitTargetMode::BbUpper,
            Regime::Bullish,
            4.0,
            Utc::now(),
        )
    }

    fn sample_state() -> EngineState {
        let mut state = EngineState::default();
        state.positions.push(sample_position());
        state.daily_loss_pct = -1.2;
        state.consecutive_losses = 1;
        state
    }

    #[test]
    fn lock_excludes_second_engine() {
        let dir = TempDir::new().unwrap();
        let _first = StateStore::open(dir.path()).unwrap();
        assert!(StateStore::open(dir.path()).is_err());
    }

    #[test]
    fn engine_state_roundtrip() {
        let (store, _dir) = store();
        store.save_engine_state(&sample_state()).unwrap();

        let loaded = store.load_engine_state();
        assert_eq!(loaded.positions.len(), 1);
        assert_eq!(loaded.positions[0].coin, "BTC");
        assert_eq!(loaded.consecutive_losses, 1);
        assert!((loaded.daily_loss_pct - -1.2).abs() < 1e-12);

        // positions.json is written alongside and agrees.
        let positions = store.load_positions().unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].entry_price, dec!(100));
    }

    #[test]
    fn persisted_keys_are_camel_case() {
        let (store, dir) = store();
        store.save_engine_state(&sample_state()).unwrap();
        let raw = std::fs::read_to_string(dir.path().join(ENGINE_STATE_FILE)).unwrap();
        assert!(raw.contains("updatedAt"));
        assert!(raw.contains("consecutiveTimeoutCycles"));
        assert!(raw.contains("stopLossPrice"));
        assert!(!raw.contains("stop_loss_price"));
    }

    #[test]
    fn missing_peripheral_files_default() {
        let (store, _dir) = store();
        assert!(store.load_journal().transactions.is_empty());
        assert!(store.load_performance().trades.is_empty());
        assert_eq!(store.load_engine_state().positions.len(), 0);
    }

    #[test]
    fn corrupt_peripheral_file_defaults_with_warning() {
        let (store, dir) = store();
        std::fs::write(dir.path().join(JOURNAL_FILE), "{not json").unwrap();
        assert!(store.load_journal().transactions.is_empty());
    }

    #[test]
    fn corrupt_positions_file_is_fatal() {
        let (store, dir) = store();
        std::fs::write(dir.path().join(POSITIONS_FILE), "[{broken").unwrap();
        assert!(matches!(
            store.load_positions(),
            Err(EngineError::StateCorruption { .. })
        ));
    }

    #[test]
    fn journal_appends_preserve_order() {
        let (store, _dir) = store();
        for i in 0..3 {
            store
                .append_transaction(Transaction {
                    timestamp: Utc::now(),
                    coin: "BTC".to_string(),
                    side: Side::Buy,
                    qty: dec!(1),
                    price: Decimal::from(100 + i),
                    fee: dec!(0.25),
                    reason: "entry_score".to_string(),
                    regime: Regime::Bullish,
                    entry_score: Some(4.0),
                    realized_pnl: None,
                    pnl_pct: None,
                    dry_run: true,
                })
                .unwrap();
        }
        let journal = store.load_journal();
        assert_eq!(journal.transactions.len(), 3);
        assert_eq!(journal.transactions[0].price, dec!(100));
        assert_eq!(journal.transactions[2].price, dec!(102));
    }

    #[test]
    fn daily_snapshot_replaces_same_date() {
        let (store, _dir) = store();
        let snap = |pnl: Decimal| DailySnapshot {
            date: "2025-06-02".to_string(),
            total_assets: dec!(1010000),
            daily_pnl: pnl,
            daily_pnl_pct: 1.0,
            cumulative_pnl_pct: 1.0,
            position_count: 1,
            trades_today: 2,
        };
        store.append_daily_snapshot(dec!(1000000), snap(dec!(10000))).unwrap();
        store.append_daily_snapshot(dec!(1000000), snap(dec!(12000))).unwrap();

        let history = store.load_daily_history();
        assert_eq!(history.initial_capital, dec!(1000000));
        assert_eq!(history.snapshots.len(), 1);
        assert_eq!(history.snapshots[0].daily_pnl, dec!(12000));
    }

    #[test]
    fn stray_temp_file_does_not_break_loads() {
        // Simulates a crash between temp-write and rename: the store must
        // read the last fully renamed file and ignore the orphan temp.
        let (store, dir) = store();
        store.save_engine_state(&sample_state()).unwrap();
        std::fs::write(dir.path().join(".tmpXYZ"), "garbage").unwrap();

        let loaded = store.load_engine_state();
        assert_eq!(loaded.positions.len(), 1);
        let positions = store.load_positions().unwrap();
        assert_eq!(positions.len(), 1);
    }

    #[test]
    fn atomic_write_preserves_old_on_reopen() {
        // Write twice; the second write fully replaces the first (no partial
        // mixing), and the content survives a store reopen.
        let dir = TempDir::new().unwrap();
        {
            let store = StateStore::open(dir.path()).unwrap();
            store.save_engine_state(&sample_state()).unwrap();
            let mut state2 = sample_state();
            state2.consecutive_losses = 9;
            store.save_engine_state(&state2).unwrap();
        }
        let store = StateStore::open(dir.path()).unwrap();
        assert_eq!(store.load_engine_state().consecutive_losses, 9);
    }
}
