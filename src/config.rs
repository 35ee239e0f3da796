// =============================================================================
// Engine Configuration — loaded once at startup, immutable afterwards
// =============================================================================
//
// Every field carries a serde default so that older JSON files missing new
// fields keep loading. Live-tunable parameters do NOT live here — those are
// the Factors, recomputed every cycle. Persistence uses the same atomic
// tmp + rename pattern as the state store.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::{Coin, RunMode};

// =============================================================================
// Default-value helpers (required by serde `default = "..."`)
// =============================================================================

fn default_coins() -> Vec<Coin> {
    vec![
        Coin {
            symbol: "BTC".to_string(),
            pair: "BTC/KRW".to_string(),
            min_order_qty: Decimal::new(1, 4), // 0.0001
            min_order_value: Decimal::new(5000, 0),
            price_precision: 0,
            qty_precision: 8,
            rank: 1,
        },
        Coin {
            symbol: "ETH".to_string(),
            pair: "ETH/KRW".to_string(),
            min_order_qty: Decimal::new(1, 3), // 0.001
            min_order_value: Decimal::new(5000, 0),
            price_precision: 0,
            qty_precision: 8,
            rank: 2,
        },
        Coin {
            symbol: "XRP".to_string(),
            pair: "XRP/KRW".to_string(),
            min_order_qty: Decimal::ONE,
            min_order_value: Decimal::new(5000, 0),
            price_precision: 1,
            qty_precision: 2,
            rank: 3,
        },
    ]
}

fn default_initial_capital() -> Decimal {
    Decimal::new(1_000_000, 0)
}

fn default_fee_rate() -> Decimal {
    Decimal::new(25, 4) // 0.0025
}

fn default_cycle_interval_secs() -> u64 {
    900
}

fn default_per_coin_timeout_secs() -> u64 {
    60
}

fn default_total_timeout_secs() -> u64 {
    120
}

fn default_max_positions() -> u32 {
    2
}

fn default_max_daily_loss_pct() -> f64 {
    3.0
}

fn default_max_consecutive_losses() -> u32 {
    3
}

fn default_consecutive_timeout_limit() -> u32 {
    3
}

fn default_daily_bars() -> u32 {
    220
}

fn default_strategy_bars() -> u32 {
    120
}

fn default_state_dir() -> String {
    "state".to_string()
}

fn default_emergency_ratio() -> f64 {
    0.7
}

// =============================================================================
// Rebalance configuration
// =============================================================================

/// Monthly coin re-selection. Off by default; when enabled the universe is a
/// ranked superset of the coins the engine may rotate between.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalanceConfig {
    #[serde(default)]
    pub enabled: bool,

    /// How many coins the engine should hold in its active set.
    #[serde(default = "default_max_positions")]
    pub target_count: u32,

    /// Ranked candidate coins (rank field decides selection order).
    #[serde(default)]
    pub universe: Vec<Coin>,

    /// Emergency rebalance fires when open positions drop below
    /// `emergency_ratio * target_count`.
    #[serde(default = "default_emergency_ratio")]
    pub emergency_ratio: f64,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            target_count: default_max_positions(),
            universe: Vec::new(),
            emergency_ratio: default_emergency_ratio(),
        }
    }
}

// =============================================================================
// EngineConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// DryRun simulates fills locally; Live sends real orders.
    #[serde(default)]
    pub run_mode: RunMode,

    /// Coins the engine analyzes and trades.
    #[serde(default = "default_coins")]
    pub coins: Vec<Coin>,

    /// Starting capital in quote currency; the 1 % risk unit derives from it.
    #[serde(default = "default_initial_capital")]
    pub initial_capital: Decimal,

    /// Taker fee rate used for dry-run fills and fee estimates.
    #[serde(default = "default_fee_rate")]
    pub fee_rate: Decimal,

    // --- Cadence and timeouts -----------------------------------------------
    #[serde(default = "default_cycle_interval_secs")]
    pub cycle_interval_secs: u64,

    #[serde(default = "default_per_coin_timeout_secs")]
    pub per_coin_timeout_secs: u64,

    #[serde(default = "default_total_timeout_secs")]
    pub total_timeout_secs: u64,

    /// Consecutive all-timeout cycles before the engine exits for restart.
    #[serde(default = "default_consecutive_timeout_limit")]
    pub consecutive_timeout_limit: u32,

    // --- Portfolio gates ----------------------------------------------------
    #[serde(default = "default_max_positions")]
    pub max_positions: u32,

    #[serde(default = "default_max_daily_loss_pct")]
    pub max_daily_loss_pct: f64,

    #[serde(default = "default_max_consecutive_losses")]
    pub max_consecutive_losses: u32,

    // --- Data depth ---------------------------------------------------------
    /// Daily bars requested for regime classification.
    #[serde(default = "default_daily_bars")]
    pub daily_bars: u32,

    /// 4h bars requested for the strategy timeframe.
    #[serde(default = "default_strategy_bars")]
    pub strategy_bars: u32,

    // --- Features -----------------------------------------------------------
    #[serde(default)]
    pub pyramiding_enabled: bool,

    #[serde(default)]
    pub rebalance: RebalanceConfig,

    // --- Paths --------------------------------------------------------------
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            run_mode: RunMode::DryRun,
            coins: default_coins(),
            initial_capital: default_initial_capital(),
            fee_rate: default_fee_rate(),
            cycle_interval_secs: default_cycle_interval_secs(),
            per_coin_timeout_secs: default_per_coin_timeout_secs(),
            total_timeout_secs: default_total_timeout_secs(),
            consecutive_timeout_limit: default_consecutive_timeout_limit(),
            max_positions: default_max_positions(),
            max_daily_loss_pct: default_max_daily_loss_pct(),
            max_consecutive_losses: default_max_consecutive_losses(),
            daily_bars: default_daily_bars(),
            strategy_bars: default_strategy_bars(),
            pyramiding_enabled: false,
            rebalance: RebalanceConfig::default(),
            state_dir: default_state_dir(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file. A missing file is an error so the
    /// caller can decide between defaults (unattended start) and a hard fail
    /// (explicit `--config`).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        config.validate()?;

        info!(
            path = %path.display(),
            coins = config.coins.len(),
            run_mode = %config.run_mode,
            "config loaded"
        );

        Ok(config)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.coins.is_empty() {
            anyhow::bail!("config has no coins");
        }
        if self.initial_capital <= Decimal::ZERO {
            anyhow::bail!("initial_capital must be positive");
        }
        if self.cycle_interval_secs == 0 {
            anyhow::bail!("cycle_interval_secs must be positive");
        }
        if self.per_coin_timeout_secs > self.total_timeout_secs {
            anyhow::bail!(
                "per_coin_timeout_secs ({}) exceeds total_timeout_secs ({})",
                self.per_coin_timeout_secs,
                self.total_timeout_secs
            );
        }
        let mut symbols: Vec<&str> = self.coins.iter().map(|c| c.symbol.as_str()).collect();
        symbols.sort_unstable();
        symbols.dedup();
        if symbols.len() != self.coins.len() {
            anyhow::bail!("duplicate coin symbols in config");
        }
        Ok(())
    }

    /// Persist via tmp + rename (crash-safe).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content =
            serde_json::to_string_pretty(self).context("failed to serialize config")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "config saved");
        Ok(())
    }

    pub fn coin(&self, symbol: &str) -> Option<&Coin> {
        self.coins.iter().find(|c| c.symbol == symbol)
    }
}
