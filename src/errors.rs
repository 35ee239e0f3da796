// =============================================================================
// Engine error taxonomy
// =============================================================================
//
// Recovery policy per kind:
//   InsufficientData — local recovery: the cycle substitutes HOLD and reuses
//                      the last valid regime for the coin.
//   Exchange         — carries the adapter's own taxonomy (Transient /
//                      RateLimited / Auth / InvalidParam / Permanent).
//   InvalidParam     — a bug; logged with full context, decision becomes HOLD.
//   PerCoinTimeout / CycleTimeout — substituted with HOLD + previous regime and
//                      tallied into the consecutive-timeout counter.
//   StateCorruption  — peripheral files are recreated with defaults; a corrupt
//                      positions file is fatal.

use crate::exchange::ExchangeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Indicator or classifier warmup unmet.
    #[error("insufficient data: {0}")]
    InsufficientData(String),

    /// Propagated exchange adapter failure.
    #[error("exchange: {0}")]
    Exchange(#[from] ExchangeError),

    /// Internal invariant violation or bad numeric input.
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    /// A single coin's analysis task exceeded its deadline.
    #[error("per-coin analysis timed out for {0}")]
    PerCoinTimeout(String),

    /// The whole cycle exceeded its deadline.
    #[error("cycle timed out")]
    CycleTimeout,

    /// A persisted file could not be read or parsed.
    #[error("state corruption in {file}: {cause}")]
    StateCorruption { file: String, cause: String },
}

impl EngineError {
    /// Whether the per-coin fallback (HOLD + last valid regime) applies.
    pub fn is_recoverable_per_coin(&self) -> bool {
        matches!(
            self,
            Self::InsufficientData(_)
                | Self::PerCoinTimeout(_)
                | Self::InvalidParam(_)
                | Self::Exchange(_)
        )
    }
}
