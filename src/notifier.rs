// =============================================================================
// Notifier — best-effort alerts that can never stall a cycle
// =============================================================================
//
// The engine pushes formatted messages into a bounded in-memory queue; a
// background task drains it toward the configured backend. Backpressure
// policy: beyond 100 pending messages the oldest are dropped. A failed send
// is retried once after a short pause and then dropped — alerting is strictly
// best-effort and the trading loop never waits on it.
// =============================================================================

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::factors::FactorsRecord;
use crate::regime::Regime;
use crate::state_store::Transaction;

/// Most messages allowed to wait in the queue before drop-oldest kicks in.
const MAX_PENDING: usize = 100;

/// Pause before the single re-send attempt.
const RETRY_PAUSE: Duration = Duration::from_millis(500);

/// Delivery backend. Implementations must not retry internally forever —
/// bounded failure is expected and handled by the queue worker.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, msg: &str) -> Result<(), String>;
}

// =============================================================================
// Backends
// =============================================================================

/// Fallback backend that just logs. Used when no chat credentials are set so
/// the rest of the engine does not need a "no notifier" special case.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, msg: &str) -> Result<(), String> {
        info!(target: "notify", "{msg}");
        Ok(())
    }
}

/// Telegram-style chat backend.
pub struct ChatNotifier {
    client: reqwest::Client,
    token: String,
    chat_id: String,
}

impl ChatNotifier {
    pub fn new(token: impl Into<String>, chat_id: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build notifier http client");
        Self {
            client,
            token: token.into(),
            chat_id: chat_id.into(),
        }
    }
}

#[async_trait]
impl Notifier for ChatNotifier {
    async fn send(&self, msg: &str) -> Result<(), String> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.token);
        let resp = self
            .client
            .post(&url)
            .form(&[("chat_id", self.chat_id.as_str()), ("text", msg)])
            .send()
            .await
            .map_err(|e| format!("send failed: {e}"))?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(format!("chat API returned {}", resp.status()))
        }
    }
}

impl std::fmt::Debug for ChatNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatNotifier")
            .field("token", &"<redacted>")
            .field("chat_id", &self.chat_id)
            .finish()
    }
}

// =============================================================================
// NotifierHandle — the bounded queue the engine actually talks to
// =============================================================================

struct Queue {
    pending: Mutex<VecDeque<String>>,
    wakeup: Notify,
}

/// Cheap-to-clone handle; all engine components push through this.
#[derive(Clone)]
pub struct NotifierHandle {
    queue: Arc<Queue>,
}

impl NotifierHandle {
    /// Create the handle and spawn the drain worker onto the current runtime.
    pub fn spawn(backend: Arc<dyn Notifier>) -> Self {
        let queue = Arc::new(Queue {
            pending: Mutex::new(VecDeque::new()),
            wakeup: Notify::new(),
        });

        let worker_queue = queue.clone();
        tokio::spawn(async move {
            loop {
                let msg = {
                    let mut pending = worker_queue.pending.lock();
                    pending.pop_front()
                };

                match msg {
                    Some(msg) => {
                        if let Err(first) = backend.send(&msg).await {
                            debug!(error = %first, "notify send failed — one retry");
                            tokio::time::sleep(RETRY_PAUSE).await;
                            if let Err(second) = backend.send(&msg).await {
                                warn!(error = %second, "notify dropped after retry");
                            }
                        }
                    }
                    None => worker_queue.wakeup.notified().await,
                }
            }
        });

        Self { queue }
    }

    /// Queue a message; never blocks. Oldest pending messages are discarded
    /// beyond the cap.
    pub fn push(&self, msg: impl Into<String>) {
        let msg = msg.into();
        {
            let mut pending = self.queue.pending.lock();
            while pending.len() >= MAX_PENDING {
                pending.pop_front();
                debug!("notify queue full — oldest message dropped");
            }
            pending.push_back(msg);
        }
        self.queue.wakeup.notify_one();
    }

    /// Number of messages waiting to be sent.
    pub fn pending(&self) -> usize {
        self.queue.pending.lock().len()
    }

    // -------------------------------------------------------------------------
    // Formatting helpers
    // -------------------------------------------------------------------------

    pub fn notify_trade(&self, tx: &Transaction) {
        let pnl = match (tx.realized_pnl.as_ref(), tx.pnl_pct) {
            (Some(pnl), Some(pct)) => format!(" | PnL {pnl} ({pct:+.2}%)"),
            _ => String::new(),
        };
        let tag = if tx.dry_run { "[DRY] " } else { "" };
        self.push(format!(
            "{tag}{} {} {} @ {} ({}){pnl}",
            tx.side, tx.qty, tx.coin, tx.price, tx.reason
        ));
    }

    pub fn notify_regime_change(&self, coin: &str, old: Regime, new: Regime) {
        self.push(format!("Regime change {coin}: {old} -> {new}"));
    }

    pub fn notify_factors_summary(&self, record: &FactorsRecord) {
        self.push(format!(
            "Factors [{} / {}]: minScore={} chandelier={:.2} sizeMult={:.2} target={} (ATR {:.2}%)",
            record.regime,
            record.volatility_bucket,
            record.factors.min_entry_score,
            record.factors.chandelier_multiplier,
            record.factors.position_size_multiplier,
            record.factors.profit_target_mode,
            record.atr_pct,
        ));
    }

    pub fn notify_timeout_alert(&self, cycle_id: u64, coins: &[String]) {
        self.push(format!(
            "Cycle #{cycle_id}: analysis timed out for [{}] — substituted HOLD",
            coins.join(", ")
        ));
    }

    pub fn notify_cycle_summary(&self, summary: &str) {
        self.push(summary.to_string());
    }
}

impl std::fmt::Debug for NotifierHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifierHandle")
            .field("pending", &self.pending())
            .finish()
    }
}
