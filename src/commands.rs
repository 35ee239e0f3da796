// =============================================================================
// Command receiver — optional remote control surface
// =============================================================================
//
// The engine polls `CommandSource::next()` between cycles; any frontend (chat
// bot, admin socket, test harness) can implement the trait. The core runs
// unchanged with no source at all. Authorization is the source's concern —
// by the time a command reaches the engine it is trusted.

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Remote commands the engine accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Report engine posture (mode, cycle counters, risk state).
    Status,
    /// Report open positions.
    Positions,
    /// Report the active factors.
    Factors,
    /// Market-close the named coin.
    Close(String),
    /// Graceful shutdown, same path as SIGTERM.
    Stop,
}

/// Where commands come from.
#[async_trait]
pub trait CommandSource: Send + Sync {
    /// Next command, or `None` when the source is permanently closed.
    async fn next(&mut self) -> Option<Command>;
}

/// Channel-backed source: the engine consumes, any producer feeds it.
pub struct ChannelCommandSource {
    rx: mpsc::Receiver<Command>,
}

impl ChannelCommandSource {
    /// Create the source plus a cloneable sender for producers.
    pub fn new(buffer: usize) -> (mpsc::Sender<Command>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self { rx })
    }
}

#[async_trait]
impl CommandSource for ChannelCommandSource {
    async fn next(&mut self) -> Option<Command> {
        self.rx.recv().await
    }
}

/// Operator console: reads commands line by line from stdin. Wired only when
/// stdin is a terminal.
///
/// Grammar: `status` | `positions` | `factors` | `close <COIN>` | `stop`.
/// Unrecognized lines are logged and skipped.
pub struct StdinCommandSource {
    lines: tokio::io::Lines<tokio::io::BufReader<tokio::io::Stdin>>,
}

impl StdinCommandSource {
    pub fn new() -> Self {
        use tokio::io::AsyncBufReadExt;
        Self {
            lines: tokio::io::BufReader::new(tokio::io::stdin()).lines(),
        }
    }
}

impl Default for StdinCommandSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandSource for StdinCommandSource {
    async fn next(&mut self) -> Option<Command> {
        loop {
            let line = self.lines.next_line().await.ok().flatten()?;
            match parse_command(&line) {
                Some(cmd) => return Some(cmd),
                None if line.trim().is_empty() => continue,
                None => tracing::warn!(input = %line.trim(), "unrecognized command"),
            }
        }
    }
}

/// Parse one console line into a command.
fn parse_command(line: &str) -> Option<Command> {
    let mut words = line.split_whitespace();
    let verb = words.next()?.to_ascii_lowercase();
    match verb.as_str() {
        "status" => Some(Command::Status),
        "positions" => Some(Command::Positions),
        "factors" => Some(Command::Factors),
        "stop" | "quit" => Some(Command::Stop),
        "close" => words.next().map(|coin| Command::Close(coin.to_uppercase())),
        _ => None,
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_source_delivers_in_order() {
        let (tx, mut source) = ChannelCommandSource::new(8);
        tx.send(Command::Status).await.unwrap();
        tx.send(Command::Close("BTC".to_string())).await.unwrap();
        tx.send(Command::Stop).await.unwrap();

        assert_eq!(source.next().await, Some(Command::Status));
        assert_eq!(source.next().await, Some(Command::Close("BTC".to_string())));
        assert_eq!(source.next().await, Some(Command::Stop));
    }

    #[tokio::test]
    async fn dropped_sender_closes_source() {
        let (tx, mut source) = ChannelCommandSource::new(8);
        drop(tx);
        assert_eq!(source.next().await, None);
    }

    #[test]
    fn console_grammar() {
        assert_eq!(parse_command("status"), Some(Command::Status));
        assert_eq!(parse_command("  POSITIONS "), Some(Command::Positions));
        assert_eq!(parse_command("factors"), Some(Command::Factors));
        assert_eq!(parse_command("stop"), Some(Command::Stop));
        assert_eq!(parse_command("quit"), Some(Command::Stop));
        assert_eq!(
            parse_command("close btc"),
            Some(Command::Close("BTC".to_string()))
        );
        assert_eq!(parse_command("close"), None);
        assert_eq!(parse_command("frobnicate"), None);
        assert_eq!(parse_command(""), None);
    }
}
