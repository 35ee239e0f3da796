// =============================================================================
// Supervisor Watchdog — keeps the engine alive from outside the process
// =============================================================================
//
// Spawns the engine, tails its log file's modification time, and hard-kills
// plus restarts the process when no log activity is seen for the hang
// timeout. Restarts inside the rapid-restart window are counted; too many in
// a row means the engine is crash-looping and the watchdog gives up instead
// of hammering the exchange.
//
// The engine's own exit codes pass through untouched: a clean 0 stops the
// watchdog, anything else triggers a restart.
// =============================================================================

use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant, SystemTime};

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "helios-watchdog", about = "Hang-detecting supervisor for the engine")]
struct Args {
    /// Engine command to supervise.
    #[arg(long, default_value = "./helios-bot")]
    engine: String,

    /// Arguments passed to the engine, comma-separated.
    #[arg(long, default_value = "")]
    engine_args: String,

    /// Log file whose mtime proves the engine is alive.
    #[arg(long, default_value = "helios.log")]
    log_file: PathBuf,

    /// Seconds of log silence before the engine is considered hung.
    #[arg(long, default_value_t = 600)]
    hang_timeout: u64,

    /// Seconds defining the rapid-restart window.
    #[arg(long, default_value_t = 300)]
    rapid_window: u64,

    /// Restarts within the window before the watchdog gives up.
    #[arg(long, default_value_t = 3)]
    max_rapid_restarts: u32,

    /// Seconds between liveness checks.
    #[arg(long, default_value_t = 30)]
    poll_interval: u64,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(
        engine = %args.engine,
        hang_timeout = args.hang_timeout,
        "watchdog starting"
    );

    let mut recent_restarts: Vec<Instant> = Vec::new();

    loop {
        let mut child = match spawn_engine(&args) {
            Ok(child) => child,
            Err(e) => {
                error!(error = %e, "failed to spawn engine — giving up");
                std::process::exit(1);
            }
        };
        info!(pid = child.id(), "engine spawned");

        let outcome = supervise(&args, &mut child);
        match outcome {
            Outcome::CleanExit => {
                info!("engine exited cleanly — watchdog done");
                return;
            }
            Outcome::Crashed(status) => {
                warn!(status = %status, "engine exited abnormally — restarting");
            }
            Outcome::Hung => {
                warn!(
                    hang_timeout = args.hang_timeout,
                    "no log activity — killing hung engine"
                );
                let _ = child.kill();
                let _ = child.wait();
            }
        }

        // Bound crash loops.
        let now = Instant::now();
        let window = Duration::from_secs(args.rapid_window);
        recent_restarts.retain(|t| now.duration_since(*t) < window);
        recent_restarts.push(now);
        if recent_restarts.len() as u32 > args.max_rapid_restarts {
            error!(
                restarts = recent_restarts.len(),
                window_secs = args.rapid_window,
                "too many rapid restarts — watchdog giving up"
            );
            std::process::exit(1);
        }

        std::thread::sleep(Duration::from_secs(5));
    }
}

enum Outcome {
    CleanExit,
    Crashed(ExitStatus),
    Hung,
}

fn spawn_engine(args: &Args) -> std::io::Result<Child> {
    let mut cmd = Command::new(&args.engine);
    for arg in args.engine_args.split(',').filter(|a| !a.is_empty()) {
        cmd.arg(arg.trim());
    }
    cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
    cmd.spawn()
}

/// Poll the child and the log file until the engine exits or hangs.
fn supervise(args: &Args, child: &mut Child) -> Outcome {
    let hang = Duration::from_secs(args.hang_timeout);
    let poll = Duration::from_secs(args.poll_interval);
    let started = SystemTime::now();

    loop {
        std::thread::sleep(poll);

        match child.try_wait() {
            Ok(Some(status)) => {
                return if status.success() {
                    Outcome::CleanExit
                } else {
                    Outcome::Crashed(status)
                };
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "try_wait failed — assuming engine is gone");
                return Outcome::Hung;
            }
        }

        let last_activity = std::fs::metadata(&args.log_file)
            .and_then(|m| m.modified())
            .unwrap_or(started);
        let silence = SystemTime::now()
            .duration_since(last_activity)
            .unwrap_or_default();
        if silence >= hang {
            return Outcome::Hung;
        }
    }
}
