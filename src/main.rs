//! policy-replay - drive the phone window policy from a script
//!
//! Loads the device config, builds the policy against simulated
//! collaborators and replays a TOML step script. Policy decisions are
//! logged; `dump` steps print the policy state to stdout.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_appender::rolling;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use phone_policy::config::PolicyConfig;
use phone_policy::replay::{Replay, Script};

#[derive(Parser, Debug)]
#[command(name = "policy-replay")]
#[command(about = "Replay input and device events against the phone window policy", long_about = None)]
struct Args {
    /// Device config (defaults to ~/.config/phone-policy/policy.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Step script to replay
    #[arg(short, long)]
    script: PathBuf,

    /// Enable verbose debug output
    #[arg(short, long)]
    debug: bool,

    /// Run timers on the handler thread in wall-clock time
    #[arg(short, long)]
    realtime: bool,
}

/// `$XDG_STATE_HOME/phone-policy`, falling back to `~/.local/state` and
/// then `/tmp`
fn log_dir(xdg_state_home: Option<String>, home: Option<String>) -> PathBuf {
    xdg_state_home
        .map(PathBuf::from)
        .or_else(|| home.map(|h| PathBuf::from(h).join(".local/state")))
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("phone-policy")
}

fn crash_log_path(log_dir: &Path) -> PathBuf {
    log_dir.join("crash.log")
}

fn main() -> Result<()> {
    let log_dir = log_dir(std::env::var("XDG_STATE_HOME").ok(), std::env::var("HOME").ok());
    std::fs::create_dir_all(&log_dir).ok();

    // Set up panic hook to log panics before crashing
    let crash_log = crash_log_path(&log_dir);
    std::panic::set_hook(Box::new(move |panic_info| {
        eprintln!("PANIC: {}", panic_info);
        if let Ok(mut f) = std::fs::OpenOptions::new().create(true).append(true).open(&crash_log) {
            use std::io::Write;
            let _ = writeln!(f, "[{}] PANIC: {}", chrono::Local::now(), panic_info);
        }
    }));

    let args = Args::parse();

    let file_appender = rolling::daily(&log_dir, "replay.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let default_filter = if args.debug {
        "debug,phone_policy=debug"
    } else {
        "warn,phone_policy=info"
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    info!(log_path = %log_dir.display(), script = %args.script.display(), "policy-replay starting");

    let config = match args.config.or_else(PolicyConfig::default_path) {
        Some(path) => PolicyConfig::load(&path).with_context(|| format!("loading {}", path.display()))?,
        None => PolicyConfig::default(),
    };
    let script = Script::load(&args.script)?;
    info!(steps = script.steps.len(), realtime = args.realtime, "Script loaded");

    let mut replay = Replay::new(config, &script, args.realtime)?;
    let stdout = std::io::stdout();
    replay.run(&script, &mut stdout.lock())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_dir_prefers_xdg_state_home() {
        let dir = log_dir(Some("/var/state".into()), Some("/home/user".into()));
        assert_eq!(dir, PathBuf::from("/var/state/phone-policy"));
        assert_eq!(crash_log_path(&dir), PathBuf::from("/var/state/phone-policy/crash.log"));
    }

    #[test]
    fn test_log_dir_fallbacks() {
        assert_eq!(log_dir(None, Some("/home/user".into())), PathBuf::from("/home/user/.local/state/phone-policy"));
        assert_eq!(log_dir(None, None), PathBuf::from("/tmp/phone-policy"));
    }
}
