use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use groupsync::cache::{AnyStorage, CacheStats, CacheStorage};
use groupsync::sync::{persist_key, PersistedLists, SyncPolicy};
use groupsync::Config;

#[derive(Parser, Debug)]
#[command(name = "groupsync")]
#[command(about = "Inspect and manage the persisted group sync cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/groupsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show age and staleness of persisted entries
  Stats {
    /// Only show this user's entry
    #[arg(short, long)]
    user: Option<String>,
  },
  /// Print a user's persisted groups and invitations as JSON
  Show {
    #[arg(short, long)]
    user: String,
  },
  /// Remove persisted entries
  Clear {
    /// Only remove this user's entry
    #[arg(short, long)]
    user: Option<String>,
  },
}

fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = init_logging(&config)?;

  let storage = config.storage.open()?;
  let policy = SyncPolicy::from(&config.cache);

  match args.command {
    Command::Stats { user } => stats(&storage, &policy, user.as_deref()),
    Command::Show { user } => show(&storage, &user),
    Command::Clear { user } => clear(&storage, user.as_deref()),
  }
}

/// Log to a daily rolling file so stdout stays free for command output.
fn init_logging(config: &Config) -> Result<WorkerGuard> {
  let dir = config.log_dir()?;
  std::fs::create_dir_all(&dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(&dir, "groupsync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(writer)
    .with_ansi(false)
    .init();
  Ok(guard)
}

fn stats(storage: &AnyStorage, policy: &SyncPolicy, user: Option<&str>) -> Result<()> {
  let wanted = user.map(persist_key);
  let entries: Vec<_> = storage
    .entries()?
    .into_iter()
    .filter(|e| wanted.as_ref().map_or(true, |key| &e.key == key))
    .collect();

  if entries.is_empty() {
    println!("No persisted entries");
    return Ok(());
  }

  let now = Utc::now();
  println!(
    "{:<32} {:>8} {:>10} {:>10}  STATE",
    "KEY", "VERSION", "SIZE", "AGE"
  );
  for entry in entries {
    let stats = CacheStats::compute(entry.stored_at, policy.groups_ttl, now);
    let state = if !policy.is_persisted_usable(entry.stored_at, now) {
      "expired"
    } else if stats.is_stale {
      "stale"
    } else {
      "fresh"
    };
    println!(
      "{:<32} {:>8} {:>10} {:>10}  {}",
      entry.key,
      entry.version,
      entry.size_bytes,
      format_age(stats.age),
      state
    );
  }
  Ok(())
}

fn show(storage: &AnyStorage, user: &str) -> Result<()> {
  let stored = storage
    .read::<PersistedLists>(&persist_key(user))?
    .ok_or_else(|| eyre!("No persisted entry for user {}", user))?;
  let json = serde_json::to_string_pretty(&stored.value)
    .map_err(|e| eyre!("Failed to render entry: {}", e))?;
  println!("{}", json);
  Ok(())
}

fn clear(storage: &AnyStorage, user: Option<&str>) -> Result<()> {
  match user {
    Some(user) => {
      storage.clear(&persist_key(user))?;
      println!("Cleared persisted entry for {}", user);
    }
    None => {
      storage.clear_all()?;
      println!("Cleared all persisted entries");
    }
  }
  Ok(())
}

fn format_age(age: Duration) -> String {
  let secs = age.num_seconds();
  if secs < 60 {
    format!("{}s", secs)
  } else if secs < 3600 {
    format!("{}m {}s", secs / 60, secs % 60)
  } else {
    format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
  }
}
