mod cache;
mod client;
mod config;
mod dirty;
mod engine;
mod store;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tally_core::{ProgressEntry, ProgressMap};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal::unix::{signal, SignalKind};

use crate::cache::LocalCache;
use crate::config::Config;
use crate::engine::SyncEngine;
use crate::store::LocalStore;

#[derive(Parser)]
#[command(name = "tally-syncd", about = "Progress sync client for tally")]
struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "~/.config/tally/config.toml")]
    config: String,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = if args.config.starts_with("~/") {
        dirs::home_dir()
            .context("cannot determine home directory")?
            .join(&args.config[2..])
    } else {
        PathBuf::from(args.config)
    };
    let config = Config::load(&config_path)?;

    if args.verbose {
        println!("tally-syncd starting with config: {}", config_path.display());
    }

    let cache_path = config.cache_path()?;
    let cache = LocalCache::open(&cache_path)?;
    let (local_store, events) = LocalStore::hydrate(cache)?;
    if args.verbose {
        println!(
            "Hydrated {} entries from {}",
            local_store.len(),
            cache_path.display()
        );
    }

    let (mut engine, mut import_outcomes) = SyncEngine::new(local_store, events, &config)
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    if engine.is_local_only() {
        println!("No server configured - edits stay in the local cache");
    } else if args.verbose {
        if let Some(url) = &config.sync.server_url {
            println!("Syncing to server: {}", url);
        }
    }

    // No drain runs before this first pull has been attempted; an empty
    // cache must never be pushed over real server data
    engine.reconcile().await;

    let mut reconcile_timer = tokio::time::interval_at(
        tokio::time::Instant::now() + config.reconcile_interval(),
        config.reconcile_interval(),
    );
    // Wake signal: the daemon analog of the app regaining focus
    let mut wake = signal(SignalKind::user_defined1())?;

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        let drain_deadline = engine
            .next_drain_at()
            .map(tokio::time::Instant::from_std)
            .unwrap_or_else(|| tokio::time::Instant::now() + config.reconcile_interval());
        let drain_armed = engine.next_drain_at().is_some();

        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) => {
                        if !handle_command(&mut engine, line.trim(), args.verbose).await {
                            break;
                        }
                    }
                    None => break,
                }
            }

            // Debounced dirty drain
            _ = tokio::time::sleep_until(drain_deadline), if drain_armed => {
                if args.verbose {
                    println!("Draining {} pending item(s)", engine.status().pending);
                }
                engine.drain().await;
            }

            // Periodic reconciliation, independent of user activity
            _ = reconcile_timer.tick() => {
                if args.verbose {
                    println!("Performing periodic reconciliation");
                }
                engine.reconcile().await;
                engine.drain().await;
            }

            // A finished background snapshot push; a partial conflict means
            // the server moved ahead of us while it was in flight
            Some(ack) = import_outcomes.recv() => {
                if ack.conflict && args.verbose {
                    println!(
                        "Snapshot push partially applied ({}/{}), restamping and retrying",
                        ack.applied.unwrap_or(0),
                        ack.total.unwrap_or(0)
                    );
                } else if args.verbose {
                    println!("Snapshot push applied");
                }
                engine.import_ack(&ack).await;
            }

            _ = wake.recv() => {
                if args.verbose {
                    println!("Wake signal received, reconciling");
                }
                engine.reconcile().await;
                engine.drain().await;
            }

            _ = tokio::signal::ctrl_c() => {
                println!("Received shutdown signal, stopping tally-syncd");
                break;
            }
        }
    }

    let pending = engine.status().pending;
    if pending > 0 {
        println!("Note: {pending} change(s) not yet confirmed by the server");
    }
    Ok(())
}

/// Execute one line command. Returns false when the loop should exit.
async fn handle_command(engine: &mut SyncEngine, line: &str, verbose: bool) -> bool {
    let mut parts = line.splitn(3, ' ');
    let command = parts.next().unwrap_or("");
    match command {
        "" => {}
        "toggle" => match parts.next() {
            Some(item_id) => {
                if let Err(e) = engine.toggle(item_id) {
                    eprintln!("toggle failed: {e}");
                } else if verbose {
                    println!("Toggled {item_id}");
                }
            }
            None => eprintln!("usage: toggle <item-id>"),
        },
        "note" => match parts.next() {
            Some(item_id) => {
                let note = parts.next().unwrap_or("").to_string();
                if let Err(e) = engine.set_note(item_id, note) {
                    eprintln!("note failed: {e}");
                }
            }
            None => eprintln!("usage: note <item-id> [text]"),
        },
        "import" => match parts.next() {
            Some(path) => match read_import_file(path) {
                Ok(map) => {
                    let count = map.len();
                    match engine.import(map) {
                        Ok(()) => println!("Imported {count} entries"),
                        Err(e) => eprintln!("import failed: {e}"),
                    }
                }
                Err(e) => eprintln!("import failed: {e:#}"),
            },
            None => eprintln!("usage: import <file.json>"),
        },
        "reset" => {
            engine.reset().await;
            println!("Progress reset");
        }
        "status" => match serde_json::to_string_pretty(&engine.status()) {
            Ok(json) => println!("{json}"),
            Err(e) => eprintln!("status failed: {e}"),
        },
        "sync" => {
            engine.reconcile().await;
            engine.drain().await;
            if verbose {
                println!("Manual sync done");
            }
        }
        "quit" | "exit" => return false,
        other => eprintln!("unknown command: {other}"),
    }
    true
}

fn read_import_file(path: &str) -> Result<ProgressMap> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {path}"))?;
    let value: serde_json::Value =
        serde_json::from_str(&data).with_context(|| format!("failed to parse {path}"))?;
    parse_import(value)
}

/// Accept both export shapes: `{"id": true}` and
/// `{"id": {"done": true, "note": "..."}}`
fn parse_import(value: serde_json::Value) -> Result<ProgressMap> {
    let object = value
        .as_object()
        .context("import file must be a JSON object keyed by item id")?;
    let mut map = ProgressMap::new();
    for (item_id, entry) in object {
        let parsed = match entry {
            serde_json::Value::Bool(done) => ProgressEntry::new(*done, None, 0),
            serde_json::Value::Object(fields) => ProgressEntry::new(
                fields.get("done").and_then(|v| v.as_bool()).unwrap_or(false),
                fields
                    .get("note")
                    .and_then(|v| v.as_str())
                    .map(String::from),
                0,
            ),
            _ => continue,
        };
        map.insert(item_id.clone(), parsed);
    }
    Ok(map)
}
