//! eraindex CLI: inspect a running or stopped indexer's database.
//!
//! Usage:
//! ```bash
//! eraindex status   ./eraindex.db
//! eraindex eras     ./eraindex.db 10
//! eraindex warnings ./eraindex.db 50
//! eraindex config   ./eraindex.json
//! eraindex info
//! ```

use std::env;
use std::path::Path;
use std::process;

use anyhow::{bail, Context};

use eraindex_core::{Chain, IndexStore, IndexerConfig};
use eraindex_storage::SqliteStorage;

const DEFAULT_LIMIT: usize = 20;

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "info" => {
            cmd_info();
            Ok(())
        }
        "version" | "--version" | "-V" => {
            println!("eraindex {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        "status" => cmd_status(&args[2..]).await,
        "eras" => cmd_eras(&args[2..]).await,
        "warnings" => cmd_warnings(&args[2..]).await,
        "config" => cmd_config(&args[2..]),
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn print_usage() {
    println!("eraindex {}", env!("CARGO_PKG_VERSION"));
    println!("Era/session correlation indexer for Relay Chain + Asset Hub staking\n");
    println!("USAGE:");
    println!("    eraindex <COMMAND> [ARGS]\n");
    println!("COMMANDS:");
    println!("    status   <db>           Per-chain sync state");
    println!("    eras     <db> [limit]   Most recent eras");
    println!("    warnings <db> [limit]   Most recent warnings");
    println!("    config   [file]         Print the effective configuration as JSON");
    println!("    info                    Show defaults");
    println!("    version                 Print version");
    println!("    help                    Print this help");
}

fn cmd_info() {
    let cfg = IndexerConfig::default();
    println!("eraindex v{}", env!("CARGO_PKG_VERSION"));
    println!("  Chains: Relay Chain (RC) + Asset Hub (AH)");
    println!("  Default backfill depth: {} blocks", cfg.relay_chain.backfill_depth);
    println!("  Default poll interval: {} ms", cfg.relay_chain.poll_interval_ms);
    println!(
        "  Session report deadline: {:?}",
        cfg.engine.expectations.session_report
    );
    println!(
        "  Era activation deadline: {:?}",
        cfg.engine.expectations.era_activation
    );
    println!("  Deadline sweep: every {} ms", cfg.sweep_interval_ms);
    println!("  Storage backends: memory, SQLite (feature: sqlite)");
}

async fn open(args: &[String]) -> anyhow::Result<SqliteStorage> {
    let Some(db) = args.first() else {
        bail!("missing <db> argument");
    };
    if !db.starts_with("sqlite:") && !Path::new(db).exists() {
        bail!("database not found: {db}");
    }
    SqliteStorage::open(db)
        .await
        .with_context(|| format!("opening {db}"))
}

fn limit(args: &[String]) -> anyhow::Result<usize> {
    match args.get(1) {
        Some(s) => s.parse().with_context(|| format!("invalid limit '{s}'")),
        None => Ok(DEFAULT_LIMIT),
    }
}

fn fmt_ms(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| ms.to_string())
}

fn fmt_opt(v: Option<u32>) -> String {
    v.map(|v| v.to_string()).unwrap_or_else(|| "-".into())
}

async fn cmd_status(args: &[String]) -> anyhow::Result<()> {
    let store = open(args).await?;
    let states = store.get_current_state().await?;
    for chain in Chain::ALL {
        let Some(s) = states.iter().find(|s| s.chain == chain) else {
            println!("{chain}: no state recorded");
            continue;
        };
        println!("{chain} ({})", chain.as_str());
        println!("  last processed block: {}", s.last_processed_block);
        println!("  current height:       {} (lag {})", s.current_height, s.lag());
        println!("  syncing:              {}", s.is_syncing);
        println!("  era / session:        {} / {}", fmt_opt(s.current_era), fmt_opt(s.current_session));
        println!("  errors:               {}", s.error_count);
        if let Some(err) = &s.last_error {
            println!("  last error:           {err}");
        }
        println!("  updated:              {}", fmt_ms(s.updated_at));
    }
    println!("events stored: {}", store.event_count().await?);
    store.close().await?;
    Ok(())
}

async fn cmd_eras(args: &[String]) -> anyhow::Result<()> {
    let store = open(args).await?;
    let eras = store.get_recent_eras(limit(args)?).await?;
    if eras.is_empty() {
        println!("no eras recorded");
    }
    for era in eras {
        let end = era
            .session_end
            .map(|e| e.to_string())
            .unwrap_or_else(|| "open".into());
        println!(
            "era {:>6}  sessions {}..{}  started {}",
            era.era_id,
            era.session_start,
            end,
            fmt_ms(era.start_time)
        );
    }
    store.close().await?;
    Ok(())
}

async fn cmd_warnings(args: &[String]) -> anyhow::Result<()> {
    let store = open(args).await?;
    let warnings = store.get_recent_warnings(limit(args)?).await?;
    if warnings.is_empty() {
        println!("no warnings recorded");
    }
    for w in warnings {
        println!(
            "{} [{}] {} era={} session={} block={}: {}",
            fmt_ms(w.timestamp),
            w.severity.as_str(),
            w.kind.as_str(),
            fmt_opt(w.era_id),
            fmt_opt(w.session_id),
            w.block_number,
            w.message
        );
    }
    store.close().await?;
    Ok(())
}

fn cmd_config(args: &[String]) -> anyhow::Result<()> {
    let config = match args.first() {
        Some(path) => {
            let raw = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
            IndexerConfig::from_json(&raw)?
        }
        None => IndexerConfig::default(),
    };
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
