use anyhow::{Context, Result};
use chrono::{Local, TimeZone};
use clap::Parser;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

use threadline::config::Config;
use threadline::feed::{self, EngineServices, FeedCommand, FeedPhase, FeedSnapshot, FeedSpec, SeenRegistry};
use threadline::record::{AuthorId, Record};
use threadline::relay::MemoryRelay;
use threadline::storage::{Database, DatabaseError, RecordStore};
use threadline::trust::AdmitAll;
use threadline::util::preview_line;

/// Records are written to the database in batches of this size on import.
const IMPORT_BATCH: usize = 500;

/// Get the config directory path (~/.config/threadline/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("threadline"))
}

#[derive(Parser, Debug)]
#[command(
    name = "threadline",
    about = "Rebuild a threaded timeline from locally stored relay records"
)]
struct Args {
    /// Reset database (delete and recreate)
    #[arg(long)]
    reset_db: bool,

    /// Import records from a JSON-lines file before building the feed
    #[arg(long, value_name = "FILE")]
    import: Option<PathBuf>,

    /// Comma-separated authors whose records the feed shows
    #[arg(long, value_name = "IDS", value_delimiter = ',')]
    authors: Vec<String>,

    /// The reader's own author id
    #[arg(long, value_name = "ID")]
    account: Option<String>,

    /// Feed id; list position is remembered per feed
    #[arg(long, default_value = "following")]
    feed: String,

    /// Add an author to the persisted block list
    #[arg(long, value_name = "ID")]
    block: Vec<String>,

    /// Hide replies
    #[arg(long)]
    hide_replies: bool,

    /// Print at most this many leafs
    #[arg(long, default_value_t = 20)]
    limit: usize,

    /// Line width used for previews
    #[arg(long, default_value_t = 80)]
    width: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
        println!("Created config directory: {}", config_dir.display());
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        match std::fs::metadata(&config_dir) {
            Ok(metadata) => {
                let mut perms = metadata.permissions();
                perms.set_mode(0o700);
                if let Err(e) = std::fs::set_permissions(&config_dir, perms) {
                    tracing::warn!(
                        path = %config_dir.display(),
                        error = %e,
                        "Failed to set config directory permissions to 0700"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(
                    path = %config_dir.display(),
                    error = %e,
                    "Failed to read config directory metadata"
                );
            }
        }
    }

    let mut config = Config::load(&config_dir.join("config.toml")).context("Failed to load config")?;
    if args.hide_replies {
        config.hide_replies = true;
    }
    if !config.relays.is_empty() {
        tracing::info!(
            relays = ?config.relays,
            "Relays are configured for an embedding relay client; the CLI reads only the local database"
        );
    }

    let db_path = config_dir.join("threadline.db");
    if args.reset_db && db_path.exists() {
        std::fs::remove_file(&db_path).context("Failed to delete database")?;
        println!("Database reset.");
    }

    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = match Database::open(db_path_str).await {
        Ok(db) => db,
        Err(DatabaseError::InstanceLocked) => {
            eprintln!(
                "Error: Another instance of threadline appears to be running. Please close it and try again."
            );
            std::process::exit(1);
        }
        Err(e) => {
            return Err(anyhow::anyhow!("Failed to open database: {}", e));
        }
    };

    if let Some(import_file) = &args.import {
        let (imported, skipped) = import_records(&db, import_file).await?;
        println!("Imported {} records ({} skipped)", imported, skipped);
    }

    let mut lists = db.load_filter_lists().await.context("Failed to load filter lists")?;
    if !args.block.is_empty() {
        lists.blocked.extend(args.block.iter().map(|a| AuthorId::from(a.as_str())));
        db.save_filter_lists(&lists)
            .await
            .context("Failed to save filter lists")?;
    }

    if args.authors.is_empty() {
        eprintln!("Error: No authors given.");
        eprintln!();
        eprintln!("Name the authors whose records the feed should show:");
        eprintln!("  threadline --authors <ID>[,<ID>...]");
        std::process::exit(1);
    }

    let (inbound_tx, inbound_rx) = mpsc::channel(256);
    let relay = Arc::new(MemoryRelay::offline(inbound_tx));
    let store = Arc::new(db.clone());
    let services = EngineServices {
        store: store.clone(),
        state_store: store.clone(),
        relay: relay.clone(),
        trust: Arc::new(AdmitAll),
    };
    let spec = FeedSpec {
        id: args.feed.clone(),
        authors: args.authors.iter().map(|a| AuthorId::from(a.as_str())).collect(),
        account: args.account.as_deref().map(AuthorId::from),
    };

    let seen = SeenRegistry::for_feed(&SeenRegistry::new(), config.per_feed_dedup);
    let handle = feed::spawn(spec, &config, lists, seen, services, inbound_rx)
        .await
        .context("Failed to start feed")?;
    let mut snapshots = handle.subscribe();
    handle.send(FeedCommand::Start).await?;

    let wait = config.tuning.bootstrap_timeout() * 2;
    let went_live = matches!(
        tokio::time::timeout(wait, snapshots.wait_for(|s| s.phase == FeedPhase::Live)).await,
        Ok(Ok(_))
    );
    if !went_live {
        tracing::warn!(feed = %args.feed, "Feed did not go live in time, printing what is there");
    }
    // Let dangling replies settle against the offline relay.
    tokio::time::sleep(config.tuning.fetch_debounce() * 2).await;

    let snapshot = handle.snapshot();
    print_snapshot(&snapshot, &db, args.limit, args.width).await;

    if let Some(top) = snapshot.posts.first() {
        handle.send(FeedCommand::Appeared(top.id.clone())).await?;
    }
    handle.shutdown().await?;
    tracing::debug!(requests = relay.sent().len(), "Relay requests issued");
    Ok(())
}

/// Read a JSON-lines export. Lines that do not parse, or whose id is not
/// the hash of their content, are skipped with a warning.
async fn import_records(db: &Database, path: &Path) -> Result<(usize, usize)> {
    let canonical = path
        .canonicalize()
        .with_context(|| format!("Failed to resolve import file: {}", path.display()))?;
    let metadata = std::fs::metadata(&canonical)?;
    if !metadata.is_file() {
        anyhow::bail!("Import path must be a regular file");
    }
    let file = std::fs::File::open(&canonical)
        .with_context(|| format!("Failed to read import file: {}", canonical.display()))?;

    let mut batch: Vec<Record> = Vec::with_capacity(IMPORT_BATCH);
    let mut imported = 0;
    let mut skipped = 0;
    for (number, line) in BufReader::new(file).lines().enumerate() {
        let line = line.context("Failed to read import file")?;
        if line.trim().is_empty() {
            continue;
        }
        let record = match Record::from_json(&line) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(line = number + 1, error = %e, "Skipping unparsable record");
                skipped += 1;
                continue;
            }
        };
        if let Err(e) = record.verify_id() {
            tracing::warn!(line = number + 1, error = %e, "Skipping record with bad id");
            skipped += 1;
            continue;
        }
        batch.push(record);
        if batch.len() >= IMPORT_BATCH {
            imported += db.store_records(&batch).await?;
            batch.clear();
        }
    }
    if !batch.is_empty() {
        imported += db.store_records(&batch).await?;
    }
    Ok((imported, skipped))
}

async fn print_snapshot(snapshot: &FeedSnapshot, store: &dyn RecordStore, limit: usize, width: usize) {
    if snapshot.is_empty() {
        println!("Nothing to show yet.");
        return;
    }
    for post in snapshot.posts.iter().take(limit) {
        let indent = "  ";
        for (depth, ancestor) in post.ancestors.iter().enumerate() {
            let marker = if depth == 0 && post.truncated { "… " } else { "" };
            println!(
                "{}{}{} {}",
                indent.repeat(depth),
                marker,
                short(&ancestor.author),
                preview_line(&ancestor.content, width.saturating_sub(depth * 2 + 12))
            );
        }

        let depth = post.ancestors.len();
        let replies = match store.fetch_by_relation_target(&post.id).await {
            Ok(found) => found.iter().filter(|r| r.parent_id() == Some(&*post.id)).count(),
            Err(e) => {
                tracing::warn!(id = %post.id, error = %e, "Failed to count replies");
                0
            }
        };
        let body = match &post.repost_of {
            Some(target) => format!("reposted {}: {}", short(&target.author), target.content),
            None => post.record.content.clone(),
        };
        println!(
            "{}{} {}  [{}{}]",
            indent.repeat(depth),
            short(&post.record.author),
            preview_line(&body, width.saturating_sub(depth * 2 + 24)),
            format_time(post.record.created_at),
            if replies > 0 { format!(", {} replies", replies) } else { String::new() }
        );
    }
    if snapshot.unread > 0 {
        println!("({} unread)", snapshot.unread);
    }
}

fn short(author: &str) -> &str {
    author.get(..8).unwrap_or(author)
}

fn format_time(created_at: i64) -> String {
    Local
        .timestamp_opt(created_at, 0)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| created_at.to_string())
}
