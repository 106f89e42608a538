#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(clippy::cargo)]
#![warn(clippy::perf)]
#![warn(clippy::complexity)]
#![warn(clippy::style)]
#![allow(clippy::multiple_crate_versions)]

use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use m3u8_ferret::{
    CacheEntry, CacheKey, CacheStore, Config,
    config::{CACHE_FILE_ENV, CAPTURE_TIMEOUT_ENV, FALLBACK_TTL_ENV, default_cache_file},
    expiry::infer_expiration_ms,
    pattern::matching_pattern,
    util::truncate_string,
    validate::{HeadProbe, Reachability},
    validate_reachable,
};
use tracing::info;

/// Sniffs HLS manifest (M3U8) URLs out of browser traffic and caches them until they expire
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Manifest cache file [default: ~/.m3u8-ferret/m3u8-cache.json]
    #[arg(long, env = CACHE_FILE_ENV, global = true)]
    cache_file: Option<PathBuf>,

    /// How long a capture keeps listening once the page has loaded, in milliseconds
    #[arg(long, env = CAPTURE_TIMEOUT_ENV, default_value_t = 15_000, global = true)]
    capture_timeout_ms: u64,

    /// Lifetime in seconds for captured URLs without an expiry hint
    #[arg(long, env = FALLBACK_TTL_ENV, global = true)]
    fallback_ttl: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Checks whether a URL looks like an HLS manifest
    Classify { url: String },

    /// Works out when a captured manifest URL expires
    Expiry {
        url: String,

        /// Lifetime in seconds when the URL carries no expiry hint
        #[arg(long)]
        ttl: Option<u64>,

        /// Capture instant in unix milliseconds [default: now]
        #[arg(long)]
        captured_at: Option<i64>,
    },

    /// Checks that a manifest URL answers a HEAD request
    Probe {
        url: String,

        /// Gives up after this many milliseconds [default: 5000]
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Inspects or edits the manifest cache
    #[command(subcommand)]
    Cache(CacheCommand),
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
    /// Lists every cached manifest
    List,

    /// Shows a cached manifest, by its `<channel>|<source url>` key
    Get { key: CacheKey },

    /// Forgets a cached manifest, by its `<channel>|<source url>` key
    Remove { key: CacheKey },

    /// Drops every expired entry
    Prune,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    dotenvy::dotenv().ok();

    let args = Args::parse();
    let config = args.config();

    match args.command {
        Command::Classify { url } => match matching_pattern(&url) {
            Some(pattern) => println!("manifest (matched `{pattern}`)"),
            None => println!("not a manifest"),
        },

        Command::Expiry {
            url,
            ttl,
            captured_at,
        } => {
            let captured_at = captured_at.unwrap_or_else(|| Utc::now().timestamp_millis());
            match infer_expiration_ms(&url, captured_at, ttl.or(config.fallback_ttl)) {
                Some(expires_at) => println!("{}", expires_at.to_rfc3339()),
                None => println!("never expires"),
            }
        }

        Command::Probe { url, timeout_ms } => {
            let reachable = match timeout_ms {
                Some(ms) => {
                    HeadProbe::default()
                        .with_timeout(Duration::from_millis(ms))
                        .is_reachable(&url)
                        .await
                }
                None => validate_reachable(&url).await,
            };
            if !reachable {
                bail!("{url} is not reachable");
            }
            println!("reachable");
        }

        Command::Cache(command) => run_cache_command(command, &config).await?,
    }

    Ok(())
}

impl Args {
    fn config(&self) -> Config {
        Config {
            cache_file: self.cache_file.clone().unwrap_or_else(default_cache_file),
            capture_timeout: Duration::from_millis(self.capture_timeout_ms),
            fallback_ttl: self.fallback_ttl,
        }
    }
}

async fn run_cache_command(command: CacheCommand, config: &Config) -> Result<()> {
    let mut store = CacheStore::open(config.cache_file.clone()).await;

    match command {
        CacheCommand::List => {
            if store.is_empty() {
                info!("Cache at {:?} is empty", store.path());
            }
            for (key, entry) in store.iter() {
                println!(
                    "[{}] {key}\n    {}",
                    status(entry),
                    truncate_string(&entry.m3u8_url, 100)
                );
            }
        }

        CacheCommand::Get { key } => {
            let entry = store
                .get(&key)
                .with_context(|| format!("Nothing cached for `{key}`"))?;
            println!("{}", describe(entry));
        }

        CacheCommand::Remove { key } => {
            if store.remove(&key).await?.is_none() {
                bail!("Nothing cached for `{key}`");
            }
            info!("Removed `{key}`");
        }

        CacheCommand::Prune => {
            let pruned = store.prune_expired().await?;
            info!("Pruned {pruned} expired entries, {} left", store.len());
        }
    }

    Ok(())
}

fn status(entry: &CacheEntry) -> &'static str {
    if entry.is_expired() { "expired" } else { "fresh" }
}

fn describe(entry: &CacheEntry) -> String {
    let headers = entry.headers.as_ref().map_or_else(
        || "none".to_string(),
        |headers| {
            headers
                .iter()
                .map(|(name, value)| format!("{name}: {value}"))
                .collect::<Vec<String>>()
                .join(", ")
        },
    );

    indoc::formatdoc!(
        "Source:   {}
        Manifest: {}
        Captured: {}
        Expires:  {}
        Status:   {}
        Headers:  {}",
        entry.source_url,
        entry.m3u8_url,
        entry.captured_at.to_rfc3339(),
        entry
            .expires_at
            .map_or_else(|| "never".to_string(), |e| e.to_rfc3339()),
        status(entry),
        headers
    )
}
