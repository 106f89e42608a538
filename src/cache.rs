use std::{
    collections::BTreeMap,
    ffi::OsString,
    fmt,
    io::ErrorKind,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{Context, Result, ensure};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::Headers;

/// Version tag of the on-disk cache document
pub const CACHE_VERSION: u32 = 1;

/// Separates the channel from the source URL in a rendered [`CacheKey`]
const KEY_DELIMITER: char = '|';

/// A manifest URL discovered for one (channel, source page) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    /// Page that was navigated to find the manifest
    pub source_url: String,
    pub m3u8_url: String,
    pub captured_at: DateTime<Utc>,
    /// `None` means the entry never goes stale by itself
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Request headers seen alongside the manifest request, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Headers>,
}

impl CacheEntry {
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now > expires_at)
    }
}

/// Identifies a cache entry by channel and source URL
///
/// Renders as `<channel>|<source_url>`. `%` and `|` inside the channel are
/// percent-escaped, so the first `|` always ends the channel part.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    channel: String,
    source_url: String,
}

impl CacheKey {
    pub fn new(channel: impl Into<String>, source_url: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            source_url: source_url.into(),
        }
    }

    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    #[must_use]
    pub fn source_url(&self) -> &str {
        &self.source_url
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in self.channel.chars() {
            match c {
                '%' => f.write_str("%25")?,
                KEY_DELIMITER => f.write_str("%7C")?,
                c => write!(f, "{c}")?,
            }
        }
        write!(f, "{KEY_DELIMITER}{}", self.source_url)
    }
}

impl FromStr for CacheKey {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (channel, source_url) = s
            .split_once(KEY_DELIMITER)
            .with_context(|| format!("Cache key `{s}` has no `{KEY_DELIMITER}` delimiter"))?;

        let mut unescaped = String::with_capacity(channel.len());
        let mut rest = channel;
        while let Some(i) = rest.find('%') {
            unescaped.push_str(&rest[..i]);
            rest = &rest[i..];
            if rest.starts_with("%25") {
                unescaped.push('%');
                rest = &rest[3..];
            } else if rest.starts_with("%7C") || rest.starts_with("%7c") {
                unescaped.push(KEY_DELIMITER);
                rest = &rest[3..];
            } else {
                unescaped.push('%');
                rest = &rest[1..];
            }
        }
        unescaped.push_str(rest);

        Ok(Self::new(unescaped, source_url))
    }
}

#[derive(Debug, Serialize)]
struct CacheDocument {
    version: u32,
    entries: BTreeMap<String, CacheEntry>,
}

impl Default for CacheDocument {
    fn default() -> Self {
        Self {
            version: CACHE_VERSION,
            entries: BTreeMap::new(),
        }
    }
}

/// Shape check only, entries are validated one by one afterwards
#[derive(Deserialize)]
struct RawCacheDocument {
    version: u32,
    entries: serde_json::Map<String, Value>,
}

/// Durable store of discovered manifest URLs
///
/// The backing file is read once in [`CacheStore::open`] and every write
/// flushes the whole document back with a temp file + rename.
#[derive(Debug)]
pub struct CacheStore {
    path: PathBuf,
    document: CacheDocument,
}

impl CacheStore {
    /// Opens the cache at `path`
    ///
    /// Never fails: a missing file starts an empty cache, and so does an unreadable
    /// or malformed one (with a warning).
    #[instrument]
    pub async fn open(path: PathBuf) -> Self {
        let document = match tokio::fs::read_to_string(&path).await {
            Ok(content) => match parse_document(&content) {
                Ok(document) => document,
                Err(e) => {
                    warn!("Failed to read M3U8 cache {path:?}: {e:#}");
                    CacheDocument::default()
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No M3U8 cache at {path:?} yet, starting empty");
                CacheDocument::default()
            }
            Err(e) => {
                warn!("Failed to read M3U8 cache {path:?}: {e}");
                CacheDocument::default()
            }
        };

        Self { path, document }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn get(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.document.entries.get(&key.to_string())
    }

    /// Inserts or replaces an entry and persists the cache
    ///
    /// # Errors
    /// Errors when the cache directory or file cannot be written
    pub async fn set(&mut self, key: &CacheKey, entry: CacheEntry) -> Result<()> {
        self.document.entries.insert(key.to_string(), entry);
        self.save().await
    }

    /// Removes an entry, persisting the cache only if something was removed
    ///
    /// # Errors
    /// Errors when the cache file cannot be written
    pub async fn remove(&mut self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let removed = self.document.entries.remove(&key.to_string());
        if removed.is_some() {
            self.save().await?;
        }
        Ok(removed)
    }

    /// Drops every expired entry, returning how many were dropped
    ///
    /// # Errors
    /// Errors when the cache file cannot be written
    pub async fn prune_expired(&mut self) -> Result<usize> {
        let now = Utc::now();
        let before = self.document.entries.len();
        self.document
            .entries
            .retain(|_, entry| !entry.is_expired_at(now));

        let pruned = before - self.document.entries.len();
        if pruned > 0 {
            self.save().await?;
        }
        Ok(pruned)
    }

    /// Iterates over `(rendered key, entry)` in key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &CacheEntry)> {
        self.document
            .entries
            .iter()
            .map(|(key, entry)| (key.as_str(), entry))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.document.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.document.entries.is_empty()
    }

    async fn save(&self) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Creating M3U8 cache directory {dir:?}"))?;
        }

        let mut content =
            serde_json::to_string_pretty(&self.document).context("Serializing M3U8 cache")?;
        content.push('\n');

        // Rename is atomic, so readers only ever see a complete document
        let temp_path = temp_path_for(&self.path);
        tokio::fs::write(&temp_path, content)
            .await
            .with_context(|| format!("Writing M3U8 cache temp file {temp_path:?}"))?;
        tokio::fs::rename(&temp_path, &self.path)
            .await
            .with_context(|| format!("Moving M3U8 cache into place at {:?}", self.path))?;

        debug!("Saved {} M3U8 cache entries", self.document.entries.len());
        Ok(())
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut temp: OsString = path.as_os_str().to_owned();
    temp.push(".tmp");
    PathBuf::from(temp)
}

fn parse_document(content: &str) -> Result<CacheDocument> {
    let raw = serde_json::from_str::<RawCacheDocument>(content).context("Invalid cache format")?;
    ensure!(
        raw.version == CACHE_VERSION,
        "Unsupported cache version {}",
        raw.version
    );

    let mut entries = BTreeMap::new();
    for (key, value) in raw.entries {
        match serde_json::from_value::<CacheEntry>(value) {
            Ok(entry) => {
                entries.insert(key, entry);
            }
            Err(e) => warn!("Dropping malformed M3U8 cache entry `{key}`: {e}"),
        }
    }

    Ok(CacheDocument {
        version: CACHE_VERSION,
        entries,
    })
}
