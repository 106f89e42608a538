use std::{path::PathBuf, time::Duration};

use crate::capture::{CaptureOptions, DEFAULT_CAPTURE_TIMEOUT};

/// Overrides where the manifest cache lives
pub const CACHE_FILE_ENV: &str = "M3U8_FERRET_CACHE_FILE";
/// Capture timeout in milliseconds
pub const CAPTURE_TIMEOUT_ENV: &str = "M3U8_FERRET_CAPTURE_TIMEOUT_MS";
/// Lifetime in seconds for captured URLs without an expiry hint
pub const FALLBACK_TTL_ENV: &str = "M3U8_FERRET_FALLBACK_TTL";

/// Settings shared by the cache and the capture monitor
///
/// The binary fills this in from its arguments (with environment fallbacks named by
/// the `*_ENV` constants); library users build it however they like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub cache_file: PathBuf,
    pub capture_timeout: Duration,
    pub fallback_ttl: Option<u64>,
}

/// `~/.m3u8-ferret/m3u8-cache.json`, relative to the working directory if there's no home
#[must_use]
pub fn default_cache_file() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_default()
        .join(".m3u8-ferret")
        .join("m3u8-cache.json")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_file: default_cache_file(),
            capture_timeout: DEFAULT_CAPTURE_TIMEOUT,
            fallback_ttl: None,
        }
    }
}

impl Config {
    #[must_use]
    pub fn capture_options(&self) -> CaptureOptions {
        CaptureOptions {
            timeout: self.capture_timeout,
            cancel: None,
        }
    }
}
