#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(clippy::perf)]
#![warn(clippy::complexity)]
#![warn(clippy::style)]
#![allow(clippy::multiple_crate_versions)]

//! Finds HLS manifest URLs by watching a page's network traffic, and remembers them
//! until they expire.

use std::collections::BTreeMap;

pub mod cache;
pub mod capture;
pub mod config;
pub mod expiry;
pub mod pattern;
pub mod resolver;
pub mod util;
pub mod validate;

/// Request header name to value
pub type Headers = BTreeMap<String, String>;

pub use cache::{CacheEntry, CacheKey, CacheStore};
pub use capture::{CaptureError, CaptureOptions, CapturedManifest, capture_from_network};
pub use config::Config;
pub use expiry::infer_expiration;
pub use pattern::is_manifest_url;
pub use resolver::{ManifestResolver, Resolution};
pub use validate::validate_reachable;
