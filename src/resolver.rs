use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::{
    cache::{CacheEntry, CacheKey, CacheStore},
    capture::{CaptureError, CaptureOptions, CapturePage, Navigator, capture_from_network},
    config::Config,
    expiry::infer_expiration,
    validate::{HeadProbe, Reachability},
};

/// A manifest URL for a channel, and whether it came out of the cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub entry: CacheEntry,
    pub from_cache: bool,
}

/// Cache-first manifest lookup: reuse a fresh entry, otherwise capture one and remember it
#[derive(Debug)]
pub struct ManifestResolver<'n, N, V = HeadProbe> {
    navigator: &'n N,
    validator: V,
    options: CaptureOptions,
    fallback_ttl: Option<u64>,
}

impl<'n, N> ManifestResolver<'n, N> {
    pub fn from_config(navigator: &'n N, config: &Config) -> Self {
        Self::new(navigator, HeadProbe::default(), config.capture_options())
            .with_fallback_ttl(config.fallback_ttl)
    }
}

impl<'n, N, V: Reachability> ManifestResolver<'n, N, V> {
    pub fn new(navigator: &'n N, validator: V, options: CaptureOptions) -> Self {
        Self {
            navigator,
            validator,
            options,
            fallback_ttl: None,
        }
    }

    /// Lifetime given to captured URLs that carry no expiry hint of their own
    #[must_use]
    pub fn with_fallback_ttl(mut self, ttl_seconds: Option<u64>) -> Self {
        self.fallback_ttl = ttl_seconds;
        self
    }

    /// Returns a usable manifest URL for `key`, capturing one from `page` when needed
    ///
    /// A capture is written back to `store`. Failing to persist it is logged and
    /// does not fail the lookup.
    ///
    /// # Errors
    /// Errors when the cache has nothing fresh and the capture fails
    #[instrument(skip(self, store, page, profile), fields(channel = key.channel(), url = key.source_url()))]
    pub async fn resolve<P>(
        &self,
        store: &mut CacheStore,
        key: &CacheKey,
        page: &P,
        profile: &N::Profile,
    ) -> Result<Resolution, CaptureError>
    where
        P: CapturePage,
        N: Navigator<P>,
    {
        if let Some(entry) = store.get(key) {
            if !entry.is_expired() {
                debug!("Using cached M3U8 {}", entry.m3u8_url);
                return Ok(Resolution {
                    entry: entry.clone(),
                    from_cache: true,
                });
            }
            info!("Cached M3U8 for {key} expired, capturing a new one");
        }

        let captured = capture_from_network(
            page,
            self.navigator,
            key.source_url(),
            profile,
            &self.options,
            &self.validator,
        )
        .await?;

        let captured_at = Utc::now();
        let entry = CacheEntry {
            source_url: key.source_url().to_string(),
            expires_at: infer_expiration(&captured.m3u8_url, captured_at, self.fallback_ttl),
            m3u8_url: captured.m3u8_url,
            captured_at,
            headers: captured.request_headers,
        };

        if let Err(e) = store.set(key, entry.clone()).await {
            warn!("Failed to save M3U8 cache entry for {key}: {e:#}");
        }

        Ok(Resolution {
            entry,
            from_cache: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{DateTime, TimeDelta};

    use super::*;
    use crate::capture::{
        Feed,
        fake::{FakePage, ScriptedNavigator, StubProbe, request},
    };

    fn options() -> CaptureOptions {
        CaptureOptions {
            timeout: Duration::from_millis(100),
            cancel: None,
        }
    }

    fn key() -> CacheKey {
        CacheKey::new("news", "https://tv.example/live/news")
    }

    fn navigator_finding(m3u8_url: &str) -> ScriptedNavigator {
        ScriptedNavigator::with_events(vec![(
            Feed::RequestWillBeSent,
            request(m3u8_url, &[("Referer", "https://tv.example/")]),
        )])
    }

    #[tokio::test]
    async fn miss_captures_and_stores() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m3u8-cache.json");
        let mut store = CacheStore::open(path.clone()).await;
        let navigator = navigator_finding("https://cdn.example/hls/master.m3u8?exp=9999999999");
        let resolver = ManifestResolver::new(&navigator, StubProbe::reachable(), options());

        let resolution = resolver
            .resolve(&mut store, &key(), &FakePage::default(), &())
            .await
            .unwrap();

        assert!(!resolution.from_cache);
        assert_eq!(resolution.entry.source_url, "https://tv.example/live/news");
        assert_eq!(
            resolution.entry.expires_at,
            DateTime::from_timestamp_millis(9_999_999_999_000)
        );
        assert_eq!(
            resolution.entry.headers.as_ref().and_then(|h| h.get("Referer")),
            Some(&"https://tv.example/".to_string())
        );

        let reopened = CacheStore::open(path).await;
        assert_eq!(reopened.get(&key()), Some(&resolution.entry));
    }

    #[tokio::test]
    async fn fresh_entry_skips_capture() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CacheStore::open(dir.path().join("m3u8-cache.json")).await;
        let navigator = navigator_finding("https://cdn.example/first.m3u8");
        let resolver = ManifestResolver::new(&navigator, StubProbe::reachable(), options());

        let first = resolver
            .resolve(&mut store, &key(), &FakePage::default(), &())
            .await
            .unwrap();
        let second = resolver
            .resolve(&mut store, &key(), &FakePage::default(), &())
            .await
            .unwrap();

        assert!(second.from_cache);
        assert_eq!(second.entry, first.entry);
        assert_eq!(navigator.navigated.borrow().len(), 1);
    }

    #[tokio::test]
    async fn expired_entry_is_recaptured() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CacheStore::open(dir.path().join("m3u8-cache.json")).await;
        let stale = CacheEntry {
            source_url: "https://tv.example/live/news".to_string(),
            m3u8_url: "https://cdn.example/old.m3u8".to_string(),
            captured_at: Utc::now() - TimeDelta::hours(2),
            expires_at: Some(Utc::now() - TimeDelta::hours(1)),
            headers: None,
        };
        store.set(&key(), stale).await.unwrap();

        let navigator = navigator_finding("https://cdn.example/new.m3u8");
        let resolver = ManifestResolver::new(&navigator, StubProbe::reachable(), options())
            .with_fallback_ttl(Some(600));

        let resolution = resolver
            .resolve(&mut store, &key(), &FakePage::default(), &())
            .await
            .unwrap();

        assert!(!resolution.from_cache);
        assert_eq!(resolution.entry.m3u8_url, "https://cdn.example/new.m3u8");
        assert_eq!(
            resolution.entry.expires_at,
            Some(resolution.entry.captured_at + TimeDelta::seconds(600))
        );
        assert_eq!(store.get(&key()), Some(&resolution.entry));
    }

    #[tokio::test]
    async fn failed_capture_leaves_cache_alone() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CacheStore::open(dir.path().join("m3u8-cache.json")).await;
        let navigator = navigator_finding("https://cdn.example/dead.m3u8");
        let resolver = ManifestResolver::new(&navigator, StubProbe::unreachable(), options());

        let err = resolver
            .resolve(&mut store, &key(), &FakePage::default(), &())
            .await
            .unwrap_err();

        assert_eq!(
            err,
            CaptureError::Unreachable("https://cdn.example/dead.m3u8".to_string())
        );
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn unwritable_cache_does_not_fail_lookup() {
        let dir = tempfile::tempdir().unwrap();
        // The cache path's parent is a regular file, so saving must fail
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "").unwrap();
        let mut store = CacheStore::open(blocker.join("m3u8-cache.json")).await;

        let navigator = navigator_finding("https://cdn.example/live.m3u8");
        let resolver = ManifestResolver::new(&navigator, StubProbe::reachable(), options());

        let resolution = resolver
            .resolve(&mut store, &key(), &FakePage::default(), &())
            .await
            .unwrap();

        assert_eq!(resolution.entry.m3u8_url, "https://cdn.example/live.m3u8");
    }

    #[tokio::test]
    async fn configured_resolver_serves_cache_hits() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            cache_file: dir.path().join("m3u8-cache.json"),
            ..Config::default()
        };
        let mut store = CacheStore::open(config.cache_file.clone()).await;
        let entry = CacheEntry {
            source_url: "https://tv.example/live/news".to_string(),
            m3u8_url: "https://cdn.example/cached.m3u8".to_string(),
            captured_at: Utc::now(),
            expires_at: None,
            headers: None,
        };
        store.set(&key(), entry.clone()).await.unwrap();

        let navigator = ScriptedNavigator::default();
        let resolver = ManifestResolver::from_config(&navigator, &config);

        let resolution = resolver
            .resolve(&mut store, &key(), &FakePage::default(), &())
            .await
            .unwrap();

        assert!(resolution.from_cache);
        assert_eq!(resolution.entry, entry);
        assert!(navigator.navigated.borrow().is_empty());
    }
}
