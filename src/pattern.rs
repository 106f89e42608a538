use std::sync::LazyLock;

use regex::{RegexSet, RegexSetBuilder};

/// Manifest URL patterns, in the order they are reported by [`matching_pattern`]
///
/// The last entry is a catch-all; anything carrying `m3u8` is worth a look
pub const MANIFEST_PATTERNS: [&str; 7] = [
    r"\.m3u8(\?.*)?$",
    r"/manifest\.m3u8",
    r"/playlist\.m3u8",
    r"/master\.m3u8",
    r"hls.*\.m3u8",
    r"/chunklist.*\.m3u8",
    r"m3u8",
];

static MANIFEST_REGEX_SET: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSetBuilder::new(MANIFEST_PATTERNS)
        .case_insensitive(true)
        .build()
        .unwrap()
});

/// Checks whether a URL plausibly points at an HLS manifest
///
/// Never errors; garbage input simply doesn't match
#[must_use]
pub fn is_manifest_url(url: &str) -> bool {
    MANIFEST_REGEX_SET.is_match(url)
}

/// Returns the first pattern in [`MANIFEST_PATTERNS`] that matched `url`
#[must_use]
pub fn matching_pattern(url: &str) -> Option<&'static str> {
    MANIFEST_REGEX_SET
        .matches(url)
        .iter()
        .next()
        .map(|i| MANIFEST_PATTERNS[i])
}
