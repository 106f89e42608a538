use base64::{
    Engine as _, alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
};
use chrono::{DateTime, TimeDelta, Utc};
use reqwest::Url;
use serde_json::Value;

/// Query parameters commonly used by CDNs to carry an expiry epoch, checked in order
pub const EXPIRY_PARAMS: [&str; 5] = ["exp", "expires", "expiration", "expires_at", "expiry"];

/// Query parameters that may carry a JWT-like token with an `exp` claim, checked in order
pub const TOKEN_PARAMS: [&str; 5] = ["jwt", "token", "sjwt", "auth", "authorization"];

/// Lenient base64url: padding optional, stray trailing bits tolerated
const TOKEN_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_decode_allow_trailing_bits(true)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Anything above this is already in milliseconds
const MILLIS_THRESHOLD: f64 = 1_000_000_000_000.0;
/// Anything above this (and not above [`MILLIS_THRESHOLD`]) is in seconds
const SECONDS_THRESHOLD: f64 = 1_000_000_000.0;

/// Figures out when a captured manifest URL stops being usable
///
/// Signals are tried in order:
/// 1. An epoch in one of [`EXPIRY_PARAMS`]
/// 2. An `exp` claim in a token carried by one of [`TOKEN_PARAMS`]
/// 3. `captured_at + ttl_seconds`, when a positive TTL is given
///
/// Epochs that aren't strictly after `captured_at` are ignored and the search moves on.
/// Returns `None` when the entry should never expire on its own.
#[must_use]
pub fn infer_expiration(
    m3u8_url: &str,
    captured_at: DateTime<Utc>,
    ttl_seconds: Option<u64>,
) -> Option<DateTime<Utc>> {
    if let Ok(url) = Url::parse(m3u8_url) {
        let from_url = param_epochs(&url)
            .chain(token_epochs(&url))
            .filter_map(DateTime::from_timestamp_millis)
            .find(|exp| *exp > captured_at);

        if from_url.is_some() {
            return from_url;
        }
    }

    let ttl = ttl_seconds.filter(|ttl| *ttl > 0)?;
    let ttl = TimeDelta::try_seconds(i64::try_from(ttl).ok()?)?;
    captured_at.checked_add_signed(ttl)
}

/// Same as [`infer_expiration`], but takes the capture instant as unix milliseconds
#[must_use]
pub fn infer_expiration_ms(
    m3u8_url: &str,
    captured_at_ms: i64,
    ttl_seconds: Option<u64>,
) -> Option<DateTime<Utc>> {
    let captured_at = DateTime::from_timestamp_millis(captured_at_ms)?;
    infer_expiration(m3u8_url, captured_at, ttl_seconds)
}

fn first_param(url: &Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

fn param_epochs(url: &Url) -> impl Iterator<Item = i64> + '_ {
    EXPIRY_PARAMS
        .iter()
        .filter_map(|name| first_param(url, name))
        .filter_map(|value| parse_epoch_millis(&value))
}

fn token_epochs(url: &Url) -> impl Iterator<Item = i64> + '_ {
    TOKEN_PARAMS
        .iter()
        .filter_map(|name| first_param(url, name))
        .filter_map(|token| token_exp_millis(&token))
}

/// Parses a numeric timestamp string, guessing its unit from its magnitude
fn parse_epoch_millis(value: &str) -> Option<i64> {
    epoch_millis(value.trim().parse::<f64>().ok()?)
}

#[allow(clippy::cast_possible_truncation)]
fn epoch_millis(value: f64) -> Option<i64> {
    if !value.is_finite() {
        return None;
    }

    if value > MILLIS_THRESHOLD {
        return Some(value as i64);
    }

    if value > SECONDS_THRESHOLD {
        return Some((value * 1000.0) as i64);
    }

    None
}

/// Reads the `exp` claim of a `header.payload[.signature]` token
///
/// The signature is not verified, we only care about a hint of the lifetime.
fn token_exp_millis(token: &str) -> Option<i64> {
    let payload = token.split('.').nth(1)?;

    let encoded: String = payload
        .chars()
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            c => c,
        })
        .collect();

    let decoded = TOKEN_ENGINE.decode(encoded).ok()?;
    let claims = serde_json::from_slice::<Value>(&decoded).ok()?;

    epoch_millis(claims.get("exp")?.as_f64()?)
}
