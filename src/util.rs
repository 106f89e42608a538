use crate::validate::PROBE_TIMEOUT;

/// Truncates a string to a maximum length, adding `...` to the end if it was truncated.
///
/// Backs off further when the cut would land in the middle of a UTF-8 codepoint.
/// Strings shorter than `...` itself are returned untouched.
///
/// # Arguments
/// * `string` - The string to truncate
/// * `max_length` - The maximum length of the string, in bytes
#[must_use]
pub fn truncate_string(string: &impl ToString, max_length: usize) -> String {
    let string = string.to_string();
    if string.len() <= max_length || max_length < 3 {
        return string;
    }

    let mut cut = max_length - 3;
    while !string.is_char_boundary(cut) {
        cut -= 1;
    }

    format!("{}...", &string[..cut])
}

/// User-Agent sent with every manifest probe
pub const USER_AGENT: &str = concat!(
    env!("CARGO_PKG_NAME"),
    "/",
    env!("CARGO_PKG_VERSION"),
    " (+",
    env!("CARGO_PKG_REPOSITORY"),
    ")"
);

/// HTTP client shared by manifest probes
///
/// Whole requests are capped at [`PROBE_TIMEOUT`] unless a request sets its own timeout.
///
/// # Panics
/// Panics if the TLS backend cannot be initialized
#[must_use]
pub fn init_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(PROBE_TIMEOUT)
        .timeout(PROBE_TIMEOUT)
        .build()
        .expect("Unable to build HTTP client")
}
