//! Share-link validation and the proxy rewrite handed to the download manager.

use std::sync::OnceLock;

use regex::Regex;
use url::Url;

/// Hosting domains whose share links the bot accepts (subdomains included).
pub const VALID_DOMAINS: &[&str] = &[
    "terabox.com",
    "nephobox.com",
    "4funbox.com",
    "mirrobox.com",
    "momerybox.com",
    "teraboxapp.com",
    "1024tera.com",
    "terabox.app",
    "gibibox.com",
    "goaibox.com",
    "terasharelink.com",
    "teraboxlink.com",
    "terafileshare.com",
];

/// Fixed resolver endpoint that turns a share link into a direct download.
pub const PROXY_BASE: &str = "https://teradlrobot.cheemsbackup.workers.dev/";

/// Sentence punctuation that hugs a pasted link but is never part of one.
const TRAILING_PUNCTUATION: &[char] = &[')', ']', '>', '.', ',', ';', ':', '!', '?', '\'', '"'];

fn link_candidates() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)https?://\S+").expect("static regex"))
}

/// True iff `candidate` parses as a URL whose host is an allow-listed domain
/// or a subdomain of one.
pub fn is_valid_url(candidate: &str) -> bool {
    let Ok(parsed) = Url::parse(candidate.trim()) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    host_allowed(host)
}

fn host_allowed(host: &str) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    VALID_DOMAINS.iter().any(|domain| {
        host == *domain
            || host
                .strip_suffix(domain)
                .is_some_and(|prefix| prefix.len() > 1 && prefix.ends_with('.'))
    })
}

/// First allow-listed link in a free-form chat message.
pub fn extract_link(text: &str) -> Option<String> {
    text.split_whitespace()
        .filter_map(|word| link_candidates().find(word))
        .map(|m| m.as_str().trim_end_matches(TRAILING_PUNCTUATION))
        .find(|candidate| is_valid_url(candidate))
        .map(str::to_string)
}

/// `<PROXY_BASE>?url=<percent-encoded link>`.
pub fn rewrite_url(link: &str) -> String {
    format!("{PROXY_BASE}?url={}", urlencoding::encode(link))
}
