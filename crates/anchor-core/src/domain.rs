//! Host and path matching shared by the rule engine, nuclear store, and session engine.
//!
//! ## Matching Rules
//!
//! - Hosts compare case-insensitively with any port, trailing dot, and leading
//!   `www.` removed.
//! - A site entry matches its own host and every subdomain of it
//!   (`music.youtube.com` matches `youtube.com`, `notyoutube.com` does not).
//! - A path rule (`youtube.com/veritasium`) requires the host to match exactly,
//!   then matches the request path on a segment boundary: `/veritasium` and
//!   `/veritasium/videos` match, `/veritasiumx` does not.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Normalizes a host for comparison.
///
/// # Examples
///
/// ```
/// use anchor_core::domain::normalize_host;
///
/// assert_eq!(normalize_host("WWW.YouTube.com:443"), "youtube.com");
/// assert_eq!(normalize_host("music.youtube.com."), "music.youtube.com");
/// ```
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let host = strip_port(host);
    let host = host.trim_end_matches('.').to_ascii_lowercase();

    match host.strip_prefix("www.") {
        Some(stripped) => stripped.to_string(),
        None => host,
    }
}

/// Removes a `:port` suffix, leaving bracketed IPv6 literals intact.
fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    // A bare IPv6 literal has more than one colon and no port.
    if host.matches(':').count() > 1 {
        return host;
    }
    host.split(':').next().unwrap_or(host)
}

/// Returns true if `host` equals `site` or is a subdomain of it.
///
/// Both sides are normalized first.
pub fn host_matches(host: &str, site: &str) -> bool {
    let host = normalize_host(host);
    let site = normalize_host(site);
    host_matches_normalized(&host, &site)
}

/// Like [`host_matches`] but assumes both inputs are already normalized.
pub fn host_matches_normalized(host: &str, site: &str) -> bool {
    if site.is_empty() {
        return false;
    }
    host == site
        || (host.len() > site.len()
            && host.ends_with(site)
            && host.as_bytes()[host.len() - site.len() - 1] == b'.')
}

/// Returns true if the host matches any site in the list.
pub fn matches_any<'a, I>(host: &str, sites: I) -> bool
where
    I: IntoIterator<Item = &'a String>,
{
    let host = normalize_host(host);
    sites
        .into_iter()
        .any(|site| host_matches_normalized(&host, &normalize_host(site)))
}

/// Returns true if `path` starts with `prefix` on a segment boundary.
///
/// An empty or `/` prefix matches every path. Comparison is ASCII
/// case-insensitive.
pub fn path_has_prefix(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }

    let path = if path.is_empty() { "/" } else { path };
    match (path.get(..prefix.len()), path.get(prefix.len()..)) {
        (Some(head), Some(tail)) => {
            head.eq_ignore_ascii_case(prefix) && (tail.is_empty() || tail.starts_with('/'))
        }
        _ => false,
    }
}

/// A domain-qualified path prefix such as `youtube.com/veritasium`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DomainPath {
    /// Normalized host.
    pub host: String,
    /// Path prefix, always starting with `/`, never ending with one (except root).
    pub path: String,
}

impl DomainPath {
    /// Parses a rule like `youtube.com/veritasium` or `https://www.youtube.com/veritasium/`.
    ///
    /// Returns `None` if there is no host.
    pub fn parse(rule: &str) -> Option<Self> {
        let target = RequestTarget::parse(rule)?;
        let path = target.path.trim_end_matches('/');
        let path = if path.is_empty() { "/" } else { path };

        Some(Self {
            host: target.host,
            path: path.to_string(),
        })
    }

    /// Returns true if the request host matches exactly and the path shares the prefix.
    pub fn matches(&self, host: &str, path: &str) -> bool {
        normalize_host(host) == self.host && path_has_prefix(path, &self.path)
    }
}

impl fmt::Display for DomainPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path == "/" {
            write!(f, "{}", self.host)
        } else {
            write!(f, "{}{}", self.host, self.path)
        }
    }
}

/// Returns true if any rule in `rules` matches the request.
///
/// Rules that fail to parse are ignored.
pub fn matches_any_path<'a, I>(host: &str, path: &str, rules: I) -> bool
where
    I: IntoIterator<Item = &'a String>,
{
    rules
        .into_iter()
        .filter_map(|rule| DomainPath::parse(rule))
        .any(|rule| rule.matches(host, path))
}

/// Host and path extracted from a URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTarget {
    /// Normalized host.
    pub host: String,
    /// Path without query or fragment, always starting with `/`.
    pub path: String,
}

impl RequestTarget {
    /// Splits a URL (with or without scheme) into host and path.
    ///
    /// # Examples
    ///
    /// ```
    /// use anchor_core::domain::RequestTarget;
    ///
    /// let target = RequestTarget::parse("https://www.youtube.com/watch?v=x").unwrap();
    /// assert_eq!(target.host, "youtube.com");
    /// assert_eq!(target.path, "/watch");
    /// ```
    pub fn parse(url: &str) -> Option<Self> {
        let rest = url.trim();
        let rest = match rest.find("://") {
            Some(idx) => &rest[idx + 3..],
            None => rest,
        };

        let end_of_authority = rest.find(|c: char| matches!(c, '/' | '?' | '#')).unwrap_or(rest.len());
        let (authority, remainder) = rest.split_at(end_of_authority);

        // Drop userinfo.
        let authority = authority.rsplit('@').next().unwrap_or(authority);
        let host = normalize_host(authority);
        if host.is_empty() {
            return None;
        }

        let path_end = remainder.find(|c: char| matches!(c, '?' | '#')).unwrap_or(remainder.len());
        let path = &remainder[..path_end];
        let path = if path.is_empty() { "/" } else { path };

        Some(Self {
            host,
            path: path.to_string(),
        })
    }
}

/// Returns true for hosts that resolve to this machine.
pub fn is_loopback(host: &str) -> bool {
    let host = normalize_host(host);
    if host == "localhost" || host.ends_with(".localhost") || host == "::1" {
        return true;
    }
    host.parse::<std::net::Ipv4Addr>()
        .map(|ip| ip.is_loopback())
        .unwrap_or(false)
}
