use crate::CaptureError;
use std::time::Duration;
use url::Url;

/// Link schemes that never lead to a capturable page.
const NON_NAVIGABLE_SCHEMES: &[&str] = &["javascript:", "mailto:", "tel:", "data:", "blob:"];

/// Longest slug used in archive filenames.
pub const MAX_SLUG_LEN: usize = 50;

pub fn sanitize_filename(input: &str) -> String {
    input
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect::<String>()
        .trim()
        .to_string()
}

/// Filesystem-safe, length-capped slug from a URL's path, or its hostname
/// when the path is empty.
pub fn url_slug(url: &Url) -> String {
    let path = url.path().trim_matches('/');
    let source = if path.is_empty() {
        url.host_str().unwrap_or("page")
    } else {
        path
    };

    let mut slug = String::with_capacity(source.len());
    for c in sanitize_filename(source).chars() {
        if c.is_ascii_alphanumeric() || c == '-' {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('_') {
            slug.push('_');
        }
    }

    let slug: String = slug.trim_matches('_').chars().take(MAX_SLUG_LEN).collect();
    if slug.is_empty() {
        "page".to_string()
    } else {
        slug
    }
}

pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    let millis = duration.subsec_millis();

    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else if seconds > 0 {
        format!("{}.{}s", seconds, millis / 100)
    } else {
        format!("{millis}ms")
    }
}

pub fn format_bytes(bytes: usize) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

/// Parses a job URL, accepting only absolute http(s) URLs with a host.
pub fn validate_url(url: &str) -> Result<Url, CaptureError> {
    let parsed = Url::parse(url).map_err(|e| CaptureError::InvalidUrl(format!("{url}: {e}")))?;

    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Ok(parsed),
        _ => Err(CaptureError::InvalidUrl(url.to_string())),
    }
}

pub fn extract_domain(url: &Url) -> Option<String> {
    url.host_str().map(|d| d.to_string())
}

/// Scheme, host and port all match.
pub fn same_origin(a: &Url, b: &Url) -> bool {
    a.origin() == b.origin()
}

pub fn is_non_navigable(href: &str) -> bool {
    let lowered = href.trim().to_ascii_lowercase();
    NON_NAVIGABLE_SCHEMES.iter().any(|s| lowered.starts_with(s))
}

/// Resolves `href` against `base` into a crawlable absolute URL.
///
/// Pure fragments, script/mail/phone links and non-http schemes yield `None`.
/// The fragment is stripped so `/a#x` and `/a#y` are the same page.
pub fn normalize_link(base: &Url, href: &str) -> Option<Url> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') || is_non_navigable(href) {
        return None;
    }

    let mut resolved = base.join(href).ok()?;
    if !matches!(resolved.scheme(), "http" | "https") {
        return None;
    }
    resolved.set_fragment(None);
    Some(resolved)
}

/// Canonical form of a URL used for visited-set membership.
pub fn visit_key(url: &Url) -> String {
    let mut key = url.clone();
    key.set_fragment(None);
    key.to_string()
}
