//! Shared utility functions used across multiple modules.

use regex::Regex;

/// Current Unix timestamp in milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Current time as an RFC 3339 string, used for serialized timestamps.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Normalize optional text by trimming whitespace and removing empties.
///
/// Returns `None` when the input is `None` or the trimmed value is empty.
pub fn normalize_text_option(value: Option<String>) -> Option<String> {
    let value = value?;
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Check if a string is a `#RGB` or `#RRGGBB` hex color.
pub fn is_valid_color(value: &str) -> bool {
    let re = Regex::new(r"^#(?:[0-9a-fA-F]{3}|[0-9a-fA-F]{6})$").expect("Invalid regex");
    re.is_match(value)
}

/// Check if a string starts with `http://` or `https://`.
pub fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_text_option_rejects_empty() {
        assert_eq!(normalize_text_option(None), None);
        assert_eq!(normalize_text_option(Some("   ".to_string())), None);
    }

    #[test]
    fn normalize_text_option_trims_value() {
        assert_eq!(
            normalize_text_option(Some(" groceries ".to_string())),
            Some("groceries".to_string())
        );
    }

    #[test]
    fn is_valid_color_accepts_hex_forms() {
        assert!(is_valid_color("#fff"));
        assert!(is_valid_color("#FACADE"));
        assert!(is_valid_color("#1a2b3c"));
        assert!(!is_valid_color("fff"));
        assert!(!is_valid_color("#ggg"));
        assert!(!is_valid_color("#12345"));
        assert!(!is_valid_color("#1234567"));
    }

    #[test]
    fn is_http_url_accepts_valid_schemes() {
        assert!(is_http_url("http://localhost"));
        assert!(is_http_url("https://example.com"));
        assert!(!is_http_url("ftp://example.com"));
        assert!(!is_http_url("example.com"));
    }

    #[test]
    fn now_ms_is_positive() {
        assert!(now_ms() > 0);
    }
}
