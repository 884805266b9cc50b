//! Text matchers for the device-login prompts printed by the server.
//!
//! All functions expect escape sequences to be stripped already.

use std::sync::OnceLock;

use regex::Regex;

const PREFERRED_URL_MARKER: &str = "or visit:";
const URL_MARKER: &str = "visit:";

const PROFILE_PROMPTS: [&str; 2] = ["Multiple profiles available", "Use '/auth select"];

fn url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"https?://[^\s]+").expect("static URL pattern"))
}

fn code_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)Enter code:\s+([A-Za-z0-9]+)").expect("static code pattern"))
}

fn first_profile_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[1\]\s+([^\s(]+)").expect("static profile pattern"))
}

/// Login URL announced on `line`, if any.
///
/// `Or visit:` wins over a plain `Visit:` so the variant carrying the code is
/// picked when the server prints both. Markers are case-insensitive.
pub fn find_login_url(line: &str) -> Option<String> {
    // ASCII 소문자 변환은 바이트 위치를 보존
    let lower = line.to_ascii_lowercase();
    let after = lower
        .find(PREFERRED_URL_MARKER)
        .map(|i| i + PREFERRED_URL_MARKER.len())
        .or_else(|| lower.find(URL_MARKER).map(|i| i + URL_MARKER.len()))?;

    url_re()
        .find(&line[after..])
        .map(|m| m.as_str().trim_end_matches(['.', ',', ')']).to_string())
}

/// Device code from an `Enter code: <code>` line.
pub fn find_device_code(line: &str) -> Option<String> {
    code_re()
        .captures(line)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

pub fn has_user_code(url: &str) -> bool {
    url.contains("user_code=")
}

/// Append `user_code=<code>` unless the URL already carries one.
pub fn with_user_code(url: &str, code: &str) -> String {
    if has_user_code(url) {
        return url.to_string();
    }
    let sep = if url.contains('?') { '&' } else { '?' };
    format!("{}{}user_code={}", url, sep, code)
}

/// Text that asks the operator to pick a profile.
pub fn is_profile_prompt(line: &str) -> bool {
    PROFILE_PROMPTS.iter().any(|p| line.contains(p))
}

/// Name of the first enumerated profile (`[1] <name>`), if listed on `line`.
pub fn first_profile_entry(line: &str) -> Option<&str> {
    first_profile_re()
        .captures(line)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_or_visit_preferred_over_visit() {
        let line = "Visit: https://a.example/plain Or visit: https://a.example/device?user_code=X1";
        assert_eq!(
            find_login_url(line).as_deref(),
            Some("https://a.example/device?user_code=X1")
        );
    }

    #[test]
    fn test_visit_marker_case_insensitive() {
        assert_eq!(
            find_login_url("[Auth] please VISIT: https://a.example/device").as_deref(),
            Some("https://a.example/device")
        );
        assert_eq!(find_login_url("no marker https://a.example"), None);
        assert_eq!(find_login_url("Visit: the website"), None);
    }

    #[test]
    fn test_device_code() {
        assert_eq!(find_device_code("Enter code: AB12CD").as_deref(), Some("AB12CD"));
        assert_eq!(find_device_code("[Auth] enter code:   zz9").as_deref(), Some("zz9"));
        assert_eq!(find_device_code("Enter code:"), None);
    }

    #[test]
    fn test_with_user_code() {
        assert_eq!(
            with_user_code("https://example/device", "AB12CD"),
            "https://example/device?user_code=AB12CD"
        );
        assert_eq!(
            with_user_code("https://example/device?lang=en", "AB"),
            "https://example/device?lang=en&user_code=AB"
        );
        assert_eq!(
            with_user_code("https://example/device?user_code=OLD", "NEW"),
            "https://example/device?user_code=OLD"
        );
    }

    #[test]
    fn test_profile_matchers() {
        assert!(is_profile_prompt("Multiple profiles available:"));
        assert!(is_profile_prompt("Use '/auth select <n>' to choose"));
        assert!(!is_profile_prompt("Authenticated successfully"));

        assert_eq!(first_profile_entry("  [1] alice (default)"), Some("alice"));
        assert_eq!(first_profile_entry("[2] bob"), None);
    }
}
