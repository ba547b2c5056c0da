/// Check if a host matches a domain rule pattern
///
/// Supports two pattern forms:
/// - `example.com` - Exact domain match
/// - `*.example.com` - The apex domain or any subdomain of example.com
///
/// Comparison is ASCII case-insensitive. A wildcard suffix only matches on a
/// label boundary, so `*.example.com` never matches `notexample.com`.
pub fn domain_matches(pattern: &str, host: &str) -> bool {
    if host.is_empty() {
        return false;
    }

    let normalized_host = host.to_ascii_lowercase();
    let normalized_pattern = pattern.to_ascii_lowercase();

    if let Some(suffix) = normalized_pattern.strip_prefix("*.") {
        if suffix.is_empty() {
            return false;
        }
        return normalized_host == suffix
            || matches_suffix_with_boundary(&normalized_host, suffix);
    }

    normalized_host == normalized_pattern
}

/// Check if a host matches a suffix with proper dot boundary
fn matches_suffix_with_boundary(host: &str, suffix: &str) -> bool {
    if host.ends_with(suffix) && host.len() > suffix.len() {
        let boundary_pos = host.len() - suffix.len() - 1;
        return host.as_bytes().get(boundary_pos) == Some(&b'.');
    }
    false
}

/// Validate a domain pattern for common mistakes
pub fn validate_domain_pattern(pattern: &str) -> Result<(), String> {
    if pattern.is_empty() {
        return Err("Domain pattern cannot be empty".to_string());
    }

    if pattern.contains(' ') {
        return Err("Domain pattern cannot contain spaces".to_string());
    }

    if pattern.contains("..") {
        return Err("Domain pattern cannot contain consecutive dots".to_string());
    }

    if pattern.starts_with('.') || pattern.ends_with('.') {
        return Err("Domain pattern cannot start or end with a dot".to_string());
    }

    if pattern.contains('*') {
        let suffix = match pattern.strip_prefix("*.") {
            Some(suffix) => suffix,
            None => return Err("Wildcard (*) can only be used as '*.domain.com'".to_string()),
        };

        if suffix.contains('*') {
            return Err("Only one wildcard (*) is allowed per pattern".to_string());
        }

        if suffix.is_empty() {
            return Err("Wildcard pattern must have a domain after '*.'".to_string());
        }
    }

    Ok(())
}
