use std::path::Path;

use url::Url;

use crate::error::{CoreError, CoreResult};

fn is_safe_segment_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'
}

/// Map an untrusted identifier to a filesystem-safe path segment.
/// Characters outside `[A-Za-z0-9._-]` are replaced with underscores.
pub fn sanitize_path_segment(value: &str, label: &str) -> CoreResult<String> {
    if value.is_empty() || value == "." || value == ".." {
        return Err(CoreError::Validation(format!("Invalid {label}")));
    }
    if value.chars().all(is_safe_segment_char) {
        return Ok(value.to_string());
    }
    let cleaned: String = value
        .chars()
        .map(|c| if is_safe_segment_char(c) { c } else { '_' })
        .collect();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        return Err(CoreError::Validation(format!("Invalid {label}")));
    }
    Ok(cleaned)
}

fn is_ip_address(host: &str) -> bool {
    host.parse::<std::net::Ipv4Addr>().is_ok() || host.starts_with('[')
}

fn is_allowed_domain(host: &str) -> bool {
    host.to_ascii_lowercase().ends_with(".apple.com")
}

/// Validate an origin URL: HTTPS only, allowlisted host suffix, no IP literals.
pub fn validate_download_url(url: &str) -> CoreResult<()> {
    let parsed =
        Url::parse(url).map_err(|_| CoreError::Validation("Invalid URL".to_string()))?;

    if parsed.scheme() != "https" {
        return Err(CoreError::Validation("Must use HTTPS".to_string()));
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| CoreError::Validation("Invalid URL".to_string()))?;

    // IP literals first so the error names the actual problem.
    if is_ip_address(host) {
        return Err(CoreError::Validation(
            "Must not use IP addresses".to_string(),
        ));
    }

    if !is_allowed_domain(host) {
        return Err(CoreError::Validation(
            "Must be from an allowed domain".to_string(),
        ));
    }

    Ok(())
}

/// True when `resolved` lies strictly beneath `base` (base itself does not count).
pub fn path_within_base(resolved: &Path, base: &Path) -> bool {
    resolved != base && resolved.starts_with(base)
}
