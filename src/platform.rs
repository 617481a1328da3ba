//! Platform string normalization
//!
//! Printer hardware families are stored in a canonical dashed lowercase form
//! (`esp32-c3`, `esp32-s3`). Historical firmware announced no-separator
//! (`esp32c3`) or underscore (`esp32_s3`) spellings, so lookups widen a
//! canonical value back out to every accepted variant.

/// Normalize a platform string to its canonical form
///
/// Rules:
/// - lowercase, surrounding whitespace stripped
/// - esp32 variants use a dash: `esp32-c3`, `esp32-s2`, `esp32-s3`, ...
/// - `esp8266` (and anything non-esp32) passes through unchanged
///
/// Returns `None` for empty or whitespace-only input.
pub fn normalize_platform(platform: &str) -> Option<String> {
    let value = platform.trim().to_lowercase();
    if value.is_empty() {
        return None;
    }
    if !value.starts_with("esp32") {
        return Some(value);
    }

    let suffix: String = value["esp32".len()..].trim_start_matches(['-', '_']).to_string();
    if suffix.is_empty() {
        return Some("esp32".to_string());
    }
    if !suffix.chars().all(|c| c.is_ascii_alphanumeric()) {
        // Not an esp32 family suffix; leave the lowercased value as-is
        return Some(value);
    }

    Some(format!("esp32-{suffix}"))
}

/// Expand a platform into every variant accepted in stored data
///
/// The canonical form comes first; order is stable so callers can probe in
/// preference order.
pub fn platform_variants(platform: &str) -> Vec<String> {
    let Some(normalized) = normalize_platform(platform) else {
        return Vec::new();
    };

    let mut variants = vec![normalized.clone()];
    if let Some(suffix) = normalized.strip_prefix("esp32-") {
        variants.push(format!("esp32{suffix}"));
        variants.push(format!("esp32_{suffix}"));
    }
    variants
}
