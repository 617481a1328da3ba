//! Firmware version ordering
//!
//! Versions are dotted numeric strings (`1.4.2`). Comparison is component-wise
//! on the parsed integers, shorter versions padded with zeros, so `1.4` and
//! `1.4.0` are equal.

use std::cmp::Ordering;

/// Compare two dotted numeric version strings
///
/// Non-numeric components are treated as zero.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let a_parts = parse_parts(a);
    let b_parts = parse_parts(b);
    let len = a_parts.len().max(b_parts.len());

    for i in 0..len {
        let x = a_parts.get(i).copied().unwrap_or(0);
        let y = b_parts.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// True if `candidate` is strictly newer than `current`
pub fn is_newer(candidate: &str, current: &str) -> bool {
    compare_versions(candidate, current) == Ordering::Greater
}

fn parse_parts(version: &str) -> Vec<u64> {
    version
        .split('.')
        .map(|p| p.trim().parse::<u64>().unwrap_or(0))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_ordering() {
        assert_eq!(compare_versions("1.0.0", "1.0.0"), Ordering::Equal);
        assert_eq!(compare_versions("1.0.0", "1.0.1"), Ordering::Less);
        assert_eq!(compare_versions("1.5.0", "1.0.9"), Ordering::Greater);
        assert_eq!(compare_versions("2.0.0", "1.9.9"), Ordering::Greater);
        assert_eq!(compare_versions("0.0.0", "0.0.1"), Ordering::Less);
    }

    #[test]
    fn test_compare_unequal_lengths() {
        assert_eq!(compare_versions("1.4", "1.4.0"), Ordering::Equal);
        assert_eq!(compare_versions("1.4", "1.4.1"), Ordering::Less);
        assert_eq!(compare_versions("1.4.1", "1.4"), Ordering::Greater);
    }

    #[test]
    fn test_compare_multi_digit_components() {
        // Numeric, not lexicographic
        assert_eq!(compare_versions("1.10.0", "1.9.0"), Ordering::Greater);
        assert_eq!(compare_versions("10.0.0", "9.99.99"), Ordering::Greater);
    }

    #[test]
    fn test_is_newer() {
        assert!(is_newer("1.5.0", "1.0.0"));
        assert!(!is_newer("1.0.0", "1.0.0"));
        assert!(!is_newer("0.9.0", "1.0.0"));
    }

    #[test]
    fn test_garbage_components_treated_as_zero() {
        assert_eq!(compare_versions("1.x.0", "1.0.0"), Ordering::Equal);
    }
}
