//! Gradual rollout bucketing
//!
//! Each printer is pinned to a bucket in 0..100 derived from the MD5 digest
//! of its UUID, so percentage rollouts select a stable subset of the fleet
//! across restarts and re-subscriptions.

use md5::{Digest, Md5};
use uuid::Uuid;

/// Deterministic bucket in 0..100 for a printer identity
///
/// The digest of the hyphenated lowercase UUID string is interpreted as a
/// big-endian u128 and reduced modulo 100.
pub fn rollout_bucket(printer_id: &Uuid) -> u8 {
    let digest = Md5::digest(printer_id.to_string().as_bytes());
    let value = u128::from_be_bytes(digest.into());
    (value % 100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_is_deterministic() {
        let id = Uuid::parse_str("00000000-0000-0000-0000-000000000001").unwrap();
        let first = rollout_bucket(&id);
        for _ in 0..10 {
            assert_eq!(rollout_bucket(&id), first);
        }
    }

    #[test]
    fn test_bucket_in_range() {
        for _ in 0..200 {
            let bucket = rollout_bucket(&Uuid::new_v4());
            assert!(bucket < 100);
        }
    }

    #[test]
    fn test_bucket_varies_across_printers() {
        // 32 random printers landing in one bucket would mean the hash is broken
        let buckets: std::collections::HashSet<u8> =
            (0..32).map(|_| rollout_bucket(&Uuid::new_v4())).collect();
        assert!(buckets.len() > 1);
    }
}
