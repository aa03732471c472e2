//! Deterministic bucketing.
//!
//! `bucket(identity, experiment)` is a pure function of its inputs: a 32-bit polynomial
//! rolling hash (`h = h * 31 + unit`, wrapping) over the UTF-16 code units of
//! `"{identity}_{experiment}"`, folded into `[0, 100)`. The hash is not cryptographic;
//! it is kept bit-exact so buckets stay stable across migrations.

/// Number of buckets; allocation percentages and variant weights live on this scale.
pub const BUCKETS: u32 = 100;

const VARIANT_SUFFIX: &str = "_variant";

/// 32-bit wrapping rolling hash over UTF-16 code units.
pub fn rolling_hash(input: &str) -> i32 {
    input
        .encode_utf16()
        .fold(0i32, |h, unit| h.wrapping_mul(31).wrapping_add(i32::from(unit)))
}

fn fold(hash: i32) -> u32 {
    // unsigned_abs keeps i32::MIN well-defined (2^31)
    hash.unsigned_abs() % BUCKETS
}

fn seed(identity: &str, experiment_id: &str) -> String {
    format!("{}_{}", identity, experiment_id)
}

/// Allocation bucket used for traffic gating.
pub fn bucket(identity: &str, experiment_id: &str) -> u32 {
    fold(rolling_hash(&seed(identity, experiment_id)))
}

/// Independent bucket used only for variant choice, so gating and selection stay
/// decorrelated.
pub fn variant_bucket(identity: &str, experiment_id: &str) -> u32 {
    let mut s = seed(identity, experiment_id);
    s.push_str(VARIANT_SUFFIX);
    fold(rolling_hash(&s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rolling_hash_known_values() {
        assert_eq!(rolling_hash(""), 0);
        assert_eq!(rolling_hash("a"), 97);
        assert_eq!(rolling_hash("hello"), 99_162_322);
        assert_eq!(rolling_hash("alice_checkout-test"), -39_944_902);
    }

    #[test]
    fn test_hash_uses_utf16_units() {
        assert_eq!(rolling_hash("é_x"), 226_978);
    }

    #[test]
    fn test_buckets_known_values() {
        assert_eq!(bucket("user-1", "e1"), 4);
        assert_eq!(variant_bucket("user-1", "e1"), 62);
        assert_eq!(bucket("alice", "checkout-test"), 2);
    }

    #[test]
    fn test_min_hash_folds_in_range() {
        assert_eq!(fold(i32::MIN), 48);
    }

    #[test]
    fn test_bucket_deterministic_and_in_range() {
        for i in 0..1_000 {
            let id = format!("visitor-{}", i);
            let b = bucket(&id, "exp");
            assert!(b < BUCKETS);
            assert_eq!(b, bucket(&id, "exp"));
            assert!(variant_bucket(&id, "exp") < BUCKETS);
        }
    }

    #[test]
    fn test_bucket_roughly_uniform() {
        let mut counts = [0u32; 10];
        for i in 0..10_000 {
            let b = bucket(&format!("S-{}", i), "e1");
            counts[(b / 10) as usize] += 1;
        }
        for c in counts {
            assert!((700..=1_300).contains(&c), "decile count {}", c);
        }
    }
}
