use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 over `parts`, hex encoded. Each part is prefixed with its
/// byte length as a big-endian u64, so part boundaries cannot shift.
pub fn keyed_digest(secret: &[u8], parts: &[&str]) -> Result<String, anyhow::Error> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| anyhow::anyhow!("Invalid key length: {}", e))?;

    for part in parts {
        mac.update(&(part.len() as u64).to_be_bytes());
        mac.update(part.as_bytes());
    }
    let result = mac.finalize();

    Ok(hex::encode(result.into_bytes()))
}

/// Constant-time comparison of two hex digests.
pub fn digests_match(expected: &str, candidate: &str) -> bool {
    let expected_bytes = expected.as_bytes();
    let candidate_bytes = candidate.as_bytes();

    if expected_bytes.len() != candidate_bytes.len() {
        return false;
    }

    expected_bytes.ct_eq(candidate_bytes).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"an-adequately-long-test-secret-value";

    #[test]
    fn test_digest_is_deterministic() {
        let a = keyed_digest(SECRET, &["code", r#"{"total":"10"}"#]).unwrap();
        let b = keyed_digest(SECRET, &["code", r#"{"total":"10"}"#]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(digests_match(&a, &b));
    }

    #[test]
    fn test_changed_payload_changes_digest() {
        let a = keyed_digest(SECRET, &["code", r#"{"total":"10"}"#]).unwrap();
        let b = keyed_digest(SECRET, &["code", r#"{"total":"11"}"#]).unwrap();
        assert!(!digests_match(&a, &b));
    }

    #[test]
    fn test_different_secret_changes_digest() {
        let a = keyed_digest(SECRET, &["payload"]).unwrap();
        let b = keyed_digest(b"another-secret", &["payload"]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_part_boundaries_are_bound() {
        let a = keyed_digest(SECRET, &["a|b", "c"]).unwrap();
        let b = keyed_digest(SECRET, &["a", "b|c"]).unwrap();
        let joined = keyed_digest(SECRET, &["abc"]).unwrap();
        let split = keyed_digest(SECRET, &["ab", "c"]).unwrap();
        assert_ne!(a, b);
        assert_ne!(joined, split);
    }

    #[test]
    fn test_length_mismatch_never_matches() {
        assert!(!digests_match("abcd", "abc"));
    }
}
