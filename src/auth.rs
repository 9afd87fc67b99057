//! Bearer-token helpers shared by the control, ingest, and stream endpoints.

/// Strip a `Bearer ` prefix from an Authorization header value.
///
/// A raw token without the prefix is accepted as the token itself.
pub fn extract_bearer(header: Option<&str>) -> &str {
    let Some(header) = header else {
        return "";
    };
    header.strip_prefix("Bearer ").unwrap_or(header)
}

/// Compare two tokens without early exit on the first differing byte.
///
/// Length is folded into the accumulator rather than short-circuited, so the
/// comparison touches every byte of the longer input regardless of where the
/// strings diverge.
pub fn constant_time_compare(expected: Option<&str>, received: Option<&str>) -> bool {
    let (Some(expected), Some(received)) = (expected, received) else {
        return false;
    };
    let a = expected.as_bytes();
    let b = received.as_bytes();
    let mut diff = (a.len() ^ b.len()) as u8;
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_bearer_variants() {
        assert_eq!(extract_bearer(Some("Bearer token123")), "token123");
        assert_eq!(extract_bearer(Some("token123")), "token123");
        assert_eq!(extract_bearer(Some("")), "");
        assert_eq!(extract_bearer(None), "");
    }

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare(Some("secret"), Some("secret")));
        assert!(!constant_time_compare(Some("secret"), Some("SECRET")));
        assert!(!constant_time_compare(Some("secret"), Some("secret2")));
        assert!(!constant_time_compare(Some("secret"), None));
        assert!(!constant_time_compare(None, Some("secret")));
        assert!(!constant_time_compare(None, None));
    }
}
