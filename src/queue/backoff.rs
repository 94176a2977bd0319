//! Exponential backoff with a ceiling.

use std::time::Duration;

/// `base × 2^attempt`, never more than `cap`.
pub fn delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(cap).min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_until_cap() {
        let base = Duration::from_secs(10);
        let cap = Duration::from_secs(30);
        assert_eq!(delay(base, cap, 0), Duration::from_secs(10));
        assert_eq!(delay(base, cap, 1), Duration::from_secs(20));
        assert_eq!(delay(base, cap, 2), Duration::from_secs(30));
        assert_eq!(delay(base, cap, 10), Duration::from_secs(30));
    }

    #[test]
    fn test_delay_survives_huge_attempts() {
        let cap = Duration::from_secs(30);
        assert_eq!(delay(Duration::from_secs(1), cap, 64), cap);
        assert_eq!(delay(Duration::from_secs(1), cap, u32::MAX), cap);
    }
}
