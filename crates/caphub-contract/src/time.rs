//! Clock helpers shared across the hub.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as unix milliseconds.
pub fn current_unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis().min(u128::from(u64::MAX)) as u64)
}

/// Generate a time-ordered UUID v7 identifier with a type prefix.
pub fn gen_id(prefix: &str) -> String {
    format!("{prefix}_{}", uuid::Uuid::now_v7().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gen_id_prefix_and_uniqueness() {
        let a = gen_id("run");
        let b = gen_id("run");
        assert!(a.starts_with("run_"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_current_unix_millis_is_recent() {
        // Anything after 2024-01-01 counts as a sane clock.
        assert!(current_unix_millis() > 1_704_067_200_000);
    }
}
