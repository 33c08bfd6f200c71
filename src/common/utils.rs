//! Utility functions for fleetcoord

use rand::Rng;
use std::time::Duration;

/// Jitter factor applied to lease retry periods
pub const JITTER_FACTOR: f64 = 1.2;

/// Return `base` plus a random extra of up to `base * max_factor`.
pub fn jitter(base: Duration, max_factor: f64) -> Duration {
    let factor = if max_factor <= 0.0 { 1.0 } else { max_factor };
    let extra = rand::thread_rng().gen::<f64>() * factor * base.as_secs_f64();
    base + Duration::from_secs_f64(extra)
}

/// Split a comma-separated identifier list, dropping blanks and duplicates
/// while keeping first-seen order.
pub fn parse_key_list(raw: &str) -> Vec<String> {
    let mut keys: Vec<String> = Vec::new();
    for key in raw.split(',').map(str::trim).filter(|k| !k.is_empty()) {
        if !keys.iter().any(|k| k == key) {
            keys.push(key.to_string());
        }
    }
    keys
}

/// Validate an affinity key (must be non-empty, reasonable length)
pub fn validate_key(key: &str) -> crate::Result<()> {
    if key.is_empty() {
        return Err(crate::Error::InvalidConfig("key cannot be empty".into()));
    }

    if key.len() > 256 {
        return Err(crate::Error::InvalidConfig(
            "key too long (max 256 bytes)".into(),
        ));
    }

    if key.chars().any(|c| c.is_control() || c == ',') {
        return Err(crate::Error::InvalidConfig(
            "key contains invalid characters".into(),
        ));
    }

    Ok(())
}

/// Parse duration string (e.g., "500ms", "30s", "5m")
pub fn parse_duration(s: &str) -> crate::Result<Duration> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| crate::Error::InvalidConfig(format!("missing duration unit: {}", s)))?;
    let (num_str, unit) = s.split_at(split);

    let num: u64 = num_str
        .parse()
        .map_err(|_| crate::Error::InvalidConfig(format!("invalid duration: {}", s)))?;

    match unit {
        "ms" => Ok(Duration::from_millis(num)),
        "s" => Ok(Duration::from_secs(num)),
        "m" => Ok(Duration::from_secs(num * 60)),
        "h" => Ok(Duration::from_secs(num * 3600)),
        _ => Err(crate::Error::InvalidConfig(format!(
            "unknown duration unit: {}",
            unit
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_millis(100);
        for _ in 0..100 {
            let d = jitter(base, JITTER_FACTOR);
            assert!(d >= base);
            assert!(d <= base + Duration::from_millis(120));
        }
    }

    #[test]
    fn test_parse_key_list() {
        assert_eq!(parse_key_list("a,b, c,,a"), vec!["a", "b", "c"]);
        assert!(parse_key_list(" , ").is_empty());
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key("sensor-42").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("a,b").is_err());
        assert!(validate_key(&"x".repeat(300)).is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("abc").is_err());
    }
}
