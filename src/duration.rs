//! Parsing of human-entered sanction durations.

use std::time::Duration;

use crate::error::{Result, WardenError};

/// Parse a duration such as `30s`, `10m`, `2h` or `1d`.
///
/// Arabic unit letters (`ث`, `د`, `س`, `ي`) are accepted as well. A bare
/// number is read as minutes.
///
/// ```
/// use std::time::Duration;
/// use warden::duration::parse_duration;
///
/// assert_eq!(parse_duration("10m").unwrap(), Duration::from_secs(600));
/// assert_eq!(parse_duration("5").unwrap(), Duration::from_secs(300));
/// assert!(parse_duration("soon").is_err());
/// ```
pub fn parse_duration(input: &str) -> Result<Duration> {
    let trimmed = input.trim().to_lowercase();
    let mut chars = trimmed.chars();
    let last = chars
        .next_back()
        .ok_or_else(|| WardenError::InvalidInput("duration is empty".to_string()))?;

    let (digits, unit_secs) = match last {
        's' | 'ث' => (chars.as_str(), 1),
        'm' | 'د' => (chars.as_str(), 60),
        'h' | 'س' => (chars.as_str(), 3600),
        'd' | 'ي' => (chars.as_str(), 86_400),
        _ => (trimmed.as_str(), 60),
    };

    let amount: u64 = digits
        .trim()
        .parse()
        .map_err(|_| WardenError::InvalidInput(format!("not a duration: {}", input.trim())))?;

    amount
        .checked_mul(unit_secs)
        .map(Duration::from_secs)
        .ok_or_else(|| WardenError::InvalidInput(format!("duration too large: {}", input.trim())))
}
