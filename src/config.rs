//! Configuration snapshot loading and delivery-period parsing.

use std::path::Path;
use std::time::Duration;

use crate::types::BrokerConfig;

/// Errors produced while loading a configuration snapshot.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("could not read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid YAML for the snapshot schema.
    #[error("could not parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Errors produced while parsing an ISO-8601 period.
#[derive(Debug, thiserror::Error)]
pub enum PeriodError {
    #[error("invalid ISO-8601 period '{0}'")]
    Invalid(String),

    #[error("empty ISO-8601 period '{0}'")]
    Empty(String),
}

/// Parse a configuration snapshot from YAML.
pub fn parse_config(contents: &str) -> Result<BrokerConfig, ConfigError> {
    Ok(serde_yaml::from_str(contents)?)
}

/// Load a configuration snapshot from a file path.
pub fn load_config(path: &Path) -> Result<BrokerConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    parse_config(&contents)
}

/// Parse an ISO-8601 period (e.g. `PT1S`, `P1DT2H`, `PT0.5S`) into a
/// duration.
///
/// Calendar components use fixed approximations: a year is 365 days, a
/// month 30 days. Negative periods are rejected; at least one component is
/// required.
pub fn parse_period(input: &str) -> Result<Duration, PeriodError> {
    let invalid = || PeriodError::Invalid(input.to_string());

    let mut chars = input.chars().peekable();
    match chars.next() {
        Some('P') => {}
        _ => return Err(invalid()),
    }

    let mut in_time = false;
    let mut components = 0u32;
    let mut total = Duration::ZERO;

    while let Some(&c) = chars.peek() {
        if c == 'T' {
            if in_time {
                return Err(invalid());
            }
            in_time = true;
            chars.next();
            continue;
        }

        // Numeric part; fractions only make sense for seconds but are
        // accepted uniformly like the reference period libraries do.
        let mut number = String::new();
        while let Some(&d) = chars.peek() {
            if d.is_ascii_digit() || d == '.' {
                number.push(d);
                chars.next();
            } else {
                break;
            }
        }
        if number.is_empty() {
            return Err(invalid());
        }
        let value: f64 = number.parse().map_err(|_| invalid())?;

        let designator = chars.next().ok_or_else(invalid)?;
        let seconds = match (in_time, designator) {
            (false, 'Y') => value * 365.0 * 86_400.0,
            (false, 'M') => value * 30.0 * 86_400.0,
            (false, 'W') => value * 7.0 * 86_400.0,
            (false, 'D') => value * 86_400.0,
            (true, 'H') => value * 3_600.0,
            (true, 'M') => value * 60.0,
            (true, 'S') => value,
            _ => return Err(invalid()),
        };

        let part = Duration::try_from_secs_f64(seconds).map_err(|_| invalid())?;
        total = total.checked_add(part).ok_or_else(invalid)?;
        components += 1;
    }

    if components == 0 {
        return Err(PeriodError::Empty(input.to_string()));
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_period_seconds() {
        assert_eq!(parse_period("PT0S").unwrap(), Duration::ZERO);
        assert_eq!(parse_period("PT1S").unwrap(), Duration::from_secs(1));
        assert_eq!(parse_period("PT30S").unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn test_parse_period_fractional_seconds() {
        assert_eq!(parse_period("PT0.5S").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_period("PT1.5S").unwrap(), Duration::from_millis(1500));
    }

    #[test]
    fn test_parse_period_minutes_hours() {
        assert_eq!(parse_period("PT1M").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_period("PT2H").unwrap(), Duration::from_secs(7200));
        assert_eq!(
            parse_period("PT1H30M").unwrap(),
            Duration::from_secs(5400)
        );
    }

    #[test]
    fn test_parse_period_date_components() {
        assert_eq!(parse_period("P1D").unwrap(), Duration::from_secs(86_400));
        assert_eq!(
            parse_period("P2W").unwrap(),
            Duration::from_secs(14 * 86_400)
        );
        assert_eq!(
            parse_period("P1DT2H").unwrap(),
            Duration::from_secs(86_400 + 7200)
        );
    }

    #[test]
    fn test_parse_period_date_vs_time_minutes() {
        // 'M' before the T marker is months, after it minutes.
        assert_eq!(
            parse_period("P1M").unwrap(),
            Duration::from_secs(30 * 86_400)
        );
        assert_eq!(parse_period("PT1M").unwrap(), Duration::from_secs(60));
    }

    #[test]
    fn test_parse_period_rejects_invalid() {
        for input in ["", "P", "PT", "1S", "PT1X", "PTS", "P-1D", "PT1S2", "PTT1S"] {
            assert!(parse_period(input).is_err(), "expected error for {input:?}");
        }
    }

    #[test]
    fn test_parse_config_rejects_bad_yaml() {
        assert!(parse_config("triggers: [not, a, map]").is_err());
    }
}
