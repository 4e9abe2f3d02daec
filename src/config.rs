use crate::errors::{TierError, TierResult};
use anyhow::{Context, Result};
use chrono::Duration;
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::env;

/// Which tiering policy a container runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyKind {
    NoBounce,
    Copy,
    Migration,
    WriteBack,
    LastModifiedTime,
    Storage,
    Lru,
}

/// Per-policy settings. Durations are kept as ISO-8601 strings and parsed
/// when the policy is built, so a bad value fails there and nowhere else.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySettings {
    pub kind: PolicyKind,
    pub copy_delay: Option<String>,
    pub evict_delay: Option<String>,
    pub capacity: Option<u64>,
}

impl PolicySettings {
    pub fn new(kind: PolicyKind) -> Self {
        Self {
            kind,
            copy_delay: None,
            evict_delay: None,
            capacity: None,
        }
    }

    pub fn copy_delay(mut self, delay: impl Into<String>) -> Self {
        self.copy_delay = Some(delay.into());
        self
    }

    pub fn evict_delay(mut self, delay: impl Into<String>) -> Self {
        self.evict_delay = Some(delay.into());
        self
    }

    pub fn capacity(mut self, capacity: u64) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn require_copy_delay(&self) -> TierResult<Duration> {
        require_duration("copyDelay", self.copy_delay.as_deref())
    }

    pub fn require_evict_delay(&self) -> TierResult<Duration> {
        require_duration("evictDelay", self.evict_delay.as_deref())
    }

    /// Parsed copy delay, or `None` when unset.
    pub fn optional_copy_delay(&self) -> TierResult<Option<Duration>> {
        self.copy_delay.as_deref().map(parse_duration).transpose()
    }

    pub fn optional_evict_delay(&self) -> TierResult<Option<Duration>> {
        self.evict_delay.as_deref().map(parse_duration).transpose()
    }

    pub fn require_capacity(&self) -> TierResult<u64> {
        self.capacity
            .ok_or_else(|| TierError::Config("capacity is required".into()))
    }
}

fn require_duration(field: &str, value: Option<&str>) -> TierResult<Duration> {
    let value = value.ok_or_else(|| TierError::Config(format!("{} is required", field)))?;
    parse_duration(value)
}

/// Longest accepted delay either way, ten thousand years.
pub const MAX_DELAY_DAYS: i64 = 3_652_425;

/// Parse an ISO-8601 duration of the `PnDTnHnMn.nS` family, as in `PT0S`,
/// `-P1D` or `PT1H30M`. A leading `-` negates the whole value. Values past
/// [`MAX_DELAY_DAYS`] are refused.
pub fn parse_duration(text: &str) -> TierResult<Duration> {
    let invalid = || TierError::Config(format!("invalid ISO-8601 duration `{}`", text));

    let trimmed = text.trim();
    let (negative, rest) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    let rest = rest.strip_prefix(['P', 'p']).ok_or_else(invalid)?;
    let (date_part, time_part) = match rest.find(['T', 't']) {
        Some(idx) => (&rest[..idx], Some(&rest[idx + 1..])),
        None => (rest, None),
    };

    let mut total = Duration::zero();
    let mut seen = false;

    for (value, unit) in components(date_part).ok_or_else(invalid)? {
        let part = match unit {
            'D' => Duration::try_days(parse_whole(value).ok_or_else(invalid)?),
            _ => None,
        };
        total = total.checked_add(&part.ok_or_else(invalid)?).ok_or_else(invalid)?;
        seen = true;
    }

    if let Some(time) = time_part {
        if time.is_empty() {
            return Err(invalid());
        }
        for (value, unit) in components(time).ok_or_else(invalid)? {
            let part = match unit {
                'H' => parse_whole(value).and_then(Duration::try_hours),
                'M' => parse_whole(value).and_then(Duration::try_minutes),
                'S' => parse_seconds(value),
                _ => None,
            };
            total = total.checked_add(&part.ok_or_else(invalid)?).ok_or_else(invalid)?;
            seen = true;
        }
    }

    if !seen {
        return Err(invalid());
    }
    if total > Duration::days(MAX_DELAY_DAYS) {
        return Err(TierError::Config(format!(
            "duration `{}` exceeds {} days",
            text, MAX_DELAY_DAYS
        )));
    }
    Ok(if negative { -total } else { total })
}

/// Split `12D` / `1H30M` into `(number, unit)` pairs.
fn components(part: &str) -> Option<Vec<(&str, char)>> {
    let mut out = Vec::new();
    let mut start = 0;
    for (idx, ch) in part.char_indices() {
        if ch.is_ascii_alphabetic() {
            let value = &part[start..idx];
            if value.is_empty() {
                return None;
            }
            out.push((value, ch.to_ascii_uppercase()));
            start = idx + ch.len_utf8();
        }
    }
    if start != part.len() {
        return None;
    }
    Some(out)
}

fn parse_whole(value: &str) -> Option<i64> {
    value.parse::<i64>().ok()
}

fn parse_seconds(value: &str) -> Option<Duration> {
    let (negative, digits) = match value.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, value),
    };
    let (whole, fraction) = match digits.split_once(['.', ',']) {
        Some((whole, fraction)) => (whole, fraction),
        None => (digits, ""),
    };
    if fraction.len() > 9 || !fraction.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let seconds = Duration::try_seconds(whole.parse::<i64>().ok()?)?;
    let nanos = if fraction.is_empty() {
        0
    } else {
        format!("{:0<9}", fraction).parse::<i64>().ok()?
    };
    let total = seconds.checked_add(&Duration::nanoseconds(nanos))?;
    Some(if negative { -total } else { total })
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub near_dir: String,
    pub near_database_url: String,
    pub far_dir: String,
    pub far_database_url: String,
    pub container: String,
    pub policy: PolicySettings,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Run one tiering pass between a near and a far store")]
pub struct Args {
    /// Container to bounce (overrides BOUNCE_CONTAINER)
    #[arg(long)]
    pub container: Option<String>,

    /// Directory for near-store payloads (overrides BOUNCE_NEAR_DIR)
    #[arg(long)]
    pub near_dir: Option<String>,

    /// Near-store database URL (overrides BOUNCE_NEAR_DATABASE_URL)
    #[arg(long)]
    pub near_database_url: Option<String>,

    /// Directory for far-store payloads (overrides BOUNCE_FAR_DIR)
    #[arg(long)]
    pub far_dir: Option<String>,

    /// Far-store database URL (overrides BOUNCE_FAR_DATABASE_URL)
    #[arg(long)]
    pub far_database_url: Option<String>,

    /// Policy to run (overrides BOUNCE_POLICY)
    #[arg(long, value_enum)]
    pub policy: Option<PolicyKind>,

    /// ISO-8601 copy delay, negative disables (overrides BOUNCE_COPY_DELAY)
    #[arg(long, allow_hyphen_values = true)]
    pub copy_delay: Option<String>,

    /// ISO-8601 evict delay, negative disables (overrides BOUNCE_EVICT_DELAY)
    #[arg(long, allow_hyphen_values = true)]
    pub evict_delay: Option<String>,

    /// Near-store capacity in bytes (overrides BOUNCE_CAPACITY)
    #[arg(long)]
    pub capacity: Option<u64>,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig.
    pub fn from_env_and_args() -> Result<Self> {
        Self::merge(Args::parse(), |key| env::var(key))
    }

    /// CLI values win over environment values, which win over defaults.
    pub fn merge(
        args: Args,
        lookup: impl Fn(&str) -> Result<String, env::VarError>,
    ) -> Result<Self> {
        let var = |key: &str| -> Result<Option<String>> {
            match lookup(key) {
                Ok(value) => Ok(Some(value)),
                Err(env::VarError::NotPresent) => Ok(None),
                Err(err) => Err(err).with_context(|| format!("reading {}", key)),
            }
        };

        let env_policy = match var("BOUNCE_POLICY")? {
            Some(value) => PolicyKind::from_str(&value, true)
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("parsing BOUNCE_POLICY value `{}`", value))?,
            None => PolicyKind::WriteBack,
        };
        let env_capacity = match var("BOUNCE_CAPACITY")? {
            Some(value) => Some(
                value
                    .parse::<u64>()
                    .with_context(|| format!("parsing BOUNCE_CAPACITY value `{}`", value))?,
            ),
            None => None,
        };

        let policy = PolicySettings {
            kind: args.policy.unwrap_or(env_policy),
            copy_delay: args.copy_delay.or(var("BOUNCE_COPY_DELAY")?),
            evict_delay: args.evict_delay.or(var("BOUNCE_EVICT_DELAY")?),
            capacity: args.capacity.or(env_capacity),
        };

        let cfg = Self {
            near_dir: args
                .near_dir
                .or(var("BOUNCE_NEAR_DIR")?)
                .unwrap_or_else(|| "./data/near/objects".into()),
            near_database_url: args
                .near_database_url
                .or(var("BOUNCE_NEAR_DATABASE_URL")?)
                .unwrap_or_else(|| "sqlite://./data/near/meta.db".into()),
            far_dir: args
                .far_dir
                .or(var("BOUNCE_FAR_DIR")?)
                .unwrap_or_else(|| "./data/far/objects".into()),
            far_database_url: args
                .far_database_url
                .or(var("BOUNCE_FAR_DATABASE_URL")?)
                .unwrap_or_else(|| "sqlite://./data/far/meta.db".into()),
            container: args
                .container
                .or(var("BOUNCE_CONTAINER")?)
                .context("no container given (--container or BOUNCE_CONTAINER)")?,
            policy,
        };
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn parses_common_durations() {
        assert_eq!(parse_duration("PT0S").unwrap(), Duration::zero());
        assert_eq!(parse_duration("-P1D").unwrap(), -Duration::days(1));
        assert_eq!(
            parse_duration("PT1H30M").unwrap(),
            Duration::hours(1) + Duration::minutes(30)
        );
        assert_eq!(
            parse_duration("P2DT3H4M5.5S").unwrap(),
            Duration::days(2)
                + Duration::hours(3)
                + Duration::minutes(4)
                + Duration::milliseconds(5500)
        );
        assert_eq!(parse_duration("PT-1H").unwrap(), -Duration::hours(1));
    }

    #[test]
    fn rejects_malformed_durations() {
        for bad in ["", "P", "PT", "1D", "P1H", "PT1D", "PTS", "P1DT", "PT1.5H", "nonsense"] {
            let err = parse_duration(bad).unwrap_err();
            assert!(matches!(err, TierError::Config(_)), "{bad} parsed");
        }
    }

    #[test]
    fn rejects_durations_past_ten_thousand_years() {
        for huge in ["P100000000D", "-P100000000D", "PT9999999999M"] {
            let err = parse_duration(huge).unwrap_err();
            assert!(matches!(err, TierError::Config(_)), "{huge} parsed");
        }
        let limit = format!("P{}D", MAX_DELAY_DAYS);
        assert_eq!(parse_duration(&limit).unwrap(), Duration::days(MAX_DELAY_DAYS));
        assert!(PolicySettings::new(PolicyKind::WriteBack)
            .evict_delay("P100000000D")
            .optional_evict_delay()
            .is_err());
    }

    #[test]
    fn missing_settings_are_configuration_errors() {
        let settings = PolicySettings::new(PolicyKind::Storage);
        assert!(matches!(settings.require_capacity(), Err(TierError::Config(_))));
        assert!(matches!(settings.require_copy_delay(), Err(TierError::Config(_))));
        assert_eq!(settings.optional_evict_delay().unwrap(), None);
    }

    #[test]
    fn cli_overrides_environment() {
        let env = HashMap::from([
            ("BOUNCE_CONTAINER", "from-env"),
            ("BOUNCE_POLICY", "storage"),
            ("BOUNCE_CAPACITY", "100"),
            ("BOUNCE_EVICT_DELAY", "P1D"),
        ]);
        let lookup = |key: &str| {
            env.get(key)
                .map(|value| value.to_string())
                .ok_or(env::VarError::NotPresent)
        };
        let args = Args::parse_from(["bounce", "--container", "from-cli", "--copy-delay", "-P1D"]);
        let cfg = AppConfig::merge(args, lookup).unwrap();

        assert_eq!(cfg.container, "from-cli");
        assert_eq!(cfg.policy.kind, PolicyKind::Storage);
        assert_eq!(cfg.policy.capacity, Some(100));
        assert_eq!(cfg.policy.copy_delay.as_deref(), Some("-P1D"));
        assert_eq!(cfg.policy.evict_delay.as_deref(), Some("P1D"));
        assert_eq!(cfg.near_dir, "./data/near/objects");
    }

    #[test]
    fn container_is_required() {
        let args = Args::parse_from(["bounce"]);
        assert!(AppConfig::merge(args, |_| Err(env::VarError::NotPresent)).is_err());
    }
}
