//! Cache Configuration
//!
//! `CacheConfig` is loaded from YAML, then overridden by `TIERCACHE_*`
//! environment variables, then validated. Durations accept plain seconds
//! (`30`) or unit strings (`500ms`, `30s`, `5m`, `1h`, `1d`, `1h30m`).
//!
//! ```yaml
//! memory_budget_bytes: 67108864
//! low_watermark: 0.8
//! file_tier_enabled: true
//! file_tier_path: /var/cache/tiercache
//! external_tier_endpoint: http://cache-store:8080
//! external_timeout: 2s
//! default_ttl: 5m
//! strategy_table:
//!   cart:
//!     ttl: 30s
//!     sliding: true
//!   organizations:
//!     ttl: 1h
//!     warm_eligible: false
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::compression::CodecConfig;
use crate::cache::Strategy;
use crate::cache::MemoryConfig;
use crate::error::{Error, Result};

/// Prefix of environment overrides
pub const ENV_PREFIX: &str = "TIERCACHE_";

/// Highest LZ4 high-compression level
pub const MAX_COMPRESSION_LEVEL: i32 = 12;

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Memory tier byte budget (key + stored value); 0 disables the tier
    pub memory_budget_bytes: u64,
    /// Optional memory tier entry budget
    pub memory_max_entries: Option<usize>,
    /// Memory tier map shards
    pub memory_shard_count: usize,
    /// Fraction of each budget eviction drains down to
    pub low_watermark: f64,

    /// Enable the file tier
    pub file_tier_enabled: bool,
    /// File tier directory
    pub file_tier_path: PathBuf,

    /// External store base URL; absent disables the tier
    pub external_tier_endpoint: Option<String>,
    /// Bound on every external call
    #[serde(with = "duration")]
    pub external_timeout: Duration,

    /// Values strictly larger than this are compressed
    pub compression_threshold_bytes: u64,
    /// LZ4 high-compression level (1-12)
    pub compression_level: i32,

    /// Active expiry sweep period; zero disables the sweeper
    #[serde(with = "duration")]
    pub active_sweep_interval: Duration,
    /// TTL for keys with no strategy and no explicit TTL
    #[serde(with = "duration")]
    pub default_ttl: Duration,

    /// Warm producers run at once when the caller gives no limit
    pub warm_concurrency: usize,

    /// Category -> policy
    pub strategy_table: HashMap<String, Strategy>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_budget_bytes: 64 * 1024 * 1024, // 64MB
            memory_max_entries: None,
            memory_shard_count: 64,
            low_watermark: 0.80,
            file_tier_enabled: false,
            file_tier_path: std::env::temp_dir().join("tiercache"),
            external_tier_endpoint: None,
            external_timeout: Duration::from_secs(2),
            compression_threshold_bytes: 1024,
            compression_level: 4,
            active_sweep_interval: Duration::from_secs(60),
            default_ttl: Duration::from_secs(300),
            warm_concurrency: crate::cache::DEFAULT_WARM_CONCURRENCY,
            strategy_table: HashMap::new(),
        }
    }
}

impl CacheConfig {
    /// Parse YAML without validating
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| Error::Config(format!("Invalid YAML: {}", e)))
    }

    /// Read a YAML file without validating
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Cannot read {}: {}", path.display(), e)))?;
        Self::from_yaml(&yaml)
    }

    /// File (or defaults), then environment overrides, then validation
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `TIERCACHE_*` variables from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(std::env::vars())
    }

    /// Apply `TIERCACHE_*` overrides from `vars`; other names are ignored
    pub fn apply_overrides<I>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (name, value) in vars {
            let Some(field) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value = value.trim();
            match field {
                "MEMORY_BUDGET_BYTES" => self.memory_budget_bytes = parse(&name, value)?,
                "MEMORY_MAX_ENTRIES" => {
                    self.memory_max_entries = if value.is_empty() {
                        None
                    } else {
                        Some(parse(&name, value)?)
                    }
                }
                "MEMORY_SHARD_COUNT" => self.memory_shard_count = parse(&name, value)?,
                "LOW_WATERMARK" => self.low_watermark = parse(&name, value)?,
                "FILE_TIER_ENABLED" => self.file_tier_enabled = parse_bool(&name, value)?,
                "FILE_TIER_PATH" => self.file_tier_path = PathBuf::from(value),
                "EXTERNAL_TIER_ENDPOINT" => {
                    self.external_tier_endpoint = (!value.is_empty()).then(|| value.to_string())
                }
                "EXTERNAL_TIMEOUT" => self.external_timeout = parse_duration(value)?,
                "COMPRESSION_THRESHOLD_BYTES" => {
                    self.compression_threshold_bytes = parse(&name, value)?
                }
                "COMPRESSION_LEVEL" => self.compression_level = parse(&name, value)?,
                "ACTIVE_SWEEP_INTERVAL" => self.active_sweep_interval = parse_duration(value)?,
                "DEFAULT_TTL" => self.default_ttl = parse_duration(value)?,
                "WARM_CONCURRENCY" => self.warm_concurrency = parse(&name, value)?,
                _ => {
                    tracing::debug!("Ignoring unknown override {}", name);
                    continue;
                }
            }
            tracing::debug!("Config override {}={}", name, value);
        }
        Ok(())
    }

    /// Check ranges and cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if !(self.low_watermark > 0.0 && self.low_watermark <= 1.0) {
            return Err(Error::Config(format!(
                "low_watermark must be in (0, 1], got {}",
                self.low_watermark
            )));
        }
        if self.memory_shard_count == 0 {
            return Err(Error::Config("memory_shard_count must be positive".into()));
        }
        if !(1..=MAX_COMPRESSION_LEVEL).contains(&self.compression_level) {
            return Err(Error::Config(format!(
                "compression_level must be in 1..={}, got {}",
                MAX_COMPRESSION_LEVEL, self.compression_level
            )));
        }
        if self.default_ttl.as_millis() == 0 {
            return Err(Error::Config("default_ttl must be at least 1ms".into()));
        }
        if self.warm_concurrency == 0 {
            return Err(Error::Config("warm_concurrency must be positive".into()));
        }
        if self.file_tier_enabled && self.file_tier_path.as_os_str().is_empty() {
            return Err(Error::Config(
                "file_tier_path is required when the file tier is enabled".into(),
            ));
        }
        if let Some(endpoint) = &self.external_tier_endpoint {
            if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                return Err(Error::Config(format!(
                    "external_tier_endpoint must be an http(s) URL, got {}",
                    endpoint
                )));
            }
            if self.external_timeout.is_zero() {
                return Err(Error::Config("external_timeout must be positive".into()));
            }
        }
        for (category, strategy) in &self.strategy_table {
            if category.is_empty() || category.contains(crate::cache::NAMESPACE_SEPARATOR) {
                return Err(Error::Config(format!("invalid strategy category {:?}", category)));
            }
            if strategy.ttl.as_millis() == 0 {
                return Err(Error::Config(format!(
                    "strategy {} must have a TTL of at least 1ms",
                    category
                )));
            }
        }
        Ok(())
    }

    /// Memory tier settings
    pub fn memory_config(&self) -> MemoryConfig {
        MemoryConfig {
            budget_bytes: self.memory_budget_bytes,
            max_entries: self.memory_max_entries,
            low_watermark: self.low_watermark,
            shard_count: self.memory_shard_count,
        }
    }

    /// Codec settings
    pub fn codec_config(&self) -> CodecConfig {
        CodecConfig {
            threshold_bytes: self.compression_threshold_bytes,
            level: self.compression_level,
        }
    }
}

fn parse<T>(name: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| Error::Config(format!("{}={:?}: {}", name, value, e)))
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!("{}={:?}: expected a boolean", name, value))),
    }
}

/// Parse a duration string such as "30s", "5m", "1h30m", "250ms" or "45"
/// (bare numbers are seconds)
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::Config("empty duration string".to_string()));
    }

    let mut total = Duration::ZERO;
    let mut num_buf = String::new();
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            num_buf.push(c);
            continue;
        }

        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::Config(format!("invalid number in duration: {}", s)))?;
        num_buf.clear();

        let unit = match c {
            'm' | 'M' if chars.peek().is_some_and(|n| matches!(n, 's' | 'S')) => {
                chars.next();
                Duration::from_millis(1)
            }
            'd' | 'D' => Duration::from_secs(86400),
            'h' | 'H' => Duration::from_secs(3600),
            'm' | 'M' => Duration::from_secs(60),
            's' | 'S' => Duration::from_secs(1),
            _ => {
                return Err(Error::Config(format!(
                    "unknown duration unit '{}' in {}",
                    c, s
                )))
            }
        };
        total += unit * num as u32;
    }

    // Handle case where string ends with a number (assume seconds)
    if !num_buf.is_empty() {
        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::Config(format!("invalid number in duration: {}", s)))?;
        total += Duration::from_secs(num);
    }

    Ok(total)
}

/// Render a duration in the shortest unit that is exact
pub fn format_duration(d: Duration) -> String {
    let millis = d.as_millis();
    if millis % 1000 != 0 {
        return format!("{}ms", millis);
    }
    let secs = d.as_secs();
    match secs {
        s if s != 0 && s % 86400 == 0 => format!("{}d", s / 86400),
        s if s != 0 && s % 3600 == 0 => format!("{}h", s / 3600),
        s if s != 0 && s % 60 == 0 => format!("{}m", s / 60),
        s => format!("{}s", s),
    }
}

/// Serde adapter: durations as seconds or unit strings
pub(crate) mod duration {
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        struct DurationVisitor;

        impl<'de> Visitor<'de> for DurationVisitor {
            type Value = Duration;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("seconds or a duration string like \"30s\"")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
                Ok(Duration::from_secs(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
                u64::try_from(v)
                    .map(Duration::from_secs)
                    .map_err(|_| E::custom("duration must not be negative"))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
                super::parse_duration(v).map_err(E::custom)
            }
        }

        d.deserialize_any(DurationVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TierKind;
    use assert_matches::assert_matches;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = CacheConfig::default();
        config.validate().unwrap();
        assert_eq!(config.memory_budget_bytes, 64 * 1024 * 1024);
        assert!(!config.file_tier_enabled);
        assert!(config.external_tier_endpoint.is_none());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86400));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("1m500ms").unwrap(), Duration::from_millis(60_500));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("s").is_err());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(1500)), "1500ms");
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_secs(120)), "2m");
        assert_eq!(format_duration(Duration::from_secs(7200)), "2h");
        assert_eq!(format_duration(Duration::ZERO), "0s");
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
memory_budget_bytes: 1048576
memory_max_entries: 1000
file_tier_enabled: true
file_tier_path: /tmp/tiercache-test
external_tier_endpoint: http://cache-store:8080
external_timeout: 500ms
default_ttl: 10m
active_sweep_interval: 15
strategy_table:
  cart:
    ttl: 30s
    sliding: true
  organizations:
    ttl: 1h
    tiers: [memory, external]
"#;
        let config = CacheConfig::from_yaml(yaml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.memory_budget_bytes, 1_048_576);
        assert_eq!(config.memory_max_entries, Some(1000));
        assert_eq!(config.external_timeout, Duration::from_millis(500));
        assert_eq!(config.default_ttl, Duration::from_secs(600));
        assert_eq!(config.active_sweep_interval, Duration::from_secs(15));
        // Unspecified fields keep their defaults
        assert_eq!(config.compression_threshold_bytes, 1024);

        let cart = &config.strategy_table["cart"];
        assert_eq!(cart.ttl, Duration::from_secs(30));
        assert!(cart.sliding);
        assert!(!config.strategy_table["organizations"].uses(TierKind::File));
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert_matches!(
            CacheConfig::from_yaml("memory_budget: 10"),
            Err(Error::Config(_))
        );
    }

    #[test]
    fn test_yaml_round_trip_keeps_durations() {
        let mut config = CacheConfig::default();
        config.external_timeout = Duration::from_millis(750);
        let yaml = serde_yaml::to_string(&config).unwrap();
        assert!(yaml.contains("external_timeout: 750ms"));
        assert_eq!(CacheConfig::from_yaml(&yaml).unwrap(), config);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = CacheConfig::default();
        config
            .apply_overrides(vars(&[
                ("TIERCACHE_MEMORY_BUDGET_BYTES", "2048"),
                ("TIERCACHE_MEMORY_MAX_ENTRIES", "2"),
                ("TIERCACHE_FILE_TIER_ENABLED", "yes"),
                ("TIERCACHE_EXTERNAL_TIER_ENDPOINT", "https://store"),
                ("TIERCACHE_DEFAULT_TTL", "90s"),
                ("TIERCACHE_SOMETHING_ELSE", "ignored"),
                ("HOME", "/root"),
            ]))
            .unwrap();

        assert_eq!(config.memory_budget_bytes, 2048);
        assert_eq!(config.memory_max_entries, Some(2));
        assert!(config.file_tier_enabled);
        assert_eq!(config.external_tier_endpoint.as_deref(), Some("https://store"));
        assert_eq!(config.default_ttl, Duration::from_secs(90));
    }

    #[test]
    fn test_bad_override_is_config_error() {
        let mut config = CacheConfig::default();
        let err = config
            .apply_overrides(vars(&[("TIERCACHE_LOW_WATERMARK", "most")]))
            .unwrap_err();
        assert_matches!(err, Error::Config(msg) if msg.contains("TIERCACHE_LOW_WATERMARK"));
    }

    #[test]
    fn test_validation() {
        let invalid = [
            CacheConfig {
                low_watermark: 0.0,
                ..Default::default()
            },
            CacheConfig {
                compression_level: 13,
                ..Default::default()
            },
            CacheConfig {
                default_ttl: Duration::ZERO,
                ..Default::default()
            },
            CacheConfig {
                external_tier_endpoint: Some("cache-store:8080".into()),
                ..Default::default()
            },
            CacheConfig {
                strategy_table: HashMap::from([(
                    "cart".to_string(),
                    Strategy::new("cart", Duration::ZERO),
                )]),
                ..Default::default()
            },
        ];
        for config in invalid {
            assert_matches!(config.validate(), Err(Error::Config(_)), "{:?}", config);
        }
    }
}
