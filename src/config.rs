//! Flat key/value configuration reader (spec.md §6).
//!
//! The gateway's configuration file is a flat list of `key value` and
//! `key:appender value` lines. This is not a format any of the off-the-shelf
//! config crates in the surrounding stack read out of the box, so — in the
//! manner of the teacher's `src/config/datastore.rs` (a typed config struct
//! plus a `config()` loader function) — a small dedicated reader is built
//! here instead.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::SystemTime;

use crate::error::ConfigError;
use crate::search_cache::CacheMode;

/// One `key[:appender] value` line from the configuration file.
#[derive(Debug, Clone)]
pub struct ConfigEntry {
    pub key: String,
    pub appender: Option<String>,
    pub value: String,
}

/// The parsed, flat key/value configuration file.
#[derive(Debug, Clone, Default)]
pub struct RawConfig {
    entries: Vec<ConfigEntry>,
}

impl RawConfig {
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let mut entries = Vec::new();

        for (lineno, raw_line) in contents.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut parts = line.splitn(2, char::is_whitespace);
            let keyspec = parts.next().unwrap_or("");
            let value = parts.next().unwrap_or("").trim().to_string();

            if keyspec.is_empty() {
                return Err(ConfigError::Parse(format!(
                    "line {}: missing key",
                    lineno + 1
                )));
            }

            let (key, appender) = match keyspec.split_once(':') {
                Some((k, a)) => (k.to_string(), Some(a.to_string())),
                None => (keyspec.to_string(), None),
            };

            entries.push(ConfigEntry { key, appender, value });
        }

        Ok(RawConfig { entries })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|err| {
            ConfigError::InvalidDirectory(format!("{:?}: {}", path, err))
        })?;
        Self::parse(&contents)
    }

    /// First entry matching `key` with no appender.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.key == key && e.appender.is_none())
            .map(|e| e.value.as_str())
    }

    /// First entry matching `key:appender`.
    pub fn get_appended(&self, key: &str, appender: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.key == key && e.appender.as_deref() == Some(appender))
            .map(|e| e.value.as_str())
    }

    /// All entries for `key` (with any appender), keyed by appender name.
    /// Used for per-index keys like `index:NAME` or `index-location:NAME`.
    pub fn all_appended(&self, key: &str) -> HashMap<&str, &str> {
        self.entries
            .iter()
            .filter(|e| e.key == key)
            .filter_map(|e| e.appender.as_deref().map(|a| (a, e.value.as_str())))
            .collect()
    }
}

/// Wire protocol used between the gateway and backend mirrors (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireProtocol {
    Tcp,
    Udp,
}

/// Gateway-wide resolved defaults (spec.md §3 "Gateway", §6 table).
#[derive(Debug, Clone)]
pub struct GatewayDefaults {
    pub connection_timeout_ms: u64,
    pub search_timeout_ms: u64,
    pub retrieval_timeout_ms: u64,
    pub information_timeout_ms: u64,
    pub mirror_affinity: i32,
    pub info_cache_ttl_secs: u64,
    pub allow_search_overrides: bool,
    pub protocol: WireProtocol,
    pub send_init: bool,
}

impl Default for GatewayDefaults {
    fn default() -> Self {
        GatewayDefaults {
            connection_timeout_ms: 10,
            search_timeout_ms: 60_000,
            retrieval_timeout_ms: 5_000,
            information_timeout_ms: 5_000,
            mirror_affinity: -1,
            info_cache_ttl_secs: 600,
            allow_search_overrides: false,
            protocol: WireProtocol::Tcp,
            send_init: false,
        }
    }
}

fn parse_bool(s: &str, key: &str) -> Result<bool, ConfigError> {
    match s.trim().to_ascii_lowercase().as_str() {
        "yes" | "true" | "1" => Ok(true),
        "no" | "false" | "0" => Ok(false),
        other => Err(ConfigError::Parse(format!(
            "invalid boolean '{}' for key '{}'",
            other, key
        ))),
    }
}

fn parse_u64(s: &str, key: &str) -> Result<u64, ConfigError> {
    s.trim()
        .parse::<u64>()
        .map_err(|_| ConfigError::Parse(format!("invalid integer '{}' for key '{}'", s, key)))
}

fn parse_i32(s: &str, key: &str) -> Result<i32, ConfigError> {
    s.trim()
        .parse::<i32>()
        .map_err(|_| ConfigError::Parse(format!("invalid integer '{}' for key '{}'", s, key)))
}

/// Checks `version`'s minor component against the build's own minor version
/// (spec.md §6: "minor must be ≤ build's minor").
pub fn check_version(version: &str, build_minor: u32) -> Result<(), ConfigError> {
    let mut parts = version.split('.');
    let _major = parts.next().ok_or_else(|| ConfigError::BadVersion(version.to_string()))?;
    let minor: u32 = parts
        .next()
        .ok_or_else(|| ConfigError::BadVersion(version.to_string()))?
        .parse()
        .map_err(|_| ConfigError::BadVersion(version.to_string()))?;
    let _patch = parts.next().ok_or_else(|| ConfigError::BadVersion(version.to_string()))?;

    if minor > build_minor {
        return Err(ConfigError::BadVersion(format!(
            "{} has minor {} > build minor {}",
            version, minor, build_minor
        )));
    }

    Ok(())
}

/// Current build minor version, used by [`check_version`].
pub const BUILD_MINOR_VERSION: u32 = 0;

impl GatewayDefaults {
    pub fn from_config(raw: &RawConfig) -> Result<Self, ConfigError> {
        let mut defaults = GatewayDefaults::default();

        if let Some(version) = raw.get("version") {
            check_version(version, BUILD_MINOR_VERSION)?;
        }

        if let Some(v) = raw.get("gateway-connection-timeout") {
            defaults.connection_timeout_ms = parse_u64(v, "gateway-connection-timeout")?;
        }
        if let Some(v) = raw.get("gateway-search-timeout") {
            defaults.search_timeout_ms = parse_u64(v, "gateway-search-timeout")?;
        }
        if let Some(v) = raw.get("gateway-retrieval-timeout") {
            defaults.retrieval_timeout_ms = parse_u64(v, "gateway-retrieval-timeout")?;
        }
        if let Some(v) = raw.get("gateway-information-timeout") {
            defaults.information_timeout_ms = parse_u64(v, "gateway-information-timeout")?;
        }
        if let Some(v) = raw.get("gateway-mirror-affinity") {
            defaults.mirror_affinity = parse_i32(v, "gateway-mirror-affinity")?;
        }
        if let Some(v) = raw.get("gateway-information-cache-timeout") {
            defaults.info_cache_ttl_secs = parse_u64(v, "gateway-information-cache-timeout")?;
        }
        if let Some(v) = raw.get("gateway-allow-search-overrides") {
            defaults.allow_search_overrides = parse_bool(v, "gateway-allow-search-overrides")?;
        }
        if let Some(v) = raw.get_appended("gateway-network-protocol", "lwps") {
            defaults.protocol = match v.trim().to_ascii_lowercase().as_str() {
                "tcp" => WireProtocol::Tcp,
                "udp" => WireProtocol::Udp,
                other => {
                    return Err(ConfigError::Parse(format!(
                        "invalid protocol '{}' for gateway-network-protocol:lwps",
                        other
                    )))
                }
            };
        }
        if let Some(v) = raw.get_appended("gateway-send-init", "lwps") {
            defaults.send_init = parse_bool(v, "gateway-send-init:lwps")?;
        }

        Ok(defaults)
    }
}

/// Per-index connection policy (spec.md §3 `lazy_connection` flag).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPolicy {
    Strict,
    Lazy,
}

/// Per-index error-handling policy for one error class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    Ignore,
    Fail,
}

/// Raw, not-yet-resolved per-index configuration, read straight off the
/// `index-*:NAME` keys (spec.md §6).
#[derive(Debug, Clone)]
pub struct IndexConfigEntry {
    pub location: Option<String>,
    pub hosts: Option<String>,
    pub segment_spec: Option<String>,
    pub sort_orders: Option<String>,
    pub max_segments_searched: u32,
    pub min_segments_searched: u32,
    pub connection_policy: ConnectionPolicy,
    pub connection_error: ErrorPolicy,
    pub search_error: ErrorPolicy,
    pub retrieval_error: ErrorPolicy,
}

impl IndexConfigEntry {
    pub fn resolve(raw: &RawConfig, name: &str) -> Result<Self, ConfigError> {
        let location = raw.get_appended("index-location", name).map(str::to_string);
        let hosts = raw
            .get_appended("index-hosts", name)
            .or_else(|| raw.get("index-hosts"))
            .map(str::to_string);
        let segment_spec = raw.get_appended("index", name).map(str::to_string);
        let sort_orders = raw.get_appended("index-sort-orders", name).map(str::to_string);

        let max_segments_searched = match raw.get_appended("index-max-segments-searched", name) {
            Some(v) => parse_u64(v, "index-max-segments-searched")? as u32,
            None => 0,
        };
        let min_segments_searched = match raw.get_appended("index-min-segments-searched", name) {
            Some(v) => parse_u64(v, "index-min-segments-searched")? as u32,
            None => 0,
        };

        let connection_policy = match raw.get_appended("index-connection-policy", name) {
            Some("lazy") => ConnectionPolicy::Lazy,
            Some("strict") | None => ConnectionPolicy::Strict,
            Some(other) => {
                return Err(ConfigError::Parse(format!(
                    "invalid connection policy '{}'",
                    other
                )))
            }
        };

        let parse_error_policy = |k: &str| -> Result<ErrorPolicy, ConfigError> {
            match raw.get_appended(k, name) {
                Some("ignore") => Ok(ErrorPolicy::Ignore),
                Some("fail") | None => Ok(ErrorPolicy::Fail),
                Some(other) => Err(ConfigError::Parse(format!(
                    "invalid error policy '{}' for {}",
                    other, k
                ))),
            }
        };

        Ok(IndexConfigEntry {
            location,
            hosts,
            segment_spec,
            sort_orders,
            max_segments_searched,
            min_segments_searched,
            connection_policy,
            connection_error: parse_error_policy("index-connection-error")?,
            search_error: parse_error_policy("index-search-error")?,
            retrieval_error: parse_error_policy("index-retrieval-error")?,
        })
    }
}

/// On-disk search cache configuration (spec.md §4.3 "Modes"). Not in
/// spec.md's non-exhaustive key table, but every deployment needs a
/// directory and mode to turn the cache on at all; named in the same
/// `search-cache-*` family as the rest of §6's flat keys, grounded on the
/// original's `SRCH_SEARCH_CONFIG_SEARCH_CACHE_{MODE,LOCATION,SUBDIRECTORY_MASK}`.
#[derive(Debug, Clone)]
pub struct SearchCacheConfig {
    pub mode: CacheMode,
    pub directory: Option<String>,
    pub subdirectory_mask: Option<String>,
}

impl SearchCacheConfig {
    pub fn from_config(raw: &RawConfig) -> Result<Self, ConfigError> {
        let directory = raw.get("search-cache-location").map(str::to_string);

        let mode = match (raw.get("search-cache-mode"), directory.is_some()) {
            (Some("off"), _) | (None, false) => CacheMode::Off,
            (Some("read-only"), _) => CacheMode::ReadOnly,
            (Some("read-write"), _) | (None, true) => CacheMode::ReadWrite,
            (Some(other), _) => {
                return Err(ConfigError::Parse(format!(
                    "invalid search-cache-mode '{}'",
                    other
                )))
            }
        };

        let subdirectory_mask = raw.get("search-cache-subdirectory-mask").map(str::to_string);

        Ok(SearchCacheConfig { mode, directory, subdirectory_mask })
    }
}

/// stat(2) the config file's modification time, used to detect a config
/// change between requests (spec.md §3 "Lifecycle").
pub fn status_change_time<P: AsRef<Path>>(path: P) -> std::io::Result<SystemTime> {
    fs::metadata(path)?.modified()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_appended_keys() {
        let raw = RawConfig::parse(
            "# comment\n\
             version 1.0.0\n\
             gateway-connection-timeout 25\n\
             index-location:foo lwps://host1:1970/foo\n\
             \n",
        )
        .unwrap();

        assert_eq!(raw.get("gateway-connection-timeout"), Some("25"));
        assert_eq!(
            raw.get_appended("index-location", "foo"),
            Some("lwps://host1:1970/foo")
        );
        assert_eq!(raw.get("index-location"), None);
    }

    #[test]
    fn defaults_applied_when_absent() {
        let raw = RawConfig::parse("").unwrap();
        let defaults = GatewayDefaults::from_config(&raw).unwrap();
        assert_eq!(defaults.connection_timeout_ms, 10);
        assert_eq!(defaults.search_timeout_ms, 60_000);
        assert_eq!(defaults.mirror_affinity, -1);
        assert_eq!(defaults.protocol, WireProtocol::Tcp);
        assert!(!defaults.allow_search_overrides);
    }

    #[test]
    fn version_minor_mismatch_rejected() {
        let raw = RawConfig::parse("version 1.5.0\n").unwrap();
        let err = GatewayDefaults::from_config(&raw).unwrap_err();
        assert!(matches!(err, ConfigError::BadVersion(_)));
    }

    #[test]
    fn index_config_resolves_bounds_and_policies() {
        let raw = RawConfig::parse(
            "index-max-segments-searched:foo 4\n\
             index-min-segments-searched:foo 2\n\
             index-connection-policy:foo lazy\n\
             index-search-error:foo ignore\n",
        )
        .unwrap();

        let entry = IndexConfigEntry::resolve(&raw, "foo").unwrap();
        assert_eq!(entry.max_segments_searched, 4);
        assert_eq!(entry.min_segments_searched, 2);
        assert_eq!(entry.connection_policy, ConnectionPolicy::Lazy);
        assert_eq!(entry.search_error, ErrorPolicy::Ignore);
        assert_eq!(entry.connection_error, ErrorPolicy::Fail);
    }

    #[test]
    fn search_cache_defaults_to_off_without_a_directory() {
        let raw = RawConfig::parse("").unwrap();
        let cache = SearchCacheConfig::from_config(&raw).unwrap();
        assert_eq!(cache.mode, CacheMode::Off);
    }

    #[test]
    fn search_cache_defaults_to_read_write_once_a_directory_is_set() {
        let raw = RawConfig::parse("search-cache-location /var/cache/lwps\n").unwrap();
        let cache = SearchCacheConfig::from_config(&raw).unwrap();
        assert_eq!(cache.mode, CacheMode::ReadWrite);
        assert_eq!(cache.directory.as_deref(), Some("/var/cache/lwps"));
    }

    #[test]
    fn search_cache_mode_explicit_read_only() {
        let raw = RawConfig::parse(
            "search-cache-location /var/cache/lwps\n\
             search-cache-mode read-only\n",
        )
        .unwrap();
        let cache = SearchCacheConfig::from_config(&raw).unwrap();
        assert_eq!(cache.mode, CacheMode::ReadOnly);
    }
}
