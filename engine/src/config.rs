// --- Configuration -----------------------------------------------------------
//
// Everything is read from the environment once at start-up. Bad values are
// logged and replaced by the default so a typo never keeps the channel dark.

use std::net::SocketAddr;
use std::time::Duration;

use tracing::warn;

use crate::playlist::DEFAULT_DURATION_SECS;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreKind {
    Sqlite { path: String },
    Rest { url: String, token: Option<String> },
    /// No shared store configured: process-local only.
    Memory,
}

/// What happens to the playing position when the whole catalog is replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPolicy {
    /// Restart at item 0, offset 0.
    Reset,
    /// Keep the current item and offset if its id is still in the catalog.
    Preserve,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: SocketAddr,
    pub store: StoreKind,
    pub state_ttl: Duration,
    pub store_timeout: Duration,
    pub default_duration_secs: u32,
    pub catalog_file: Option<String>,
    pub catalog_url: Option<String>,
    pub refresh_policy: RefreshPolicy,
    pub probe_durations: bool,
    pub ffprobe: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 3000)),
            store: StoreKind::Sqlite {
                path: "/opt/channel/shared/channel.db".into(),
            },
            state_ttl: Duration::from_secs(86_400),
            store_timeout: Duration::from_millis(1_500),
            default_duration_secs: DEFAULT_DURATION_SECS,
            catalog_file: None,
            catalog_url: None,
            refresh_policy: RefreshPolicy::Reset,
            probe_durations: false,
            ffprobe: "ffprobe".into(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F>(get: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Config::default();
        let get = |k: &str| get(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let bind = parse_or(get("CHANNEL_BIND"), "CHANNEL_BIND", d.bind);

        let store = match get("CHANNEL_STORE").as_deref().map(str::to_ascii_lowercase).as_deref() {
            None | Some("sqlite") => StoreKind::Sqlite {
                path: get("CHANNEL_DB_PATH").unwrap_or_else(|| "/opt/channel/shared/channel.db".into()),
            },
            Some("rest") | Some("redis") => match get("CHANNEL_REST_URL") {
                Some(url) => StoreKind::Rest {
                    url,
                    token: get("CHANNEL_REST_TOKEN"),
                },
                None => {
                    warn!("CHANNEL_STORE=rest but CHANNEL_REST_URL is not set; shared state will be process-local");
                    StoreKind::Memory
                }
            },
            Some("memory") | Some("none") => StoreKind::Memory,
            Some(other) => {
                warn!("unknown CHANNEL_STORE={other}; using sqlite");
                d.store.clone()
            }
        };

        let ttl_secs: u64 = parse_or(get("CHANNEL_STATE_TTL_SECS"), "CHANNEL_STATE_TTL_SECS", d.state_ttl.as_secs());
        let timeout_ms: u64 = parse_or(
            get("CHANNEL_STORE_TIMEOUT_MS"),
            "CHANNEL_STORE_TIMEOUT_MS",
            d.store_timeout.as_millis() as u64,
        );
        let default_duration_secs: u32 = parse_or(
            get("CHANNEL_DEFAULT_DURATION_SECS"),
            "CHANNEL_DEFAULT_DURATION_SECS",
            d.default_duration_secs,
        );

        let refresh_policy = match get("CHANNEL_REFRESH_POLICY").as_deref() {
            None | Some("reset") => RefreshPolicy::Reset,
            Some("preserve") => RefreshPolicy::Preserve,
            Some(other) => {
                warn!("unknown CHANNEL_REFRESH_POLICY={other}; using reset");
                RefreshPolicy::Reset
            }
        };

        let probe_durations = matches!(
            get("CHANNEL_PROBE_DURATIONS").as_deref().map(str::to_ascii_lowercase).as_deref(),
            Some("1") | Some("true") | Some("yes") | Some("on")
        );

        Self {
            bind,
            store,
            state_ttl: Duration::from_secs(ttl_secs.max(1)),
            store_timeout: Duration::from_millis(timeout_ms.max(1)),
            default_duration_secs: if default_duration_secs == 0 {
                warn!("CHANNEL_DEFAULT_DURATION_SECS must be positive; using {}", d.default_duration_secs);
                d.default_duration_secs
            } else {
                default_duration_secs
            },
            catalog_file: get("CHANNEL_CATALOG_FILE"),
            catalog_url: get("CHANNEL_CATALOG_URL"),
            refresh_policy,
            probe_durations,
            ffprobe: get("CHANNEL_FFPROBE").unwrap_or(d.ffprobe),
        }
    }
}

fn parse_or<T: std::str::FromStr>(raw: Option<String>, name: &str, default: T) -> T {
    match raw {
        None => default,
        Some(s) => s.parse().unwrap_or_else(|_| {
            warn!("invalid {name}={s}; using default");
            default
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn cfg(pairs: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let c = cfg(&[]);
        assert_eq!(c.bind.to_string(), "127.0.0.1:3000");
        assert_eq!(c.default_duration_secs, 3600);
        assert_eq!(c.state_ttl, Duration::from_secs(86_400));
        assert_eq!(c.refresh_policy, RefreshPolicy::Reset);
        assert!(matches!(c.store, StoreKind::Sqlite { .. }));
        assert!(!c.probe_durations);
    }

    #[test]
    fn rest_without_url_degrades_to_memory() {
        let c = cfg(&[("CHANNEL_STORE", "rest")]);
        assert_eq!(c.store, StoreKind::Memory);

        let c = cfg(&[("CHANNEL_STORE", "rest"), ("CHANNEL_REST_URL", "https://kv.example"), ("CHANNEL_REST_TOKEN", "t")]);
        assert_eq!(
            c.store,
            StoreKind::Rest {
                url: "https://kv.example".into(),
                token: Some("t".into())
            }
        );
    }

    #[test]
    fn invalid_numbers_fall_back() {
        let c = cfg(&[
            ("CHANNEL_DEFAULT_DURATION_SECS", "0"),
            ("CHANNEL_STORE_TIMEOUT_MS", "soon"),
            ("CHANNEL_BIND", "not-an-addr"),
        ]);
        assert_eq!(c.default_duration_secs, 3600);
        assert_eq!(c.store_timeout, Duration::from_millis(1_500));
        assert_eq!(c.bind.port(), 3000);
    }

    #[test]
    fn policy_and_probe_flags() {
        let c = cfg(&[("CHANNEL_REFRESH_POLICY", "preserve"), ("CHANNEL_PROBE_DURATIONS", "TRUE")]);
        assert_eq!(c.refresh_policy, RefreshPolicy::Preserve);
        assert!(c.probe_durations);
    }
}
