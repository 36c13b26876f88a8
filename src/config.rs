//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use url::Url;

use crate::error::ConfigError;

/// Node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Base coordinator address, e.g. `ws://127.0.0.1:8120`.
    pub server: String,
    /// Node name reported to the coordinator.
    pub name: String,
    /// Model file handed to the engine at init.
    pub model_path: PathBuf,
    /// Authorization token sent on the connection handshake.
    pub token: SecretString,
    /// Concurrency ceiling advertised to the coordinator.
    pub max_concurrency: u32,
    /// Delay between a disconnect and the next connection attempt.
    pub reconnect_delay: Duration,
    /// Outbound silence after which an empty keepalive frame is sent.
    pub keepalive_interval: Duration,
    /// Engine tick interval on the scheduling loop.
    pub tick_interval: Duration,
    /// Capacity of the inbound and outbound hand-off queues.
    pub queue_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            server: "ws://127.0.0.1:8120".to_string(),
            name: "beagle".to_string(),
            model_path: PathBuf::from("model.bin"),
            token: SecretString::from("unsafe-default-token"),
            max_concurrency: 1,
            reconnect_delay: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(30),
            tick_interval: Duration::from_millis(5),
            queue_capacity: 1000,
        }
    }
}

impl NodeConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary variable lookup.
    pub fn from_vars<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let max_concurrency: u32 =
            parse_var(&lookup, "NODE_MAX_CONCURRENCY")?.unwrap_or(defaults.max_concurrency);
        if max_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "NODE_MAX_CONCURRENCY".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        let reconnect_delay = parse_secs(&lookup, "NODE_RECONNECT_DELAY_SECS")?
            .unwrap_or(defaults.reconnect_delay);
        let keepalive_interval = parse_secs(&lookup, "NODE_KEEPALIVE_SECS")?
            .unwrap_or(defaults.keepalive_interval);

        Ok(Self {
            server: lookup("NODE_SERVER").unwrap_or(defaults.server),
            name: lookup("NODE_NAME").unwrap_or(defaults.name),
            model_path: lookup("NODE_MODEL_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.model_path),
            token: lookup("NODE_TOKEN")
                .map(SecretString::from)
                .unwrap_or(defaults.token),
            max_concurrency,
            reconnect_delay,
            keepalive_interval,
            ..defaults
        })
    }

    /// Model identifier advertised to the coordinator: the file name of the
    /// model path without its `.bin` suffix.
    pub fn model_name(&self) -> String {
        let path = self.model_path.to_string_lossy();
        let mut name = path.strip_suffix(".bin").unwrap_or(&*path);
        if let Some(idx) = name.rfind('/') {
            name = &name[idx + 1..];
        }
        if let Some(idx) = name.rfind('\\') {
            name = &name[idx + 1..];
        }
        name.to_string()
    }

    /// Coordinator URL including the handshake query parameters.
    pub fn connect_url(&self) -> Result<Url, ConfigError> {
        let address = format!("{}/ws", self.server.trim_end_matches('/'));
        let mut url = Url::parse(&address).map_err(|source| ConfigError::InvalidUrl {
            address: address.clone(),
            source,
        })?;
        url.query_pairs_mut()
            .append_pair("name", &self.name)
            .append_pair("model", &self.model_name())
            .append_pair("token", self.token.expose_secret())
            .append_pair("max_concurrency", &self.max_concurrency.to_string());
        Ok(url)
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
    }
}

/// A whole number of seconds. Zero would turn the timer it drives into a
/// busy loop.
fn parse_secs<F>(lookup: &F, key: &str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match parse_var::<u64, _>(lookup, key)? {
        Some(0) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be at least 1 second".to_string(),
        }),
        secs => Ok(secs.map(Duration::from_secs)),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_set() {
        let config = NodeConfig::from_vars(lookup(&[])).unwrap();
        assert_eq!(config.server, "ws://127.0.0.1:8120");
        assert_eq!(config.name, "beagle");
        assert_eq!(config.max_concurrency, 1);
        assert_eq!(config.reconnect_delay, Duration::from_secs(30));
        assert_eq!(config.keepalive_interval, Duration::from_secs(30));
        assert_eq!(config.tick_interval, Duration::from_millis(5));
        assert_eq!(config.queue_capacity, 1000);
    }

    #[test]
    fn reads_overrides() {
        let config = NodeConfig::from_vars(lookup(&[
            ("NODE_SERVER", "wss://coord.example.com"),
            ("NODE_NAME", "husky"),
            ("NODE_MODEL_PATH", "/models/7b-q5.bin"),
            ("NODE_TOKEN", "s3cret"),
            ("NODE_MAX_CONCURRENCY", "4"),
            ("NODE_RECONNECT_DELAY_SECS", "2"),
        ]))
        .unwrap();
        assert_eq!(config.server, "wss://coord.example.com");
        assert_eq!(config.name, "husky");
        assert_eq!(config.token.expose_secret(), "s3cret");
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.reconnect_delay, Duration::from_secs(2));
        assert_eq!(config.model_name(), "7b-q5");
    }

    #[test]
    fn rejects_garbage_numbers() {
        let err = NodeConfig::from_vars(lookup(&[("NODE_MAX_CONCURRENCY", "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "NODE_MAX_CONCURRENCY"));
    }

    #[test]
    fn rejects_zero_concurrency() {
        assert!(NodeConfig::from_vars(lookup(&[("NODE_MAX_CONCURRENCY", "0")])).is_err());
    }

    #[test]
    fn rejects_zero_intervals() {
        for key in ["NODE_KEEPALIVE_SECS", "NODE_RECONNECT_DELAY_SECS"] {
            let err = NodeConfig::from_vars(lookup(&[(key, "0")])).unwrap_err();
            assert!(
                matches!(err, ConfigError::InvalidValue { key: ref k, .. } if k == key),
                "{key} accepted zero"
            );
        }
        let config = NodeConfig::from_vars(lookup(&[("NODE_KEEPALIVE_SECS", "1")])).unwrap();
        assert_eq!(config.keepalive_interval, Duration::from_secs(1));
    }

    #[test]
    fn model_name_strips_directories_and_suffix() {
        let mut config = NodeConfig::default();
        config.model_path = PathBuf::from("/mnt/c/AITemp/7b-v1.3-q5_1.bin");
        assert_eq!(config.model_name(), "7b-v1.3-q5_1");

        config.model_path = PathBuf::from(r"C:\models\vicuna.bin");
        assert_eq!(config.model_name(), "vicuna");

        config.model_path = PathBuf::from("plain-model");
        assert_eq!(config.model_name(), "plain-model");
    }

    #[test]
    fn connect_url_escapes_query() {
        let config = NodeConfig {
            server: "ws://127.0.0.1:8120/".to_string(),
            name: "my node".to_string(),
            token: SecretString::from("a&b=c"),
            max_concurrency: 3,
            model_path: PathBuf::from("/m/llama.bin"),
            ..NodeConfig::default()
        };
        let url = config.connect_url().unwrap();
        assert_eq!(url.path(), "/ws");

        let pairs: HashMap<String, String> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs["name"], "my node");
        assert_eq!(pairs["model"], "llama");
        assert_eq!(pairs["token"], "a&b=c");
        assert_eq!(pairs["max_concurrency"], "3");
        assert!(!url.as_str().contains("a&b=c"));
    }

    #[test]
    fn connect_url_rejects_bad_server() {
        let config = NodeConfig {
            server: "not a url".to_string(),
            ..NodeConfig::default()
        };
        assert!(matches!(
            config.connect_url(),
            Err(ConfigError::InvalidUrl { .. })
        ));
    }
}
