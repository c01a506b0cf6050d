use async_trait::async_trait;
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{env, fs, path::PathBuf, str::FromStr, time::Duration};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bridge::BridgeOptions;
use crate::engine::{LayoutOptions, OutputFormat};
use crate::message::Protocol;

pub const ENGINE_URL: &str = "LAYOUT_ENGINE_URL";
pub const PROTOCOL: &str = "LAYOUT_PROTOCOL";
pub const TIMEOUT_MS: &str = "LAYOUT_TIMEOUT_MS";
pub const ENGINE: &str = "LAYOUT_ENGINE";
pub const FORMAT: &str = "LAYOUT_FORMAT";
pub const FUEL: &str = "LAYOUT_FUEL";
pub const QUEUE_CAPACITY: &str = "LAYOUT_QUEUE_CAPACITY";

/// Every key [`BridgeConfig::from_manager`] reads.
pub const KEYS: [&str; 7] = [ENGINE_URL, PROTOCOL, TIMEOUT_MS, ENGINE, FORMAT, FUEL, QUEUE_CAPACITY];

#[async_trait::async_trait]
#[typetag::serde]
pub trait ConfigManagerType: Send + Sync {
    async fn as_vec(&self) -> Vec<(String, String)> {
        let mut config = vec![];
        for key in self.keys().await {
            if let Some(value) = self.get(&key).await {
                config.push((key, value));
            }
        }
        config
    }
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
    async fn del(&self, key: &str);
    async fn set(&self, key: &str, value: &str) -> Result<(), String>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

#[derive(Serialize, Deserialize)]
pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl ConfigManager {
    pub fn into_inner(self) -> Box<dyn ConfigManagerType> {
        self.0
    }
}

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvConfigManager {
    env_file: PathBuf,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        if env_file.exists() {
            dotenvy::from_path(env_file.clone()).ok();
            info!("Loaded .env from {}", env_file.display());
        } else {
            debug!("no .env at {}", env_file.display())
        }

        Box::new(Self { env_file })
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn keys(&self) -> Vec<String> {
        env::vars().map(|(k, _)| k).collect()
    }
    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        unsafe {
            env::set_var(key, value);
        };
        rewrite_env_file(&self.env_file, key, Some(value)).map_err(|e| e.to_string())
    }

    async fn del(&self, key: &str) {
        unsafe {
            env::remove_var(key);
        };
        if self.env_file.exists() {
            if let Err(e) = rewrite_env_file(&self.env_file, key, None) {
                warn!("could not update {}: {e}", self.env_file.display());
            }
        }
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        "EnvConfigManager".to_string()
    }
}

/// Replaces (or with `None` removes) `key` in a `.env` file, keeping every
/// other line as is.
fn rewrite_env_file(path: &std::path::Path, key: &str, value: Option<&str>) -> std::io::Result<()> {
    let content = fs::read_to_string(path).unwrap_or_default();
    let mut found = false;
    let mut lines: Vec<String> = Vec::new();
    for line in content.lines() {
        match line.split_once('=') {
            Some((k, _)) if k.trim() == key => {
                found = true;
                if let Some(v) = value {
                    lines.push(format!("{key}={v}"));
                }
            }
            _ => lines.push(line.to_string()),
        }
    }
    if let (false, Some(v)) = (found, value) {
        lines.push(format!("{key}={v}"));
    }
    fs::write(path, lines.join("\n"))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct MapConfigManager {
    #[schemars(with = "std::collections::HashMap<String, String>")]
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self::default())
    }

    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Box<Self> {
        let map = pairs
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Box::new(Self { map })
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        self.map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) {
        self.map.remove(key);
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }
    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid value `{value}` for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("unknown setting {0}; expected one of {keys}", keys = KEYS.join(", "))]
    UnknownKey(String),
    #[error("could not store {key}: {reason}")]
    Store { key: &'static str, reason: String },
}

/// Runtime settings of the bridge, read from a [`ConfigManager`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BridgeConfig {
    /// Engine asset URL or path. `None` selects the built-in engine.
    pub engine_url: Option<String>,
    pub protocol: Protocol,
    pub timeout_ms: Option<u64>,
    pub layout: LayoutOptions,
    /// Fuel units per WASM render; unbounded when `None`.
    pub fuel: Option<u64>,
    pub queue_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        let options = BridgeOptions::default();
        Self {
            engine_url: None,
            protocol: options.protocol,
            timeout_ms: options.timeout.map(|t| t.as_millis() as u64),
            layout: options.layout,
            fuel: None,
            queue_capacity: options.queue_capacity,
        }
    }
}

impl BridgeConfig {
    pub async fn from_manager(config: &ConfigManager) -> Result<Self, ConfigError> {
        let mut out = Self::default();
        let mgr = &config.0;

        if let Some(url) = mgr.get(ENGINE_URL).await {
            let url = url.trim();
            out.engine_url = (!url.is_empty()).then(|| url.to_string());
        }
        if let Some(v) = mgr.get(PROTOCOL).await {
            out.protocol = parse(PROTOCOL, &v)?;
        }
        if let Some(v) = mgr.get(TIMEOUT_MS).await {
            let ms: u64 = parse(TIMEOUT_MS, &v)?;
            // 0 disables the bound
            out.timeout_ms = (ms > 0).then_some(ms);
        }
        if let Some(v) = mgr.get(ENGINE).await {
            out.layout.engine = v.trim().to_string();
        }
        if let Some(v) = mgr.get(FORMAT).await {
            out.layout.format = parse::<OutputFormat>(FORMAT, &v)?;
        }
        if let Some(v) = mgr.get(FUEL).await {
            out.fuel = Some(parse(FUEL, &v)?);
        }
        if let Some(v) = mgr.get(QUEUE_CAPACITY).await {
            let capacity: usize = parse(QUEUE_CAPACITY, &v)?;
            if capacity == 0 {
                return Err(ConfigError::Invalid {
                    key: QUEUE_CAPACITY,
                    value: v,
                    reason: "must be at least 1".into(),
                });
            }
            out.queue_capacity = capacity;
        }

        debug!(?out, "bridge configuration");
        Ok(out)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn bridge_options(&self) -> BridgeOptions {
        BridgeOptions {
            protocol: self.protocol,
            layout: self.layout.clone(),
            timeout: self.timeout(),
            queue_capacity: self.queue_capacity,
        }
    }
}

fn known_key(key: &str) -> Result<&'static str, ConfigError> {
    KEYS.iter()
        .find(|k| k.eq_ignore_ascii_case(key.trim()))
        .copied()
        .ok_or_else(|| ConfigError::UnknownKey(key.to_string()))
}

/// The `LAYOUT_*` settings visible through `config`, sorted by key.
pub async fn layout_settings(config: &ConfigManager) -> Vec<(String, String)> {
    let mut settings: Vec<(String, String)> = config
        .0
        .as_vec()
        .await
        .into_iter()
        .filter(|(k, _)| KEYS.contains(&k.as_str()))
        .collect();
    settings.sort();
    settings
}

pub async fn get_setting(config: &ConfigManager, key: &str) -> Result<Option<String>, ConfigError> {
    let key = known_key(key)?;
    Ok(config.0.get(key).await)
}

/// Stores `key=value` if the configuration it produces is valid, and returns
/// that configuration. Nothing is stored on error.
pub async fn set_setting(config: &ConfigManager, key: &str, value: &str) -> Result<BridgeConfig, ConfigError> {
    let key = known_key(key)?;
    let mut pairs = layout_settings(config).await;
    pairs.retain(|(k, _)| k != key);
    pairs.push((key.to_string(), value.to_string()));
    let candidate = ConfigManager(MapConfigManager::from_pairs(
        pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())),
    ));
    let bridge = BridgeConfig::from_manager(&candidate).await?;

    config
        .0
        .set(key, value)
        .await
        .map_err(|reason| ConfigError::Store { key, reason })?;
    info!(key, value, "setting stored");
    Ok(bridge)
}

pub async fn unset_setting(config: &ConfigManager, key: &str) -> Result<(), ConfigError> {
    let key = known_key(key)?;
    config.0.del(key).await;
    info!(key, "setting removed");
    Ok(())
}

fn parse<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manager(pairs: &[(&str, &str)]) -> ConfigManager {
        ConfigManager(MapConfigManager::from_pairs(pairs.iter().copied()))
    }

    #[tokio::test]
    async fn test_map_config_manager_basic() {
        let mgr = MapConfigManager::new();

        mgr.set(ENGINE_URL, "https://cdn.example.com/a.wasm").await.unwrap();
        mgr.set(ENGINE_URL, "https://cdn.example.com/b.wasm").await.unwrap();
        assert_eq!(mgr.get(ENGINE_URL).await.as_deref(), Some("https://cdn.example.com/b.wasm"));
        assert_eq!(mgr.keys().await, vec![ENGINE_URL.to_string()]);

        mgr.set(FUEL, "1000").await.unwrap();
        let mut pairs = mgr.as_vec().await;
        pairs.sort();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[1], (FUEL.to_string(), "1000".to_string()));

        mgr.del(ENGINE_URL).await;
        assert_eq!(mgr.get(ENGINE_URL).await, None);
    }

    #[tokio::test]
    async fn test_defaults_select_native_engine() {
        let config = BridgeConfig::from_manager(&manager(&[])).await.unwrap();
        assert_eq!(config, BridgeConfig::default());
        assert_eq!(config.engine_url, None);
        assert_eq!(config.protocol, Protocol::Correlated);
        assert_eq!(config.layout, LayoutOptions::default());
    }

    #[tokio::test]
    async fn test_reads_every_key() {
        let config = BridgeConfig::from_manager(&manager(&[
            (ENGINE_URL, " file:///opt/layout.wasm "),
            (PROTOCOL, "single-use"),
            (TIMEOUT_MS, "250"),
            (ENGINE, "dot"),
            (FORMAT, "SVG"),
            (FUEL, "5000000"),
            (QUEUE_CAPACITY, "4"),
        ]))
        .await
        .unwrap();

        assert_eq!(config.engine_url.as_deref(), Some("file:///opt/layout.wasm"));
        assert_eq!(config.protocol, Protocol::SingleUse);
        assert_eq!(config.timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.fuel, Some(5_000_000));

        let options = config.bridge_options();
        assert_eq!(options.queue_capacity, 4);
        assert_eq!(options.protocol, Protocol::SingleUse);
    }

    #[tokio::test]
    async fn test_zero_timeout_disables_bound_and_blank_url_is_native() {
        let config = BridgeConfig::from_manager(&manager(&[(TIMEOUT_MS, "0"), (ENGINE_URL, "  ")]))
            .await
            .unwrap();
        assert_eq!(config.timeout(), None);
        assert_eq!(config.engine_url, None);
    }

    #[tokio::test]
    async fn test_invalid_values_are_rejected() {
        let err = BridgeConfig::from_manager(&manager(&[(PROTOCOL, "carrier-pigeon")]))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: PROTOCOL, .. }));

        let err = BridgeConfig::from_manager(&manager(&[(TIMEOUT_MS, "soon")]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains(TIMEOUT_MS));

        let err = BridgeConfig::from_manager(&manager(&[(QUEUE_CAPACITY, "0")]))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: QUEUE_CAPACITY, .. }));
    }

    #[tokio::test]
    async fn test_settings_are_validated_before_storing() {
        let mgr = ConfigManager(MapConfigManager::from_pairs([(FUEL, "10"), ("UNRELATED", "x")]));

        let bridge = set_setting(&mgr, "layout_timeout_ms", "1500").await.unwrap();
        assert_eq!(bridge.timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(bridge.fuel, Some(10));
        assert_eq!(get_setting(&mgr, TIMEOUT_MS).await.unwrap().as_deref(), Some("1500"));

        let err = set_setting(&mgr, QUEUE_CAPACITY, "0").await.unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: QUEUE_CAPACITY, .. }));
        assert_eq!(get_setting(&mgr, QUEUE_CAPACITY).await.unwrap(), None);

        let err = set_setting(&mgr, "LAYOUT_COLOUR", "blue").await.unwrap_err();
        assert_eq!(err, ConfigError::UnknownKey("LAYOUT_COLOUR".into()));

        assert_eq!(
            layout_settings(&mgr).await,
            vec![
                (FUEL.to_string(), "10".to_string()),
                (TIMEOUT_MS.to_string(), "1500".to_string()),
            ]
        );

        unset_setting(&mgr, FUEL).await.unwrap();
        assert_eq!(get_setting(&mgr, FUEL).await.unwrap(), None);
        assert!(unset_setting(&mgr, "HOME").await.is_err());
    }

    #[tokio::test]
    async fn test_env_config_manager_reads_env_file() {
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        std::fs::write(&env_path, "DIAGRAM_TEST_FUEL=42\n# comment\n").unwrap();

        let mgr = EnvConfigManager::new(env_path.clone());
        assert_eq!(mgr.get("DIAGRAM_TEST_FUEL").await.as_deref(), Some("42"));

        mgr.set("DIAGRAM_TEST_QUEUE", "8").await.unwrap();
        let content = std::fs::read_to_string(&env_path).unwrap();
        assert!(content.contains("DIAGRAM_TEST_QUEUE=8"));
        assert!(content.contains("# comment"));

        mgr.del("DIAGRAM_TEST_FUEL").await;
        assert_eq!(std::env::var("DIAGRAM_TEST_FUEL").ok(), None);
        let content = std::fs::read_to_string(&env_path).unwrap();
        assert!(!content.contains("DIAGRAM_TEST_FUEL"));

        mgr.del("DIAGRAM_TEST_QUEUE").await;
    }

    #[test]
    fn test_config_manager_serializes_with_tag() {
        let mgr = manager(&[(ENGINE, "dot")]);
        let json = serde_json::to_value(&mgr).unwrap();
        assert!(json.get("MapConfigManager").is_some());
        let back: ConfigManager = serde_json::from_value(json).unwrap();
        assert_eq!(format!("{:?}", back), "MapConfigManager(1 entries)");
    }
}
