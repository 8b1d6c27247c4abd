use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::orchestrator::OrchestratorOptions;

pub const CONFIG_ENV: &str = "SANDBOX_BRIDGE_CONFIG";
const CONFIG_FILE: &str = "bridge.yaml";
const DEFAULT_SANDBOX_BASE_URL: &str = "https://web-sandbox.oaiusercontent.com/";

const DEFAULT_APP_ORIGINS: &[(&str, &str)] = &[
    ("chatgpt", "https://chatgpt.com"),
    ("feather", "https://feather.openai.com"),
    ("skybridge", "https://skybridge.openai.com"),
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read bridge config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse sandbox base URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DownloadCacheConfig {
    pub max_entries: usize,
    pub ttl_secs: u64,
}

impl Default for DownloadCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 100,
            ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub sandbox_base_url: String,
    pub locale: String,
    /// App name to the origin its sandbox announces itself to.
    pub app_origins: BTreeMap<String, String>,
    pub rpc_timeout_ms: Option<u64>,
    pub handshake_timeout_ms: Option<u64>,
    pub download_cache: DownloadCacheConfig,
    pub extra_third_party_domains: Vec<String>,
}

pub fn default_app_origins() -> BTreeMap<String, String> {
    DEFAULT_APP_ORIGINS
        .iter()
        .map(|(app, origin)| (app.to_string(), origin.to_string()))
        .collect()
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            sandbox_base_url: DEFAULT_SANDBOX_BASE_URL.to_string(),
            locale: "en-US".to_string(),
            app_origins: default_app_origins(),
            rpc_timeout_ms: None,
            handshake_timeout_ms: None,
            download_cache: DownloadCacheConfig::default(),
            extra_third_party_domains: Vec::new(),
        }
    }
}

impl BridgeConfig {
    /// Load from `config_path`, falling back to defaults when it is absent.
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        match config_path {
            Some(path) if path.exists() => {
                let contents = fs::read_to_string(path)?;
                let mut config: BridgeConfig = serde_yaml::from_str(&contents)?;
                // a partial table still knows the built-in apps
                for (app, origin) in default_app_origins() {
                    config.app_origins.entry(app).or_insert(origin);
                }
                config.sandbox_base_url()?;
                Ok(config)
            }
            _ => Ok(Self::default()),
        }
    }

    /// `$SANDBOX_BRIDGE_CONFIG`, else `bridge.yaml` in the platform config dir.
    pub fn load_default() -> Result<Self, ConfigError> {
        Self::load(default_config_path())
    }

    pub fn sandbox_base_url(&self) -> Result<Url, ConfigError> {
        Ok(Url::parse(&self.sandbox_base_url)?)
    }

    pub fn rpc_timeout(&self) -> Option<Duration> {
        self.rpc_timeout_ms.map(Duration::from_millis)
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_ms.map(Duration::from_millis)
    }

    pub fn orchestrator_options(&self) -> OrchestratorOptions {
        OrchestratorOptions {
            download_cache_entries: self.download_cache.max_entries,
            download_cache_ttl: Duration::from_secs(self.download_cache.ttl_secs),
            extra_third_party_domains: self.extra_third_party_domains.clone(),
        }
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        return Some(PathBuf::from(path));
    }
    ProjectDirs::from("com", "SandboxBridge", "sandbox-bridge")
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn loads_default() {
        let config = BridgeConfig::load(None).unwrap();
        assert_eq!(config.download_cache, DownloadCacheConfig::default());
        assert_eq!(config.rpc_timeout(), None);
        assert!(config.app_origins.contains_key("skybridge"));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = BridgeConfig::load(Some(dir.path().join("absent.yaml"))).unwrap();
        assert_eq!(config, BridgeConfig::default());
    }

    #[test]
    fn loads_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "sandbox_base_url: https://sandbox.example/frame\n\
             rpc_timeout_ms: 2500\n\
             app_origins:\n  studio: https://studio.example\n\
             download_cache:\n  ttl_secs: 60\n\
             extra_third_party_domains:\n  - cdn.example.com"
        )
        .unwrap();
        let config = BridgeConfig::load(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.sandbox_base_url().unwrap().as_str(), "https://sandbox.example/frame");
        assert_eq!(config.rpc_timeout(), Some(Duration::from_millis(2500)));
        assert_eq!(config.handshake_timeout(), None);
        assert_eq!(config.app_origins["studio"], "https://studio.example");
        assert_eq!(config.app_origins["chatgpt"], "https://chatgpt.com");

        let options = config.orchestrator_options();
        assert_eq!(options.download_cache_entries, 100);
        assert_eq!(options.download_cache_ttl, Duration::from_secs(60));
        assert_eq!(options.extra_third_party_domains, vec!["cdn.example.com".to_string()]);
    }

    #[test]
    fn rejects_invalid_yaml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "sandbox_base_url: [not, a, url]").unwrap();
        assert!(matches!(
            BridgeConfig::load(Some(file.path().to_path_buf())),
            Err(ConfigError::Yaml(_))
        ));
    }

    #[test]
    fn rejects_invalid_base_url() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "sandbox_base_url: not a url").unwrap();
        assert!(matches!(
            BridgeConfig::load(Some(file.path().to_path_buf())),
            Err(ConfigError::InvalidUrl(_))
        ));
    }
}
