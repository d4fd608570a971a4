/*
 * Settings
 *
 * Optional TOML file read before any download starts. Every field has a
 * default, so an empty file (or no file at all) is a valid configuration.
 *
 *   [download]
 *   user_agent = "gpt-lab/0.3"
 *   connect_timeout_secs = 30
 *   progress_log_interval_ms = 500
 *
 *   [attention]
 *   max_exponent = 4.0
 */
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::attention::{DEFAULT_MAX_EXPONENT, MIN_EXPONENT};

/// Environment variable naming the settings file.
pub const CONFIG_ENV: &str = "GPT_LAB_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("無法讀取設定檔 {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("設定檔格式錯誤: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("attention.max_exponent must be >= 1.5, got {0}")]
    MaxExponent(f32),
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub download: DownloadConfig,
    pub attention: AttentionConfig,
}

/// Transport settings shared by every downloader created from them.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct DownloadConfig {
    pub user_agent: String,
    /// No timeout unless set; a stalled transfer otherwise waits for
    /// cancellation or a transport failure.
    pub connect_timeout_secs: Option<u64>,
    /// Minimum gap between progress log lines. Progress events are not
    /// throttled.
    pub progress_log_interval_ms: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).to_string(),
            connect_timeout_secs: None,
            progress_log_interval_ms: 100,
        }
    }
}

impl DownloadConfig {
    /// Build the HTTP client these settings describe.
    pub fn client(&self) -> reqwest::Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder().user_agent(self.user_agent.clone());
        if let Some(secs) = self.connect_timeout_secs {
            builder = builder.connect_timeout(std::time::Duration::from_secs(secs));
        }
        builder.build()
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct AttentionConfig {
    /// Upper bound of the adaptive exaggeration exponent.
    pub max_exponent: f32,
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self {
            max_exponent: DEFAULT_MAX_EXPONENT,
        }
    }
}

impl Settings {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let settings: Settings = toml::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Load the file named by `GPT_LAB_CONFIG`, or fall back to defaults
    /// when the variable is unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => {
                let path = PathBuf::from(path);
                tracing::info!("Loading settings from {:?}", path);
                Self::load(&path)
            }
            None => Ok(Self::default()),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let max = self.attention.max_exponent;
        if !(max >= MIN_EXPONENT) {
            return Err(ConfigError::MaxExponent(max));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_file_uses_defaults() {
        let settings = Settings::from_toml_str("").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.download.connect_timeout_secs, None);
        assert_eq!(settings.attention.max_exponent, DEFAULT_MAX_EXPONENT);
    }

    #[test]
    fn test_partial_sections() {
        let settings = Settings::from_toml_str(
            r#"
            [download]
            connect_timeout_secs = 15

            [attention]
            max_exponent = 6.0
            "#,
        )
        .unwrap();

        assert_eq!(settings.download.connect_timeout_secs, Some(15));
        assert_eq!(settings.download.progress_log_interval_ms, 100);
        assert!(settings.download.user_agent.starts_with("gpt-lab/"));
        assert_eq!(settings.attention.max_exponent, 6.0);
    }

    #[test]
    fn test_rejects_small_exponent() {
        let err = Settings::from_toml_str("[attention]\nmax_exponent = 1.0\n").unwrap_err();
        assert!(matches!(err, ConfigError::MaxExponent(v) if v == 1.0));
    }

    #[test]
    fn test_rejects_bad_toml() {
        let err = Settings::from_toml_str("[download\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[download]\nuser_agent = \"lab-test\"").unwrap();

        let settings = Settings::load(file.path()).unwrap();
        assert_eq!(settings.download.user_agent, "lab-test");

        let missing = Settings::load(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Read { .. }));
    }
}
