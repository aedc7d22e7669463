use std::{
    fs,
    path::{Path, PathBuf},
};

use clap::ValueEnum;
use cohortnet_engine::EngineConfig;
use cohortnet_telemetry::TelemetryConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum ConfigFormat {
    Auto,
    Toml,
    Yaml,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {format:?} config: {details}")]
    Parse {
        format: ConfigFormat,
        details: String,
    },
    #[error("configuration invalid: {0}")]
    Validation(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default = "default_telemetry")]
    pub telemetry: TelemetryConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NodeSection {
    /// Directory holding `cohort_snapshots.json` and `pending_vectors.json`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Hex-encoded 32 byte seed. Leave unset outside demos and tests.
    #[serde(default)]
    pub seed: Option<String>,
    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data/cohortnet")
}

fn default_telemetry() -> TelemetryConfig {
    TelemetryConfig::sample("cohortnet-node")
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            seed: None,
            log_format: LogFormat::default(),
        }
    }
}

impl NodeSection {
    pub fn seed_bytes(&self) -> Result<Option<[u8; 32]>, ConfigError> {
        let Some(seed) = &self.seed else {
            return Ok(None);
        };
        let mut out = [0u8; 32];
        hex::decode_to_slice(seed, &mut out).map_err(|err| {
            ConfigError::Validation(format!("node seed must be 64 hex characters: {err}"))
        })?;
        Ok(Some(out))
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::Validation("data dir must not be empty".into()));
        }
        self.node.seed_bytes()?;
        self.engine
            .validate()
            .map_err(|err| ConfigError::Validation(err.to_string()))?;
        if self.telemetry.component.is_empty() {
            return Err(ConfigError::Validation(
                "telemetry component must not be empty".into(),
            ));
        }
        Ok(())
    }

    pub fn sample() -> Self {
        Self {
            node: NodeSection::default(),
            engine: EngineConfig::default(),
            telemetry: default_telemetry(),
        }
    }
}

pub fn load_config(path: &Path, format: ConfigFormat) -> Result<Config, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config = parse_config(&contents, resolve_format(path, format))?;
    config.validate()?;
    Ok(config)
}

/// `format` must already be resolved; `Auto` is treated as TOML.
pub fn parse_config(contents: &str, format: ConfigFormat) -> Result<Config, ConfigError> {
    match format {
        ConfigFormat::Yaml => serde_yaml::from_str(contents).map_err(|err| ConfigError::Parse {
            format,
            details: err.to_string(),
        }),
        ConfigFormat::Toml | ConfigFormat::Auto => {
            toml::from_str(contents).map_err(|err| ConfigError::Parse {
                format: ConfigFormat::Toml,
                details: err.to_string(),
            })
        }
    }
}

fn resolve_format(path: &Path, format: ConfigFormat) -> ConfigFormat {
    match format {
        ConfigFormat::Auto => match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => ConfigFormat::Yaml,
            _ => ConfigFormat::Toml,
        },
        _ => format,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_config_is_valid() {
        Config::sample().validate().unwrap();
    }

    #[test]
    fn auto_format_follows_extension() {
        assert_eq!(
            resolve_format(Path::new("node.yml"), ConfigFormat::Auto),
            ConfigFormat::Yaml
        );
        assert_eq!(
            resolve_format(Path::new("node.conf"), ConfigFormat::Auto),
            ConfigFormat::Toml
        );
        assert_eq!(
            resolve_format(Path::new("node.toml"), ConfigFormat::Yaml),
            ConfigFormat::Yaml
        );
    }

    #[test]
    fn seed_must_be_32_bytes() {
        let mut config = Config::sample();
        config.node.seed = Some("abcd".into());
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
        config.node.seed = Some("11".repeat(32));
        assert_eq!(config.node.seed_bytes().unwrap(), Some([0x11; 32]));
    }
}
