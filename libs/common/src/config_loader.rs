//! Layered configuration loading
//!
//! Priority (lowest to highest): serialized defaults, configuration file,
//! prefixed environment variables. Nested keys in the environment use `__`,
//! e.g. `BRIDGESRV_BUS__PORT=1884`.

use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Json, Serialized, Toml, Yaml},
    Figment,
};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ConfigLoadError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Unsupported config format: {0}")]
    UnsupportedFormat(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),
}

/// Build the figment for `T` without extracting it
pub fn figment_for<T: Serialize + Default>(
    path: Option<&Path>,
    env_prefix: &str,
) -> Result<Figment, ConfigLoadError> {
    let mut figment = Figment::from(Serialized::defaults(T::default()));

    if let Some(path) = path {
        if !path.exists() {
            return Err(ConfigLoadError::NotFound(path.to_path_buf()));
        }
        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .map(str::to_lowercase)
            .ok_or_else(|| ConfigLoadError::UnsupportedFormat(path.display().to_string()))?;

        figment = match extension.as_str() {
            "json" => figment.merge(Json::file(path)),
            "toml" => figment.merge(Toml::file(path)),
            "yaml" | "yml" => figment.merge(Yaml::file(path)),
            other => return Err(ConfigLoadError::UnsupportedFormat(other.to_string())),
        };
        info!("Loading configuration from {}", path.display());
    } else {
        debug!("No configuration file given, using defaults");
    }

    Ok(figment.merge(Env::prefixed(env_prefix).split("__")))
}

/// Load `T` from defaults, an optional file and the environment
pub fn load_layered<T>(path: Option<&Path>, env_prefix: &str) -> Result<T, ConfigLoadError>
where
    T: Serialize + DeserializeOwned + Default,
{
    figment_for::<T>(path, env_prefix)?
        .extract()
        .map_err(|e| ConfigLoadError::Parse(e.to_string()))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::io::Write;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    #[serde(default)]
    struct Sample {
        name: String,
        port: u16,
    }

    impl Default for Sample {
        fn default() -> Self {
            Self {
                name: "default".into(),
                port: 1883,
            }
        }
    }

    #[test]
    fn test_defaults_without_file() {
        let sample: Sample = load_layered(None, "CFGLOADER_TEST_NONE_").unwrap();
        assert_eq!(sample, Sample::default());
    }

    #[test]
    fn test_yaml_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "port: 2883").unwrap();
        let sample: Sample = load_layered(Some(file.path()), "CFGLOADER_TEST_YAML_").unwrap();
        assert_eq!(sample.port, 2883);
        assert_eq!(sample.name, "default");
    }

    #[test]
    fn test_unsupported_extension() {
        let file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
        let err = load_layered::<Sample>(Some(file.path()), "CFGLOADER_TEST_INI_").unwrap_err();
        assert!(matches!(err, ConfigLoadError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = load_layered::<Sample>(
            Some(Path::new("/nonexistent/gridlink.yaml")),
            "CFGLOADER_TEST_MISSING_",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigLoadError::NotFound(_)));
    }
}
