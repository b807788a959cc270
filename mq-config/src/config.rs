use std::error::Error;
use std::path::{Path, PathBuf};
use std::{env, fmt, fs, io};

use mq_log::{LogConfig, LogLevel};
use mq_query::QueryConfig;
use serde::{Deserialize, Serialize};

/// Name of the configuration file within the configuration directory.
const CONFIG_FILE: &str = "config.yml";

/// Environment variable overriding the log level.
const ENV_LOG_LEVEL: &str = "MQ_LOG_LEVEL";

/// Environment variable overriding [`QueryConfig::max_points`].
const ENV_MAX_POINTS: &str = "MQ_QUERY_MAX_POINTS";

/// Indicates config related errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigErrorKind {
    /// Failed to open the file.
    #[error("could not open config file")]
    CouldNotOpenFile,
    /// Parsing YAML failed.
    #[error("could not parse yaml config file")]
    BadYaml,
    /// Invalid config value.
    #[error("invalid config value")]
    InvalidValue,
}

/// Defines the origin of a [`ConfigError`].
#[derive(Debug, Default)]
enum ConfigErrorSource {
    /// An error occurring independently.
    #[default]
    None,
    /// An error originating from a configuration file.
    File(PathBuf),
    /// An error originating in a field override, such as an environment variable.
    FieldOverride(String),
}

impl fmt::Display for ConfigErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigErrorSource::None => Ok(()),
            ConfigErrorSource::File(file_name) => {
                write!(f, " (file {})", file_name.display())
            }
            ConfigErrorSource::FieldOverride(name) => write!(f, " (field {name})"),
        }
    }
}

/// Indicates config related errors.
#[derive(Debug)]
pub struct ConfigError {
    source: ConfigErrorSource,
    kind: ConfigErrorKind,
    cause: Option<Box<dyn Error + Send + Sync + 'static>>,
}

impl ConfigError {
    #[inline]
    fn new(kind: ConfigErrorKind) -> Self {
        Self {
            source: ConfigErrorSource::None,
            kind,
            cause: None,
        }
    }

    #[inline]
    fn wrap<E>(cause: E, kind: ConfigErrorKind) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self {
            cause: Some(Box::new(cause)),
            ..Self::new(kind)
        }
    }

    #[inline]
    fn for_field<E>(cause: E, name: &str) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self::wrap(cause, ConfigErrorKind::InvalidValue).field(name)
    }

    #[inline]
    fn file(mut self, path: impl AsRef<Path>) -> Self {
        self.source = ConfigErrorSource::File(path.as_ref().to_path_buf());
        self
    }

    #[inline]
    fn field(mut self, name: &str) -> Self {
        self.source = ConfigErrorSource::FieldOverride(name.to_owned());
        self
    }

    /// Returns the error kind of the error.
    pub fn kind(&self) -> &ConfigErrorKind {
        &self.kind
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind, self.source)
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause.as_deref().map(|e| e as &(dyn Error + 'static))
    }
}

/// Values that can be overridden from outside of the config file.
///
/// All values are raw strings as passed through the environment and are validated in
/// [`Config::apply_override`].
#[derive(Clone, Debug, Default)]
pub struct OverridableConfig {
    /// The log level of all crates of the query planner.
    pub log_level: Option<String>,
    /// The maximum number of data points of a series query.
    pub max_points: Option<String>,
}

impl OverridableConfig {
    /// Reads overrides from the `MQ_LOG_LEVEL` and `MQ_QUERY_MAX_POINTS` environment variables.
    pub fn from_env() -> Self {
        Self {
            log_level: env::var(ENV_LOG_LEVEL).ok(),
            max_points: env::var(ENV_MAX_POINTS).ok(),
        }
    }
}

/// The configuration of the metrics query planner.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Configuration of the logging system.
    pub logging: LogConfig,
    /// Limits of the query builder.
    pub query: QueryConfig,
}

impl Config {
    /// Loads the config from `config.yml` in the given directory.
    ///
    /// Relative paths are resolved against the current working directory.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let base = env::current_dir()
            .map(|dir| dir.join(path.as_ref()))
            .unwrap_or_else(|_| path.as_ref().to_path_buf());
        let path = base.join(CONFIG_FILE);

        let file = fs::File::open(&path)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotOpenFile).file(&path))?;

        let config = serde_yaml::from_reader(io::BufReader::new(file))
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadYaml).file(&path))?;

        mq_log::debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Parses the config from a YAML string.
    ///
    /// This is mostly useful for tests.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadYaml))
    }

    /// Overrides configuration with values from other sources.
    pub fn apply_override(
        &mut self,
        overrides: OverridableConfig,
    ) -> Result<&mut Self, ConfigError> {
        if let Some(level) = overrides.log_level {
            self.logging.level = level
                .parse::<LogLevel>()
                .map_err(|e| ConfigError::for_field(e, "logging.level"))?;
        }

        if let Some(max_points) = overrides.max_points {
            let max_points = max_points
                .trim()
                .parse::<u64>()
                .map_err(|e| ConfigError::for_field(e, "query.max_points"))?;

            if max_points == 0 {
                return Err(
                    ConfigError::new(ConfigErrorKind::InvalidValue).field("query.max_points")
                );
            }

            self.query.max_points = max_points;
        }

        Ok(self)
    }

    /// Overrides configuration with values from the environment.
    ///
    /// See [`OverridableConfig::from_env`] for the supported variables.
    pub fn apply_env(&mut self) -> Result<&mut Self, ConfigError> {
        self.apply_override(OverridableConfig::from_env())
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use mq_log::LogFormat;
    use similar_asserts::assert_eq;

    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = env::temp_dir().join(format!("mq-config-{name}-{nanos}"));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_yaml_str("{}").unwrap();
        assert_eq!(config.query, QueryConfig::default());
        assert_eq!(config.logging.level.to_string(), "info");
        assert_eq!(config.logging.format, LogFormat::Auto);
    }

    #[test]
    fn test_from_yaml_str() {
        let yaml = r#"
logging:
  level: debug
  format: json
query:
  default_limit: 100
  allow_cross_entity_having: true
"#;
        let config = Config::from_yaml_str(yaml).unwrap();

        assert_eq!(config.logging.level.to_string(), "debug");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(
            config.query,
            QueryConfig {
                default_limit: 100,
                allow_cross_entity_having: true,
                ..Default::default()
            }
        );
    }

    #[test]
    fn test_bad_yaml() {
        let error = Config::from_yaml_str("query: [1, 2").unwrap_err();
        assert!(matches!(error.kind(), ConfigErrorKind::BadYaml));
        assert!(error.source().is_some());
        insta::assert_snapshot!(error, @"could not parse yaml config file");
    }

    #[test]
    fn test_invalid_log_level() {
        let error = Config::from_yaml_str("logging:\n  level: verbose\n").unwrap_err();
        assert!(matches!(error.kind(), ConfigErrorKind::BadYaml));
    }

    #[test]
    fn test_from_path() {
        mq_test::setup();

        let dir = temp_dir("load");
        fs::write(dir.join(CONFIG_FILE), "query:\n  max_points: 200\n").unwrap();

        let config = Config::from_path(&dir).unwrap();
        assert_eq!(config.query.max_points, 200);

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_from_path_missing_file() {
        let dir = temp_dir("missing");

        let error = Config::from_path(&dir).unwrap_err();
        assert!(matches!(error.kind(), ConfigErrorKind::CouldNotOpenFile));
        assert!(error.to_string().starts_with("could not open config file (file "));
        assert!(error.to_string().ends_with("config.yml)"));

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_apply_override() {
        let mut config = Config::default();
        config
            .apply_override(OverridableConfig {
                log_level: Some("TRACE".to_owned()),
                max_points: Some(" 500 ".to_owned()),
            })
            .unwrap();

        assert_eq!(config.logging.level.to_string(), "trace");
        assert_eq!(config.query.max_points, 500);
        assert_eq!(config.query.max_limit, 10_000);
    }

    #[test]
    fn test_apply_override_invalid() {
        let mut config = Config::default();

        let error = config
            .apply_override(OverridableConfig {
                max_points: Some("many".to_owned()),
                ..Default::default()
            })
            .unwrap_err();
        insta::assert_snapshot!(error, @"invalid config value (field query.max_points)");

        let error = config
            .apply_override(OverridableConfig {
                max_points: Some("0".to_owned()),
                ..Default::default()
            })
            .unwrap_err();
        assert!(error.source().is_none());

        let error = config
            .apply_override(OverridableConfig {
                log_level: Some("loud".to_owned()),
                ..Default::default()
            })
            .unwrap_err();
        insta::assert_snapshot!(error, @"invalid config value (field logging.level)");

        assert_eq!(config.query.max_points, 10_000);
    }
}
