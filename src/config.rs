use crate::pipeline::definition::PipelineDefinition;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub pipelines: Vec<PipelineConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Items processed concurrently by one item executor
    pub item_concurrency: usize,
    /// Capacity of the channels connecting consecutive stages
    pub channel_capacity: usize,
    /// Capacity of the shared error sink, independent of the main stream
    pub error_buffer: usize,
    /// Window used by batch stages that declare none of their own
    pub batch: WindowConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            item_concurrency: 16,
            channel_capacity: 256,
            error_buffer: 1024,
            batch: WindowConfig::default(),
        }
    }
}

/// Batch window bounds; a window fires on whichever limit is hit first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowConfig {
    pub max_size: usize,
    /// Measured from the arrival of the first item in the window
    #[serde(with = "humantime_serde")]
    pub max_time: Duration,
}

impl WindowConfig {
    pub fn new(max_size: usize, max_time: Duration) -> Self {
        Self { max_size, max_time }
    }

    pub fn validate(&self, context: &str) -> crate::Result<()> {
        if self.max_size == 0 {
            return Err(crate::error::PipeError::InvalidConfig(format!(
                "{}.max_size must be greater than 0",
                context
            )));
        }
        if self.max_time.is_zero() {
            return Err(crate::error::PipeError::InvalidConfig(format!(
                "{}.max_time must be greater than 0",
                context
            )));
        }
        Ok(())
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            max_time: Duration::from_millis(500),
        }
    }
}

/// A window override where either bound may be left to the next level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_size: Option<usize>,
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub max_time: Option<Duration>,
}

impl WindowOverride {
    pub fn is_empty(&self) -> bool {
        self.max_size.is_none() && self.max_time.is_none()
    }

    pub fn apply_to(&self, base: WindowConfig) -> WindowConfig {
        WindowConfig {
            max_size: self.max_size.unwrap_or(base.max_size),
            max_time: self.max_time.unwrap_or(base.max_time),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Console,
    Json,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
}

/// A named pipeline definition, e.g. `validate+enrich|match(size=50)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub name: String,
    pub definition: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Per-stage window overrides keyed by stage name
    #[serde(default)]
    pub windows: BTreeMap<String, WindowOverride>,
}

fn default_enabled() -> bool {
    true
}

impl PipelineConfig {
    pub fn new(name: impl Into<String>, definition: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            definition: definition.into(),
            enabled: true,
            windows: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| crate::error::PipeError::Config(e.to_string()))?;
        Ok(config)
    }

    pub fn pipeline(&self, name: &str) -> crate::Result<&PipelineConfig> {
        self.pipelines
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| crate::error::PipeError::PipelineNotFound(name.to_string()))
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.engine.item_concurrency == 0 {
            return Err(crate::error::PipeError::InvalidConfig(
                "engine.item_concurrency must be greater than 0".to_string(),
            ));
        }

        if self.engine.channel_capacity == 0 {
            return Err(crate::error::PipeError::InvalidConfig(
                "engine.channel_capacity must be greater than 0".to_string(),
            ));
        }

        if self.engine.error_buffer == 0 {
            return Err(crate::error::PipeError::InvalidConfig(
                "engine.error_buffer must be greater than 0".to_string(),
            ));
        }

        self.engine.batch.validate("engine.batch")?;

        let mut names = HashSet::new();
        for pipeline in &self.pipelines {
            if pipeline.name.is_empty() {
                return Err(crate::error::PipeError::InvalidConfig(
                    "pipelines.name cannot be empty".to_string(),
                ));
            }
            if !names.insert(pipeline.name.as_str()) {
                return Err(crate::error::PipeError::InvalidConfig(format!(
                    "duplicate pipeline name: {}",
                    pipeline.name
                )));
            }

            // Grammar errors surface here rather than at deploy time
            pipeline.definition.parse::<PipelineDefinition>()?;

            for (stage, window) in &pipeline.windows {
                let context = format!("pipelines.{}.windows.{}", pipeline.name, stage);
                if window.max_size == Some(0) {
                    return Err(crate::error::PipeError::InvalidConfig(format!(
                        "{}.max_size must be greater than 0",
                        context
                    )));
                }
                if window.max_time.is_some_and(|t| t.is_zero()) {
                    return Err(crate::error::PipeError::InvalidConfig(format!(
                        "{}.max_time must be greater than 0",
                        context
                    )));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.engine.item_concurrency, 16);
        assert_eq!(config.engine.batch.max_time, Duration::from_millis(500));
    }

    #[test]
    fn test_config_validation_zero_values() {
        let mut config = Config::default();
        config.engine.error_buffer = 0;
        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("error_buffer must be greater than 0"));

        let mut config = Config::default();
        config.engine.batch.max_size = 0;
        assert!(config.validate().unwrap_err().to_string().contains("engine.batch.max_size"));
    }

    #[test]
    fn test_config_validation_pipelines() {
        let mut config = Config::default();
        config.pipelines = vec![
            PipelineConfig::new("orders", "validate|match"),
            PipelineConfig::new("orders", "noop"),
        ];
        assert!(config.validate().unwrap_err().to_string().contains("duplicate pipeline name"));

        config.pipelines = vec![PipelineConfig::new("orders", "validate||match")];
        assert!(matches!(
            config.validate(),
            Err(crate::error::PipeError::InvalidDefinition(_))
        ));
    }

    #[test]
    fn test_toml_parsing_with_windows() {
        let config = Config::from_toml(
            r#"
            [engine]
            item_concurrency = 4

            [engine.batch]
            max_size = 10
            max_time = "250ms"

            [logging]
            level = "debug"
            format = "json"

            [[pipelines]]
            name = "customers"
            definition = "validate+enrich|match"

            [pipelines.windows.match]
            max_time = "2s"
            "#,
        )
        .unwrap();

        assert!(config.validate().is_ok());
        assert_eq!(config.engine.item_concurrency, 4);
        assert_eq!(config.engine.channel_capacity, 256);
        assert_eq!(config.engine.batch, WindowConfig::new(10, Duration::from_millis(250)));
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(config.logging.format, LogFormat::Json);

        let pipeline = config.pipeline("customers").unwrap();
        assert!(pipeline.enabled);
        let window = pipeline.windows["match"].apply_to(config.engine.batch);
        assert_eq!(window, WindowConfig::new(10, Duration::from_secs(2)));

        assert!(config.pipeline("missing").is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[[pipelines]]\nname = \"p\"\ndefinition = \"noop\"").unwrap();

        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.pipelines.len(), 1);

        assert!(Config::from_file("/nonexistent/rustpipe.toml").is_err());
    }

    #[test]
    fn test_toml_serialization_roundtrip() {
        let mut config = Config::default();
        let mut pipeline = PipelineConfig::new("p", "a|b");
        pipeline.windows.insert(
            "b".to_string(),
            WindowOverride {
                max_size: Some(5),
                max_time: None,
            },
        );
        config.pipelines.push(pipeline);

        let toml_string = toml::to_string(&config).unwrap();
        let deserialized: Config = toml::from_str(&toml_string).unwrap();
        assert!(deserialized.validate().is_ok());
        assert_eq!(deserialized.pipelines[0].windows["b"].max_size, Some(5));
    }
}
