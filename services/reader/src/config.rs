use aws_config::meta::region::RegionProviderChain;
use aws_config::BehaviorVersion;
use aws_types::region::Region;
use serde::Deserialize;
use thiserror::Error;

/// Region used when neither the configuration nor the environment names one
pub const DEFAULT_REGION_NAME: &str = "us-east-1";

/// Errors that can occur while loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Main configuration for the flow log reader
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// AWS client configuration
    #[serde(default)]
    pub aws: AwsConfig,
    /// Reader defaults
    #[serde(default)]
    pub reader: ReaderConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// AWS client configuration shared by the S3 and CloudWatch Logs clients
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AwsConfig {
    /// AWS region; falls back to the environment, then `us-east-1`
    pub region: Option<String>,
    /// Named profile from the shared AWS config files
    pub profile: Option<String>,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style S3 access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
}

/// Defaults applied to readers built by the command line tool
#[derive(Debug, Clone, Deserialize)]
pub struct ReaderConfig {
    /// `strftime` format for `--start-time` / `--end-time`
    #[serde(default = "default_time_format")]
    pub time_format: String,
    /// Override for the CloudWatch Logs filter pattern
    pub filter_pattern: Option<String>,
}

// Default value functions
fn default_service_name() -> String {
    "flowlogs-reader".to_string()
}

fn default_log_level() -> String {
    "warn".to_string()
}

fn default_time_format() -> String {
    "%Y-%m-%d %H:%M:%S".to_string()
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> Result<Self, ConfigError> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", default_service_name())?
            .set_default("service.log_level", default_log_level())?
            .set_default("reader.time_format", default_time_format())?
            // Add config file if present
            .add_source(config::File::with_name("config/flowlogs").required(false))
            .add_source(config::File::with_name("/etc/flowlogs/reader").required(false))
            // Override with environment variables
            // FLOWLOGS__AWS__REGION -> aws.region
            .add_source(
                config::Environment::with_prefix("FLOWLOGS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.reader.time_format.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "reader.time_format".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        if let Some(ref endpoint) = self.aws.endpoint_url {
            if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                return Err(ConfigError::InvalidValue {
                    key: "aws.endpoint_url".to_string(),
                    message: format!("expected an http(s) URL, got {}", endpoint),
                });
            }
        }
        Ok(())
    }
}

impl AwsConfig {
    /// Resolve region, profile and credentials into an SDK config
    pub async fn load_sdk_config(&self) -> aws_config::SdkConfig {
        let region = RegionProviderChain::first_try(self.region.clone().map(Region::new))
            .or_default_provider()
            .or_else(Region::new(DEFAULT_REGION_NAME));

        let mut loader = aws_config::defaults(BehaviorVersion::latest()).region(region);
        if let Some(ref profile) = self.profile {
            loader = loader.profile_name(profile);
        }

        loader.load().await
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            time_format: default_time_format(),
            filter_pattern: None,
        }
    }
}
