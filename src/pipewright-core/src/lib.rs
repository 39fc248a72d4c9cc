pub mod config;
pub mod connector_contract;
pub mod contract;
pub mod logging;
pub mod manifest;
pub mod models;
pub mod paths;

pub use config::{Config, ConfigError, LogLevel, LoggingConfig, ValidationError};
pub use contract::{Connector, ContractError, ContractResult, Provisioner};
pub use logging::{init_logging, LoggingError, LoggingGuard};
pub use manifest::{Manifest, ManifestEntry, ManifestError};
pub use models::{
    ActionRequired, GeneratedFile, PluginDescriptor, PluginSpec, Step, StepsFile, ValueBag,
};
pub use paths::{AppDirs, DirsError};

pub const APP_NAME: &str = "pipewright";
pub const APP_AUTHOR: &str = "Pipewright";
pub const APP_QUALIFIER: &str = "dev";
