pub mod config;
pub mod models;
pub mod util;

use std::path::PathBuf;

/// A required parameter is missing or unusable. Always fatal to the stage that needs it.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("required parameter {0} is missing or empty")]
    Missing(&'static str),
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
    #[error("failed to read config file {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}
