//! Common error types for mpipe

use thiserror::Error;

/// Common result type for mpipe operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types shared by the pipeline crates
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed TOML configuration file
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
}
