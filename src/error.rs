//! Error types for Warden.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WardenError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid pattern in rule '{rule}': {message}")]
    Pattern { rule: String, message: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Firewall error: {0}")]
    Firewall(String),

    #[error("Could not resolve '{0}'")]
    Resolve(String),
}
