use thiserror::Error;

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Map error: {0}")]
    MapError(String),
}

pub type Result<T> = std::result::Result<T, PluginError>;
