use thiserror::Error;

#[derive(Debug, Error)]
pub enum SlurmCiError {
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

impl From<toml::de::Error> for SlurmCiError {
    fn from(error: toml::de::Error) -> Self {
        Self::DeserializationError(error.to_string())
    }
}
