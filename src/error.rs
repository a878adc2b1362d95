use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Task '{task}' failed: {reason}")]
    TaskExecution { task: String, reason: String },

    #[error("Synchronization error: {0}")]
    Synchronization(String),

    #[error("Timed out acquiring lock {0} after {1} attempts")]
    LockTimeout(std::path::PathBuf, u32),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

pub type Result<T> = std::result::Result<T, Error>;
