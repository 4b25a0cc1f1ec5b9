use thiserror::Error;

#[derive(Error, Debug)]
pub enum LabError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SSH error: {0}")]
    Ssh(#[from] ssh2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Container error: {0}")]
    Container(String),

    #[error("Extraction error: {0}")]
    Extraction(String),
}

pub type Error = LabError;
pub type Result<T> = std::result::Result<T, Error>;
