use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetwardenError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Application not found: {0}")]
    AppNotFound(String),

    #[error("Tunnel establishment failed: {0}")]
    Establish(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, NetwardenError>;
