use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Netlink error: {0}")]
    NetlinkError(String),

    #[error("Failed to subscribe to netlink group: {0}")]
    SubscribeFailed(String),

    #[error("OVSDB error: {0}")]
    OvsdbError(String),

    #[error("Docker error: {0}")]
    DockerError(String),

    #[error("Network namespace error: {path}: {reason}")]
    NetnsError { path: String, reason: String },

    #[error("Unsupported graph backend: {0}")]
    UnsupportedBackend(String),

    #[error("Unknown topology probe: {0}")]
    UnknownProbe(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Websocket error: {0}")]
    WebsocketError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;
