use std::fmt;
use thiserror::Error;

/// Which step of connection establishment failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStage {
    Resolve,
    Connect,
    Tunnel,
    Handshake,
}

impl fmt::Display for ConnectStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self {
            ConnectStage::Resolve => "resolve",
            ConnectStage::Connect => "connect",
            ConnectStage::Tunnel => "tunnel",
            ConnectStage::Handshake => "handshake",
        };
        f.write_str(stage)
    }
}

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Invalid proxy spec: {0}")]
    InvalidProxySpec(String),

    #[error("Connection error ({stage}): {message}")]
    Connection {
        stage: ConnectStage,
        message: String,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unexpected http status code: {code}({reason})")]
    UnexpectedStatus { code: u16, reason: String },

    #[error("Server closed the connection before responding")]
    ServerClosed,

    #[error("Session acquire failed: {0}")]
    SessionAcquireFailed(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl BridgeError {
    pub fn connection(stage: ConnectStage, message: impl fmt::Display) -> Self {
        BridgeError::Connection {
            stage,
            message: message.to_string(),
        }
    }

    /// Only a peer that hung up before sending a response head is worth a fresh connection
    pub fn is_retryable(&self) -> bool {
        matches!(self, BridgeError::ServerClosed)
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
