//! Error types for the Homestay real-time core

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Not connected to message broker")]
    NotConnected,

    #[error("Connection handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Timed out waiting for connection after {0:?}")]
    SendTimeout(Duration),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("No heart-beat from broker within {0:?}")]
    HeartbeatTimeout(Duration),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Peer connection error: {0}")]
    Peer(String),

    #[error("Invalid call state: {0}")]
    InvalidCallState(String),

    #[error("No incoming call")]
    NoIncomingCall,

    #[error("Call engine stopped")]
    EngineStopped,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures while acquiring local capture devices.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Permission to use {0} denied")]
    PermissionDenied(String),

    #[error("No {0} device available")]
    DeviceNotFound(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocket(e.to_string())
    }
}

impl From<webrtc::Error> for Error {
    fn from(e: webrtc::Error) -> Self {
        Error::Peer(e.to_string())
    }
}

impl Error {
    /// Whether this error came from the broker link rather than from the caller.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::NotConnected
                | Error::HandshakeTimeout(_)
                | Error::ConnectionClosed
                | Error::HeartbeatTimeout(_)
                | Error::Protocol(_)
                | Error::Broker(_)
                | Error::WebSocket(_)
        )
    }
}
