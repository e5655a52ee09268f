use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("A stream is already in progress")]
    Busy,

    #[error("No active session")]
    NoActiveSession,
}

/// Failures at the transport boundary.
///
/// `Http` renders as `HTTP <status>: <body>` because that string ends up
/// verbatim in the error marker shown to the user.
#[derive(Error, Debug, Clone)]
pub enum ClientError {
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("{0}")]
    Business(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Session {session_id} already has streaming message {message_id}")]
    StreamInProgress {
        session_id: String,
        message_id: String,
    },
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file error: {0}")]
    File(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
