use std::io;
use thiserror::Error;

pub type RemoteResult<T> = Result<T, RemoteError>;

/// Errors reported by a remote mail server
#[derive(Error, Debug)]
pub enum RemoteError {
    /// IO error (network, file system, etc.)
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Authentication error
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Server error (NO/BAD response, error response code)
    #[error("Server error: {0}")]
    Server(String),

    /// Protocol error (invalid response, etc.)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Timeout error
    #[error("Operation timed out")]
    Timeout,

    /// Folder not found on the server
    #[error("Folder not found: {0}")]
    FolderNotFound(String),

    /// The incoming server connection was closed while the fetch was in flight
    #[error("Operation cancelled")]
    Cancelled,
}

impl RemoteError {
    /// Create a new connection error
    pub fn connection<S: Into<String>>(msg: S) -> Self {
        RemoteError::Connection(msg.into())
    }

    /// Create a new authentication error
    pub fn authentication<S: Into<String>>(msg: S) -> Self {
        RemoteError::Authentication(msg.into())
    }

    /// Create a new server error
    pub fn server<S: Into<String>>(msg: S) -> Self {
        RemoteError::Server(msg.into())
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        RemoteError::Protocol(msg.into())
    }

    /// Create a new folder not found error
    pub fn folder_not_found<S: Into<String>>(folder: S) -> Self {
        RemoteError::FolderNotFound(folder.into())
    }

    /// Check if retrying on the next explicit request may succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            RemoteError::Io(_) => true,
            RemoteError::Connection(_) => true,
            RemoteError::Timeout => true,
            RemoteError::Server(_) => true,
            RemoteError::Cancelled => true,
            RemoteError::Authentication(_) => false,
            RemoteError::Protocol(_) => false,
            RemoteError::FolderNotFound(_) => false,
        }
    }

    /// Check if this is a connection-related error
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            RemoteError::Io(_) | RemoteError::Connection(_) | RemoteError::Timeout
        )
    }

    /// Check if this is an authentication error
    pub fn is_auth_error(&self) -> bool {
        matches!(self, RemoteError::Authentication(_))
    }
}
