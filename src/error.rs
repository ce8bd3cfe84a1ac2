use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// 错误所属的生命周期阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The listener never came up
    Startup,
    /// Draining did not finish cleanly
    Shutdown,
}

/// Errors reported by the server lifecycle controller.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("could not bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("could not load host key {}: {source}", path.display())]
    HostKey {
        path: PathBuf,
        #[source]
        source: HostKeyError,
    },

    #[error("server was already started")]
    AlreadyStarted,

    #[error("shutdown timed out after {timeout:?} with {remaining} session(s) still active")]
    ShutdownTimeout { timeout: Duration, remaining: usize },

    #[error("accept task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl ServerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServerError::Bind { .. } | ServerError::HostKey { .. } | ServerError::AlreadyStarted => {
                ErrorKind::Startup
            }
            ServerError::ShutdownTimeout { .. } | ServerError::Task(_) => ErrorKind::Shutdown,
        }
    }
}

/// 主机密钥读写错误
#[derive(Error, Debug)]
pub enum HostKeyError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("key encoding error: {0}")]
    Key(#[from] russh::keys::ssh_key::Error),
}
