//! Service-level errors.
//!
//! Per-connection failures never show up here; the event loop handles them
//! by evicting the connection. These are the conditions that stop the
//! service as a whole, plus startup failures reported to the caller.

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    /// Could not create, bind or listen on the listening socket.
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Poll instance or listener registration could not be set up.
    #[error("failed to set up event loop: {0}")]
    Setup(#[source] io::Error),

    #[error("failed to spawn network thread: {0}")]
    Spawn(#[source] io::Error),

    /// The readiness wait failed for a reason other than interruption.
    #[error("readiness wait failed: {0}")]
    Poll(#[source] io::Error),

    /// A readiness event of a kind the loop does not handle.
    #[error("unexpected readiness event on token {0}")]
    UnexpectedReadiness(usize),

    #[error("attempted to evict the listening socket")]
    ListenerEviction,

    #[error("network thread panicked")]
    Panicked,
}

impl ServiceError {
    /// True for errors raised by a running loop rather than during startup.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ServiceError::Poll(_)
                | ServiceError::UnexpectedReadiness(_)
                | ServiceError::ListenerEviction
                | ServiceError::Panicked
        )
    }
}
