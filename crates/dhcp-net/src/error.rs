use thiserror::Error;

/// The networking-layer failure taxonomy (spec.md §7). `reader_task`
/// distinguishes all three socket variants: `SocketTransient` is logged
/// and the read loop continues, `SocketClosed` drains and exits
/// cleanly, and `SocketPermanent` terminates the processor with the
/// error surfaced.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("transient socket error: {0}")]
    SocketTransient(std::io::Error),

    #[error("socket closed")]
    SocketClosed,

    #[error("permanent socket error: {0}")]
    SocketPermanent(std::io::Error),

    #[error("invalid interface: {0}")]
    InvalidInterface(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error(transparent)]
    Engine(#[from] dhcp_core::EngineError),
}

impl From<std::io::Error> for NetError {
    /// `WouldBlock`/`Interrupted`/timeouts are transient; an unexpected
    /// EOF means the peer closed the socket; everything else (e.g.
    /// `EBADF`, `ENODEV`) is treated as permanent.
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match e.kind() {
            WouldBlock | Interrupted | TimedOut => NetError::SocketTransient(e),
            UnexpectedEof | ConnectionAborted | ConnectionReset => NetError::SocketClosed,
            _ => NetError::SocketPermanent(e),
        }
    }
}

pub type NetResult<T> = std::result::Result<T, NetError>;
