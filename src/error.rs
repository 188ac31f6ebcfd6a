use thiserror::Error;

/// Connection-level error kinds.
///
/// Only a few of these ever cross the public API boundary (`QueueFull`, `SocketClosed`);
///  the rest classify internal outcomes: parse errors abort the current datagram but never the
///  connection, `Throttled` paths are retried on a later tick, `Timeout` is handled by the
///  retransmission walk, and `Obsolete`/`DuplicateDrop` are silent by design.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("malformed datagram: {0}")]
    Malformed(#[from] WireError),

    #[error("duplicate datagram or message dropped")]
    DuplicateDrop,

    #[error("throttled - retry on a later tick")]
    Throttled,

    #[error("outbound accept queue is full, reliable message rejected")]
    QueueFull,

    #[error("socket is closed")]
    SocketClosed,

    #[error("reliable datagram timed out")]
    Timeout,

    #[error("message superseded by a newer one with the same content id")]
    Obsolete,
}

/// Parse failure inside a single datagram. Aborts parsing of the remainder of that datagram,
///  never the connection.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// The sentinel for an unknown width-flag combination in a variable-length integer.
    #[error("invalid width flags in variable-length integer")]
    InvalidVle,

    #[error("truncated while reading {0}")]
    Truncated(&'static str),

    #[error("message content length must be at least one byte")]
    ZeroContentLength,

    #[error("fragment start declared {0} total fragments")]
    BadFragmentCount(u32),
}
