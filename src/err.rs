#[derive(Debug, thiserror::Error)]
pub enum TcpError {
    #[error("invalid argument")]
    InvalidArgument,

    #[error("operation already in progress")]
    InProgress,

    #[error("operation already performed")]
    Already,

    #[error("socket is already connected")]
    IsConnected,

    #[error("connection refused")]
    ConnectionRefused,

    #[error("connection reset by peer")]
    ConnectionReset,

    #[error("operation timed out")]
    TimedOut,

    #[error("socket is not connected")]
    NotConnected,

    #[error("port {0} has been unexpectedly closed")]
    PortClosed(u16),

    #[error("port {0} already in use")]
    PortInUse(u16),

    #[error("device error: {0}")]
    Device(#[from] tidy_tuntap::error::Error),
}

/// The subset of `TcpError` a `TCB` latches into its own `err` field and
/// hands to every blocked waiter (spec.md S7's "connection-level errors").
/// Kept free of `Device` and `Clone`-able so it can live inside a cloned
/// `TCB` (`on_segment_listen`'s `Action::AddToPending`) without requiring
/// the non-`Clone` `tidy_tuntap::error::Error` to be `Clone` too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ErrorKind {
    #[error("connection refused")]
    ConnectionRefused,

    #[error("connection reset by peer")]
    ConnectionReset,

    #[error("operation timed out")]
    TimedOut,

    #[error("socket is not connected")]
    NotConnected,
}

impl From<ErrorKind> for TcpError {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::ConnectionRefused => TcpError::ConnectionRefused,
            ErrorKind::ConnectionReset => TcpError::ConnectionReset,
            ErrorKind::TimedOut => TcpError::TimedOut,
            ErrorKind::NotConnected => TcpError::NotConnected,
        }
    }
}
