//! Wire-level SMTP errors shared by the server and client sessions.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SmtpError {
    /// The peer closed the connection mid-session.
    #[error("connection lost")]
    ConnectionLost,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A read exceeded the session timeout.
    #[error("session timed out")]
    TimedOut,

    /// DATA exceeded the configured maximum size. The body has been
    /// drained up to the terminator; the session may continue.
    #[error("message exceeds size limit of {0} bytes")]
    MessageTooBig(usize),

    /// A reply line that does not match `NNN[- ]text`.
    #[error("malformed reply line: {0}")]
    BadReply(String),

    /// A single command or reply line longer than the codec allows.
    #[error("line exceeds {0} bytes")]
    LineTooLong(usize),

    #[error("TLS error: {0}")]
    Tls(String),
}

pub type Result<T> = std::result::Result<T, SmtpError>;
