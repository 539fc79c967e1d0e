use std::error::Error;
use std::fmt;
use std::io;

/// Result type for a UtpError.
pub type UtpResult<T> = Result<T, UtpError>;

/// Errors surfaced to the user of a uTP stream.
#[derive(Debug)]
pub enum UtpError {
    /// Peer sent a valid ST_RESET for this stream.
    ConnectionReset,
    /// Retransmission limit was reached without an acknowledgment.
    Timeout,
    /// Stream was closed before the operation could complete.
    OperationAborted,
    /// Underlying UDP socket failed.
    Io(io::Error),
}

impl fmt::Display for UtpError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            UtpError::ConnectionReset => write!(f, "Connection Reset By Peer"),
            UtpError::Timeout => write!(f, "Connection Timed Out"),
            UtpError::OperationAborted => write!(f, "Operation Aborted"),
            UtpError::Io(err) => write!(f, "Io Error: {}", err),
        }
    }
}

impl Error for UtpError {
    fn description(&self) -> &str {
        match self {
            UtpError::ConnectionReset => "Connection Reset By Peer",
            UtpError::Timeout => "Connection Timed Out",
            UtpError::OperationAborted => "Operation Aborted",
            UtpError::Io(_) => "Io Error",
        }
    }
}

impl From<io::Error> for UtpError {
    fn from(err: io::Error) -> UtpError {
        UtpError::Io(err)
    }
}
