use std::fmt;
use std::io;

pub type TransportResult<T> = Result<T, TransportError>;

/// Transport-layer plumbing shared by the codec, the buffers and the
/// connection state machine. `Wait` means the operation cannot make progress
/// until the socket signals readiness again; `Fatal` closes the connection.
#[derive(Debug, Eq, PartialEq)]
pub enum TransportError {
    Wait,
    Fatal(FailureKind),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FailureKind {
    Write,
    Read,
    UnknownRead,
    Connect,
    Bind,
    SocketCreate,
    Protocol,
    Timeout,
    Memory,
    Io(io::ErrorKind),
}

impl From<io::Error> for TransportError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => TransportError::Wait,
            kind => TransportError::Fatal(FailureKind::Io(kind)),
        }
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for TransportResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(TransportError::Wait) => false,
            _ => true,
        }
    }
}

/// Outcome of a client operation. Protocol-level outcomes (`NotFound`,
/// `NotStored`, `Exists`, ...) leave the connection open; I/O failures close
/// it and schedule a retry.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Status {
    Success,
    Stored,
    Deleted,
    Touched,
    Value,
    Stat,
    End,
    NotFound,
    NotStored,
    Exists { cas: u64 },
    DataExists,
    Buffered,
    FetchNotFinished,
    PartialRead,
    BadKey,
    NoServers,
    NotSupported,
    Timeout { server: usize },
    ProtocolError,
    WriteFailure,
    ReadFailure,
    UnknownReadFailure,
    ConnectionFailure,
    ConnectionBindFailure,
    ConnectionSocketCreateFailure,
    MemoryAllocationFailure,
    ClientError(String),
    ServerError(String),
}

impl Status {
    /// True for outcomes that completed the operation as requested.
    #[inline]
    pub fn is_success(&self) -> bool {
        match self {
            Status::Success
            | Status::Stored
            | Status::Deleted
            | Status::Touched
            | Status::Value
            | Status::Stat
            | Status::End
            | Status::Buffered => true,
            _ => false,
        }
    }

    /// True for failures that close the connection and schedule a retry.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        match self {
            Status::ProtocolError
            | Status::WriteFailure
            | Status::ReadFailure
            | Status::UnknownReadFailure
            | Status::ConnectionFailure
            | Status::ConnectionBindFailure
            | Status::ConnectionSocketCreateFailure
            | Status::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Maps a binary-protocol status code. The response CAS rides along so
    /// `Exists` can carry the token that failed to match.
    pub fn from_binary(code: u16, cas: u64) -> Status {
        match code {
            0x00 => Status::Success,
            0x01 => Status::NotFound,
            0x02 => Status::Exists { cas },
            0x03 => Status::ServerError("value too large".to_owned()),
            0x04 => Status::ClientError("invalid arguments".to_owned()),
            0x05 => Status::NotStored,
            0x06 => Status::ClientError("incr/decr on non-numeric value".to_owned()),
            0x07 => Status::ServerError("vbucket belongs to another server".to_owned()),
            0x08 => Status::ServerError("authentication error".to_owned()),
            0x09 => Status::ServerError("authentication continue".to_owned()),
            0x20 => Status::ServerError("authentication required".to_owned()),
            0x81 => Status::ServerError("unknown command".to_owned()),
            0x82 => Status::ServerError("out of memory".to_owned()),
            0x83 => Status::NotSupported,
            0x84 => Status::ServerError("internal error".to_owned()),
            0x85 => Status::ServerError("busy".to_owned()),
            0x86 => Status::ServerError("temporary failure".to_owned()),
            _ => Status::ProtocolError,
        }
    }

    /// Maps a fatal transport failure observed against `server`.
    pub fn from_failure(kind: FailureKind, server: usize) -> Status {
        match kind {
            FailureKind::Write => Status::WriteFailure,
            FailureKind::Read => Status::ReadFailure,
            FailureKind::UnknownRead => Status::UnknownReadFailure,
            FailureKind::Connect => Status::ConnectionFailure,
            FailureKind::Bind => Status::ConnectionBindFailure,
            FailureKind::SocketCreate => Status::ConnectionSocketCreateFailure,
            FailureKind::Protocol => Status::ProtocolError,
            FailureKind::Timeout => Status::Timeout { server },
            FailureKind::Memory => Status::MemoryAllocationFailure,
            FailureKind::Io(_) => Status::ConnectionFailure,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Status::Exists { cas } => write!(f, "EXISTS (cas {})", cas),
            Status::Timeout { server } => write!(f, "TIMEOUT (server {})", server),
            Status::ClientError(msg) => write!(f, "CLIENT_ERROR {}", msg),
            Status::ServerError(msg) => write!(f, "SERVER_ERROR {}", msg),
            other => write!(f, "{:?}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_would_block_folds_to_wait() {
        let err: TransportError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert_eq!(err, TransportError::Wait);

        let err: TransportError = io::Error::from(io::ErrorKind::BrokenPipe).into();
        assert_eq!(
            err,
            TransportError::Fatal(FailureKind::Io(io::ErrorKind::BrokenPipe))
        );
    }

    #[test]
    fn test_has_failed() {
        assert!(!TransportResult::Ok(0usize).has_failed());
        assert!(!TransportResult::<usize>::Err(TransportError::Wait).has_failed());
        assert!(TransportResult::<usize>::Err(TransportError::Fatal(FailureKind::Write)).has_failed());
    }

    #[test]
    fn test_binary_status_mapping() {
        assert_eq!(Status::from_binary(0x00, 0), Status::Success);
        assert_eq!(Status::from_binary(0x01, 0), Status::NotFound);
        assert_eq!(Status::from_binary(0x02, 42), Status::Exists { cas: 42 });
        assert_eq!(Status::from_binary(0x05, 0), Status::NotStored);
        assert_eq!(Status::from_binary(0x83, 0), Status::NotSupported);
        assert_eq!(Status::from_binary(0xff, 0), Status::ProtocolError);
    }

    #[test]
    fn test_success_and_fatal_partition() {
        assert!(Status::Success.is_success());
        assert!(Status::Buffered.is_success());
        assert!(!Status::NotFound.is_success());
        assert!(!Status::NotFound.is_fatal());
        assert!(Status::Timeout { server: 2 }.is_fatal());
        assert!(Status::ProtocolError.is_fatal());
    }
}
