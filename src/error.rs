use std::time::Duration;

use thiserror::Error;

/// The failure taxonomy shared by all carriers.
///
/// Carrier-level faults (socket errors, signal failures) are caught at the physical
///  connection boundary and mapped to one of these kinds - raw OS error codes never
///  cross into the connection manager.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    Timeout,
    DestinationUnreachable,
    ConnectionClosed,
    Desynchronization,
    IncorrectData,
    TooLarge,
    QueueOverloaded,
    SecurityFailure,
    ConnectionSuperseded,
    ListeningStopped,
    LogicError,
}
impl ErrorKind {
    /// Stable identifier for programmatic matching, independent of the formatted message.
    pub fn identifier(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "Conduit.Timeout",
            ErrorKind::DestinationUnreachable => "Conduit.DestinationUnreachable",
            ErrorKind::ConnectionClosed => "Conduit.ConnectionClosed",
            ErrorKind::Desynchronization => "Conduit.Desynchronization",
            ErrorKind::IncorrectData => "Conduit.IncorrectData",
            ErrorKind::TooLarge => "Conduit.TooLarge",
            ErrorKind::QueueOverloaded => "Conduit.QueueOverloaded",
            ErrorKind::SecurityFailure => "Conduit.SecurityFailure",
            ErrorKind::ConnectionSuperseded => "Conduit.ConnectionSuperseded",
            ErrorKind::ListeningStopped => "Conduit.ListeningStopped",
            ErrorKind::LogicError => "Conduit.LogicError",
        }
    }

    /// Critical failures tear the logical connection down permanently and are never
    ///  retried; everything else is eligible for the reconnection loop.
    ///
    /// NB: This is an explicit classification on the kind, not derived from matching
    ///      substrings in identifiers.
    pub fn is_critical(&self) -> bool {
        match self {
            ErrorKind::SecurityFailure
            | ErrorKind::ConnectionSuperseded
            | ErrorKind::ListeningStopped
            | ErrorKind::Desynchronization
            | ErrorKind::LogicError => true,
            ErrorKind::Timeout
            | ErrorKind::DestinationUnreachable
            | ErrorKind::ConnectionClosed
            | ErrorKind::IncorrectData
            | ErrorKind::TooLarge
            | ErrorKind::QueueOverloaded => false,
        }
    }
}

#[derive(Debug, Error, Clone)]
pub enum ChannelError {
    #[error("deadline elapsed during '{operation}' after {budget:?}")]
    Timeout { operation: &'static str, budget: Duration },

    #[error("no connection to '{host}' and none could be opened: {detail}")]
    DestinationUnreachable { host: String, detail: String },

    #[error("connection closed: {reason}")]
    ConnectionClosed { reason: String },

    #[error("sequence desynchronization: expected {expected} or {}, received {actual}", *expected + 1)]
    Desynchronization { expected: u64, actual: u64 },

    #[error("malformed frame or header: {detail}")]
    IncorrectData { detail: String },

    #[error("packet of {size} bytes exceeds the configured bound of {limit} bytes")]
    TooLarge { size: usize, limit: usize },

    #[error("outbound queue overloaded: {queued_bytes} bytes queued, limit is {limit_bytes}")]
    QueueOverloaded { queued_bytes: usize, limit_bytes: usize },

    #[error("security session failure: {detail}")]
    SecurityFailure { detail: String },

    #[error("connection to '{host}' superseded by a conflicting connection")]
    ConnectionSuperseded { host: String },

    #[error("listening was stopped on '{address}'")]
    ListeningStopped { address: String },

    #[error("internal invariant violated: {detail}")]
    LogicError { detail: String },
}

impl ChannelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChannelError::Timeout { .. } => ErrorKind::Timeout,
            ChannelError::DestinationUnreachable { .. } => ErrorKind::DestinationUnreachable,
            ChannelError::ConnectionClosed { .. } => ErrorKind::ConnectionClosed,
            ChannelError::Desynchronization { .. } => ErrorKind::Desynchronization,
            ChannelError::IncorrectData { .. } => ErrorKind::IncorrectData,
            ChannelError::TooLarge { .. } => ErrorKind::TooLarge,
            ChannelError::QueueOverloaded { .. } => ErrorKind::QueueOverloaded,
            ChannelError::SecurityFailure { .. } => ErrorKind::SecurityFailure,
            ChannelError::ConnectionSuperseded { .. } => ErrorKind::ConnectionSuperseded,
            ChannelError::ListeningStopped { .. } => ErrorKind::ListeningStopped,
            ChannelError::LogicError { .. } => ErrorKind::LogicError,
        }
    }

    pub fn identifier(&self) -> &'static str {
        self.kind().identifier()
    }

    pub fn is_critical(&self) -> bool {
        self.kind().is_critical()
    }

    pub fn incorrect_data(detail: impl Into<String>) -> ChannelError {
        ChannelError::IncorrectData { detail: detail.into() }
    }

    pub fn closed(reason: impl Into<String>) -> ChannelError {
        ChannelError::ConnectionClosed { reason: reason.into() }
    }

    pub fn logic(detail: impl Into<String>) -> ChannelError {
        ChannelError::LogicError { detail: detail.into() }
    }

    pub fn security(detail: impl Into<String>) -> ChannelError {
        ChannelError::SecurityFailure { detail: detail.into() }
    }

    /// Map a carrier-level I/O fault to the taxonomy. This is the only place where
    ///  `std::io::Error` enters the picture.
    pub fn from_io(operation: &'static str, e: std::io::Error) -> ChannelError {
        use std::io::ErrorKind as IoKind;
        match e.kind() {
            IoKind::TimedOut | IoKind::WouldBlock => ChannelError::Timeout {
                operation,
                budget: Duration::ZERO,
            },
            IoKind::ConnectionRefused | IoKind::AddrNotAvailable | IoKind::NotFound => {
                ChannelError::DestinationUnreachable {
                    host: String::new(),
                    detail: format!("{} failed: {}", operation, e),
                }
            }
            IoKind::UnexpectedEof => ChannelError::IncorrectData {
                detail: format!("{}: peer truncated mid-message: {}", operation, e),
            },
            _ => ChannelError::ConnectionClosed {
                reason: format!("{} failed: {}", operation, e),
            },
        }
    }
}

pub type ChannelResult<T> = Result<T, ChannelError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[rstest]
    #[case::timeout(ErrorKind::Timeout, false)]
    #[case::unreachable(ErrorKind::DestinationUnreachable, false)]
    #[case::closed(ErrorKind::ConnectionClosed, false)]
    #[case::desync(ErrorKind::Desynchronization, true)]
    #[case::incorrect(ErrorKind::IncorrectData, false)]
    #[case::too_large(ErrorKind::TooLarge, false)]
    #[case::overloaded(ErrorKind::QueueOverloaded, false)]
    #[case::security(ErrorKind::SecurityFailure, true)]
    #[case::superseded(ErrorKind::ConnectionSuperseded, true)]
    #[case::stopped(ErrorKind::ListeningStopped, true)]
    #[case::logic(ErrorKind::LogicError, true)]
    fn test_criticality(#[case] kind: ErrorKind, #[case] expected: bool) {
        assert_eq!(kind.is_critical(), expected);
    }

    #[rstest]
    fn test_identifier_stability() {
        let e = ChannelError::Desynchronization { expected: 4, actual: 6 };
        assert_eq!(e.identifier(), "Conduit.Desynchronization");
        assert_eq!(e.kind(), ErrorKind::Desynchronization);
    }

    #[rstest]
    #[case::refused(std::io::ErrorKind::ConnectionRefused, ErrorKind::DestinationUnreachable)]
    #[case::timed_out(std::io::ErrorKind::TimedOut, ErrorKind::Timeout)]
    #[case::eof(std::io::ErrorKind::UnexpectedEof, ErrorKind::IncorrectData)]
    #[case::reset(std::io::ErrorKind::ConnectionReset, ErrorKind::ConnectionClosed)]
    fn test_from_io(#[case] io_kind: std::io::ErrorKind, #[case] expected: ErrorKind) {
        let e = ChannelError::from_io("recv", std::io::Error::from(io_kind));
        assert_eq!(e.kind(), expected);
    }
}
