//! # Error Kinds
//!
//! The categories a transport surfaces to its caller, per the protocol's
//! error handling design. Locally recovered conditions (transient I/O,
//! malformed wire packets, individual packet loss) never reach here — they
//! show up as counters or LOST markers instead.

use std::fmt;

/// Error kinds a caller of the transport API can observe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PgmError {
    /// A setter was called after `bind`, or a parameter is out of range.
    InvalidArgument(String),
    /// A rate-limited or non-blocking send could not proceed; try again.
    WouldBlock,
    /// Socket creation failed for lack of privilege or resource.
    Resource(String),
    /// A NAK exhausted `nak_ncf_retries` or `nak_data_retries`; the sqn is
    /// now LOST and will surface as a lost marker to the application.
    ExhaustedRetries { sqn: u32 },
}

impl fmt::Display for PgmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PgmError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            PgmError::WouldBlock => write!(f, "operation would block"),
            PgmError::Resource(msg) => write!(f, "resource error: {msg}"),
            PgmError::ExhaustedRetries { sqn } => {
                write!(f, "sqn {sqn} marked lost after exhausting retries")
            }
        }
    }
}

impl std::error::Error for PgmError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_are_non_empty() {
        let errs = [
            PgmError::InvalidArgument("bad".into()),
            PgmError::WouldBlock,
            PgmError::Resource("no perm".into()),
            PgmError::ExhaustedRetries { sqn: 5 },
        ];
        for e in errs {
            assert!(!e.to_string().is_empty());
        }
    }
}
