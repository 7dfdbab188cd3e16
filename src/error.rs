//! Error taxonomy shared by the codec, sessions and the dispatcher.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::packet::ErrorCode;

#[derive(Debug, Error)]
pub enum TftpError {
    /// Datagram does not follow the wire layout.
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    #[error("unknown opcode {0}")]
    UnknownOpcode(u16),

    /// Valid packet in the wrong state or sequence.
    #[error("illegal operation: {0}")]
    IllegalOperation(String),

    #[error("file not found: {0}")]
    NotFound(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("disk full: {0}")]
    DiskFull(String),

    /// A single retransmission cycle lapsed without a reply.
    #[error("timed out waiting for peer")]
    Timeout,

    #[error("max retries ({0}) exceeded")]
    MaxRetriesExceeded(u8),

    /// Datagram from an address/port other than the session's peer.
    #[error("unknown transfer id {0}")]
    UnknownTransferId(SocketAddr),

    /// The remote side sent an ERROR packet.
    #[error("peer error {code:?}: {message}")]
    PeerError { code: ErrorCode, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TftpError {
    /// Wire code to report to the peer before closing, if anything should be sent.
    pub fn reply_code(&self) -> Option<ErrorCode> {
        match self {
            TftpError::MalformedPacket(_)
            | TftpError::UnknownOpcode(_)
            | TftpError::IllegalOperation(_) => Some(ErrorCode::IllegalOperation),
            TftpError::NotFound(_) => Some(ErrorCode::FileNotFound),
            TftpError::AccessDenied(_) => Some(ErrorCode::AccessViolation),
            TftpError::DiskFull(_) => Some(ErrorCode::DiskFull),
            TftpError::UnknownTransferId(_) => Some(ErrorCode::UnknownTransferId),
            TftpError::Io(_) => Some(ErrorCode::NotDefined),
            TftpError::Timeout | TftpError::MaxRetriesExceeded(_) | TftpError::PeerError { .. } => {
                None
            }
        }
    }

    /// True for failures produced while decoding a datagram.
    pub fn is_decode_error(&self) -> bool {
        matches!(
            self,
            TftpError::MalformedPacket(_) | TftpError::UnknownOpcode(_)
        )
    }

    /// Maps a storage I/O failure for `name` onto the taxonomy.
    pub fn from_storage(err: io::Error, name: &str) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => TftpError::NotFound(name.to_string()),
            io::ErrorKind::PermissionDenied => TftpError::AccessDenied(name.to_string()),
            io::ErrorKind::StorageFull => TftpError::DiskFull(name.to_string()),
            _ => TftpError::Io(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_map_to_wire_codes() {
        let err = TftpError::from_storage(io::ErrorKind::NotFound.into(), "a.bin");
        assert!(matches!(err, TftpError::NotFound(ref n) if n == "a.bin"));
        assert_eq!(err.reply_code(), Some(ErrorCode::FileNotFound));

        let err = TftpError::from_storage(io::ErrorKind::PermissionDenied.into(), "a.bin");
        assert_eq!(err.reply_code(), Some(ErrorCode::AccessViolation));

        let err = TftpError::from_storage(io::ErrorKind::StorageFull.into(), "a.bin");
        assert_eq!(err.reply_code(), Some(ErrorCode::DiskFull));
    }

    #[test]
    fn terminal_conditions_send_nothing() {
        assert_eq!(TftpError::Timeout.reply_code(), None);
        assert_eq!(TftpError::MaxRetriesExceeded(3).reply_code(), None);
        let peer = TftpError::PeerError {
            code: ErrorCode::DiskFull,
            message: "full".into(),
        };
        assert_eq!(peer.reply_code(), None);
    }
}
