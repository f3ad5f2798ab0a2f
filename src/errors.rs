//! Error catalog (C2): the fixed TFTP error-code table and ERR emission.

use std::fmt;

use crate::codec::Packet;
use crate::io::DatagramSocket;
use std::net::SocketAddr;

/// Maximum length of an ERR packet's message field (RFC 1350 leaves this
/// unbounded; we cap it so a single ERR always fits comfortably in one
/// datagram alongside the 4-byte header).
const MAX_MESSAGE_LEN: usize = 512;

/// The fixed RFC 1350 §5 error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NotDefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFullOrAllocExceeded = 3,
    IllegalOperation = 4,
    UnknownTransferId = 5,
    FileAlreadyExists = 6,
    NoSuchUser = 7,
}

impl ErrorCode {
    pub fn code(self) -> u16 {
        self as u16
    }

    /// The catalog string for this error code.
    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::NotDefined => "Not defined",
            ErrorCode::FileNotFound => "File not found",
            ErrorCode::AccessViolation => "Access violation",
            ErrorCode::DiskFullOrAllocExceeded => "Disk full or allocation exceeded",
            ErrorCode::IllegalOperation => "Illegal TFTP operation",
            ErrorCode::UnknownTransferId => "Unknown transfer ID",
            ErrorCode::FileAlreadyExists => "File already exists",
            ErrorCode::NoSuchUser => "No such user",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

/// Build the message body for an ERR packet: the catalog string, optionally
/// suffixed `": " + extra`, truncated to fit the message field.
pub fn compose_message(code: ErrorCode, extra: Option<&str>) -> String {
    let mut msg = code.message().to_string();
    if let Some(extra) = extra
        && !extra.is_empty()
    {
        msg.push_str(": ");
        msg.push_str(extra);
    }
    if msg.len() > MAX_MESSAGE_LEN {
        msg.truncate(MAX_MESSAGE_LEN);
    }
    msg
}

/// Emit an ERR packet to `peer` over `socket`. Best-effort: a send failure
/// is logged by the caller (via the returned `Result`) but never prevents
/// session teardown.
pub async fn send_error(
    socket: &dyn DatagramSocket,
    peer: SocketAddr,
    code: ErrorCode,
    extra: Option<&str>,
) -> std::io::Result<()> {
    let pkt = Packet::ERROR {
        code: code.code(),
        msg: compose_message(code, extra),
    };
    socket.send_to(&pkt.encode(), peer).await.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_without_extra() {
        assert_eq!(compose_message(ErrorCode::FileNotFound, None), "File not found");
    }

    #[test]
    fn message_with_extra() {
        assert_eq!(
            compose_message(ErrorCode::NotDefined, Some("in use")),
            "Not defined: in use"
        );
    }

    #[test]
    fn message_truncated_to_fit() {
        let extra = "x".repeat(1000);
        let msg = compose_message(ErrorCode::NotDefined, Some(&extra));
        assert_eq!(msg.len(), MAX_MESSAGE_LEN);
    }

    #[test]
    fn codes_match_rfc_1350() {
        assert_eq!(ErrorCode::NotDefined.code(), 0);
        assert_eq!(ErrorCode::FileNotFound.code(), 1);
        assert_eq!(ErrorCode::AccessViolation.code(), 2);
        assert_eq!(ErrorCode::DiskFullOrAllocExceeded.code(), 3);
        assert_eq!(ErrorCode::IllegalOperation.code(), 4);
        assert_eq!(ErrorCode::UnknownTransferId.code(), 5);
        assert_eq!(ErrorCode::FileAlreadyExists.code(), 6);
        assert_eq!(ErrorCode::NoSuchUser.code(), 7);
    }
}
