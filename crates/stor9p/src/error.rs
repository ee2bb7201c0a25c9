//! Errors reported by the codec, the session and backends.
//!
//! Every error except the fatal codec ones ends up on the wire as an
//! `Rerror` whose `ename` is the `Display` form of the error, so the
//! messages follow the wording Plan 9 servers traditionally use.

use std::io;

use thiserror::Error;

/// The error type shared by the codec, the dispatcher and backends.
#[derive(Debug, Error)]
pub enum Error {
    /// A frame is malformed: too short, too long, or its arguments do not
    /// match the layout of its message type. Fatal to the session.
    #[error("bad frame")]
    BadFrame,

    /// The transport closed in the middle of a frame. Fatal to the session.
    #[error("truncated frame")]
    TruncatedFrame,

    /// A string does not fit in a 16-bit length prefix.
    #[error("string too long")]
    StringTooLong,

    /// A value is not a valid instance of its declared wire type.
    #[error("invalid type")]
    InvalidType,

    #[error("unknown fid")]
    UnknownFid,

    #[error("fid already in use")]
    DuplicateFid,

    /// The fid exists but the request is not valid in its current state,
    /// e.g. opening an already open fid or walking from an open one.
    #[error("fid in wrong state")]
    BadFidState,

    #[error("permission denied")]
    PermissionDenied,

    #[error("create prohibited")]
    NoCreate,

    #[error("write prohibited")]
    NoWrite,

    #[error("wstat prohibited")]
    NoWstat,

    #[error("remove prohibited")]
    NoRemove,

    /// Out of order access to a backend that can only move forward.
    #[error("bad offset")]
    BadOffset,

    /// Returned by `Srv::auth` when attach needs no prior authentication.
    #[error("authentication not required")]
    NoAuthRequired,

    #[error("file does not exist")]
    NotFound,

    #[error("file already exists")]
    Exists,

    #[error("walk in non-directory")]
    WalkNoDir,

    #[error("illegal file name")]
    IllegalName,

    #[error("too many names in walk")]
    TooManyWalkNames,

    #[error("unknown message")]
    UnknownMessage,

    /// Opaque failure reported by a backend.
    #[error("{0}")]
    Backend(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Wrap any displayable backend failure.
    pub fn backend<E: std::fmt::Display>(e: E) -> Self {
        Error::Backend(e.to_string())
    }

    /// Whether the error must terminate the session instead of being
    /// answered with `Rerror`.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::BadFrame | Error::TruncatedFrame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_kinds() {
        assert!(Error::BadFrame.is_fatal());
        assert!(Error::TruncatedFrame.is_fatal());
        assert!(!Error::UnknownFid.is_fatal());
        assert!(!Error::StringTooLong.is_fatal());
        assert!(!Error::Io(io::Error::other("boom")).is_fatal());
    }

    #[test]
    fn messages_reach_the_wire_verbatim() {
        assert_eq!(Error::UnknownFid.to_string(), "unknown fid");
        assert_eq!(Error::Exists.to_string(), "file already exists");
        assert_eq!(
            Error::NoAuthRequired.to_string(),
            "authentication not required"
        );
        assert_eq!(Error::backend("disk on fire").to_string(), "disk on fire");
    }
}
