// Copyright 2020 Joyent, Inc.

//! Error taxonomy shared by every layer of the encoder.
//!
//! Each [`DapError`] maps onto one [`ErrorKind`], and each kind onto the
//! HTTP-equivalent status reported to the client, either out of band or in
//! the body of a terminal ERROR chunk.

use std::fmt;
use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DapError>;

/// The closed set of failure categories a client can observe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    BadRequest,
    NotFound,
    NoMatchingProvider,
    ProtocolSequence,
    PayloadTooLarge,
    Forbidden,
    Internal,
}

impl ErrorKind {
    pub fn http_code(self) -> u16 {
        match self {
            ErrorKind::BadRequest => 400,
            ErrorKind::Forbidden => 403,
            ErrorKind::NotFound | ErrorKind::NoMatchingProvider => 404,
            ErrorKind::PayloadTooLarge => 413,
            ErrorKind::ProtocolSequence | ErrorKind::Internal => 500,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::BadRequest => "BAD_REQUEST",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::NoMatchingProvider => "NO_MATCHING_PROVIDER",
            ErrorKind::ProtocolSequence => "PROTOCOL_SEQUENCE_ERROR",
            ErrorKind::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ErrorKind::Forbidden => "FORBIDDEN",
            ErrorKind::Internal => "INTERNAL",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum DapError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no dataset provider matches path: {0}")]
    NoMatchingProvider(String),

    #[error("protocol sequence error: {0}")]
    ProtocolSequence(String),

    #[error("payload too large: {attempted} bytes exceeds write limit of {limit}")]
    PayloadTooLarge { attempted: u64, limit: u64 },

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl DapError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DapError::BadRequest(_) => ErrorKind::BadRequest,
            DapError::NotFound(_) => ErrorKind::NotFound,
            DapError::NoMatchingProvider(_) => ErrorKind::NoMatchingProvider,
            DapError::ProtocolSequence(_) => ErrorKind::ProtocolSequence,
            DapError::PayloadTooLarge { .. } => ErrorKind::PayloadTooLarge,
            DapError::Forbidden(_) => ErrorKind::Forbidden,
            DapError::Internal(_) | DapError::Io(_) => ErrorKind::Internal,
        }
    }

    pub fn http_code(&self) -> u16 {
        self.kind().http_code()
    }

    pub(crate) fn bad_request(msg: impl Into<String>) -> DapError {
        DapError::BadRequest(msg.into())
    }

    pub(crate) fn internal(msg: impl Into<String>) -> DapError {
        DapError::Internal(msg.into())
    }

    pub(crate) fn sequence(msg: impl Into<String>) -> DapError {
        DapError::ProtocolSequence(msg.into())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn io_errors_are_internal() {
        let err: DapError =
            io::Error::new(io::ErrorKind::BrokenPipe, "peer went away").into();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(err.http_code(), 500);
    }

    #[test]
    fn status_codes() {
        assert_eq!(DapError::bad_request("x").http_code(), 400);
        assert_eq!(DapError::NoMatchingProvider("x".into()).http_code(), 404);
        let too_big = DapError::PayloadTooLarge {
            attempted: 11,
            limit: 10,
        };
        assert_eq!(too_big.http_code(), 413);
        assert_eq!(too_big.kind().to_string(), "PAYLOAD_TOO_LARGE");
    }
}
