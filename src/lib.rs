// Copyright 2020 Joyent, Inc.

//! dap4-encoder: the server side of a DAP4 data access service
//!
//! Given a dataset's metadata tree and a client-supplied constraint
//! expression, this crate produces a length-framed, optionally checksummed
//! binary stream that a client decodes without any out-of-band schema.
//!
//! Protocol definition
//!
//! A response is a sequence of chunks. Each chunk starts with a 4-byte
//! big-endian header word:
//!
//! * FLAGS     high 8 bits.  A combination of:
//!
//!     * CHUNK_DATA          0x00  a chunk of data payload
//!
//!     * CHUNK_END           0x01  the last chunk of the response
//!
//!     * CHUNK_ERROR         0x02  the payload is an XML error document
//!
//!     * CHUNK_LITTLE_ENDIAN 0x04  data payload values are little-endian
//!
//!     * CHUNK_METADATA      0x08  the payload is the DMR document
//!
//! * LENGTH    low 24 bits.  Number of payload bytes that follow, at most
//!             MAX_CHUNK_SIZE (0xFFFFFF).
//!
//! A metadata response is one METADATA chunk followed by an empty END chunk.
//! A data response is one METADATA chunk, any number of DATA chunks and an
//! END chunk. Either may instead end with a single ERROR|END chunk when a
//! failure happens after the client has started receiving bytes.
//!
//! Data payload: the selected variables in declared order. Fixed-width
//! values are written in the response byte order; strings, URLs and opaque
//! values are each preceded by an 8-byte length, and every sequence instance
//! by an 8-byte record count. With checksums enabled each top-level
//! variable is followed by the 4-byte CRC-32 of its bytes.

#![allow(missing_docs)]

use slog::{o, Drain, Logger};

pub mod cache;
pub mod checksum;
pub mod client;
pub mod codec;
pub mod config;
pub mod constraint;
pub mod dispatcher;
pub mod dmr;
pub mod dsp;
pub mod error;
pub mod filter;
pub mod framer;
pub mod odometer;
pub mod protocol;
pub mod request;
pub mod serializer;
pub mod server;
pub mod writer;
pub mod xml;

pub use crate::error::{DapError, ErrorKind, Result};

/// The given logger, or one that forwards to the `log` crate.
pub(crate) fn logger_or_default(log: Option<&Logger>) -> Logger {
    log.cloned()
        .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()))
}
