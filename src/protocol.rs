// Copyright 2020 Joyent, Inc.

//! Chunk wire format.
//!
//! Every chunk starts with a 4-byte big-endian header word laid out as
//! `(flags << 24) | length`, followed by `length` payload bytes. The flags
//! byte combines:
//!
//! * `CHUNK_DATA`          0x00  plain data payload
//! * `CHUNK_END`           0x01  last chunk of the stream
//! * `CHUNK_ERROR`         0x02  payload is an XML error document
//! * `CHUNK_LITTLE_ENDIAN` 0x04  data payload is little-endian
//! * `CHUNK_METADATA`      0x08  payload is the DMR document
//!
//! The header word itself is big-endian regardless of the payload order.

use std::io::{Error, ErrorKind};
use std::{fmt, io};

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::Endian;

pub const CHUNK_DATA: u8 = 0x00;
pub const CHUNK_END: u8 = 0x01;
pub const CHUNK_ERROR: u8 = 0x02;
pub const CHUNK_LITTLE_ENDIAN: u8 = 0x04;
pub const CHUNK_METADATA: u8 = 0x08;

const CHUNK_FLAGS_KNOWN: u8 =
    CHUNK_END | CHUNK_ERROR | CHUNK_LITTLE_ENDIAN | CHUNK_METADATA;

pub const CHUNK_HEADER_SZ: usize = 4;
pub const MAX_CHUNK_SIZE: usize = 0x00FF_FFFF;

/// Prefix of every METADATA and ERROR payload.
pub const XML_DOCUMENT_HEADER: &str =
    "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkHeader {
    pub flags: u8,
    pub len: usize,
}

impl ChunkHeader {
    pub fn new(flags: u8, len: usize) -> ChunkHeader {
        ChunkHeader { flags, len }
    }

    pub fn encode(&self) -> [u8; CHUNK_HEADER_SZ] {
        let word = ((self.flags as u32) << 24) | (self.len as u32 & 0x00FF_FFFF);
        let mut buf = [0u8; CHUNK_HEADER_SZ];
        BigEndian::write_u32(&mut buf, word);
        buf
    }

    pub fn parse(buf: &[u8]) -> Result<ChunkHeader, io::Error> {
        if buf.len() < CHUNK_HEADER_SZ {
            let msg = "Unable to parse chunk header: not enough bytes";
            return Err(Error::new(ErrorKind::UnexpectedEof, msg));
        }
        let word = BigEndian::read_u32(&buf[..CHUNK_HEADER_SZ]);
        let flags = (word >> 24) as u8;
        if flags & !CHUNK_FLAGS_KNOWN != 0 {
            let msg = format!("Unknown chunk flags: {:#04x}", flags);
            return Err(Error::new(ErrorKind::InvalidData, msg));
        }
        Ok(ChunkHeader {
            flags,
            len: (word & 0x00FF_FFFF) as usize,
        })
    }
}

/// One decoded chunk.
#[derive(Clone, PartialEq, Eq)]
pub struct Chunk {
    pub flags: u8,
    pub payload: Bytes,
}

impl Chunk {
    pub fn data(payload: Bytes, endian: Endian) -> Chunk {
        Chunk {
            flags: CHUNK_DATA | endian_flag(endian),
            payload,
        }
    }

    pub fn end(endian: Endian) -> Chunk {
        Chunk {
            flags: CHUNK_END | endian_flag(endian),
            payload: Bytes::new(),
        }
    }

    pub fn is_end(&self) -> bool {
        self.flags & CHUNK_END != 0
    }

    pub fn is_error(&self) -> bool {
        self.flags & CHUNK_ERROR != 0
    }

    pub fn is_metadata(&self) -> bool {
        self.flags & CHUNK_METADATA != 0
    }

    pub fn endian(&self) -> Endian {
        if self.flags & CHUNK_LITTLE_ENDIAN != 0 {
            Endian::Little
        } else {
            Endian::Big
        }
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("flags", &format_args!("{:#04x}", self.flags))
            .field("len", &self.payload.len())
            .finish()
    }
}

pub(crate) fn endian_flag(endian: Endian) -> u8 {
    match endian {
        Endian::Little => CHUNK_LITTLE_ENDIAN,
        Endian::Big => 0,
    }
}

/// Appends one framed chunk to `buf`.
pub fn encode_chunk(flags: u8, payload: &[u8], buf: &mut BytesMut) -> Result<(), io::Error> {
    if payload.len() > MAX_CHUNK_SIZE {
        let msg = format!(
            "chunk payload of {} bytes exceeds maximum of {}",
            payload.len(),
            MAX_CHUNK_SIZE
        );
        return Err(Error::new(ErrorKind::InvalidInput, msg));
    }
    buf.reserve(CHUNK_HEADER_SZ + payload.len());
    buf.put_slice(&ChunkHeader::new(flags, payload.len()).encode());
    buf.put_slice(payload);
    Ok(())
}

/// Streaming codec for the chunk format, used by clients reading a response
/// body and by anything relaying pre-built chunks.
#[derive(Default)]
pub struct ChunkCodec {
    done: bool,
}

impl ChunkCodec {
    pub fn new() -> ChunkCodec {
        ChunkCodec::default()
    }
}

impl Decoder for ChunkCodec {
    type Item = Chunk;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Chunk>, io::Error> {
        if self.done {
            if buf.is_empty() {
                return Ok(None);
            }
            let msg = "Unexpected bytes after terminal chunk";
            return Err(Error::new(ErrorKind::InvalidData, msg));
        }
        if buf.len() < CHUNK_HEADER_SZ {
            return Ok(None);
        }
        let header = ChunkHeader::parse(&buf[..])?;
        if buf.len() < CHUNK_HEADER_SZ + header.len {
            buf.reserve(CHUNK_HEADER_SZ + header.len - buf.len());
            return Ok(None);
        }
        buf.advance(CHUNK_HEADER_SZ);
        let payload = buf.split_to(header.len).freeze();
        let chunk = Chunk {
            flags: header.flags,
            payload,
        };
        if chunk.is_end() {
            self.done = true;
        }
        Ok(Some(chunk))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Chunk>, io::Error> {
        match self.decode(buf)? {
            Some(chunk) => Ok(Some(chunk)),
            None if buf.is_empty() => Ok(None),
            None => {
                let msg = "Stream ended inside a chunk";
                Err(Error::new(ErrorKind::UnexpectedEof, msg))
            }
        }
    }
}

impl Encoder<Chunk> for ChunkCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Chunk, buf: &mut BytesMut) -> Result<(), io::Error> {
        encode_chunk(item.flags, &item.payload, buf)
    }
}

/// Decodes a complete response body. The body must end with exactly one
/// terminal chunk and carry nothing after it.
pub fn decode_stream(body: &[u8]) -> Result<Vec<Chunk>, io::Error> {
    let mut codec = ChunkCodec::new();
    let mut buf = BytesMut::from(body);
    let mut chunks = Vec::new();
    while let Some(chunk) = codec.decode_eof(&mut buf)? {
        chunks.push(chunk);
    }
    match chunks.last() {
        Some(last) if last.is_end() => Ok(chunks),
        _ => {
            let msg = "Stream is missing its terminal chunk";
            Err(Error::new(ErrorKind::UnexpectedEof, msg))
        }
    }
}
