// Copyright 2020 Joyent, Inc.

//! Turns logical writes into a legal chunk stream.
//!
//! A framer starts in `Initial`, accepts one metadata document, then (in data
//! mode) any number of data writes, and ends with exactly one terminal chunk:
//! a zero-length END chunk from `close`, or an ERROR|END chunk from
//! `write_error`. Framed output is staged inside the framer until the first
//! full data chunk or the terminal chunk, so an error raised before then
//! replaces everything the client would otherwise have seen.

use std::io::Write;

use bytes::BytesMut;

use crate::codec::Endian;
use crate::error::{DapError, Result};
use crate::protocol::{
    encode_chunk, endian_flag, CHUNK_DATA, CHUNK_END, CHUNK_ERROR,
    CHUNK_METADATA, MAX_CHUNK_SIZE, XML_DOCUMENT_HEADER,
};
use crate::xml;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FramerMode {
    MetadataOnly,
    Data,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FramerState {
    Initial,
    MetadataSent,
    Data,
    End,
    Error,
}

impl FramerState {
    pub fn is_terminal(self) -> bool {
        self == FramerState::End || self == FramerState::Error
    }
}

pub struct ChunkFramer<W: Write> {
    sink: W,
    mode: FramerMode,
    state: FramerState,
    endian: Endian,
    chunk_size: usize,
    write_limit: Option<u64>,
    /// Payload bytes accepted so far, metadata included.
    written: u64,
    /// Partially filled data chunk payload.
    buffer: BytesMut,
    /// Framed chunks not yet handed to the sink.
    staged: BytesMut,
    committed: bool,
    data_chunks: u64,
}

impl<W: Write> ChunkFramer<W> {
    pub fn new(
        sink: W,
        mode: FramerMode,
        endian: Endian,
        chunk_size: usize,
    ) -> Result<ChunkFramer<W>> {
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(DapError::internal(format!(
                "chunk size must be between 1 and {}, got {}",
                MAX_CHUNK_SIZE, chunk_size
            )));
        }
        Ok(ChunkFramer {
            sink,
            mode,
            state: FramerState::Initial,
            endian,
            chunk_size,
            write_limit: None,
            written: 0,
            buffer: BytesMut::with_capacity(chunk_size),
            staged: BytesMut::new(),
            committed: false,
            data_chunks: 0,
        })
    }

    pub fn with_write_limit(mut self, limit: Option<u64>) -> ChunkFramer<W> {
        self.write_limit = limit;
        self
    }

    pub fn state(&self) -> FramerState {
        self.state
    }

    pub fn mode(&self) -> FramerMode {
        self.mode
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    /// Whether any byte has been handed to the sink.
    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    pub fn data_chunks(&self) -> u64 {
        self.data_chunks
    }

    pub fn get_ref(&self) -> &W {
        &self.sink
    }

    pub fn into_inner(self) -> W {
        self.sink
    }

    /// Frames the DMR as the stream's single METADATA chunk.
    pub fn write_metadata(&mut self, document: &str) -> Result<()> {
        if self.state != FramerState::Initial {
            return Err(DapError::sequence(format!(
                "metadata written in state {:?}",
                self.state
            )));
        }
        let mut payload = String::with_capacity(XML_DOCUMENT_HEADER.len() + document.len() + 2);
        payload.push_str(XML_DOCUMENT_HEADER);
        payload.push_str(document);
        payload.push_str("\r\n");

        self.check_limit(payload.len())?;
        if payload.len() > MAX_CHUNK_SIZE {
            return Err(DapError::PayloadTooLarge {
                attempted: payload.len() as u64,
                limit: MAX_CHUNK_SIZE as u64,
            });
        }
        encode_chunk(CHUNK_METADATA, payload.as_bytes(), &mut self.staged)?;
        self.written += payload.len() as u64;

        match self.mode {
            FramerMode::Data => self.state = FramerState::MetadataSent,
            FramerMode::MetadataOnly => {
                encode_chunk(CHUNK_END | endian_flag(self.endian), &[], &mut self.staged)?;
                self.state = FramerState::End;
            }
        }
        Ok(())
    }

    /// Appends data payload bytes, flushing every full chunk.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        match (self.state, self.mode) {
            (FramerState::MetadataSent, _) | (FramerState::Data, _) => (),
            (FramerState::Initial, FramerMode::Data) => {
                return Err(DapError::sequence("data written before the metadata document"))
            }
            (FramerState::Initial, FramerMode::MetadataOnly) => {
                return Err(DapError::sequence("data written to a metadata-only response"))
            }
            (state, _) => {
                return Err(DapError::sequence(format!(
                    "data written after the stream ended ({:?})",
                    state
                )))
            }
        }
        if bytes.is_empty() {
            return Ok(());
        }
        self.check_limit(bytes.len())?;
        self.written += bytes.len() as u64;
        self.state = FramerState::Data;

        let mut rest = bytes;
        while !rest.is_empty() {
            let room = self.chunk_size - self.buffer.len();
            let take = room.min(rest.len());
            self.buffer.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.buffer.len() == self.chunk_size {
                self.flush_data()?;
                self.push_staged()?;
            }
        }
        Ok(())
    }

    /// Ends the stream with a single ERROR|END chunk. Anything not yet
    /// handed to the sink (including a partial data chunk) is dropped. A
    /// stream that already ended is left alone.
    pub fn write_error(
        &mut self,
        http_code: u16,
        message: &str,
        context: Option<&str>,
        extra: Option<&str>,
    ) -> Result<()> {
        if self.state.is_terminal() {
            return Ok(());
        }
        self.buffer.clear();
        self.staged.clear();
        let body = xml::error_document(http_code, message, context, extra);
        encode_chunk(CHUNK_ERROR | CHUNK_END, body.as_bytes(), &mut self.staged)?;
        self.state = FramerState::Error;
        self.push_staged()?;
        self.sink.flush()?;
        Ok(())
    }

    /// Flushes any partial chunk and writes the END chunk. Calling it again
    /// after the stream ended only pushes out what is still staged.
    pub fn close(&mut self) -> Result<()> {
        match self.state {
            FramerState::End | FramerState::Error => (),
            FramerState::Initial => {
                return Err(DapError::sequence("stream closed before the metadata document"))
            }
            FramerState::MetadataSent | FramerState::Data => {
                if !self.buffer.is_empty() {
                    self.flush_data()?;
                }
                encode_chunk(CHUNK_END | endian_flag(self.endian), &[], &mut self.staged)?;
                self.state = FramerState::End;
            }
        }
        self.push_staged()?;
        self.sink.flush()?;
        Ok(())
    }

    fn check_limit(&self, len: usize) -> Result<()> {
        if let Some(limit) = self.write_limit {
            let attempted = self.written + len as u64;
            if attempted > limit {
                return Err(DapError::PayloadTooLarge { attempted, limit });
            }
        }
        Ok(())
    }

    fn flush_data(&mut self) -> Result<()> {
        let flags = CHUNK_DATA | endian_flag(self.endian);
        encode_chunk(flags, &self.buffer, &mut self.staged)?;
        self.buffer.clear();
        self.data_chunks += 1;
        Ok(())
    }

    fn push_staged(&mut self) -> Result<()> {
        if self.staged.is_empty() {
            return Ok(());
        }
        self.committed = true;
        let result = self.sink.write_all(&self.staged);
        self.staged.clear();
        if let Err(e) = result {
            self.state = FramerState::Error;
            return Err(e.into());
        }
        Ok(())
    }
}
