// Copyright 2020 Joyent, Inc.

//! Typed writes on top of a [`ChunkFramer`], with per-variable checksums.

use std::io::Write;

use crate::checksum::ChecksumTracker;
use crate::codec::{self, AtomicType, Endian, Values};
use crate::error::{DapError, Result};
use crate::framer::ChunkFramer;

pub struct SerialWriter<'a, W: Write> {
    framer: &'a mut ChunkFramer<W>,
    checksum: ChecksumTracker,
    depth: usize,
    last_checksum: Option<u32>,
    scratch: Vec<u8>,
}

impl<'a, W: Write> SerialWriter<'a, W> {
    pub fn new(framer: &'a mut ChunkFramer<W>, checksum: bool) -> SerialWriter<'a, W> {
        SerialWriter {
            framer,
            checksum: ChecksumTracker::new(checksum),
            depth: 0,
            last_checksum: None,
            scratch: Vec::new(),
        }
    }

    pub fn endian(&self) -> Endian {
        self.framer.endian()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Trailer written for the most recent top-level variable.
    pub fn last_checksum(&self) -> Option<u32> {
        self.last_checksum
    }

    pub fn start_variable(&mut self) {
        if self.depth == 0 {
            self.checksum.reset();
        }
        self.depth += 1;
    }

    /// Closes the innermost open variable; closing a top-level one appends
    /// its checksum when checksumming is on.
    pub fn end_variable(&mut self) -> Result<()> {
        if self.depth == 0 {
            return Err(DapError::sequence("end_variable without start_variable"));
        }
        self.depth -= 1;
        if self.depth == 0 && self.checksum.enabled() {
            let crc = self.checksum.digest();
            let trailer = codec::encode_checksum(crc, self.endian());
            // the trailer is not part of its own checksum
            self.framer.write(&trailer)?;
            self.last_checksum = Some(crc);
        }
        Ok(())
    }

    /// Record count of one sequence instance.
    pub fn write_count(&mut self, count: u64) -> Result<()> {
        self.scratch.clear();
        codec::encode_count(count, self.endian(), &mut self.scratch);
        self.emit()
    }

    pub fn write_atomic_array(&mut self, wire: AtomicType, values: &Values) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        self.scratch.clear();
        codec::encode_values(values, wire, self.endian(), &mut self.scratch)?;
        self.emit()
    }

    fn emit(&mut self) -> Result<()> {
        self.framer.write(&self.scratch)?;
        self.checksum.update(&self.scratch);
        Ok(())
    }
}
