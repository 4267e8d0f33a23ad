// Copyright 2020 Joyent, Inc.

//! This module provides the interface for fetching DAP4 responses.
//!
//! `send` writes a request for one target; `receive` reads the response
//! head and then either decodes the chunk stream, handing each chunk to a
//! caller-supplied handler, or collects an unframed document body.

use std::io::{Error, ErrorKind};

use futures::StreamExt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_util::codec::FramedRead;

use crate::protocol::{Chunk, ChunkCodec};
use crate::request::{DATA_CONTENT_TYPE, DMR_CONTENT_TYPE};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub content_type: String,
}

impl ResponseHead {
    /// Whether the body is a chunk stream rather than a plain document.
    pub fn is_chunked(&self) -> bool {
        self.content_type == DATA_CONTENT_TYPE || self.content_type == DMR_CONTENT_TYPE
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ResponseBody {
    Chunks(Vec<Chunk>),
    Document(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    pub head: ResponseHead,
    pub body: ResponseBody,
}

pub async fn send(target: &str, stream: &mut TcpStream) -> Result<usize, Error> {
    let request = format!(
        "GET {} HTTP/1.1\r\nAccept: */*\r\nConnection: close\r\n\r\n",
        target
    );
    stream.write_all(request.as_bytes()).await?;
    Ok(request.len())
}

/// Reads one response. Chunks of a chunked body are passed to
/// `chunk_handler` as they arrive and the returned document is empty; any
/// other body is returned whole.
pub async fn receive<F>(
    stream: &mut TcpStream,
    mut chunk_handler: F,
) -> Result<(ResponseHead, String), Error>
where
    F: FnMut(&Chunk) -> Result<(), Error>,
{
    let mut reader = BufReader::new(stream);
    let head = read_head(&mut reader).await?;

    if !head.is_chunked() {
        let mut body = String::new();
        reader.read_to_string(&mut body).await?;
        return Ok((head, body));
    }

    let mut chunks = FramedRead::new(reader, ChunkCodec::new());
    let mut terminated = false;
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        chunk_handler(&chunk)?;
        if chunk.is_end() {
            terminated = true;
            break;
        }
    }
    if !terminated {
        return Err(Error::new(
            ErrorKind::UnexpectedEof,
            "response ended without a terminal chunk",
        ));
    }
    Ok((head, String::new()))
}

/// Sends a request for `target` and collects the whole response.
pub async fn fetch(target: &str, stream: &mut TcpStream) -> Result<Response, Error> {
    send(target, stream).await?;
    let mut chunks = Vec::new();
    let (head, document) = receive(stream, |chunk| {
        chunks.push(chunk.clone());
        Ok(())
    })
    .await?;
    let body = if head.is_chunked() {
        ResponseBody::Chunks(chunks)
    } else {
        ResponseBody::Document(document)
    };
    Ok(Response { head, body })
}

async fn read_head<R>(reader: &mut R) -> Result<ResponseHead, Error>
where
    R: AsyncBufRead + Unpin,
{
    let invalid = |msg: String| Error::new(ErrorKind::InvalidData, msg);

    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Err(Error::new(ErrorKind::UnexpectedEof, "no response"));
    }
    let status = line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| invalid(format!("malformed status line: {}", line.trim_end())))?;

    let mut content_type = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        let header = line.trim_end();
        if n == 0 || header.is_empty() {
            break;
        }
        if let Some(i) = header.find(':') {
            if header[..i].eq_ignore_ascii_case("content-type") {
                content_type = header[i + 1..].trim().to_string();
            }
        }
    }

    Ok(ResponseHead {
        status,
        content_type,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    use tokio_test::block_on;

    use crate::request::ERROR_CONTENT_TYPE;

    #[test]
    fn parses_response_head() {
        let raw = b"HTTP/1.1 404 Not Found\r\n\
                    content-type: application/vnd.opendap.dap4.error+xml\r\n\r\nbody";
        let mut reader = &raw[..];
        let head = block_on(read_head(&mut reader)).unwrap();
        assert_eq!(head.status, 404);
        assert_eq!(head.content_type, ERROR_CONTENT_TYPE);
        assert!(!head.is_chunked());
        assert_eq!(reader, &b"body"[..]);
    }

    #[test]
    fn rejects_bad_status_line() {
        let raw = b"garbage\r\n\r\n";
        let mut reader = &raw[..];
        let err = block_on(read_head(&mut reader)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }
}
