// Copyright 2020 Joyent, Inc.

//! This module provides the interface for serving DAP4 requests over TCP.
//!
//! Each connection carries one `GET` request. The request is dispatched on
//! a blocking worker thread, which streams the response back to the
//! connection task through a bounded channel. If the client goes away the
//! dispatch is cancelled before its next top-level variable.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use dap4_encoder::config::DapConfig;
//! # use dap4_encoder::dispatcher::RequestDispatcher;
//! # use dap4_encoder::dsp::DspRegistry;
//! # use dap4_encoder::server;
//! # use tokio::net::TcpListener;
//! # async fn run() -> std::io::Result<()> {
//! let dispatcher = Arc::new(
//!     RequestDispatcher::new(DspRegistry::new(), DapConfig::default(), None)
//!         .expect("valid configuration"),
//! );
//! let listener = TcpListener::bind("127.0.0.1:8080").await?;
//! loop {
//!     let (socket, _) = listener.accept().await?;
//!     let dispatcher = Arc::clone(&dispatcher);
//!     tokio::spawn(async move {
//!         server::make_task(socket, dispatcher, None).await;
//!     });
//! }
//! # }
//! ```

use std::io::{self, Error, ErrorKind, Write};

use bytes::Bytes;
use slog::{debug, error, info, o, Logger};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task;
use tokio_util::sync::CancellationToken;

use crate::dispatcher::{Completion, ResponseSink, SharedDispatcher};
use crate::request::ERROR_CONTENT_TYPE;
use crate::xml;

/// Response pieces in flight between the dispatch thread and the
/// connection task.
const CHANNEL_DEPTH: usize = 16;

/// Longest request head accepted.
const MAX_HEAD_BYTES: usize = 16 * 1024;

enum Frame {
    Head { status: u16, content_type: String },
    Body(Bytes),
}

/// A [`ResponseSink`] that hands everything to the connection task. Writes
/// block while the channel is full and fail once the task has stopped
/// listening.
struct ChannelResponse {
    tx: mpsc::Sender<Frame>,
}

fn gone() -> Error {
    Error::new(ErrorKind::BrokenPipe, "connection closed")
}

impl Write for ChannelResponse {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .blocking_send(Frame::Body(Bytes::copy_from_slice(buf)))
            .map_err(|_| gone())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ResponseSink for ChannelResponse {
    fn begin(&mut self, status: u16, content_type: &str) -> io::Result<()> {
        self.tx
            .blocking_send(Frame::Head {
                status,
                content_type: content_type.to_string(),
            })
            .map_err(|_| gone())
    }
}

/// Serves the single request carried by `socket`.
pub async fn make_task(socket: TcpStream, dispatcher: SharedDispatcher, log: Option<&Logger>) {
    let log = crate::logger_or_default(log);
    let peer = socket
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| String::from("unknown"));
    let log = log.new(o!("peer" => peer));
    if let Err(e) = serve(socket, dispatcher, &log).await {
        error!(log, "failed to process connection"; "err" => %e);
    }
}

async fn serve(socket: TcpStream, dispatcher: SharedDispatcher, log: &Logger) -> io::Result<()> {
    let (read_half, mut write_half) = socket.into_split();
    let mut reader = BufReader::new(read_half);

    let target = match read_request_target(&mut reader).await {
        Ok(target) => target,
        Err(e) if e.kind() == ErrorKind::InvalidData => {
            info!(log, "rejecting malformed request"; "err" => %e);
            let body = xml::error_document(400, &e.to_string(), None, None);
            write_head(&mut write_half, 400, ERROR_CONTENT_TYPE).await?;
            write_half.write_all(body.as_bytes()).await?;
            return write_half.shutdown().await;
        }
        Err(e) => return Err(e),
    };
    debug!(log, "received request"; "target" => &target);

    let (tx, mut rx) = mpsc::channel(CHANNEL_DEPTH);
    let cancel = CancellationToken::new();
    let dispatch = {
        let cancel = cancel.clone();
        let target = target.clone();
        task::spawn_blocking(move || {
            let mut sink = ChannelResponse { tx };
            dispatcher.handle_target(&target, &mut sink, &cancel)
        })
    };

    let mut write_failure = None;
    while let Some(frame) = rx.recv().await {
        let result = match frame {
            Frame::Head {
                status,
                content_type,
            } => write_head(&mut write_half, status, &content_type).await,
            Frame::Body(bytes) => write_half.write_all(&bytes).await,
        };
        if let Err(e) = result {
            cancel.cancel();
            write_failure = Some(e);
            break;
        }
    }
    // unblocks a dispatch still waiting to send
    drop(rx);

    let completion = dispatch
        .await
        .map_err(|e| Error::new(ErrorKind::Other, e.to_string()))?;
    match completion {
        Completion::Complete => debug!(log, "request served"; "target" => &target),
        Completion::Reported(e) => debug!(log, "request failed"; "target" => &target, "err" => %e),
        Completion::Aborted(e) => info!(log, "response aborted"; "target" => &target, "err" => %e),
    }

    match write_failure {
        Some(e) => Err(e),
        None => write_half.shutdown().await,
    }
}

/// Reads the request head and returns the target of its `GET` line.
/// Malformed heads are `InvalidData` errors.
async fn read_request_target<R>(reader: &mut R) -> io::Result<String>
where
    R: AsyncBufRead + Unpin,
{
    let invalid = |msg: &str| Error::new(ErrorKind::InvalidData, msg.to_string());

    let mut line = String::new();
    let mut total = reader.read_line(&mut line).await?;
    if total == 0 {
        return Err(Error::new(ErrorKind::UnexpectedEof, "connection closed before request"));
    }
    let mut parts = line.split_whitespace();
    let target = match (parts.next(), parts.next(), parts.next()) {
        (Some("GET"), Some(target), Some(version)) if version.starts_with("HTTP/1.") => {
            target.to_string()
        }
        (Some(_), Some(_), Some(_)) => return Err(invalid("only GET requests are supported")),
        _ => return Err(invalid("malformed request line")),
    };

    // skip headers up to the blank line
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        total += n;
        if total > MAX_HEAD_BYTES {
            return Err(invalid("request head too large"));
        }
        if n == 0 || line == "\r\n" || line == "\n" {
            break;
        }
    }
    Ok(target)
}

async fn write_head<W>(writer: &mut W, status: u16, content_type: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nConnection: close\r\n\r\n",
        status,
        reason(status),
        content_type
    );
    writer.write_all(head.as_bytes()).await
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        413 => "Payload Too Large",
        _ => "Internal Server Error",
    }
}
