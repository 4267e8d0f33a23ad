// Copyright 2020 Joyent, Inc.

//! Turns one parsed request into one response.
//!
//! A request is classified by mode. Capabilities requests are answered with
//! an unframed `DatasetServices` document and never touch the handle cache.
//! Metadata and data requests acquire a handle, compile the constraint and
//! stream a chunked response. A failure is reported out of band (status
//! code plus an XML error body) when nothing has reached the sink yet, and
//! as a terminal ERROR chunk otherwise.

use std::fmt::Write as _;
use std::io::{self, Write};
use std::sync::Arc;

use slog::{debug, error, info, o, warn, Logger};
use tokio_util::sync::CancellationToken;

use crate::cache::{HandleCache, Lease};
use crate::config::DapConfig;
use crate::constraint::ConstraintView;
use crate::dmr::render_dmr;
use crate::dsp::DspRegistry;
use crate::error::{DapError, Result};
use crate::framer::{ChunkFramer, FramerMode};
use crate::protocol::XML_DOCUMENT_HEADER;
use crate::request::{
    DapRequest, RequestMode, DATA_CONTENT_TYPE, DMR_CONTENT_TYPE, ERROR_CONTENT_TYPE,
};
use crate::serializer::serialize;
use crate::writer::SerialWriter;
use crate::xml;

/// Where a response goes. `begin` is called exactly once, before the first
/// body byte, with the status and content type of the response.
pub trait ResponseSink: Write {
    fn begin(&mut self, status: u16, content_type: &str) -> io::Result<()>;
}

/// How a request ended.
#[derive(Debug)]
pub enum Completion {
    Complete,
    /// The failure was delivered to the client, out of band or as an error
    /// chunk.
    Reported(DapError),
    /// The sink itself failed; the client saw a truncated response.
    Aborted(DapError),
}

impl Completion {
    pub fn is_complete(&self) -> bool {
        match self {
            Completion::Complete => true,
            _ => false,
        }
    }

    pub fn error(&self) -> Option<&DapError> {
        match self {
            Completion::Complete => None,
            Completion::Reported(e) | Completion::Aborted(e) => Some(e),
        }
    }
}

/// Starts a successful response on the first body write, and remembers
/// whether the underlying sink ever failed.
struct Committing<'a> {
    sink: &'a mut dyn ResponseSink,
    content_type: &'static str,
    begun: bool,
    failed: bool,
}

impl<'a> Committing<'a> {
    fn new(sink: &'a mut dyn ResponseSink, content_type: &'static str) -> Committing<'a> {
        Committing {
            sink,
            content_type,
            begun: false,
            failed: false,
        }
    }

    fn track<T>(&mut self, result: io::Result<T>) -> io::Result<T> {
        if result.is_err() {
            self.failed = true;
        }
        result
    }
}

impl<'a> Write for Committing<'a> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.begun {
            self.begun = true;
            let result = self.sink.begin(200, self.content_type);
            self.track(result)?;
        }
        let result = self.sink.write(buf);
        self.track(result)
    }

    fn flush(&mut self) -> io::Result<()> {
        let result = self.sink.flush();
        self.track(result)
    }
}

pub struct RequestDispatcher {
    config: DapConfig,
    cache: HandleCache,
    log: Logger,
}

impl RequestDispatcher {
    pub fn new(
        registry: DspRegistry,
        config: DapConfig,
        log: Option<&Logger>,
    ) -> Result<RequestDispatcher> {
        config.validate()?;
        let log = crate::logger_or_default(log);
        let cache = HandleCache::new(registry, config.cache_capacity, Some(&log))?;
        Ok(RequestDispatcher { config, cache, log })
    }

    pub fn config(&self) -> &DapConfig {
        &self.config
    }

    pub fn cache(&self) -> &HandleCache {
        &self.cache
    }

    /// Parses `target` (path and query) and handles it. A target that does
    /// not parse is reported as a bad request before any handle is touched.
    pub fn handle_target(
        &self,
        target: &str,
        sink: &mut dyn ResponseSink,
        cancel: &CancellationToken,
    ) -> Completion {
        match DapRequest::parse(target) {
            Ok(request) => self.handle(&request, sink, cancel),
            Err(e) => {
                debug!(self.log, "rejected request"; "target" => target, "err" => %e);
                self.report(sink, e, target)
            }
        }
    }

    pub fn handle(
        &self,
        request: &DapRequest,
        sink: &mut dyn ResponseSink,
        cancel: &CancellationToken,
    ) -> Completion {
        let log = self.log.new(o!(
            "resource" => request.resource.clone(),
            "mode" => request.mode.extension(),
        ));
        debug!(log, "handling request"; "ce" => &request.constraint);

        let completion = match request.mode {
            RequestMode::Capabilities => self.capabilities(request, sink),
            RequestMode::Metadata | RequestMode::Data => self.chunked(request, sink, cancel, &log),
        };

        match &completion {
            Completion::Complete => debug!(log, "request complete"),
            Completion::Reported(e) => info!(log, "request failed"; "err" => %e),
            Completion::Aborted(e) => error!(log, "response aborted"; "err" => %e),
        }
        completion
    }

    fn capabilities(&self, request: &DapRequest, sink: &mut dyn ResponseSink) -> Completion {
        let body = capabilities_document(&request.resource, &self.config.server_name);
        let result = sink
            .begin(200, RequestMode::Capabilities.content_type())
            .and_then(|_| sink.write_all(body.as_bytes()))
            .and_then(|_| sink.flush());
        match result {
            Ok(()) => Completion::Complete,
            Err(e) => Completion::Aborted(e.into()),
        }
    }

    fn chunked(
        &self,
        request: &DapRequest,
        sink: &mut dyn ResponseSink,
        cancel: &CancellationToken,
        log: &Logger,
    ) -> Completion {
        let context = format!("{}.{}", request.resource, request.mode);
        let (mode, content_type) = match request.mode {
            RequestMode::Data => (FramerMode::Data, DATA_CONTENT_TYPE),
            _ => (FramerMode::MetadataOnly, DMR_CONTENT_TYPE),
        };

        let prepared = self.cache.acquire(&request.resource).and_then(|lease| {
            let view = ConstraintView::compile(&request.constraint, lease.dmr())?;
            Ok((lease, view))
        });
        let (lease, view) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => return self.report(sink, e, &context),
        };

        let endian = request
            .byte_order
            .unwrap_or_else(|| self.config.byte_order.endian());
        let framer = ChunkFramer::new(
            Committing::new(&mut *sink, content_type),
            mode,
            endian,
            self.config.chunk_size,
        );
        let mut framer = match framer {
            Ok(framer) => framer.with_write_limit(self.config.write_limit),
            Err(e) => return self.report(sink, e, &context),
        };

        let checksum = request.checksum.unwrap_or(self.config.checksum);
        let err = match stream(&mut framer, &lease, &view, checksum, cancel) {
            Ok(()) => {
                debug!(log, "response streamed";
                    "bytes" => framer.bytes_written(),
                    "chunks" => framer.data_chunks());
                return Completion::Complete;
            }
            Err(e) => e,
        };

        if framer.get_ref().failed {
            return Completion::Aborted(err);
        }
        if !framer.is_committed() {
            drop(framer);
            return self.report(sink, err, &context);
        }

        warn!(log, "failing response after commit"; "err" => %err);
        let kind = err.kind().to_string();
        match framer.write_error(err.http_code(), &err.to_string(), Some(&context), Some(&kind)) {
            Ok(()) => Completion::Reported(err),
            Err(e) => {
                error!(log, "could not write error chunk"; "err" => %e);
                Completion::Aborted(err)
            }
        }
    }

    /// Sends `err` as a complete out-of-band response.
    fn report(&self, sink: &mut dyn ResponseSink, err: DapError, context: &str) -> Completion {
        let kind = err.kind().to_string();
        let body = xml::error_document(
            err.http_code(),
            &err.to_string(),
            Some(context),
            Some(&kind),
        );
        let result = sink
            .begin(err.http_code(), ERROR_CONTENT_TYPE)
            .and_then(|_| sink.write_all(body.as_bytes()))
            .and_then(|_| sink.flush());
        match result {
            Ok(()) => Completion::Reported(err),
            Err(e) => {
                error!(self.log, "could not report error"; "err" => %err, "sink_err" => %e);
                Completion::Aborted(err)
            }
        }
    }
}

fn stream<W: Write>(
    framer: &mut ChunkFramer<W>,
    lease: &Lease,
    view: &ConstraintView,
    checksum: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    framer.write_metadata(&render_dmr(lease.dmr(), view))?;
    if framer.mode() == FramerMode::Data {
        let mut writer = SerialWriter::new(framer, checksum);
        serialize(&**lease, view, &mut writer, cancel)?;
    }
    framer.close()
}

/// The capabilities document for `resource`, linking its metadata and data
/// endpoints.
pub fn capabilities_document(resource: &str, server_name: &str) -> String {
    let name = xml::escape(resource);
    let mut doc = String::from(XML_DOCUMENT_HEADER);
    let _ = writeln!(
        doc,
        "<DatasetServices xmlns=\"http://xml.opendap.org/ns/DAP/4.0/dataset-services#\">"
    );
    let _ = writeln!(doc, "<DapVersion>4.0</DapVersion>");
    let _ = writeln!(
        doc,
        "<ServerSoftwareVersion>{}</ServerSoftwareVersion>",
        xml::escape(server_name)
    );
    for (title, role, content_type, href) in &[
        (
            "DAP4 Dataset Metadata",
            "dataset-metadata",
            DMR_CONTENT_TYPE,
            format!("{}.dmr.xml", name),
        ),
        ("DAP4 Data", "data", DATA_CONTENT_TYPE, format!("{}.dap", name)),
    ] {
        let _ = writeln!(
            doc,
            "<Service title=\"{}\" role=\"http://services.opendap.org/dap4/{}\">",
            title, role
        );
        let _ = writeln!(doc, "<link type=\"{}\" href=\"{}\"/>", content_type, href);
        let _ = writeln!(doc, "</Service>");
    }
    doc.push_str("</DatasetServices>\n");
    doc
}

/// A response held in memory, for callers that want the whole body at
/// once. Optionally fails every write past `fail_after` body bytes.
#[derive(Debug, Default)]
pub struct MemoryResponse {
    pub status: Option<u16>,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    fail_after: Option<usize>,
}

impl MemoryResponse {
    pub fn new() -> MemoryResponse {
        MemoryResponse::default()
    }

    pub fn failing_after(limit: usize) -> MemoryResponse {
        MemoryResponse {
            fail_after: Some(limit),
            ..MemoryResponse::default()
        }
    }
}

impl Write for MemoryResponse {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(limit) = self.fail_after {
            if self.body.len() + buf.len() > limit {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "client went away"));
            }
        }
        self.body.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ResponseSink for MemoryResponse {
    fn begin(&mut self, status: u16, content_type: &str) -> io::Result<()> {
        if self.status.is_some() {
            return Err(io::Error::new(io::ErrorKind::Other, "response already begun"));
        }
        self.status = Some(status);
        self.content_type = Some(content_type.to_string());
        Ok(())
    }
}

/// Shared handle to a dispatcher, as held by each server task.
pub type SharedDispatcher = Arc<RequestDispatcher>;
