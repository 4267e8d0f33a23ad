// Copyright 2020 Joyent, Inc.

//! Request addressing: `<resource>.<mode>[.<format>][?query]`.
//!
//! The trailing extensions of the path pick the response mode (`.dap`,
//! `.dmr` or `.dsr`, checked in that order) and an optional response format.
//! Recognized query parameters are `dap4.ce`, `dap4.checksum` and
//! `dap4.byteorder`; anything else is ignored.

use std::fmt;

use crate::codec::Endian;
use crate::error::{DapError, Result};

pub const DMR_CONTENT_TYPE: &str = "application/vnd.opendap.dap4.dataset-metadata+xml";
pub const DATA_CONTENT_TYPE: &str = "application/vnd.opendap.dap4.data";
pub const DSR_CONTENT_TYPE: &str = "application/vnd.opendap.dap4.dataset-services+xml";
pub const ERROR_CONTENT_TYPE: &str = "application/vnd.opendap.dap4.error+xml";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestMode {
    Data,
    Metadata,
    Capabilities,
}

impl RequestMode {
    /// Precedence order used when classifying a path.
    const ALL: [RequestMode; 3] = [
        RequestMode::Data,
        RequestMode::Metadata,
        RequestMode::Capabilities,
    ];

    pub fn extension(self) -> &'static str {
        match self {
            RequestMode::Data => "dap",
            RequestMode::Metadata => "dmr",
            RequestMode::Capabilities => "dsr",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            RequestMode::Data => DATA_CONTENT_TYPE,
            RequestMode::Metadata => DMR_CONTENT_TYPE,
            RequestMode::Capabilities => DSR_CONTENT_TYPE,
        }
    }

    /// The one response format this mode can be produced in.
    pub fn native_format(self) -> ResponseFormat {
        match self {
            RequestMode::Data => ResponseFormat::Raw,
            RequestMode::Metadata | RequestMode::Capabilities => ResponseFormat::Xml,
        }
    }

    fn from_extension(ext: &str) -> Option<RequestMode> {
        RequestMode::ALL.iter().copied().find(|m| m.extension() == ext)
    }
}

impl fmt::Display for RequestMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseFormat {
    Xml,
    Raw,
    Html,
    Text,
    NetCdf,
    Json,
    Csv,
}

impl ResponseFormat {
    fn from_extension(ext: &str) -> Option<ResponseFormat> {
        match ext {
            "xml" => Some(ResponseFormat::Xml),
            "raw" => Some(ResponseFormat::Raw),
            "html" => Some(ResponseFormat::Html),
            "txt" => Some(ResponseFormat::Text),
            "nc" => Some(ResponseFormat::NetCdf),
            "json" => Some(ResponseFormat::Json),
            "csv" => Some(ResponseFormat::Csv),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ResponseFormat::Xml => "xml",
            ResponseFormat::Raw => "raw",
            ResponseFormat::Html => "html",
            ResponseFormat::Text => "txt",
            ResponseFormat::NetCdf => "nc",
            ResponseFormat::Json => "json",
            ResponseFormat::Csv => "csv",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DapRequest {
    pub resource: String,
    pub mode: RequestMode,
    pub format: Option<ResponseFormat>,
    pub constraint: String,
    /// `None` leaves the choice to the server configuration.
    pub checksum: Option<bool>,
    pub byte_order: Option<Endian>,
}

impl DapRequest {
    pub fn new(resource: &str, mode: RequestMode) -> DapRequest {
        DapRequest {
            resource: resource.to_string(),
            mode,
            format: None,
            constraint: String::new(),
            checksum: None,
            byte_order: None,
        }
    }

    pub fn with_constraint(mut self, constraint: &str) -> DapRequest {
        self.constraint = constraint.to_string();
        self
    }

    pub fn with_checksum(mut self, checksum: bool) -> DapRequest {
        self.checksum = Some(checksum);
        self
    }

    pub fn with_byte_order(mut self, endian: Endian) -> DapRequest {
        self.byte_order = Some(endian);
        self
    }

    /// Parses a request target such as `/data/foo.nc.dap?dap4.ce=x[0:2]`.
    pub fn parse(target: &str) -> Result<DapRequest> {
        let (path, query) = match target.find('?') {
            Some(i) => (&target[..i], &target[i + 1..]),
            None => (target, ""),
        };
        let path = percent_decode(path, false)?;
        let path = path.trim_start_matches('/');

        let mut segments: Vec<&str> = path.split('.').collect();
        let mut formats = Vec::new();
        while segments.len() > 1 {
            let ext = segments[segments.len() - 1];
            if RequestMode::from_extension(ext).is_some() {
                break;
            }
            match ResponseFormat::from_extension(ext) {
                Some(format) => {
                    formats.push(format);
                    segments.pop();
                }
                None => break,
            }
        }

        let mode = match segments.last().and_then(|ext| {
            if segments.len() > 1 {
                RequestMode::from_extension(ext)
            } else {
                None
            }
        }) {
            Some(mode) => mode,
            None => {
                return Err(DapError::bad_request(format!(
                    "no response mode extension (.dap, .dmr or .dsr) in {}",
                    path
                )))
            }
        };
        segments.pop();

        if formats.len() > 1 {
            return Err(DapError::bad_request(format!(
                "ambiguous response format: {}",
                formats
                    .iter()
                    .rev()
                    .map(|f| f.extension())
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }
        let format = formats.pop();
        if let Some(format) = format {
            if format != mode.native_format() {
                return Err(DapError::Forbidden(format!(
                    "cannot produce a {} response as {}",
                    mode,
                    format.extension()
                )));
            }
        }

        let resource = segments.join(".");
        if resource.is_empty() {
            return Err(DapError::bad_request("empty resource path"));
        }

        let mut request = DapRequest::new(&resource, mode);
        request.format = format;
        for (key, value) in parse_query(query)? {
            match key.as_str() {
                "dap4.ce" => request.constraint = value,
                "dap4.checksum" => request.checksum = Some(parse_flag(&value)?),
                "dap4.byteorder" => request.byte_order = Some(value.parse::<Endian>()?),
                _ => (),
            }
        }
        Ok(request)
    }
}

fn parse_flag(value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(DapError::bad_request(format!(
            "dap4.checksum must be true or false, not {}",
            value
        ))),
    }
}

/// Splits a query string into decoded key/value pairs. A key without `=`
/// has an empty value.
pub fn parse_query(query: &str) -> Result<Vec<(String, String)>> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = match pair.find('=') {
                Some(i) => (&pair[..i], &pair[i + 1..]),
                None => (pair, ""),
            };
            Ok((percent_decode(key, true)?, percent_decode(value, true)?))
        })
        .collect()
}

/// Decodes `%XX` escapes, and `+` as a space when `plus_as_space` is set.
pub fn percent_decode(input: &str, plus_as_space: bool) -> Result<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes
                    .get(i + 1..i + 3)
                    .and_then(|h| std::str::from_utf8(h).ok())
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                    .ok_or_else(|| {
                        DapError::bad_request(format!("bad percent escape in {}", input))
                    })?;
                out.push(hex);
                i += 3;
            }
            b'+' if plus_as_space => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out)
        .map_err(|_| DapError::bad_request(format!("{} does not decode to UTF-8", input)))
}
