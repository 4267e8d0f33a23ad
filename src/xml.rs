// Copyright 2020 Joyent, Inc.

//! Small XML helpers shared by the DMR, capabilities and error documents.

use std::fmt::Write;

use crate::protocol::XML_DOCUMENT_HEADER;

/// Longest message or context string carried in an error document.
const MAX_ERROR_TEXT: usize = 4096;

/// Entity-escapes text for use in element content or attribute values.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

fn clip(text: &str) -> &str {
    if text.len() <= MAX_ERROR_TEXT {
        return text;
    }
    let mut end = MAX_ERROR_TEXT;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Renders the error body used both out of band and inside a terminal
/// ERROR chunk. Empty context and extra elements are omitted.
pub fn error_document(
    http_code: u16,
    message: &str,
    context: Option<&str>,
    extra: Option<&str>,
) -> String {
    let mut doc = String::from(XML_DOCUMENT_HEADER);
    let _ = writeln!(doc, "<Error httpcode=\"{}\">", http_code);
    let _ = writeln!(doc, "<Message>{}</Message>", escape(clip(message)));
    if let Some(context) = context.filter(|c| !c.is_empty()) {
        let _ = writeln!(doc, "<Context>{}</Context>", escape(clip(context)));
    }
    if let Some(extra) = extra.filter(|e| !e.is_empty()) {
        let _ = writeln!(
            doc,
            "<OtherInformation>{}</OtherInformation>",
            escape(clip(extra))
        );
    }
    doc.push_str("</Error>\n");
    doc
}
