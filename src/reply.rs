//! Reply builder for the control paths.
//!
//! Replies are accumulated into two segments, extra headers and body, and
//! only turned into wire bytes at finalization time. Buffer growth is
//! stepped: capacity is extended in fixed [`REPLY_SIZE_STEP`] increments,
//! and each append renders its arguments first so the exact size is known
//! before any copy. The finalized reply is transmitted with a single
//! write call.

use std::fmt;
use std::io::{self, Write};

/// Buffer growth increment for reply segments.
pub const REPLY_SIZE_STEP: usize = 256;

/// Value of the `Server:` header on every reply.
pub const SERVER_NAME: &str = "unicast-rs/0.1";

/// Methods advertised by the `Public:` header on RTSP replies.
const RTSP_PUBLIC: &str = "OPTIONS, DESCRIBE, SETUP, PLAY, TEARDOWN";

/// Reason phrase for the status codes the engine emits or defines.
fn status_text(code: u16) -> &'static str {
    match code {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not found",
        451 => "Parameter Not Understood",
        454 => "Session Not Found",
        461 => "Unsupported Transport",
        501 => "Not implemented",
        503 => "Too many clients",
        _ => "Unknown",
    }
}

/// Grow `buf` so it can hold `additional` more bytes, in
/// [`REPLY_SIZE_STEP`] increments.
fn reserve_stepped(buf: &mut Vec<u8>, additional: usize) {
    let needed = buf.len() + additional;
    if needed <= buf.capacity() {
        return;
    }
    let mut capacity = buf.capacity().max(REPLY_SIZE_STEP);
    while capacity < needed {
        capacity += REPLY_SIZE_STEP;
    }
    buf.reserve_exact(capacity - buf.len());
}

/// An in-construction reply: extra header lines plus a body.
#[derive(Debug, Default)]
pub struct Reply {
    header: Vec<u8>,
    body: Vec<u8>,
}

impl Reply {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append formatted text to the extra-header segment.
    ///
    /// The line terminator is the caller's responsibility.
    pub fn append_header(&mut self, args: fmt::Arguments<'_>) {
        let rendered = args.to_string();
        reserve_stepped(&mut self.header, rendered.len());
        self.header.extend_from_slice(rendered.as_bytes());
    }

    /// Append formatted text to the body segment.
    pub fn append_body(&mut self, args: fmt::Arguments<'_>) {
        let rendered = args.to_string();
        reserve_stepped(&mut self.body, rendered.len());
        self.body.extend_from_slice(rendered.as_bytes());
    }

    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    /// Render an HTTP/1.0 reply: status line, `Server:`, any extra
    /// headers, `Content-type:`, `Content-length:`, blank line, body.
    pub fn finalize_http(&self, code: u16, content_type: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(REPLY_SIZE_STEP + self.header.len() + self.body.len());
        out.extend_from_slice(format!("HTTP/1.0 {} {}\r\n", code, status_text(code)).as_bytes());
        out.extend_from_slice(format!("Server: {}\r\n", SERVER_NAME).as_bytes());
        out.extend_from_slice(&self.header);
        out.extend_from_slice(format!("Content-type: {}\r\n", content_type).as_bytes());
        out.extend_from_slice(format!("Content-length: {}\r\n", self.body.len()).as_bytes());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }

    /// Render an RTSP/1.0 reply: status line, `CSeq:`, `Server:`,
    /// `Public:`, any extra headers, then `Content-type:` and
    /// `Content-length:` only when a body is present.
    pub fn finalize_rtsp(&self, code: u16, cseq: u64, content_type: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(REPLY_SIZE_STEP + self.header.len() + self.body.len());
        out.extend_from_slice(format!("RTSP/1.0 {} {}\r\n", code, status_text(code)).as_bytes());
        out.extend_from_slice(format!("CSeq: {}\r\n", cseq).as_bytes());
        out.extend_from_slice(format!("Server: {}\r\n", SERVER_NAME).as_bytes());
        out.extend_from_slice(format!("Public: {}\r\n", RTSP_PUBLIC).as_bytes());
        out.extend_from_slice(&self.header);
        if !self.body.is_empty() {
            out.extend_from_slice(format!("Content-type: {}\r\n", content_type).as_bytes());
            out.extend_from_slice(format!("Content-length: {}\r\n", self.body.len()).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }

    /// Finalize as HTTP and transmit with a single write call.
    pub fn send_http<W: Write>(&self, code: u16, content_type: &str, w: &mut W) -> io::Result<usize> {
        w.write(&self.finalize_http(code, content_type))
    }

    /// Finalize as RTSP and transmit with a single write call.
    pub fn send_rtsp<W: Write>(
        &self,
        code: u16,
        cseq: u64,
        content_type: &str,
        w: &mut W,
    ) -> io::Result<usize> {
        w.write(&self.finalize_rtsp(code, cseq, content_type))
    }
}
