// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

use std::{
    fmt::Write,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use super::{escape, ByteRange, HeaderLineList, RangeSet, StatusCode};

/// Header fields of a gateway response that the server generates itself.
const GATEWAY_BLOCKLIST: [&str; 4] = ["Server", "Connection", "Accept-Ranges", "Date"];

/// How the body of a content response is described in its header.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ContentKind<'a> {
    /// The whole resource, or a head-only answer describing it.
    Single { media_type: &'a str, length: u64 },

    /// One span of the resource.
    SingleRange { media_type: &'a str, range: ByteRange, size: u64 },

    /// Several spans, framed as `multipart/byteranges`.
    Multi { framing: &'a Multipart },
}

/// The modification time of a resource, both as the RFC 1123 token used for
/// conditional requests and as a timestamp.
#[derive(Copy, Clone, Debug)]
pub struct Validity<'a> {
    pub token: &'a str,
    pub modified: SystemTime,
}

/// The precomputed framing of a multi-range response: one sub-header per
/// range followed by the closing boundary, and the resulting body length.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Multipart {
    pub boundary: String,
    pub headers: Vec<Vec<u8>>,
    pub length: u64,
}

impl Multipart {
    pub fn new(ranges: &RangeSet, media_type: &str, size: u64, boundary: String) -> Self {
        let mut headers = Vec::with_capacity(ranges.len() + 1);
        let mut length = 0;
        for range in ranges.iter() {
            let header = format!(
                "\r\n--{boundary}\r\nContent-Type: {media_type}\r\nContent-Range: bytes {}-{}/{size}\r\n\r\n",
                range.start,
                range.end.saturating_sub(1),
            );
            length += header.len() as u64 + range.len();
            headers.push(header.into_bytes());
        }

        let closing = format!("\r\n--{boundary}--\r\n");
        length += closing.len() as u64;
        headers.push(closing.into_bytes());

        Self { boundary, headers, length }
    }

    /// A boundary token derived from the current time. It only has to be
    /// unique within one response.
    pub fn boundary_now() -> String {
        let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos();
        format!("portiere-boundary-{nanos:x}")
    }
}

/// Builds the status line and header block of every response the server
/// sends.
#[derive(Clone, Debug)]
pub struct ResponseBuilder {
    server_name: String,
    realm: String,
    cors: Option<String>,
    lifespan: Option<Duration>,
}

impl ResponseBuilder {
    pub fn new(server_name: impl Into<String>, realm: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            realm: realm.into(),
            cors: None,
            lifespan: None,
        }
    }

    pub fn with_cors(mut self, origin: Option<String>) -> Self {
        self.cors = origin;
        self
    }

    pub fn with_lifespan(mut self, lifespan: Option<Duration>) -> Self {
        self.lifespan = lifespan.filter(|lifespan| !lifespan.is_zero());
        self
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// An error response with its fixed plaintext body. Returns the header
    /// and the body.
    pub fn error(&self, status: StatusCode, keep_alive: bool) -> (Vec<u8>, &'static str) {
        let body = status.error_body().unwrap_or_default();
        let mut head = self.start(status.as_str(), keep_alive);
        _ = write!(head, "Content-Type: text/plain\r\nContent-Length: {}\r\n", body.len());
        if status == StatusCode::Unauthorized {
            _ = write!(head, "WWW-Authenticate: Basic realm=\"{}\"\r\n", self.realm);
        }
        (self.finish(head), body)
    }

    /// A redirect to `path` on this server. The body is the path itself.
    pub fn redirect(&self, host: &str, port: u16, path: &[u8], keep_alive: bool) -> (Vec<u8>, Vec<u8>) {
        let mut head = self.start(StatusCode::Found.as_str(), keep_alive);
        _ = write!(
            head,
            "Location: http://{host}:{port}{}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n",
            escape::quote(path),
            path.len(),
        );
        (self.finish(head), path.to_vec())
    }

    /// The header of a 200, 206 or 304 response for a file or listing.
    pub fn content(&self, status: StatusCode, keep_alive: bool, kind: ContentKind<'_>, validity: Option<Validity<'_>>) -> Vec<u8> {
        let mut head = self.start(status.as_str(), keep_alive);
        match kind {
            ContentKind::Single { media_type, length } => {
                _ = write!(head, "Content-Type: {media_type}\r\nContent-Length: {length}\r\n");
            }
            ContentKind::SingleRange { media_type, range, size } => {
                _ = write!(
                    head,
                    "Content-Type: {media_type}\r\nContent-Range: bytes {}-{}/{size}\r\nContent-Length: {}\r\n",
                    range.start,
                    range.end.saturating_sub(1),
                    range.len(),
                );
            }
            ContentKind::Multi { framing } => {
                _ = write!(
                    head,
                    "Content-Type: multipart/byteranges; boundary={}\r\nContent-Length: {}\r\n",
                    framing.boundary, framing.length,
                );
            }
        }

        if let Some(validity) = validity {
            _ = write!(head, "Last-Modified: {}\r\n", validity.token);
            if let Some(lifespan) = self.lifespan {
                _ = write!(head, "Expires: {}\r\n", httpdate::fmt_http_date(validity.modified + lifespan));
            }
        }

        self.finish(head)
    }

    /// The header of a gateway response: the status and header lines from
    /// the gateway program, minus the fields the server sets itself. These
    /// responses carry no length, so the connection always closes after.
    pub fn gateway(&self, status: &str, headers: &HeaderLineList) -> Vec<u8> {
        let mut head = self.start(status, false);
        let mut headers = headers.clone();
        headers.remove_named(&GATEWAY_BLOCKLIST);
        for line in headers.iter() {
            head.push_str(line);
            head.push_str("\r\n");
        }
        self.finish(head)
    }

    fn start(&self, status: &str, keep_alive: bool) -> String {
        let mut head = String::with_capacity(512);
        _ = write!(
            head,
            "HTTP/1.1 {status}\r\nServer: {}\r\nConnection: {}\r\nAccept-Ranges: bytes\r\n",
            self.server_name,
            if keep_alive { "Keep-Alive" } else { "Close" },
        );
        head
    }

    fn finish(&self, mut head: String) -> Vec<u8> {
        if let Some(origin) = &self.cors {
            _ = write!(head, "Access-Control-Allow-Origin: {origin}\r\n");
        }
        _ = write!(head, "Date: {}\r\n\r\n", httpdate::fmt_http_date(SystemTime::now()));
        head.into_bytes()
    }
}
