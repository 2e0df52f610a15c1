// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

//! The response half of a connection: preparing the header and the body
//! source for a reply, and sending them one non-blocking write at a time.

use std::{fs::File, sync::Arc};

use tracing::debug;

use super::{Connection, State, Step};
use crate::{
    cgi::{self, GatewayStream, HeaderProgress},
    context::ServerContext,
    handler::{FileReply, Reply},
    http::{
        response::{ContentKind, Multipart, Validity},
        HeaderLineList, RangeSet, RequestError, StatusCode,
    },
    resources::DirectoryListing,
};

/// A response body held in memory.
#[derive(Debug)]
pub enum Body {
    Static(&'static str),
    Owned(Vec<u8>),
    Listing(Arc<DirectoryListing>),
}

impl Body {
    pub fn bytes(&self) -> &[u8] {
        match self {
            Body::Static(text) => text.as_bytes(),
            Body::Owned(bytes) => bytes,
            Body::Listing(listing) => &listing.html,
        }
    }
}

/// Where the next part of a range response comes from.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RangeCursor {
    /// The multipart sub-header before range `index`, or the closing
    /// boundary when `index` is past the last range.
    Header { index: usize, written: usize },

    /// The bytes of range `index`, continuing at `offset`.
    Body { index: usize, offset: u64 },
}

/// Everything that follows the header of the response under way. Exactly
/// one source is active per response.
#[derive(Debug, Default)]
pub enum ResponseSource {
    #[default]
    Empty,

    Memory { body: Body, written: usize },

    File { file: File, offset: u64, end: u64 },

    Ranges {
        file: File,
        ranges: RangeSet,

        /// Only present for more than one range.
        framing: Option<Multipart>,
        cursor: RangeCursor,
    },

    Gateway(GatewayStream),
}

impl ResponseSource {
    fn memory(body: Body) -> Self {
        ResponseSource::Memory { body, written: 0 }
    }
}

impl Connection {
    /// Turns the outcome of target resolution into a response header and
    /// body source, and moves on to sending them.
    pub(super) fn prepare(&mut self, context: &ServerContext, host: &str, reply: Reply) {
        let keep_alive = self.exchange.keep_alive;
        let responses = &context.responses;

        match reply {
            Reply::Error(error) => self.respond_error(context, error),

            Reply::Redirect(path) => {
                let (header, body) = responses.redirect(host, context.port, &path, keep_alive);
                self.start_response(StatusCode::Found.code(), header, ResponseSource::memory(Body::Owned(body)));
            }

            Reply::Listing { listing, modified, not_modified } => {
                let status = if not_modified { StatusCode::NotModified } else { StatusCode::Ok };
                let kind = ContentKind::Single { media_type: "text/html", length: listing.html.len() as u64 };
                let validity = Validity { token: &listing.mtime, modified };
                let header = responses.content(status, keep_alive, kind, Some(validity));
                if not_modified {
                    self.exchange.head_only = true;
                }
                self.start_response(status.code(), header, ResponseSource::memory(Body::Listing(listing)));
            }

            Reply::File(file) => self.prepare_file(context, file),

            Reply::Gateway(stream) => {
                self.exchange.keep_alive = false;
                self.source = ResponseSource::Gateway(stream);
                self.state = State::CgiHeader;
            }

            Reply::GatewayFailure(body) => {
                self.exchange.keep_alive = false;
                let mut headers = HeaderLineList::new();
                headers.push("Content-Type: text/plain");
                let header = responses.gateway(StatusCode::InternalServerError.as_str(), &headers);
                self.start_response(StatusCode::InternalServerError.code(), header, ResponseSource::memory(Body::Owned(body)));
            }
        }
    }

    fn prepare_file(&mut self, context: &ServerContext, reply: FileReply) {
        let keep_alive = self.exchange.keep_alive;
        let FileReply { file, size, media_type, mtime, modified, status, ranges } = reply;
        let validity = Some(Validity { token: &mtime, modified });
        let media_type = media_type.as_str();

        let Some(ranges) = ranges.filter(|_| status == StatusCode::PartialContent) else {
            let kind = ContentKind::Single { media_type, length: size };
            let header = context.responses.content(status, keep_alive, kind, validity);
            let source = if status == StatusCode::NotModified {
                self.exchange.head_only = true;
                ResponseSource::Empty
            } else {
                ResponseSource::File { file, offset: 0, end: size }
            };
            self.start_response(status.code(), header, source);
            return;
        };

        let (header, framing, cursor) = match ranges.first_and_only() {
            Some(range) => {
                let kind = ContentKind::SingleRange { media_type, range, size };
                let cursor = RangeCursor::Body { index: 0, offset: range.start };
                (context.responses.content(status, keep_alive, kind, validity), None, cursor)
            }
            None => {
                let framing = Multipart::new(&ranges, media_type, size, Multipart::boundary_now());
                let kind = ContentKind::Multi { framing: &framing };
                let header = context.responses.content(status, keep_alive, kind, validity);
                (header, Some(framing), RangeCursor::Header { index: 0, written: 0 })
            }
        };

        debug!("Sending {} range(s) to {}", ranges.len(), self.peer);
        self.start_response(status.code(), header, ResponseSource::Ranges { file, ranges, framing, cursor });
    }

    /// Answers with the fixed error response for `error`. Errors that end
    /// the connection clear keep-alive.
    pub(super) fn respond_error(&mut self, context: &ServerContext, error: RequestError) {
        let status = error.status();
        debug!("Answering {} with {}", self.peer, error);

        self.exchange.keep_alive &= status.permits_keep_alive();
        let (header, body) = context.responses.error(status, self.exchange.keep_alive);
        self.start_response(status.code(), header, ResponseSource::memory(Body::Static(body)));
    }

    fn start_response(&mut self, status: u16, header: Vec<u8>, source: ResponseSource) {
        self.exchange.status = status;
        self.header = header;
        self.header_written = 0;
        self.source = source;
        self.state = State::WriteHeader;
    }

    /// Reads towards the end of the gateway's header block.
    pub(super) fn read_gateway_header(&mut self, context: &ServerContext) -> Step {
        let ResponseSource::Gateway(gateway) = &mut self.source else {
            self.state = State::Close;
            return Step::Continue;
        };

        match gateway.try_read_header() {
            Ok(HeaderProgress::Incomplete) => {
                self.touch();
                Step::Continue
            }
            Ok(HeaderProgress::Complete { status, headers }) => {
                self.touch();
                let header = context.responses.gateway(&status, &headers);
                self.exchange.status = cgi::status_code(&status);
                self.header = header;
                self.header_written = 0;
                self.state = State::WriteHeader;
                Step::Continue
            }
            Ok(HeaderProgress::Failed) => {
                debug!("Gateway for {} ended without a complete header", self.peer);
                self.respond_error(context, RequestError::Internal);
                Step::Continue
            }
            Err(error) => self.io_failed("gateway read", error),
        }
    }

    /// Performs one write, or one gateway read, of the response under way.
    pub(super) fn write_response(&mut self) -> Step {
        match self.state {
            State::WriteHeader => self.write_header(),
            State::WriteBody => self.write_body(),
            State::WriteFile => self.write_file(),
            State::WriteRanges => self.write_ranges(),
            State::CgiBodyIn => self.read_gateway_body(),
            State::CgiBodyOut => self.write_gateway_body(),
            _ => Step::Continue,
        }
    }

    /// Accounts for a write to the client. Returns the number of bytes
    /// written, or the step to return when nothing was.
    fn written(&mut self, result: std::io::Result<usize>, operation: &str) -> Result<usize, Step> {
        match result {
            Ok(0) => {
                self.state = State::Close;
                Err(Step::Continue)
            }
            Ok(written) => {
                self.touch();
                self.exchange.bytes_sent += written as u64;
                Ok(written)
            }
            Err(error) => Err(self.io_failed(operation, error)),
        }
    }

    fn write_header(&mut self) -> Step {
        let result = self.transport.try_write(&self.header[self.header_written..]);
        let written = match self.written(result, "write") {
            Ok(written) => written,
            Err(step) => return step,
        };

        self.header_written += written;
        if self.header_written == self.header.len() {
            self.state = self.after_header();
        }
        Step::Continue
    }

    fn after_header(&self) -> State {
        if self.exchange.head_only {
            return State::Finished;
        }
        match &self.source {
            ResponseSource::Empty => State::Finished,
            ResponseSource::Memory { body, .. } if body.bytes().is_empty() => State::Finished,
            ResponseSource::Memory { .. } => State::WriteBody,
            ResponseSource::File { offset, end, .. } if offset == end => State::Finished,
            ResponseSource::File { .. } => State::WriteFile,
            ResponseSource::Ranges { .. } => State::WriteRanges,
            ResponseSource::Gateway(gateway) if gateway.pending().is_empty() => State::CgiBodyIn,
            ResponseSource::Gateway(_) => State::CgiBodyOut,
        }
    }

    fn write_body(&mut self) -> Step {
        let result = match &self.source {
            ResponseSource::Memory { body, written } => self.transport.try_write(&body.bytes()[*written..]),
            _ => return self.source_mismatch(),
        };
        let count = match self.written(result, "write") {
            Ok(count) => count,
            Err(step) => return step,
        };

        if let ResponseSource::Memory { body, written } = &mut self.source {
            *written += count;
            if *written == body.bytes().len() {
                self.state = State::Finished;
            }
        }
        Step::Continue
    }

    fn write_file(&mut self) -> Step {
        let result = match &self.source {
            ResponseSource::File { file, offset, end } => self.transport.try_send_file(file, *offset, end - offset),
            _ => return self.source_mismatch(),
        };
        let count = match self.written(result, "sendfile") {
            Ok(count) => count,
            Err(step) => return step,
        };

        if let ResponseSource::File { offset, end, .. } = &mut self.source {
            *offset += count as u64;
            if offset == end {
                self.state = State::Finished;
            }
        }
        Step::Continue
    }

    /// Sends the sub-header of the current range, then its bytes. A single
    /// range has no sub-headers and ends after its bytes.
    fn write_ranges(&mut self) -> Step {
        let ResponseSource::Ranges { file, ranges, framing, cursor } = &mut self.source else {
            return self.source_mismatch();
        };

        let result = match *cursor {
            RangeCursor::Header { index, written } => {
                let Some(header) = framing.as_ref().and_then(|framing| framing.headers.get(index)) else {
                    return self.source_mismatch();
                };
                self.transport.try_write(&header[written..])
            }
            RangeCursor::Body { index, offset } => {
                let Some(range) = ranges.get(index) else {
                    return self.source_mismatch();
                };
                if offset == range.end {
                    *cursor = next_range(framing.is_some(), index);
                    self.state = range_state(*cursor, ranges.len());
                    return Step::Continue;
                }
                self.transport.try_send_file(file, offset, range.end - offset)
            }
        };

        let count = match self.written(result, "sendfile") {
            Ok(count) => count,
            Err(step) => return step,
        };

        let ResponseSource::Ranges { ranges, framing, cursor, .. } = &mut self.source else {
            return self.source_mismatch();
        };
        match *cursor {
            RangeCursor::Header { index, written } => {
                let written = written + count;
                let header_length = framing.as_ref().and_then(|framing| framing.headers.get(index)).map_or(0, Vec::len);
                if written < header_length {
                    *cursor = RangeCursor::Header { index, written };
                } else if index == ranges.len() {
                    self.state = State::Finished;
                } else {
                    let start = ranges.get(index).map_or(0, |range| range.start);
                    *cursor = RangeCursor::Body { index, offset: start };
                }
            }
            RangeCursor::Body { index, offset } => {
                let offset = offset + count as u64;
                if ranges.get(index).is_some_and(|range| range.end == offset) {
                    *cursor = next_range(framing.is_some(), index);
                    self.state = range_state(*cursor, ranges.len());
                } else {
                    *cursor = RangeCursor::Body { index, offset };
                }
            }
        }
        Step::Continue
    }

    fn read_gateway_body(&mut self) -> Step {
        let ResponseSource::Gateway(gateway) = &mut self.source else {
            return self.source_mismatch();
        };
        match gateway.try_read_chunk() {
            Ok(0) => {
                self.state = State::Finished;
                Step::Continue
            }
            Ok(_) => {
                self.touch();
                self.state = State::CgiBodyOut;
                Step::Continue
            }
            Err(error) => self.io_failed("gateway read", error),
        }
    }

    fn write_gateway_body(&mut self) -> Step {
        let result = match &self.source {
            ResponseSource::Gateway(gateway) => self.transport.try_write(gateway.pending()),
            _ => return self.source_mismatch(),
        };
        let count = match self.written(result, "write") {
            Ok(count) => count,
            Err(step) => return step,
        };

        if let ResponseSource::Gateway(gateway) = &mut self.source {
            gateway.consume(count);
            if gateway.pending().is_empty() {
                self.state = State::CgiBodyIn;
            }
        }
        Step::Continue
    }

    fn source_mismatch(&mut self) -> Step {
        debug!("Response source doesn't match state {}", self.state.as_ref());
        self.state = State::Close;
        Step::Continue
    }
}

/// Where to continue after the bytes of range `index` went out.
fn next_range(multipart: bool, index: usize) -> RangeCursor {
    if multipart {
        RangeCursor::Header { index: index + 1, written: 0 }
    } else {
        RangeCursor::Body { index: index + 1, offset: 0 }
    }
}

fn range_state(cursor: RangeCursor, count: usize) -> State {
    match cursor {
        RangeCursor::Body { index, .. } if index >= count => State::Finished,
        _ => State::WriteRanges,
    }
}
