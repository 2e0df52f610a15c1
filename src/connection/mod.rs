// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

//! One accepted client connection and the state machine that serves it.
//!
//! The connection is stepped by its task: every step performs at most one
//! non-blocking socket or pipe operation and reports whether the task should
//! step again right away or wait for readiness first.

mod writer;

use std::{
    io,
    net::SocketAddr,
    time::Instant,
};

use chrono::Utc;
use strum_macros::AsRefStr;
use tokio::io::Interest;
use tracing::{debug, info};

pub use self::writer::{Body, RangeCursor, ResponseSource};
use crate::{
    access_log::{AccessRecord, LoggedRequest},
    context::ServerContext,
    handler,
    http::{
        request::{self, MAX_HEADER},
        Request, RequestError,
    },
    net::Transport,
};

#[derive(Copy, Clone, Debug, PartialEq, Eq, AsRefStr)]
pub enum State {
    /// Waiting for a complete request head.
    ReadHeader,

    /// A complete head is buffered and is about to be answered.
    ParseHeader,

    WriteHeader,
    WriteBody,
    WriteFile,
    WriteRanges,

    /// Waiting for the end of the gateway's header block.
    CgiHeader,

    /// Reading the next chunk of gateway output.
    CgiBodyIn,

    /// Sending the chunk read from the gateway.
    CgiBodyOut,

    /// The response went out completely.
    Finished,

    /// Idle between requests.
    Keepalive,

    Close,
}

/// The outcome of one step.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Step {
    /// Something happened, step again.
    Continue,

    /// The operation would block, wait for [`Connection::readiness`].
    Blocked,
}

/// Bookkeeping for the request/response exchange under way.
#[derive(Debug, Default)]
struct Exchange {
    request: Option<LoggedRequest>,
    keep_alive: bool,
    head_only: bool,

    /// Zero until a response status is assigned.
    status: u16,
    bytes_sent: u64,
    logged: bool,
}

#[derive(Debug)]
pub struct Connection {
    transport: Transport,
    peer: SocketAddr,
    local: SocketAddr,
    state: State,

    inbound: Box<[u8]>,
    received: usize,
    head_length: usize,

    exchange: Exchange,
    header: Vec<u8>,
    header_written: usize,
    source: ResponseSource,

    last_activity: Instant,
}

impl Connection {
    pub fn new(transport: Transport) -> io::Result<Self> {
        Ok(Self {
            peer: transport.peer_addr()?,
            local: transport.local_addr()?,
            transport,
            state: State::ReadHeader,
            inbound: vec![0; MAX_HEADER].into_boxed_slice(),
            received: 0,
            head_length: 0,
            exchange: Exchange::default(),
            header: Vec::new(),
            header_written: 0,
            source: ResponseSource::Empty,
            last_activity: Instant::now(),
        })
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Waits until the operation of the current state can make progress.
    pub async fn readiness(&self) -> io::Result<()> {
        match self.state {
            State::ReadHeader | State::Keepalive => self.transport.ready(Interest::READABLE).await.map(drop),
            State::WriteHeader | State::WriteBody | State::WriteFile | State::WriteRanges | State::CgiBodyOut => {
                self.transport.ready(Interest::WRITABLE).await.map(drop)
            }
            State::CgiHeader | State::CgiBodyIn => match &self.source {
                ResponseSource::Gateway(gateway) => gateway.readable().await,
                _ => Ok(()),
            },
            State::Finished if self.transport.has_pending_output() => self.transport.ready(Interest::WRITABLE).await.map(drop),
            State::ParseHeader | State::Finished | State::Close => Ok(()),
        }
    }

    /// Advances the state machine by one operation.
    pub async fn step(&mut self, context: &ServerContext) -> Step {
        match self.state {
            State::ReadHeader | State::Keepalive => self.read_header(context),
            State::ParseHeader => {
                self.parse_header(context).await;
                Step::Continue
            }
            State::CgiHeader => self.read_gateway_header(context),
            State::WriteHeader
            | State::WriteBody
            | State::WriteFile
            | State::WriteRanges
            | State::CgiBodyIn
            | State::CgiBodyOut => self.write_response(),
            State::Finished => self.finish(context),
            State::Close => Step::Blocked,
        }
    }

    /// Handles the expiry of the idle timeout. A client that hasn't sent a
    /// complete request yet gets a 408 first, everyone else is dropped.
    pub fn expire(&mut self, context: &ServerContext) {
        if self.state == State::ReadHeader {
            info!("network timeout for {}", self.peer);
            self.exchange.keep_alive = false;
            self.respond_error(context, RequestError::Timeout);
            self.touch();
        } else {
            debug!("Closing {} after idling in {}", self.peer, self.state.as_ref());
            self.state = State::Close;
        }
    }

    /// Drops the connection if it is idle between requests.
    pub fn reclaim(&mut self) -> bool {
        if self.state == State::Keepalive {
            debug!("Reclaiming idle connection of {}", self.peer);
            self.state = State::Close;
            return true;
        }
        false
    }

    /// Handles a failed operation. `WouldBlock` parks the connection,
    /// `Interrupted` retries it and anything else closes.
    fn io_failed(&mut self, operation: &str, error: io::Error) -> Step {
        match error.kind() {
            io::ErrorKind::WouldBlock => Step::Blocked,
            io::ErrorKind::Interrupted => Step::Continue,
            _ => {
                info!("{operation} for {} failed: {error}", self.peer);
                self.state = State::Close;
                Step::Continue
            }
        }
    }

    fn read_header(&mut self, context: &ServerContext) -> Step {
        if self.transport.has_pending_output() {
            if let Err(error) = self.transport.try_flush() {
                return self.io_failed("write", error);
            }
        }

        let read = match self.transport.try_read(&mut self.inbound[self.received..]) {
            Ok(0) => {
                debug!("{} closed the connection", self.peer);
                self.state = State::Close;
                return Step::Continue;
            }
            Ok(read) => read,
            Err(error) => return self.io_failed("read", error),
        };

        self.touch();
        self.received += read;
        self.state = State::ReadHeader;
        self.scan_head(context);
        Step::Continue
    }

    /// Looks for a complete head in the bytes received so far.
    fn scan_head(&mut self, context: &ServerContext) {
        match request::scan_head(&self.inbound[..self.received]) {
            Ok(Some(length)) => {
                self.head_length = length;
                self.state = State::ParseHeader;
            }
            Ok(None) => (),
            Err(error) => self.respond_error(context, error.into()),
        }
    }

    async fn parse_header(&mut self, context: &ServerContext) {
        let mut request = match Request::parse(&self.inbound[..self.head_length]) {
            Ok(request) => request,
            Err(error) => return self.respond_error(context, error.into()),
        };

        self.exchange.request = Some(LoggedRequest {
            method: request.method,
            uri: request.uri.clone(),
            version: request.version,
        });
        self.exchange.keep_alive = request.keep_alive;
        self.exchange.head_only = request.is_head();

        if let Err(error) = request.validate(&context.policy()) {
            return self.respond_error(context, error);
        }

        debug!("{} {} {} from {}", request.method.as_str(), request.uri, request.version, self.peer);
        let reply = handler::resolve(context, &request, self.peer, self.local).await;
        self.prepare(context, &request.host, reply);
    }

    /// Ends the exchange: logs it, then closes, goes idle or answers the
    /// next pipelined request.
    fn finish(&mut self, context: &ServerContext) -> Step {
        // Encrypted records still queued belong to this response.
        match self.transport.try_flush() {
            Ok(true) => (),
            Ok(false) => return Step::Blocked,
            Err(error) => return self.io_failed("write", error),
        }

        self.log(context);
        self.release_source(context);

        if !self.exchange.keep_alive {
            self.state = State::Close;
            return Step::Continue;
        }

        let keep_alive = self.exchange.keep_alive;
        self.exchange = Exchange { keep_alive, ..Exchange::default() };
        self.header.clear();
        self.header_written = 0;

        let leftover = self.received - self.head_length;
        self.inbound.copy_within(self.head_length..self.received, 0);
        self.received = leftover;
        self.head_length = 0;

        if leftover == 0 {
            self.state = State::Keepalive;
        } else {
            debug!("Answering pipelined request of {}", self.peer);
            self.state = State::ReadHeader;
            self.scan_head(context);
        }
        Step::Continue
    }

    /// Tears the connection down. An exchange that was under way still gets
    /// its access log line.
    pub fn close(&mut self, context: &ServerContext) {
        if !self.exchange.logged && (self.received > 0 || self.exchange.status != 0) {
            self.log(context);
        }
        self.release_source(context);
        self.transport.shutdown();
        self.state = State::Close;
    }

    fn release_source(&mut self, context: &ServerContext) {
        if let ResponseSource::Memory { body: Body::Listing(listing), .. } = std::mem::take(&mut self.source) {
            context.cache.release(listing);
        }
    }

    fn log(&mut self, context: &ServerContext) {
        context.access_log.write(&AccessRecord {
            peer: self.peer.ip(),
            request: self.exchange.request.as_ref(),
            status: self.exchange.status,
            bytes_sent: self.exchange.bytes_sent,
            time: Utc::now(),
        });
        self.exchange.logged = true;
    }
}
