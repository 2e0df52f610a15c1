// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

//! Delegation of requests to external programs, following CGI/1.1.

use std::{
    collections::BTreeMap,
    ffi::{OsStr, OsString},
    io,
    net::SocketAddr,
    os::unix::ffi::{OsStrExt, OsStringExt},
    path::{Path, PathBuf},
    process::Stdio,
};

use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use tokio::{
    net::unix::pipe,
    process::{Child, Command},
};
use tracing::debug;

use crate::http::{request::find, HeaderLineList, Request};

/// The largest gateway header block that is accepted.
pub const MAX_GATEWAY_HEADER: usize = 4096;

/// The size of the chunks relayed from the gateway to the client.
const CHUNK_SIZE: usize = 16 * 1024;

/// Variables copied from the server's own environment.
const INHERITED_VARIABLES: [&str; 2] = ["PATH", "HOME"];

/// Server facts that go into every gateway environment.
#[derive(Clone, Copy, Debug)]
pub struct GatewayContext<'a> {
    pub document_root: &'a Path,
    pub prefix: &'a [u8],
    pub server_host: &'a str,
    pub server_name: &'a str,
    pub remote: SocketAddr,
    pub local: SocketAddr,
}

/// What to run for a gateway request, and with which environment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GatewayInvocation {
    pub script: PathBuf,
    pub environment: BTreeMap<OsString, OsString>,
}

impl GatewayInvocation {
    pub fn new(request: &Request, context: &GatewayContext<'_>) -> Self {
        let mut environment = BTreeMap::new();
        let mut set = |name: &str, value: &[u8]| {
            environment.insert(OsString::from(name), OsStr::from_bytes(value).to_owned());
        };

        for name in INHERITED_VARIABLES {
            if let Some(value) = std::env::var_os(name) {
                set(name, value.as_bytes());
            }
        }

        let remote = context.remote.ip().to_canonical();
        let local = context.local.ip().to_canonical();

        set("DOCUMENT_ROOT", context.document_root.as_os_str().as_bytes());
        set("GATEWAY_INTERFACE", b"CGI/1.1");
        set("QUERY_STRING", &request.query);
        set("REQUEST_URI", request.uri.as_bytes());
        set("REMOTE_ADDR", remote.to_string().as_bytes());
        set("REMOTE_PORT", context.remote.port().to_string().as_bytes());
        set("REQUEST_METHOD", request.method.as_str().as_bytes());
        set("SERVER_ADMIN", b"root@localhost");
        set("SERVER_NAME", context.server_host.as_bytes());
        set("SERVER_PROTOCOL", b"HTTP/1.1");
        set("SERVER_SOFTWARE", context.server_name.as_bytes());
        set("SERVER_ADDR", local.to_string().as_bytes());
        set("SERVER_PORT", context.local.port().to_string().as_bytes());

        for line in request.headers.iter() {
            if let Some((name, value)) = header_variable(line) {
                set(&name, value.as_bytes());
            }
        }

        let (script_name, path_info) = split_script_path(&request.path, context.prefix);
        set("PATH_INFO", path_info);
        set("SCRIPT_NAME", script_name);

        let mut script = context.document_root.as_os_str().as_bytes().to_vec();
        script.extend_from_slice(script_name);
        set("SCRIPT_FILENAME", &script);

        Self {
            script: PathBuf::from(OsString::from_vec(script)),
            environment,
        }
    }

    /// Starts the program with its output connected to a non-blocking pipe.
    /// Standard input and error go to the null device unless `inherit_stdio`
    /// is set.
    pub fn spawn(&self, inherit_stdio: bool) -> io::Result<GatewayStream> {
        let stdio = || if inherit_stdio { Stdio::inherit() } else { Stdio::null() };

        let mut child = Command::new(&self.script)
            .env_clear()
            .envs(&self.environment)
            .stdin(stdio())
            .stderr(stdio())
            .stdout(Stdio::piped())
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("gateway stdout was not captured"))?;
        let pipe = pipe::Receiver::from_owned_fd(stdout.into_owned_fd()?)?;

        debug!("Started gateway {} as pid {:?}", self.script.display(), child.id());
        Ok(GatewayStream {
            child,
            pipe,
            buffer: Vec::with_capacity(MAX_GATEWAY_HEADER),
            position: 0,
        })
    }

    /// The text the gateway would have produced had it failed to execute.
    pub fn failure_body(&self, error: &io::Error) -> Vec<u8> {
        format!("execve {}: {error}\n", self.script.display()).into_bytes()
    }
}

/// Splits a gateway path into `SCRIPT_NAME` and `PATH_INFO` at the first
/// slash following the prefix.
pub fn split_script_path<'a>(path: &'a [u8], prefix: &[u8]) -> (&'a [u8], &'a [u8]) {
    let search_from = prefix.len().min(path.len());
    match path[search_from..].iter().position(|&b| b == b'/') {
        Some(offset) => path.split_at(search_from + offset),
        None => (path, &path[path.len()..]),
    }
}

/// Maps a request header line to its `HTTP_*` variable. Field names must
/// consist of letters and dashes only.
fn header_variable(line: &str) -> Option<(String, &str)> {
    let (name, value) = line.split_once(':')?;
    let valid = !name.is_empty() && name.len() <= 120 && name.bytes().all(|b| b.is_ascii_alphabetic() || b == b'-');
    if !valid {
        return None;
    }

    let mut variable = String::with_capacity(5 + name.len());
    variable.push_str("HTTP_");
    variable.extend(name.chars().map(|c| if c == '-' { '_' } else { c.to_ascii_uppercase() }));
    Some((variable, value.trim_start()))
}

/// The outcome of reading more of the gateway's header block.
#[derive(Debug, PartialEq, Eq)]
pub enum HeaderProgress {
    /// More bytes are needed.
    Incomplete,

    /// The header block is complete. Body bytes that arrived with it stay
    /// buffered in the stream.
    Complete { status: String, headers: HeaderLineList },

    /// The gateway closed its output or overflowed the buffer before the
    /// header block ended.
    Failed,
}

/// The running gateway program and the read end of its output.
///
/// Dropping the stream terminates a program that is still running. Exit
/// statuses are collected in the background and ignored.
#[derive(Debug)]
pub struct GatewayStream {
    child: Child,
    pipe: pipe::Receiver,
    buffer: Vec<u8>,
    position: usize,
}

impl GatewayStream {
    pub async fn readable(&self) -> io::Result<()> {
        self.pipe.readable().await
    }

    /// Performs one read towards the end of the header block.
    pub fn try_read_header(&mut self) -> io::Result<HeaderProgress> {
        let filled = self.buffer.len();
        self.buffer.resize(MAX_GATEWAY_HEADER, 0);
        let result = self.pipe.try_read(&mut self.buffer[filled..]);
        let read = match result {
            Ok(read) => read,
            Err(error) => {
                self.buffer.truncate(filled);
                return Err(error);
            }
        };
        self.buffer.truncate(filled + read);

        if let Some((body_start, status, headers)) = parse_header_block(&self.buffer) {
            self.position = body_start;
            return Ok(HeaderProgress::Complete { status, headers });
        }

        if read == 0 || self.buffer.len() == MAX_GATEWAY_HEADER {
            return Ok(HeaderProgress::Failed);
        }
        Ok(HeaderProgress::Incomplete)
    }

    /// Reads the next chunk of the body into the buffer. Returns zero once
    /// the gateway closed its output.
    pub fn try_read_chunk(&mut self) -> io::Result<usize> {
        self.buffer.resize(CHUNK_SIZE, 0);
        self.position = 0;
        match self.pipe.try_read(&mut self.buffer) {
            Ok(read) => {
                self.buffer.truncate(read);
                Ok(read)
            }
            Err(error) => {
                self.buffer.clear();
                Err(error)
            }
        }
    }

    /// Body bytes read from the gateway but not yet sent.
    pub fn pending(&self) -> &[u8] {
        &self.buffer[self.position..]
    }

    pub fn consume(&mut self, count: usize) {
        self.position = (self.position + count).min(self.buffer.len());
    }
}

impl Drop for GatewayStream {
    fn drop(&mut self) {
        if !matches!(self.child.try_wait(), Ok(None)) {
            return;
        }
        let Some(id) = self.child.id() else {
            return;
        };
        debug!("Terminating gateway pid {id}");
        _ = kill(Pid::from_raw(id as i32), Signal::SIGTERM);
    }
}

/// Parses a complete gateway header block at the start of `buffer`.
///
/// Returns the offset of the first body byte, the status line text and the
/// remaining header lines. A `Status:` line must start with a three-digit
/// code to be used, otherwise it is dropped and the default applies.
pub fn parse_header_block(buffer: &[u8]) -> Option<(usize, String, HeaderLineList)> {
    let crlf = find(buffer, b"\r\n\r\n").map(|index| index + 4);
    let lf = find(buffer, b"\n\n").map(|index| index + 2);
    let end = match (crlf, lf) {
        (Some(a), Some(b)) => a.min(b),
        (a, b) => a.or(b)?,
    };

    let block = String::from_utf8_lossy(&buffer[..end]);
    let mut status = None;
    let mut headers = HeaderLineList::new();
    for line in block.split('\n').map(|line| line.strip_suffix('\r').unwrap_or(line)) {
        if line.is_empty() {
            break;
        }
        let is_status = line.get(..7).is_some_and(|name| name.eq_ignore_ascii_case("Status:"));
        if is_status {
            let value = line[7..].trim();
            if value.len() >= 3 && value.as_bytes()[..3].iter().all(u8::is_ascii_digit) {
                status = Some(value.to_owned());
            }
            continue;
        }
        headers.push(line);
    }

    Some((end, status.unwrap_or_else(|| "200 OK".to_owned()), headers))
}

/// The numeric code at the start of a gateway status line, for logging.
pub fn status_code(status: &str) -> u16 {
    status.get(..3).and_then(|code| code.parse().ok()).unwrap_or(200)
}
