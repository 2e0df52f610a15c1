// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

use std::{
    fs::{File, OpenOptions},
    io::{self, BufWriter, Write},
    net::IpAddr,
    path::{Path, PathBuf},
    sync::Mutex,
};

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::http::{HttpVersion, Method};

/// The request line as it is written to the access log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoggedRequest {
    pub method: Method,
    pub uri: String,
    pub version: HttpVersion,
}

/// One exchange, as recorded in the access log.
#[derive(Clone, Debug)]
pub struct AccessRecord<'a> {
    pub peer: IpAddr,
    pub request: Option<&'a LoggedRequest>,

    /// Zero when no response status was ever assigned.
    pub status: u16,
    pub bytes_sent: u64,
    pub time: DateTime<Utc>,
}

impl AccessRecord<'_> {
    /// Formats the record as a common log format line. Exchanges without a
    /// status, or rejected as malformed, are logged as 400 without their
    /// request line. Other statuses assigned before a request line was read
    /// (a timeout) keep their status.
    pub fn format(&self) -> String {
        let time = self.time.format("%d/%b/%Y:%H:%M:%S +0000");
        let peer = self.peer.to_canonical();
        match self.request {
            Some(request) if self.status != 0 && self.status != 400 => format!(
                "{peer} - - [{time}] \"{} {} {}\" {} {}\n",
                request.method.as_str(),
                request.uri,
                request.version,
                self.status,
                self.bytes_sent,
            ),
            None if self.status != 0 && self.status != 400 => {
                format!("{peer} - - [{time}] \"-\" {} {}\n", self.status, self.bytes_sent)
            }
            _ => format!("{peer} - - [{time}] \"-\" 400 {}\n", self.bytes_sent),
        }
    }
}

/// Where the access log goes.
#[derive(Debug)]
enum LogSink {
    Stdout,
    File(BufWriter<File>),
}

impl LogSink {
    fn open(path: &Path) -> io::Result<Self> {
        if path == Path::new("-") {
            return Ok(Self::Stdout);
        }
        let file = OpenOptions::new().append(true).create(true).open(path)?;
        Ok(Self::File(BufWriter::new(file)))
    }

    fn log(&mut self, line: &str, flush: bool) -> io::Result<()> {
        match self {
            Self::Stdout => {
                let mut stdout = io::stdout().lock();
                stdout.write_all(line.as_bytes())?;
                if flush {
                    stdout.flush()?;
                }
            }
            Self::File(file) => {
                file.write_all(line.as_bytes())?;
                if flush {
                    file.flush()?;
                }
            }
        }
        Ok(())
    }
}

/// The access log shared by all worker threads. Each line is written under
/// one lock.
#[derive(Debug)]
pub struct AccessLog {
    path: Option<PathBuf>,
    flush: bool,
    sink: Mutex<Option<LogSink>>,
}

impl AccessLog {
    pub fn disabled() -> Self {
        Self { path: None, flush: false, sink: Mutex::new(None) }
    }

    pub fn open(path: &Path, flush: bool) -> io::Result<Self> {
        Ok(Self {
            path: Some(path.to_owned()),
            flush,
            sink: Mutex::new(Some(LogSink::open(path)?)),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.path.is_some()
    }

    pub fn write(&self, record: &AccessRecord<'_>) {
        if !self.is_enabled() {
            return;
        }
        let line = record.format();
        let Ok(mut sink) = self.sink.lock() else {
            return;
        };
        if let Some(sink) = sink.as_mut() {
            if let Err(error) = sink.log(&line, self.flush) {
                warn!("Failed to write access log: {error}");
            }
        }
    }

    /// Opens the log file again, for use after it was rotated away.
    pub fn reopen(&self) -> io::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let sink = LogSink::open(path)?;
        if let Ok(mut current) = self.sink.lock() {
            if let Some(LogSink::File(file)) = current.as_mut() {
                _ = file.flush();
            }
            *current = Some(sink);
        }
        Ok(())
    }

    pub fn flush(&self) {
        if let Ok(mut sink) = self.sink.lock() {
            if let Some(LogSink::File(file)) = sink.as_mut() {
                _ = file.flush();
            }
        }
    }
}

impl Drop for AccessLog {
    fn drop(&mut self) {
        self.flush();
    }
}
