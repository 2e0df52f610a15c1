// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

use std::{
    fs::File,
    io,
    net::SocketAddr,
    os::unix::fs::FileExt,
};

use tokio::{
    io::{Interest, Ready},
    net::TcpStream,
};

use super::tls::TlsStream;

/// The most that is handed to one bulk transfer or relayed in one step.
const TRANSFER_CHUNK: u64 = 64 * 1024;

/// A client connection, either plain or wrapped in a TLS session. Every
/// operation is non-blocking and reports `WouldBlock` when the socket isn't
/// ready.
#[derive(Debug)]
pub enum Transport {
    Plain(TcpStream),
    Tls(Box<TlsStream>),
}

impl Transport {
    pub fn socket(&self) -> &TcpStream {
        match self {
            Transport::Plain(stream) => stream,
            Transport::Tls(tls) => &tls.stream,
        }
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.socket().peer_addr()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket().local_addr()
    }

    /// Waits until the socket is ready for `interest`. Queued TLS records
    /// add write interest, whatever the caller waits for.
    pub async fn ready(&self, interest: Interest) -> io::Result<Ready> {
        let interest = if self.has_pending_output() { interest | Interest::WRITABLE } else { interest };
        self.socket().ready(interest).await
    }

    pub fn has_pending_output(&self) -> bool {
        match self {
            Transport::Plain(_) => false,
            Transport::Tls(tls) => tls.has_pending_output(),
        }
    }

    /// Sends queued TLS records. Returns `false` while some remain.
    pub fn try_flush(&mut self) -> io::Result<bool> {
        match self {
            Transport::Plain(_) => Ok(true),
            Transport::Tls(tls) => tls.try_flush(),
        }
    }

    pub fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(stream) => stream.try_read(buf),
            Transport::Tls(tls) => tls.try_read(buf),
        }
    }

    pub fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(stream) => stream.try_write(buf),
            Transport::Tls(tls) => tls.try_write(buf),
        }
    }

    /// Sends up to `count` bytes of `file` starting at `offset`. Plain
    /// sockets on Linux use `sendfile(2)`, everything else relays one chunk
    /// through memory and stops after a partial write.
    pub fn try_send_file(&mut self, file: &File, offset: u64, count: u64) -> io::Result<usize> {
        let count = count.min(TRANSFER_CHUNK);
        if count == 0 {
            return Ok(0);
        }

        #[cfg(target_os = "linux")]
        if let Transport::Plain(stream) = &*self {
            return stream.try_io(Interest::WRITABLE, || {
                let mut position = nix::libc::off_t::try_from(offset).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
                nix::sys::sendfile::sendfile(stream, file, Some(&mut position), count as usize).map_err(io::Error::from)
            });
        }

        self.relay(file, offset, count)
    }

    fn relay(&mut self, file: &File, offset: u64, count: u64) -> io::Result<usize> {
        let mut chunk = vec![0; count as usize];
        let read = loop {
            match file.read_at(&mut chunk, offset) {
                Ok(read) => break read,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => return Err(error),
            }
        };
        if read == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        self.try_write(&chunk[..read])
    }

    /// Ends a TLS session with `close_notify`. The socket itself closes when
    /// the transport is dropped.
    pub fn shutdown(&mut self) {
        if let Transport::Tls(tls) = self {
            tls.shutdown();
        }
    }
}
