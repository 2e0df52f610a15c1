// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

use std::{
    fs::File,
    io::{self, BufReader, Read, Write},
    sync::Arc,
};

use anyhow::Context;
use rustls::{
    pki_types::{CertificateDer, PrivateKeyDer},
    ServerConnection,
};
use tokio::net::TcpStream;

use crate::config::TlsConfig;

/// Loads the certificate chain and key named in the configuration.
pub fn load_server_config(tls: &TlsConfig) -> anyhow::Result<Arc<rustls::ServerConfig>> {
    let certificates = load_certificates(&tls.certificate)?;
    let key_path = tls.private_key.as_ref().unwrap_or(&tls.certificate);
    let private_key = load_private_key(key_path)?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .context("no usable TLS protocol versions")?
        .with_no_client_auth()
        .with_single_cert(certificates, private_key)
        .context("certificate and private key don't match")?;

    // https://www.iana.org/assignments/tls-extensiontype-values/tls-extensiontype-values.xhtml#alpn-protocol-ids
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

fn load_certificates(path: &std::path::Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).with_context(|| format!("failed to open certificate {}", path.display()))?;
    let certificates = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("failed to parse certificate {}", path.display()))?;
    if certificates.is_empty() {
        anyhow::bail!("no certificates in {}", path.display());
    }
    Ok(certificates)
}

fn load_private_key(path: &std::path::Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = File::open(path).with_context(|| format!("failed to open private key {}", path.display()))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .with_context(|| format!("failed to parse private key {}", path.display()))?
        .with_context(|| format!("no private key in {}", path.display()))
}

/// Starts the server side of a TLS session for a freshly accepted socket.
pub fn accept_session(config: &Arc<rustls::ServerConfig>) -> io::Result<ServerConnection> {
    ServerConnection::new(Arc::clone(config)).map_err(io::Error::other)
}

/// Adapts the non-blocking socket to `Read` and `Write` for rustls, passing
/// `WouldBlock` through.
struct SocketIo<'a>(&'a TcpStream);

impl Read for SocketIo<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.try_read(buf)
    }
}

impl Write for SocketIo<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.try_write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A TLS session driven over a non-blocking socket. The handshake progresses
/// as part of reading and writing.
#[derive(Debug)]
pub struct TlsStream {
    pub(super) stream: TcpStream,
    session: ServerConnection,
}

impl TlsStream {
    pub fn new(stream: TcpStream, session: ServerConnection) -> Self {
        Self { stream, session }
    }

    pub fn has_pending_output(&self) -> bool {
        self.session.wants_write()
    }

    /// Writes queued records to the socket. Returns `false` if the socket
    /// filled up before everything was sent.
    pub fn try_flush(&mut self) -> io::Result<bool> {
        while self.session.wants_write() {
            match self.session.write_tls(&mut SocketIo(&self.stream)) {
                Ok(_) => (),
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(error) => return Err(error),
            }
        }
        Ok(true)
    }

    /// Returns decrypted bytes, reading and processing records from the
    /// socket as needed. Zero means the peer closed the session.
    pub fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.session.reader().read(buf) {
                Ok(read) => return Ok(read),
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => (),
                Err(error) => return Err(error),
            }

            if self.session.read_tls(&mut SocketIo(&self.stream))? == 0 {
                return Ok(0);
            }

            if let Err(error) = self.session.process_new_packets() {
                // Send the alert describing the failure, if the socket takes it.
                _ = self.try_flush();
                return Err(io::Error::new(io::ErrorKind::InvalidData, error));
            }

            self.try_flush()?;
        }
    }

    /// Encrypts and queues `buf`, then sends as much as the socket accepts.
    /// Fails with `WouldBlock` while earlier records are still queued.
    pub fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.try_flush()? {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let written = self.session.writer().write(buf)?;
        self.try_flush()?;
        Ok(written)
    }

    /// Queues `close_notify` and sends it if the socket has room.
    pub fn shutdown(&mut self) {
        self.session.send_close_notify();
        _ = self.try_flush();
    }
}
