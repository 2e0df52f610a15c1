// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

#![allow(dead_code)]

use std::{
    io::{BufRead, BufReader, Read, Write},
    net::{SocketAddr, TcpStream},
    path::{Path, PathBuf},
    time::Duration,
};

use portiere::{Server, ServerConfig, ServerHandle};

pub struct TestServer {
    pub root: tempfile::TempDir,
    pub address: SocketAddr,
    handle: Option<ServerHandle>,
}

impl TestServer {
    pub fn start(configure: impl FnOnce(&Path, &mut ServerConfig)) -> Self {
        let root = tempfile::tempdir().unwrap();
        let mut config = ServerConfig {
            document_root: root.path().to_owned(),
            listen_ip: Some("127.0.0.1".parse().unwrap()),
            port: 0,
            server_host: Some("localhost".to_owned()),
            server_name: "portiere/test".to_owned(),
            ..ServerConfig::default()
        };
        configure(root.path(), &mut config);
        config.normalize().unwrap();

        let server = Server::bind(config).unwrap();
        let address = server.local_addr().unwrap();
        let handle = server.spawn().unwrap();
        Self { root, address, handle: Some(handle) }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.root.path().join(name)
    }

    pub fn write(&self, name: &str, contents: impl AsRef<[u8]>) {
        let path = self.path(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, contents).unwrap();
    }

    pub fn client(&self) -> Client {
        Client::connect(self.address)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.shutdown();
        }
    }
}

#[derive(Debug)]
pub struct Response {
    pub status_line: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn status(&self) -> u16 {
        self.status_line.split(' ').nth(1).and_then(|code| code.parse().ok()).unwrap()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(field, _)| field.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

pub struct Client {
    reader: BufReader<TcpStream>,
}

impl Client {
    pub fn connect(address: SocketAddr) -> Self {
        let stream = TcpStream::connect(address).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        Self { reader: BufReader::new(stream) }
    }

    pub fn send(&mut self, bytes: impl AsRef<[u8]>) {
        self.reader.get_mut().write_all(bytes.as_ref()).unwrap();
    }

    /// Reads one response. The body length comes from `Content-Length`,
    /// without one the body runs until the server closes.
    pub fn response(&mut self, head_only: bool) -> Response {
        let mut status_line = String::new();
        self.reader.read_line(&mut status_line).unwrap();
        assert!(status_line.starts_with("HTTP/1.1 "), "unexpected status line {status_line:?}");

        let mut headers = Vec::new();
        loop {
            let mut line = String::new();
            self.reader.read_line(&mut line).unwrap();
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                break;
            }
            let (name, value) = line.split_once(':').unwrap();
            headers.push((name.to_owned(), value.trim().to_owned()));
        }

        let mut response = Response {
            status_line: status_line.trim_end().to_owned(),
            headers,
            body: Vec::new(),
        };
        if head_only || response.status() == 304 {
            return response;
        }

        match response.header("Content-Length").map(|length| length.parse::<usize>().unwrap()) {
            Some(length) => {
                response.body.resize(length, 0);
                self.reader.read_exact(&mut response.body).unwrap();
            }
            None => {
                self.reader.read_to_end(&mut response.body).unwrap();
            }
        }
        response
    }

    pub fn request(&mut self, head: &str) -> Response {
        self.send(head);
        self.response(head.starts_with("HEAD "))
    }

    /// Whether the server closed the connection.
    pub fn is_closed(&mut self) -> bool {
        let mut byte = [0];
        matches!(self.reader.read(&mut byte), Ok(0))
    }
}

pub fn get(address: SocketAddr, path: &str) -> Response {
    Client::connect(address).request(&format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n"))
}

/// Polls `condition` until it holds, giving up after five seconds.
pub fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while std::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    condition()
}
