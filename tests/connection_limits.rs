// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

mod common;

use std::{
    io::{ErrorKind, Read, Write},
    net::TcpStream,
    time::{Duration, Instant},
};

use common::TestServer;

const REQUEST: &str = "GET /one.txt HTTP/1.1\r\nHost: localhost\r\n\r\n";

#[test]
fn idle_keep_alive_connection_is_closed() {
    let server = TestServer::start(|_, config| config.keepalive_secs = 1);
    server.write("one.txt", "1");

    let mut client = server.client();
    assert_eq!(client.request(REQUEST).text(), "1");

    let idle_since = Instant::now();
    assert!(client.is_closed());
    let idle = idle_since.elapsed();
    assert!(idle >= Duration::from_millis(500), "closed after {idle:?}");
    assert!(idle < Duration::from_secs(5), "closed after {idle:?}");
}

#[test]
fn idle_connections_are_reclaimed_near_the_limit() {
    let server = TestServer::start(|_, config| config.max_connections = 2);
    server.write("one.txt", "1");

    let mut idle = server.client();
    assert_eq!(idle.request(REQUEST).text(), "1");

    let mut busy = server.client();
    assert_eq!(busy.request(REQUEST).text(), "1");
    assert!(idle.is_closed());
}

#[test]
fn accepting_pauses_at_the_limit() {
    let server = TestServer::start(|_, config| config.max_connections = 1);
    server.write("one.txt", "1");

    // Holds the only slot while it hasn't sent a complete request.
    let holder = TcpStream::connect(server.address).unwrap();
    std::thread::sleep(Duration::from_millis(200));

    let mut waiting = TcpStream::connect(server.address).unwrap();
    waiting.write_all(REQUEST.as_bytes()).unwrap();
    waiting.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
    let mut byte = [0];
    let error = waiting.read(&mut byte).unwrap_err();
    assert!(matches!(error.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut), "{error}");

    drop(holder);
    waiting.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    let mut response = Vec::new();
    let mut buffer = [0; 1024];
    while !response.ends_with(b"\r\n\r\n1") {
        let read = waiting.read(&mut buffer).unwrap();
        assert_ne!(read, 0, "closed early: {}", String::from_utf8_lossy(&response));
        response.extend_from_slice(&buffer[..read]);
    }
    assert!(response.starts_with(b"HTTP/1.1 200 OK\r\n"));
}
