// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

mod common;

use std::{fs, os::unix::fs::PermissionsExt};

use common::{get, TestServer};

fn with_script(name: &str, source: &str) -> TestServer {
    let server = TestServer::start(|_, config| config.cgi_path = Some("/cgi-bin".to_owned()));
    let path = server.path(&format!("cgi-bin/{name}"));
    server.write(&format!("cgi-bin/{name}"), source);
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    server
}

#[test]
fn runs_the_script_and_relays_its_output() {
    let server = with_script(
        "echo.sh",
        "#!/bin/sh\n\
         printf 'Status: 201 Created\\r\\nContent-Type: text/plain\\r\\nX-Path: %s\\r\\nX-Host: %s\\r\\n\\r\\n' \"$PATH_INFO\" \"$SERVER_NAME\"\n\
         printf '%s %s' \"$REQUEST_METHOD\" \"$QUERY_STRING\"\n",
    );

    let mut client = server.client();
    let response = client.request("GET /cgi-bin/echo.sh/extra/path?x=1 HTTP/1.1\r\nHost: localhost\r\n\r\n");

    assert_eq!(response.status_line, "HTTP/1.1 201 Created");
    assert_eq!(response.header("X-Path"), Some("/extra/path"));
    assert_eq!(response.header("X-Host"), Some("localhost"));
    assert_eq!(response.header("Connection"), Some("Close"));
    assert_eq!(response.text(), "GET x=1");
    assert!(client.is_closed());
}

#[test]
fn server_headers_win_over_the_script() {
    let server = with_script(
        "spoof.sh",
        "#!/bin/sh\nprintf 'Server: spoofed\\nConnection: keep-alive\\n\\nbody'\n",
    );

    let response = get(server.address, "/cgi-bin/spoof.sh");
    assert_eq!(response.status(), 200);
    assert_eq!(response.header("Server"), Some("portiere/test"));
    assert_eq!(response.header("Connection"), Some("Close"));
    assert_eq!(response.text(), "body");
}

#[test]
fn script_without_header_block_is_an_internal_error() {
    let server = with_script("broken.sh", "#!/bin/sh\nprintf 'no header here'\n");

    let mut client = server.client();
    let response = client.request("GET /cgi-bin/broken.sh HTTP/1.1\r\nHost: localhost\r\n\r\n");
    assert_eq!(response.status(), 500);
    assert!(client.is_closed());
}

#[test]
fn missing_script_reports_the_exec_failure() {
    let server = TestServer::start(|_, config| config.cgi_path = Some("/cgi-bin".to_owned()));

    let response = get(server.address, "/cgi-bin/nothing.sh");
    assert_eq!(response.status(), 500);
    assert!(response.text().starts_with("execve "), "{}", response.text());
    assert!(response.text().contains("nothing.sh"));
}

#[test]
fn output_larger_than_the_pipe_is_relayed_completely() {
    let server = with_script(
        "zeros.sh",
        "#!/bin/sh\n\
         printf 'Content-Type: application/octet-stream\\r\\n\\r\\n'\n\
         dd if=/dev/zero bs=4096 count=256 2>/dev/null\n\
         printf 'end'\n",
    );

    let mut client = server.client();
    client.send("GET /cgi-bin/zeros.sh HTTP/1.1\r\nHost: localhost\r\n\r\n");
    std::thread::sleep(std::time::Duration::from_millis(500));

    let response = client.response(false);
    assert_eq!(response.status(), 200);
    assert_eq!(response.body.len(), 1024 * 1024 + 3);
    assert!(response.body[..1024 * 1024].iter().all(|&byte| byte == 0));
    assert!(response.body.ends_with(b"end"));
}
