// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

use base64::{
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
    Engine,
};

use super::{HeaderLineList, HttpParseError, HttpVersion, Method, RequestError};

/// The largest request head that is accepted, including the blank line.
pub const MAX_HEADER: usize = 4096;

const BASIC_CREDENTIALS: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Looks for a complete request head at the start of `buffer`.
///
/// Returns the length of the head including its terminating blank line, or
/// `None` while more bytes are needed. Once five bytes have arrived they must
/// begin with one of the recognized methods.
pub fn scan_head(buffer: &[u8]) -> Result<Option<usize>, HttpParseError> {
    if buffer.len() < 5 {
        return Ok(None);
    }

    const PREFIXES: [&[u8]; 4] = [b"GET ", b"PUT ", b"HEAD ", b"POST "];
    if !PREFIXES.iter().any(|prefix| buffer.starts_with(prefix)) {
        return Err(HttpParseError::UnknownMethod);
    }

    let crlf = find(buffer, b"\r\n\r\n").map(|index| index + 4);
    let lf = find(buffer, b"\n\n").map(|index| index + 2);
    let end = match (crlf, lf) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };

    match end {
        Some(end) => Ok(Some(end)),
        None if buffer.len() >= MAX_HEADER => Err(HttpParseError::HeaderTooLarge),
        None => Ok(None),
    }
}

pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

/// Server-wide facts that decide whether a syntactically valid request is
/// acceptable.
#[derive(Clone, Copy, Debug)]
pub struct RequestPolicy<'a> {
    pub virtual_hosts: bool,
    pub server_host: &'a str,
    pub credentials: Option<&'a [u8]>,
}

/// A parsed request head.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    pub method: Method,

    /// The request target as sent, minus scheme and authority when it was
    /// in absolute-form.
    pub uri: String,

    /// The percent-decoded and normalised path.
    pub path: Vec<u8>,

    /// The percent-decoded query, with `+` mapped to a space.
    pub query: Vec<u8>,

    pub version: HttpVersion,

    /// Lowercased host name, empty until [`Request::validate`] decided on
    /// one when the client sent none.
    pub host: String,

    pub headers: HeaderLineList,
    pub keep_alive: bool,

    pub if_modified_since: Option<String>,
    pub if_unmodified_since: Option<String>,
    pub if_range: Option<String>,

    /// The part of the `Range` header after `bytes=`.
    pub range: Option<String>,

    /// Decoded `user:password` of a `Basic` authorization.
    pub credentials: Option<Vec<u8>>,
}

impl Request {
    /// Parses the request line and collects the header fields of `head`.
    /// Validation of the collected values happens in [`Request::validate`].
    pub fn parse(head: &[u8]) -> Result<Self, HttpParseError> {
        let head = String::from_utf8_lossy(head);
        let mut lines = head.split('\n').map(|line| line.strip_suffix('\r').unwrap_or(line));

        let request_line = lines.next().ok_or(HttpParseError::InvalidRequestLine)?;
        let mut parts = request_line.split_ascii_whitespace();
        let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(HttpParseError::InvalidRequestLine);
        };

        let method = Method::from_token(method).ok_or(HttpParseError::UnknownMethod)?;
        let version = parse_version(version)?;
        let (uri, host) = split_target(target)?;
        let (path, query) = decode_target(uri.as_bytes());

        let mut request = Request {
            method,
            uri,
            path,
            query,
            version,
            host: host.unwrap_or_default(),
            headers: HeaderLineList::new(),
            keep_alive: version.defaults_to_keep_alive(),
            if_modified_since: None,
            if_unmodified_since: None,
            if_range: None,
            range: None,
            credentials: None,
        };

        let mut host_header = None;
        for line in lines.take_while(|line| !line.is_empty()) {
            request.headers.push(line);
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();

            match name.trim().to_ascii_lowercase().as_str() {
                "connection" => {
                    if let Some(keep_alive) = connection_preference(value) {
                        request.keep_alive = keep_alive;
                    }
                }
                "host" => host_header = Some(host_from_header(value)),
                "if-modified-since" => request.if_modified_since = Some(value.to_owned()),
                "if-unmodified-since" => request.if_unmodified_since = Some(value.to_owned()),
                "if-range" => request.if_range = Some(value.to_owned()),
                "range" => {
                    if let Some(ranges) = strip_prefix_ignore_case(value, "bytes=") {
                        request.range = Some(ranges.to_owned());
                    }
                }
                "authorization" => {
                    if let Some(encoded) = strip_prefix_ignore_case(value, "basic ") {
                        request.credentials = BASIC_CREDENTIALS.decode(encoded.trim()).ok();
                    }
                }
                _ => (),
            }
        }

        if request.host.is_empty() {
            if let Some(host) = host_header {
                request.host = host;
            }
        }

        Ok(request)
    }

    #[must_use]
    pub fn is_head(&self) -> bool {
        self.method == Method::Head
    }

    /// Applies the checks that come after parsing, in order: method support,
    /// host name, path sanity and credentials.
    pub fn validate(&mut self, policy: &RequestPolicy<'_>) -> Result<(), RequestError> {
        if !matches!(self.method, Method::Get | Method::Head) {
            return Err(RequestError::MethodNotImplemented);
        }

        if policy.virtual_hosts {
            if self.host.is_empty() {
                if self.version >= HttpVersion::HTTP_1_1 {
                    return Err(HttpParseError::MissingHost.into());
                }
                self.host = policy.server_host.to_owned();
            } else {
                self.host = validate_host(&self.host)?;
            }
        } else {
            self.host = policy.server_host.to_owned();
        }

        if self.path.first() != Some(&b'/') {
            return Err(HttpParseError::PathNotAbsolute.into());
        }

        if find(&self.path, b"/../").is_some() {
            return Err(RequestError::Forbidden);
        }

        if let Some(expected) = policy.credentials {
            if self.credentials.as_deref() != Some(expected) {
                return Err(RequestError::Unauthorized);
            }
        }

        Ok(())
    }
}

fn parse_version(text: &str) -> Result<HttpVersion, HttpParseError> {
    let numbers = text.strip_prefix("HTTP/").ok_or(HttpParseError::InvalidHttpVersion)?;
    let (major, minor) = numbers.split_once('.').ok_or(HttpParseError::InvalidHttpVersion)?;
    Ok(HttpVersion {
        major: major.parse().map_err(|_| HttpParseError::InvalidHttpVersion)?,
        minor: minor.parse().map_err(|_| HttpParseError::InvalidHttpVersion)?,
    })
}

/// Splits an absolute-form target into its path and host. Origin-form
/// targets are returned unchanged.
fn split_target(target: &str) -> Result<(String, Option<String>), HttpParseError> {
    if target.starts_with('/') {
        return Ok((target.to_owned(), None));
    }

    let (scheme, rest) = target.split_once("://").ok_or(HttpParseError::InvalidRequestTarget)?;
    if !scheme.is_empty() && !scheme.eq_ignore_ascii_case("http") {
        return Err(HttpParseError::InvalidRequestTarget);
    }

    let authority_end = rest.find('/').ok_or(HttpParseError::InvalidRequestTarget)?;
    let (authority, path) = rest.split_at(authority_end);
    let host = match authority.split_once(':') {
        Some((host, port)) if port.bytes().all(|b| b.is_ascii_digit()) => host,
        Some(_) => return Err(HttpParseError::InvalidRequestTarget),
        None => authority,
    };

    let host_is_plain = host.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'-');
    if host.is_empty() || !host_is_plain {
        return Err(HttpParseError::InvalidRequestTarget);
    }

    Ok((path.to_owned(), Some(host.to_owned())))
}

/// Splits the target at the first `?` and percent-decodes both halves.
fn decode_target(uri: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let (path, query) = match uri.iter().position(|&b| b == b'?') {
        Some(index) => (&uri[..index], &uri[index + 1..]),
        None => (uri, &uri[uri.len()..]),
    };

    let query: Vec<u8> = query.iter().map(|&b| if b == b'+' { b' ' } else { b }).collect();
    let path = urlencoding::decode_binary(path).into_owned();
    let query = urlencoding::decode_binary(&query).into_owned();
    (normalize_path(&path), query)
}

/// Collapses `//` into `/` and removes `/./` segments.
pub fn normalize_path(path: &[u8]) -> Vec<u8> {
    let mut normalized = Vec::with_capacity(path.len());
    let mut rest = path;
    while let Some(&byte) = rest.first() {
        if rest.starts_with(b"//") {
            rest = &rest[1..];
        } else if rest.starts_with(b"/./") {
            rest = &rest[2..];
        } else {
            normalized.push(byte);
            rest = &rest[1..];
        }
    }
    normalized
}

/// Interprets the `Connection` header. `close` wins over `keep-alive`, other
/// tokens leave the version default in place.
fn connection_preference(value: &str) -> Option<bool> {
    let mut preference = None;
    for token in value.split(',').map(str::trim) {
        if token.eq_ignore_ascii_case("close") {
            return Some(false);
        }
        if token.eq_ignore_ascii_case("keep-alive") {
            preference = Some(true);
        }
    }
    preference
}

fn host_from_header(value: &str) -> String {
    if value.starts_with('[') {
        // IPv6 literals can't name a virtual host.
        return String::new();
    }
    match value.rsplit_once(':') {
        Some((host, _port)) => host.to_owned(),
        None => value.to_owned(),
    }
}

fn validate_host(host: &str) -> Result<String, HttpParseError> {
    let mut previous = None;
    for (index, byte) in host.bytes().enumerate() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' => (),
            b'.' if index != 0 && previous != Some(b'.') => (),
            _ => return Err(HttpParseError::InvalidHost),
        }
        previous = Some(byte);
    }
    Ok(host.to_ascii_lowercase())
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    let head = value.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        Some(&value[prefix.len()..])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    const POLICY: RequestPolicy<'static> = RequestPolicy {
        virtual_hosts: false,
        server_host: "server.local",
        credentials: None,
    };

    fn parse(head: &str) -> Request {
        Request::parse(head.as_bytes()).unwrap()
    }

    #[rstest]
    #[case("GET / HTTP/1.1\r\n\r\n", Some(18))]
    #[case("GET / HTTP/1.1\n\n", Some(16))]
    #[case("GET / HTTP/1.1\r\nHost: x\r\n\r\nGET /next", Some(27))]
    #[case("GET / HTTP/1.1\r\nHost: x\r\n", None)]
    #[case("GET", None)]
    #[case("HEAD /x HTTP/1.0\n\n", Some(18))]
    fn head_detection(#[case] buffer: &str, #[case] expected: Option<usize>) {
        assert_eq!(scan_head(buffer.as_bytes()), Ok(expected));
    }

    #[rstest]
    #[case("BREW /pot HTTP/1.1\r\n\r\n")]
    #[case("get / HTTP/1.1\r\n\r\n")]
    #[case("\x16\x03\x01\x02\x00")]
    fn head_detection_rejects_unknown_methods(#[case] buffer: &str) {
        assert_eq!(scan_head(buffer.as_bytes()), Err(HttpParseError::UnknownMethod));
    }

    #[test]
    fn head_detection_gives_up_on_full_buffer() {
        let mut buffer = b"GET /".to_vec();
        buffer.resize(MAX_HEADER, b'a');
        assert_eq!(scan_head(&buffer), Err(HttpParseError::HeaderTooLarge));
    }

    #[test]
    fn parses_request_line_and_fields() {
        let request = parse(
            "GET /a%20b/c.txt?x=1+2&y=%41 HTTP/1.1\r\n\
             Host: Example.org:8080\r\n\
             If-Modified-Since: Sun, 06 Nov 1994 08:49:37 GMT\r\n\
             Range: bytes=0-9\r\n\
             X-Custom: value\r\n\r\n",
        );

        assert_eq!(request.method, Method::Get);
        assert_eq!(request.uri, "/a%20b/c.txt?x=1+2&y=%41");
        assert_eq!(request.path, b"/a b/c.txt");
        assert_eq!(request.query, b"x=1 2&y=A");
        assert_eq!(request.version, HttpVersion::HTTP_1_1);
        assert_eq!(request.host, "Example.org");
        assert_eq!(request.if_modified_since.as_deref(), Some("Sun, 06 Nov 1994 08:49:37 GMT"));
        assert_eq!(request.range.as_deref(), Some("0-9"));
        assert_eq!(request.headers.len(), 4);
        assert!(request.keep_alive);
    }

    #[test]
    fn encoded_plus_in_query_stays_plus() {
        let request = parse("GET /?a=%2B HTTP/1.0\r\n\r\n");
        assert_eq!(request.query, b"a=+");
    }

    #[test]
    fn encoded_question_mark_is_part_of_the_path() {
        let request = parse("GET /what%3F?q HTTP/1.1\r\n\r\n");
        assert_eq!(request.path, b"/what?");
        assert_eq!(request.query, b"q");
    }

    #[rstest]
    #[case("/a//b", "/a/b")]
    #[case("//a///b/", "/a/b/")]
    #[case("/a/./b", "/a/b")]
    #[case("/./././x", "/x")]
    #[case("/a/../b", "/a/../b")]
    fn path_normalization(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(normalize_path(input.as_bytes()), expected.as_bytes());
    }

    #[rstest]
    #[case("GET http://Example.org:81/x HTTP/1.1\r\n\r\n", "/x", "Example.org")]
    #[case("GET HTTP://host/ HTTP/1.1\r\n\r\n", "/", "host")]
    #[case("GET ://host/y HTTP/1.1\r\nHost: other\r\n\r\n", "/y", "host")]
    fn absolute_form_targets(#[case] head: &str, #[case] path: &str, #[case] host: &str) {
        let request = parse(head);
        assert_eq!(request.path, path.as_bytes());
        assert_eq!(request.host, host);
    }

    #[rstest]
    #[case("GET ftp://host/x HTTP/1.1\r\n\r\n", HttpParseError::InvalidRequestTarget)]
    #[case("GET http://host HTTP/1.1\r\n\r\n", HttpParseError::InvalidRequestTarget)]
    #[case("GET /x\r\n\r\n", HttpParseError::InvalidRequestLine)]
    #[case("GET /x HTTP/one\r\n\r\n", HttpParseError::InvalidHttpVersion)]
    #[case("GET /x FTP/1.0\r\n\r\n", HttpParseError::InvalidHttpVersion)]
    fn malformed_request_lines(#[case] head: &str, #[case] expected: HttpParseError) {
        assert_eq!(Request::parse(head.as_bytes()), Err(expected));
    }

    #[rstest]
    #[case("HTTP/1.1", None, true)]
    #[case("HTTP/1.0", None, false)]
    #[case("HTTP/1.0", Some("Keep-Alive"), true)]
    #[case("HTTP/1.0", Some("keep-alive"), true)]
    // An explicit close ends the connection even on HTTP/1.1.
    #[case("HTTP/1.1", Some("close"), false)]
    #[case("HTTP/1.1", Some("Close"), false)]
    #[case("HTTP/1.1", Some("keep-alive, close"), false)]
    #[case("HTTP/1.1", Some("Upgrade"), true)]
    #[case("HTTP/1.0", Some("Upgrade"), false)]
    fn connection_header(#[case] version: &str, #[case] connection: Option<&str>, #[case] keep_alive: bool) {
        let head = match connection {
            Some(value) => format!("GET / {version}\r\nConnection: {value}\r\n\r\n"),
            None => format!("GET / {version}\r\n\r\n"),
        };
        assert_eq!(parse(&head).keep_alive, keep_alive);
    }

    #[rstest]
    #[case("Basic dXNlcjpwYXNz", Some(&b"user:pass"[..]))]
    #[case("basic dXNlcjpwYXNz", Some(&b"user:pass"[..]))]
    #[case("Basic dXNlcjpwYXM", Some(&b"user:pas"[..]))]
    #[case("Basic !!!", None)]
    #[case("Bearer abc", None)]
    fn basic_credentials(#[case] value: &str, #[case] expected: Option<&[u8]>) {
        let request = parse(&format!("GET / HTTP/1.1\r\nAuthorization: {value}\r\n\r\n"));
        assert_eq!(request.credentials.as_deref(), expected);
    }

    #[test]
    fn range_requires_bytes_unit() {
        assert_eq!(parse("GET / HTTP/1.1\r\nRange: items=0-1\r\n\r\n").range, None);
        assert_eq!(parse("GET / HTTP/1.1\r\nrange: Bytes=-5\r\n\r\n").range.as_deref(), Some("-5"));
    }

    #[rstest]
    #[case("POST / HTTP/1.1\r\n\r\n", RequestError::MethodNotImplemented)]
    #[case("PUT / HTTP/1.1\r\n\r\n", RequestError::MethodNotImplemented)]
    #[case("GET /a/../etc/passwd HTTP/1.1\r\n\r\n", RequestError::Forbidden)]
    #[case("GET /a/%2e%2e/b HTTP/1.1\r\n\r\n", RequestError::Forbidden)]
    #[case("GET /../ HTTP/1.1\r\n\r\n", RequestError::Forbidden)]
    #[case("GET x HTTP/1.1\r\n\r\n", RequestError::Malformed(HttpParseError::InvalidRequestTarget))]
    fn validation_errors(#[case] head: &str, #[case] expected: RequestError) {
        let result = Request::parse(head.as_bytes())
            .map_err(RequestError::from)
            .and_then(|mut request| request.validate(&POLICY));
        assert_eq!(result, Err(expected));
    }

    #[test]
    fn path_must_be_absolute() {
        let mut request = parse("GET /x HTTP/1.1\r\n\r\n");
        request.path = b"x".to_vec();
        assert_eq!(request.validate(&POLICY), Err(HttpParseError::PathNotAbsolute.into()));
    }

    #[test]
    fn without_virtual_hosts_the_server_host_is_used() {
        let mut request = parse("GET / HTTP/1.1\r\nHost: ..bogus\r\n\r\n");
        request.validate(&POLICY).unwrap();
        assert_eq!(request.host, "server.local");
    }

    #[rstest]
    #[case("GET / HTTP/1.1\r\nHost: WWW.Example.org\r\n\r\n", Ok("www.example.org"))]
    #[case("GET / HTTP/1.0\r\n\r\n", Ok("server.local"))]
    #[case("GET / HTTP/1.1\r\n\r\n", Err(HttpParseError::MissingHost))]
    #[case("GET / HTTP/1.1\r\nHost: [::1]:80\r\n\r\n", Err(HttpParseError::MissingHost))]
    #[case("GET / HTTP/1.1\r\nHost: .example.org\r\n\r\n", Err(HttpParseError::InvalidHost))]
    #[case("GET / HTTP/1.1\r\nHost: example..org\r\n\r\n", Err(HttpParseError::InvalidHost))]
    #[case("GET / HTTP/1.1\r\nHost: exa_mple.org\r\n\r\n", Err(HttpParseError::InvalidHost))]
    fn virtual_host_validation(#[case] head: &str, #[case] expected: Result<&str, HttpParseError>) {
        let policy = RequestPolicy { virtual_hosts: true, ..POLICY };
        let mut request = parse(head);
        let result = request.validate(&policy).map(|()| request.host.clone());
        assert_eq!(result, expected.map(str::to_owned).map_err(RequestError::from));
    }

    #[rstest]
    #[case(Some("Basic dXNlcjpwYXNz"), Ok(()))]
    #[case(Some("Basic dXNlcjp3cm9uZw=="), Err(RequestError::Unauthorized))]
    #[case(None, Err(RequestError::Unauthorized))]
    fn credentials_are_checked(#[case] authorization: Option<&str>, #[case] expected: Result<(), RequestError>) {
        let policy = RequestPolicy { credentials: Some(&b"user:pass"[..]), ..POLICY };
        let head = match authorization {
            Some(value) => format!("GET / HTTP/1.1\r\nAuthorization: {value}\r\n\r\n"),
            None => "GET / HTTP/1.1\r\n\r\n".to_owned(),
        };
        assert_eq!(parse(&head).validate(&policy), expected);
    }
}
