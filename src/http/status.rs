// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

/// The status codes this server generates itself. Gateway programs may send
/// any status line, those are forwarded as text and never mapped to this
/// type.
///
/// RFC 9110: https://httpwg.org/specs/rfc9110.html#status.codes
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u16)]
pub enum StatusCode {
    Ok = 200,
    PartialContent = 206,

    Found = 302,
    NotModified = 304,

    BadRequest = 400,
    Unauthorized = 401,
    Forbidden = 403,
    NotFound = 404,
    RequestTimeout = 408,
    PreconditionFailed = 412,

    InternalServerError = 500,
    NotImplemented = 501,
}

impl StatusCode {
    #[must_use]
    pub const fn code(self) -> u16 {
        self as u16
    }

    /// The text following `HTTP/1.1 ` in the status line.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            StatusCode::Ok => "200 OK",
            StatusCode::PartialContent => "206 Partial Content",
            StatusCode::Found => "302 Found",
            StatusCode::NotModified => "304 Not Modified",
            StatusCode::BadRequest => "400 Bad Request",
            StatusCode::Unauthorized => "401 Unauthorized",
            StatusCode::Forbidden => "403 Forbidden",
            StatusCode::NotFound => "404 Not Found",
            StatusCode::RequestTimeout => "408 Request Timeout",
            StatusCode::PreconditionFailed => "412 Precondition Failed",
            StatusCode::InternalServerError => "500 Internal Server Error",
            StatusCode::NotImplemented => "501 Not Implemented",
        }
    }

    /// The fixed plaintext body sent with an error response.
    #[must_use]
    pub const fn error_body(self) -> Option<&'static str> {
        Some(match self {
            StatusCode::Ok | StatusCode::PartialContent | StatusCode::Found | StatusCode::NotModified => return None,
            StatusCode::BadRequest => "The request could not be understood.\n",
            StatusCode::Unauthorized => "Authentication is required for this resource.\n",
            StatusCode::Forbidden => "Access to this resource is forbidden.\n",
            StatusCode::NotFound => "The requested file or directory does not exist.\n",
            StatusCode::RequestTimeout => "No complete request arrived in time.\n",
            StatusCode::PreconditionFailed => "A precondition of the request was not met.\n",
            StatusCode::InternalServerError => "The server failed to handle this request.\n",
            StatusCode::NotImplemented => "This request method is not supported.\n",
        })
    }

    /// Whether the connection may be kept alive after an error response with
    /// this status. Malformed input, timeouts and server faults always end
    /// the connection.
    #[must_use]
    pub const fn permits_keep_alive(self) -> bool {
        !matches!(
            self,
            StatusCode::BadRequest
                | StatusCode::RequestTimeout
                | StatusCode::InternalServerError
                | StatusCode::NotImplemented
        )
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(StatusCode::Ok, "200 OK")]
    #[case(StatusCode::PartialContent, "206 Partial Content")]
    #[case(StatusCode::PreconditionFailed, "412 Precondition Failed")]
    #[case(StatusCode::NotImplemented, "501 Not Implemented")]
    fn status_line_text_starts_with_code(#[case] status: StatusCode, #[case] expected: &str) {
        assert_eq!(status.as_str(), expected);
        assert!(status.as_str().starts_with(&status.code().to_string()));
    }

    #[rstest]
    #[case(StatusCode::BadRequest, false)]
    #[case(StatusCode::Unauthorized, true)]
    #[case(StatusCode::Forbidden, true)]
    #[case(StatusCode::NotFound, true)]
    #[case(StatusCode::RequestTimeout, false)]
    #[case(StatusCode::PreconditionFailed, true)]
    #[case(StatusCode::InternalServerError, false)]
    #[case(StatusCode::NotImplemented, false)]
    fn keep_alive_after_error(#[case] status: StatusCode, #[case] expected: bool) {
        assert_eq!(status.permits_keep_alive(), expected);
        assert!(status.error_body().is_some());
    }

    #[test]
    fn success_statuses_have_no_error_body() {
        assert_eq!(StatusCode::Ok.error_body(), None);
        assert_eq!(StatusCode::NotModified.error_body(), None);
    }
}
