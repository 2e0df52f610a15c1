// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

use strum_macros::AsRefStr;

use super::StatusCode;

/// An error that can occur while parsing an HTTP request head.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, AsRefStr)]
pub enum HttpParseError {
    /// The buffer filled up before the blank line ending the head arrived.
    HeaderTooLarge,

    /// The first token isn't one of the methods this server recognizes.
    ///
    /// ## Example:
    /// ```text
    /// BREW /pot HTTP/1.1
    /// ```
    UnknownMethod,

    /// The request line doesn't have the `METHOD target HTTP/x.y` shape.
    InvalidRequestLine,

    /// The version part of the request line couldn't be parsed.
    InvalidHttpVersion,

    /// The request target is neither origin-form nor a usable absolute-form.
    ///
    /// ## Example:
    /// ```text
    /// GET ftp://example.org/file HTTP/1.1
    /// ```
    InvalidRequestTarget,

    /// The decoded path doesn't start with a slash.
    PathNotAbsolute,

    /// The host name contains characters other than letters, digits, `-`
    /// and `.`, starts with a dot, or has two dots in a row.
    InvalidHost,

    /// Virtual hosting is enabled and an HTTP/1.1 request came without a
    /// `Host` header.
    MissingHost,

    /// The `Range` header has a syntax error.
    InvalidRange,
}

/// The reason a request was answered with an error response.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum RequestError {
    Malformed(HttpParseError),
    Unauthorized,
    Forbidden,
    NotFound,
    MethodNotImplemented,
    Timeout,
    PreconditionFailed,
    Internal,
}

impl RequestError {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            RequestError::Malformed(_) => StatusCode::BadRequest,
            RequestError::Unauthorized => StatusCode::Unauthorized,
            RequestError::Forbidden => StatusCode::Forbidden,
            RequestError::NotFound => StatusCode::NotFound,
            RequestError::MethodNotImplemented => StatusCode::NotImplemented,
            RequestError::Timeout => StatusCode::RequestTimeout,
            RequestError::PreconditionFailed => StatusCode::PreconditionFailed,
            RequestError::Internal => StatusCode::InternalServerError,
        }
    }
}

impl From<HttpParseError> for RequestError {
    fn from(error: HttpParseError) -> Self {
        RequestError::Malformed(error)
    }
}

impl std::fmt::Display for RequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestError::Malformed(error) => write!(f, "malformed request: {}", error.as_ref()),
            other => f.write_str(other.status().as_str()),
        }
    }
}

impl std::error::Error for RequestError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_requests_are_bad_requests() {
        let error = RequestError::from(HttpParseError::InvalidHost);
        assert_eq!(error.status(), StatusCode::BadRequest);
        assert_eq!(error.to_string(), "malformed request: InvalidHost");
    }

    #[test]
    fn display_uses_status_line() {
        assert_eq!(RequestError::Forbidden.to_string(), "403 Forbidden");
    }
}
