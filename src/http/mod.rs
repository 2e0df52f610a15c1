// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

pub mod error;
pub mod escape;
pub mod header_lines;
pub mod range;
pub mod request;
pub mod response;
pub mod status;

use std::fmt;

pub use self::{
    error::{HttpParseError, RequestError},
    header_lines::HeaderLineList,
    range::{ByteRange, Range, RangeParseError, RangeSet},
    request::{Request, RequestPolicy},
    response::ResponseBuilder,
    status::StatusCode,
};

/// The request methods that pass head detection. Only `GET` and `HEAD` are
/// served, the others are answered with 501.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
}

impl Method {
    #[must_use]
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "GET" => Some(Method::Get),
            "HEAD" => Some(Method::Head),
            "POST" => Some(Method::Post),
            "PUT" => Some(Method::Put),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HttpVersion {
    pub major: u16,
    pub minor: u16,
}

impl HttpVersion {
    pub const HTTP_1_0: HttpVersion = HttpVersion { major: 1, minor: 0 };
    pub const HTTP_1_1: HttpVersion = HttpVersion { major: 1, minor: 1 };

    /// Connections are persistent by default starting with HTTP/1.1.
    #[must_use]
    pub fn defaults_to_keep_alive(&self) -> bool {
        *self >= Self::HTTP_1_1
    }
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP/{}.{}", self.major, self.minor)
    }
}
