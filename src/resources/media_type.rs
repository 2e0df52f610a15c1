// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

use phf::phf_map;
use unicase::UniCase;

/// The `Content-Type` of a served file, looked up by extension. Files with
/// an unknown extension get the configured default.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MediaType(&'static str);

impl MediaType {
    pub const HTML: MediaType = MediaType::common("text/html");
    pub const PLAIN_TEXT: MediaType = MediaType::common("text/plain");
    pub const OCTET_STREAM: MediaType = MediaType::common("application/octet-stream");

    const fn common(value: &'static str) -> Self {
        Self(value)
    }

    pub fn as_str(&self) -> &'static str {
        self.0
    }

    /// Returns the media type for the given extension, if it is known.
    #[must_use]
    pub fn from_extension(extension: &str) -> Option<&'static MediaType> {
        MEDIA_TYPE_BY_EXTENSION.get(&UniCase::ascii(extension))
    }

    /// Looks at the part of the final path segment after its last dot.
    #[must_use]
    pub fn from_path(path: &[u8]) -> Option<&'static MediaType> {
        let name = path.rsplit(|&b| b == b'/').next()?;
        let dot = name.iter().rposition(|&b| b == b'.')?;
        let extension = std::str::from_utf8(&name[dot + 1..]).ok()?;
        MediaType::from_extension(extension)
    }
}

static MEDIA_TYPE_BY_EXTENSION: phf::Map<UniCase<&'static str>, MediaType> = phf_map!(
    UniCase::ascii("css") => MediaType::common("text/css"),
    UniCase::ascii("csv") => MediaType::common("text/csv"),
    UniCase::ascii("htm") => MediaType::HTML,
    UniCase::ascii("html") => MediaType::HTML,
    UniCase::ascii("js") => MediaType::common("text/javascript"),
    UniCase::ascii("md") => MediaType::common("text/markdown"),
    UniCase::ascii("txt") => MediaType::PLAIN_TEXT,
    UniCase::ascii("yaml") => MediaType::common("text/yaml"),

    UniCase::ascii("bin") => MediaType::OCTET_STREAM,
    UniCase::ascii("json") => MediaType::common("application/json"),
    UniCase::ascii("pdf") => MediaType::common("application/pdf"),
    UniCase::ascii("ps") => MediaType::common("application/postscript"),
    UniCase::ascii("zip") => MediaType::common("application/zip"),
    UniCase::ascii("gz") => MediaType::common("application/gzip"),
    UniCase::ascii("bz2") => MediaType::common("application/x-bzip2"),
    UniCase::ascii("xz") => MediaType::common("application/x-xz"),
    UniCase::ascii("tar") => MediaType::common("application/x-tar"),
    UniCase::ascii("xml") => MediaType::common("application/xml"),
    UniCase::ascii("iso") => MediaType::common("application/x-iso9660-image"),

    UniCase::ascii("gif") => MediaType::common("image/gif"),
    UniCase::ascii("ico") => MediaType::common("image/x-icon"),
    UniCase::ascii("jpeg") => MediaType::common("image/jpeg"),
    UniCase::ascii("jpg") => MediaType::common("image/jpeg"),
    UniCase::ascii("png") => MediaType::common("image/png"),
    UniCase::ascii("svg") => MediaType::common("image/svg+xml"),
    UniCase::ascii("webp") => MediaType::common("image/webp"),

    UniCase::ascii("mp3") => MediaType::common("audio/mpeg"),
    UniCase::ascii("ogg") => MediaType::common("audio/ogg"),
    UniCase::ascii("wav") => MediaType::common("audio/wav"),

    UniCase::ascii("avi") => MediaType::common("video/x-msvideo"),
    UniCase::ascii("mkv") => MediaType::common("video/x-matroska"),
    UniCase::ascii("mov") => MediaType::common("video/quicktime"),
    UniCase::ascii("mp4") => MediaType::common("video/mp4"),
    UniCase::ascii("mpeg") => MediaType::common("video/mpeg"),
    UniCase::ascii("webm") => MediaType::common("video/webm"),

    UniCase::ascii("woff") => MediaType::common("font/woff"),
    UniCase::ascii("woff2") => MediaType::common("font/woff2"),
);
