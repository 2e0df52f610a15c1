// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

//! Maps a validated request onto what answers it: a file, a directory
//! listing, a gateway program or an error.

use std::{
    ffi::OsString,
    fs::{File, Metadata},
    io,
    net::SocketAddr,
    os::unix::ffi::{OsStrExt, OsStringExt},
    path::PathBuf,
    sync::Arc,
    time::SystemTime,
};

use nix::unistd::User;
use tracing::{debug, warn};

use crate::{
    cgi::{GatewayContext, GatewayInvocation, GatewayStream},
    context::ServerContext,
    http::{HttpParseError, RangeParseError, RangeSet, Request, RequestError, StatusCode},
    resources::{DirectoryListing, ListingError, ListingRequest, MediaType},
};

/// A regular file selected for sending, with the status it is sent with.
#[derive(Debug)]
pub struct FileReply {
    pub file: File,
    pub size: u64,
    pub media_type: String,

    /// The modification time as an RFC 1123 date.
    pub mtime: String,
    pub modified: SystemTime,

    /// One of 200, 206 or 304.
    pub status: StatusCode,

    /// Only present with 206.
    pub ranges: Option<RangeSet>,
}

#[derive(Debug)]
pub enum Reply {
    Error(RequestError),

    /// The request named a directory without the trailing slash. Holds the
    /// path to redirect to.
    Redirect(Vec<u8>),

    Listing {
        listing: Arc<DirectoryListing>,
        modified: SystemTime,
        not_modified: bool,
    },

    File(FileReply),

    Gateway(GatewayStream),

    /// The gateway program couldn't be started. Holds the text sent in its
    /// place.
    GatewayFailure(Vec<u8>),
}

impl From<RequestError> for Reply {
    fn from(error: RequestError) -> Self {
        Reply::Error(error)
    }
}

/// Decides how to answer `request`, which has passed
/// [`Request::validate`].
pub async fn resolve(context: &ServerContext, request: &Request, remote: SocketAddr, local: SocketAddr) -> Reply {
    if let Some(prefix) = &context.config.cgi_path {
        if request.path.starts_with(prefix.as_bytes()) {
            return start_gateway(context, request, prefix.as_bytes(), remote, local);
        }
    }

    let filename = match filename(context, request) {
        Ok(filename) => filename,
        Err(error) => return error.into(),
    };

    if filename.ends_with(b"/") {
        if let Some(index) = &context.config.index_file {
            let mut candidate = filename.clone();
            candidate.extend_from_slice(index.as_bytes());
            match File::open(to_path(&candidate)) {
                Ok(file) => return serve_file(context, request, file, &candidate),
                Err(error) if error.kind() == io::ErrorKind::NotFound => (),
                Err(_) => return RequestError::Forbidden.into(),
            }
        }
        return serve_listing(context, request, filename).await;
    }

    match File::open(to_path(&filename)) {
        Ok(file) => serve_file(context, request, file, &filename),
        Err(error) => open_error(&error).into(),
    }
}

/// Builds the filesystem path for the request, expanding `/~user/` paths
/// when user directories are enabled.
fn filename(context: &ServerContext, request: &Request) -> Result<Vec<u8>, RequestError> {
    let config = &context.config;

    if let Some(user_dir) = &config.user_dir {
        if request.path.get(1) == Some(&b'~') {
            let rest = &request.path[2..];
            let slash = rest.iter().position(|&b| b == b'/').ok_or(RequestError::NotFound)?;
            let name = std::str::from_utf8(&rest[..slash]).map_err(|_| RequestError::NotFound)?;
            let user = User::from_name(name).ok().flatten().ok_or(RequestError::NotFound)?;

            let mut filename = user.dir.into_os_string().into_vec();
            filename.push(b'/');
            filename.extend_from_slice(user_dir.as_bytes());
            filename.push(b'/');
            filename.extend_from_slice(&rest[slash + 1..]);
            return Ok(filename);
        }
    }

    let mut filename = config.document_root.as_os_str().as_bytes().to_vec();
    if config.virtual_hosts {
        filename.push(b'/');
        filename.extend_from_slice(request.host.as_bytes());
    }
    filename.extend_from_slice(&request.path);
    Ok(filename)
}

fn to_path(filename: &[u8]) -> PathBuf {
    PathBuf::from(OsString::from_vec(filename.to_vec()))
}

fn open_error(error: &io::Error) -> RequestError {
    match error.kind() {
        io::ErrorKind::PermissionDenied => RequestError::Forbidden,
        _ => RequestError::NotFound,
    }
}

fn modification(metadata: &Metadata) -> (SystemTime, String) {
    let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
    (modified, httpdate::fmt_http_date(modified))
}

async fn serve_listing(context: &ServerContext, request: &Request, directory: Vec<u8>) -> Reply {
    if context.config.no_listing {
        return RequestError::Forbidden.into();
    }

    let directory = to_path(&directory);
    let metadata = match std::fs::metadata(&directory) {
        Ok(metadata) => metadata,
        Err(error) => return open_error(&error).into(),
    };
    let (modified, mtime) = modification(&metadata);

    let render = ListingRequest {
        directory: directory.clone(),
        url_path: request.path.clone(),
        host: request.host.clone(),
        port: context.port,
        server_name: context.responses.server_name().to_owned(),
        chrooted: context.config.chrooted,
    };

    match context.cache.acquire(&directory, &mtime, move || render.render()).await {
        Ok(listing) => Reply::Listing {
            not_modified: request.if_modified_since.as_deref() == Some(listing.mtime.as_str()),
            listing,
            modified,
        },
        Err(ListingError::Forbidden) => RequestError::Forbidden.into(),
        Err(ListingError::Internal) => RequestError::Internal.into(),
    }
}

fn serve_file(context: &ServerContext, request: &Request, file: File, filename: &[u8]) -> Reply {
    let metadata = match file.metadata() {
        Ok(metadata) => metadata,
        Err(error) => {
            warn!("Failed to stat an opened file: {error}");
            return RequestError::Internal.into();
        }
    };

    // Range syntax is checked before the file type, as the size is known.
    let mut ranges = match request.range.as_deref().map(|value| RangeSet::parse(value, metadata.len())) {
        None => None,
        Some(Ok(ranges)) => Some(ranges),
        Some(Err(RangeParseError::Unsatisfiable)) => None,
        Some(Err(RangeParseError::Syntax)) => return RequestError::from(HttpParseError::InvalidRange).into(),
    };

    if metadata.is_dir() {
        let mut location = request.path.clone();
        location.push(b'/');
        return Reply::Redirect(location);
    }
    if !metadata.is_file() {
        return RequestError::Forbidden.into();
    }

    let media_type = MediaType::from_path(filename)
        .map(|media_type| media_type.as_str().to_owned())
        .unwrap_or_else(|| context.config.default_mime.clone());
    let (modified, mtime) = modification(&metadata);

    if request.if_range.as_deref().is_some_and(|token| token != mtime) {
        debug!("If-Range doesn't match, sending the whole file");
        ranges = None;
    }

    if request.if_unmodified_since.as_deref().is_some_and(|token| token != mtime) {
        return RequestError::PreconditionFailed.into();
    }

    let status = if request.if_modified_since.as_deref() == Some(mtime.as_str()) {
        ranges = None;
        StatusCode::NotModified
    } else if ranges.is_some() {
        StatusCode::PartialContent
    } else {
        StatusCode::Ok
    };

    Reply::File(FileReply {
        file,
        size: metadata.len(),
        media_type,
        mtime,
        modified,
        status,
        ranges,
    })
}

fn start_gateway(context: &ServerContext, request: &Request, prefix: &[u8], remote: SocketAddr, local: SocketAddr) -> Reply {
    let gateway = GatewayContext {
        document_root: &context.config.document_root,
        prefix,
        server_host: &context.server_host,
        server_name: context.responses.server_name(),
        remote,
        local,
    };
    let invocation = GatewayInvocation::new(request, &gateway);

    match invocation.spawn(context.config.gateway_debug) {
        Ok(stream) => Reply::Gateway(stream),
        Err(error) => {
            warn!("Failed to start gateway {}: {error}", invocation.script.display());
            Reply::GatewayFailure(invocation.failure_body(&error))
        }
    }
}
