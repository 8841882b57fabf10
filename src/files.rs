//! Static file serving without directory listings

use crate::body::{empty, file, full, GatewayBody};
use crate::error::GatewayError;
use hyper::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use hyper::{Method, Response, StatusCode};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Body rendered for a directory without an index: an empty listing
const EMPTY_LISTING: &str =
    "<!doctype html>\n<meta name=\"viewport\" content=\"width=device-width\">\n<pre>\n</pre>\n";

/// A request path after percent-decoding and normalization.
///
/// `relative` never starts with `/`, never contains `.` or `..` segments,
/// empty segments or NUL bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizedPath {
    pub relative: String,
    pub trailing_slash: bool,
}

impl SanitizedPath {
    /// Normalize a raw (still percent-encoded) URI path. Returns `None` when
    /// the path tries to climb out of its root or is not valid UTF-8.
    pub fn parse(raw: &str) -> Option<Self> {
        let decoded = urlencoding::decode(raw).ok()?;
        let cleaned = decoded.replace('\0', "");
        let trailing_slash = cleaned.ends_with('/');

        let mut segments = Vec::new();
        for segment in cleaned.split(['/', '\\']) {
            match segment {
                "" | "." => continue,
                ".." => return None,
                s => segments.push(s),
            }
        }

        Some(Self {
            relative: segments.join("/"),
            trailing_slash,
        })
    }

    /// The path relative to `prefix` (given without slashes), if it lies under it
    pub fn strip_prefix(&self, prefix: &str) -> Option<SanitizedPath> {
        if self.relative == prefix {
            return Some(Self {
                relative: String::new(),
                trailing_slash: self.trailing_slash,
            });
        }
        self.relative
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('/'))
            .map(|rest| Self {
                relative: rest.to_string(),
                trailing_slash: self.trailing_slash,
            })
    }

    pub fn is_empty(&self) -> bool {
        self.relative.is_empty()
    }
}

/// Serves files below a root directory. Directories never list their entries.
#[derive(Debug, Clone)]
pub struct StaticFiles {
    root: PathBuf,
}

impl StaticFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Serve `path` below the root. `uri_path` is the path the client asked
    /// for, used to build the trailing-slash redirect for directories.
    pub async fn serve(
        &self,
        method: &Method,
        path: &SanitizedPath,
        uri_path: &str,
    ) -> Result<Response<GatewayBody>, GatewayError> {
        if method != Method::GET && method != Method::HEAD {
            return Err(GatewayError::MethodNotAllowed);
        }

        let full_path = self.root.join(&path.relative);
        let metadata = tokio::fs::metadata(&full_path).await.map_err(|e| {
            debug!(path = %full_path.display(), error = %e, "File not available");
            GatewayError::NotFound
        })?;

        if metadata.is_dir() {
            if !path.trailing_slash {
                return Ok(redirect(&format!("{}/", uri_path)));
            }
            let index = full_path.join("index.html");
            return match tokio::fs::metadata(&index).await {
                Ok(meta) if meta.is_file() => Ok(file_response(method, &index, meta.len())
                    .await
                    .unwrap_or_else(|_| html_response(method, EMPTY_LISTING))),
                _ => Ok(html_response(method, EMPTY_LISTING)),
            };
        }

        file_response(method, &full_path, metadata.len())
            .await
            .map_err(|e| {
                debug!(path = %full_path.display(), error = %e, "Failed to open file");
                GatewayError::NotFound
            })
    }
}

fn content_type_for(path: &Path) -> HeaderValue {
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    let value = if mime.type_() == mime_guess::mime::TEXT {
        format!("{}; charset=utf-8", mime.essence_str())
    } else {
        mime.essence_str().to_string()
    };
    HeaderValue::from_str(&value).unwrap_or(HeaderValue::from_static("application/octet-stream"))
}

/// Response streaming the file at `path`. HEAD never opens the file.
async fn file_response(
    method: &Method,
    path: &Path,
    len: u64,
) -> std::io::Result<Response<GatewayBody>> {
    let body = if method == Method::HEAD {
        empty()
    } else {
        file(tokio::fs::File::open(path).await?)
    };
    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, content_type_for(path));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
    Ok(response)
}

/// Build a `text/html` response, honoring HEAD
pub fn html_response(method: &Method, html: impl Into<String>) -> Response<GatewayBody> {
    let html = html.into();
    let len = html.len();
    let body = if method == Method::HEAD { empty() } else { full(html) };
    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
    response
}

/// 301 redirect to `location`
pub fn redirect(location: &str) -> Response<GatewayBody> {
    let mut response = Response::new(empty());
    *response.status_mut() = StatusCode::MOVED_PERMANENTLY;
    if let Ok(value) = HeaderValue::from_str(location) {
        response.headers_mut().insert(LOCATION, value);
    }
    response
}
