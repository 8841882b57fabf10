use super::{RequestContext, Stage};
use crate::body::{full, GatewayBody};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use flate2::write::{DeflateEncoder, GzEncoder};
use flate2::Compression;
use http_body_util::BodyExt;
use hyper::body::Bytes;
use hyper::header::{
    HeaderValue, CACHE_CONTROL, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, EXPIRES,
    LAST_MODIFIED, VARY,
};
use hyper::{Method, Response, StatusCode};
use std::io::Write;
use tracing::warn;

/// Seven days, in seconds
const MAX_AGE_SECS: i64 = 604_800;

const HTTP_DATE: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Largest body compressed in memory; bigger bodies stream through as identity
pub const MAX_COMPRESSED_BODY: u64 = 1024 * 1024;

/// Content types whose payload is already compressed
const PRECOMPRESSED_TYPES: [&str; 8] = [
    "application/zip",
    "application/gzip",
    "application/x-gzip",
    "application/x-7z-compressed",
    "application/x-rar-compressed",
    "application/x-bzip2",
    "font/woff",
    "font/woff2",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Gzip,
    Deflate,
}

impl Encoding {
    /// Pick an encoding from an `Accept-Encoding` value. Gzip wins over deflate
    /// regardless of order; `q=0` disables a coding.
    pub fn negotiate(accept: &str) -> Option<Self> {
        let mut gzip = false;
        let mut deflate = false;
        for item in accept.split(',') {
            let mut parts = item.split(';');
            let coding = parts.next().unwrap_or("").trim().to_ascii_lowercase();
            let disabled = parts.any(|p| {
                let p = p.trim();
                p.strip_prefix("q=")
                    .and_then(|q| q.trim().parse::<f32>().ok())
                    .is_some_and(|q| q == 0.0)
            });
            if disabled {
                continue;
            }
            match coding.as_str() {
                "gzip" | "x-gzip" => gzip = true,
                "deflate" => deflate = true,
                _ => {}
            }
        }
        if gzip {
            Some(Self::Gzip)
        } else if deflate {
            Some(Self::Deflate)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gzip => "gzip",
            Self::Deflate => "deflate",
        }
    }

    fn encode(self, data: &[u8]) -> std::io::Result<Vec<u8>> {
        match self {
            Self::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(data)?;
                encoder.finish()
            }
            Self::Deflate => {
                let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(data)?;
                encoder.finish()
            }
        }
    }
}

/// Week-long cache headers plus gzip/deflate content encoding.
///
/// `Last-Modified` is the time the stage was built, i.e. process start.
#[derive(Debug, Clone)]
pub struct CacheAndCompression {
    started: DateTime<Utc>,
}

impl Default for CacheAndCompression {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheAndCompression {
    pub fn new() -> Self {
        Self { started: Utc::now() }
    }

    fn set_cache_headers(&self, response: &mut Response<GatewayBody>) {
        let expires = Utc::now() + Duration::seconds(MAX_AGE_SECS);
        let headers = response.headers_mut();
        // Written as `max-age:<secs>`, not the standard `max-age=<secs>`
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("max-age:604800"));
        if let Ok(value) = HeaderValue::from_str(&self.started.format(HTTP_DATE).to_string()) {
            headers.insert(LAST_MODIFIED, value);
        }
        if let Ok(value) = HeaderValue::from_str(&expires.format(HTTP_DATE).to_string()) {
            headers.insert(EXPIRES, value);
        }
    }

    fn should_compress(ctx: &RequestContext, response: &Response<GatewayBody>) -> bool {
        if ctx.method == Method::HEAD {
            return false;
        }
        let status = response.status();
        if !status.is_success() || status == StatusCode::NO_CONTENT {
            return false;
        }
        let headers = response.headers();
        if headers.contains_key(CONTENT_ENCODING) {
            return false;
        }
        let length = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        if !matches!(length, Some(len) if len > 0 && len <= MAX_COMPRESSED_BODY) {
            return false;
        }
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        !is_precompressed(content_type)
    }
}

fn is_precompressed(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    if essence == "image/svg+xml" {
        return false;
    }
    essence.starts_with("image/")
        || essence.starts_with("audio/")
        || essence.starts_with("video/")
        || PRECOMPRESSED_TYPES.contains(&essence.as_str())
}

#[async_trait]
impl Stage for CacheAndCompression {
    fn name(&self) -> &'static str {
        "cache-and-compression"
    }

    async fn apply(
        &self,
        ctx: &RequestContext,
        mut response: Response<GatewayBody>,
    ) -> Response<GatewayBody> {
        self.set_cache_headers(&mut response);

        let encoding = match ctx.accept_encoding.as_deref().and_then(Encoding::negotiate) {
            Some(encoding) if Self::should_compress(ctx, &response) => encoding,
            _ => return response,
        };

        let (mut parts, body) = response.into_parts();
        let data: Bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!(error = %e, path = %ctx.target, "Failed to read body for compression");
                let mut response = Response::new(full("Internal Server Error"));
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                return response;
            }
        };

        if data.is_empty() {
            return Response::from_parts(parts, full(data));
        }

        match encoding.encode(&data) {
            Ok(compressed) => {
                parts.headers.insert(CONTENT_ENCODING, HeaderValue::from_static(encoding.as_str()));
                parts.headers.insert(CONTENT_LENGTH, HeaderValue::from(compressed.len()));
                parts.headers.append(VARY, HeaderValue::from_static("Accept-Encoding"));
                Response::from_parts(parts, full(compressed))
            }
            Err(e) => {
                warn!(error = %e, encoding = encoding.as_str(), "Compression failed, sending identity");
                Response::from_parts(parts, full(data))
            }
        }
    }
}
