//! Combined Log Format access log
//!
//! The entry is written once the response body has been fully sent (or
//! dropped), so the byte count is what actually went out on the wire.

use super::{RequestContext, Stage};
use crate::body::{BoxError, GatewayBody};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes, Frame, SizeHint};
use hyper::Response;
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::net::IpAddr;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{debug, warn};

/// One line of the access log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessLogEntry {
    pub remote_ip: IpAddr,
    pub time: DateTime<Local>,
    pub method: String,
    pub target: String,
    pub protocol: String,
    pub status: u16,
    pub bytes: u64,
    pub referer: Option<String>,
    pub user_agent: Option<String>,
}

impl AccessLogEntry {
    pub fn new(ctx: &RequestContext, status: u16, bytes: u64) -> Self {
        Self {
            remote_ip: ctx.remote_addr.ip(),
            time: ctx.started_at,
            method: ctx.method.to_string(),
            target: ctx.target.clone(),
            protocol: ctx.protocol(),
            status,
            bytes,
            referer: ctx.referer.clone(),
            user_agent: ctx.user_agent.clone(),
        }
    }

    /// `ip - - [time] "METHOD target PROTO" status bytes "referer" "ua"`
    pub fn to_line(&self) -> String {
        format!(
            "{} - - [{}] \"{} {} {}\" {} {} \"{}\" \"{}\"",
            self.remote_ip,
            self.time.format("%d/%b/%Y:%H:%M:%S %z"),
            self.method,
            self.target,
            self.protocol,
            self.status,
            self.bytes,
            quoted_field(self.referer.as_deref()),
            quoted_field(self.user_agent.as_deref()),
        )
    }
}

fn quoted_field(value: Option<&str>) -> String {
    match value {
        None | Some("") => "-".to_string(),
        Some(v) => v.replace('\\', "\\\\").replace('"', "\\\""),
    }
}

/// Destination for access log lines. Lines are also emitted as `debug`
/// events with target `access_log`.
pub struct AccessLogger {
    sink: Option<Mutex<Box<dyn Write + Send>>>,
}

impl std::fmt::Debug for AccessLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessLogger")
            .field("enabled", &self.sink.is_some())
            .finish()
    }
}

impl AccessLogger {
    /// Append to the file at `path`, creating it if needed
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path.as_ref())?;
        Ok(Self::from_writer(file))
    }

    pub fn from_writer(writer: impl Write + Send + 'static) -> Self {
        Self {
            sink: Some(Mutex::new(Box::new(writer))),
        }
    }

    /// Only the tracing event is emitted
    pub fn disabled() -> Self {
        Self { sink: None }
    }

    pub fn log(&self, entry: &AccessLogEntry) {
        let line = entry.to_line();
        debug!(target: "access_log", "{}", line);
        if let Some(sink) = &self.sink {
            let mut sink = sink.lock();
            if let Err(e) = writeln!(sink, "{}", line).and_then(|_| sink.flush()) {
                warn!(error = %e, "Failed to write access log entry");
            }
        }
    }
}

/// Outermost stage: wraps the body so the entry is logged after the last byte
#[derive(Debug, Clone)]
pub struct AccessLog {
    logger: Arc<AccessLogger>,
}

impl AccessLog {
    pub fn new(logger: Arc<AccessLogger>) -> Self {
        Self { logger }
    }
}

#[async_trait]
impl Stage for AccessLog {
    fn name(&self) -> &'static str {
        "access-log"
    }

    async fn apply(
        &self,
        ctx: &RequestContext,
        response: Response<GatewayBody>,
    ) -> Response<GatewayBody> {
        let status = response.status().as_u16();
        let (parts, body) = response.into_parts();
        let logged = LoggedBody {
            inner: body,
            bytes: 0,
            pending: Some(Pending {
                logger: Arc::clone(&self.logger),
                ctx: ctx.clone(),
                status,
            }),
        };
        Response::from_parts(parts, logged.boxed())
    }
}

struct Pending {
    logger: Arc<AccessLogger>,
    ctx: RequestContext,
    status: u16,
}

/// Counts data bytes and logs once on end of stream, error or drop
struct LoggedBody {
    inner: GatewayBody,
    bytes: u64,
    pending: Option<Pending>,
}

impl LoggedBody {
    fn finish(&mut self) {
        if let Some(pending) = self.pending.take() {
            let entry = AccessLogEntry::new(&pending.ctx, pending.status, self.bytes);
            pending.logger.log(&entry);
        }
    }
}

impl Body for LoggedBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_frame(cx);
        match &polled {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.bytes += data.len() as u64;
                }
            }
            Poll::Ready(Some(Err(_))) | Poll::Ready(None) => this.finish(),
            Poll::Pending => {}
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for LoggedBody {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{context, ok};
    use super::*;
    use chrono::TimeZone;
    use hyper::Method;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().clone()).unwrap()
        }
    }

    fn entry() -> AccessLogEntry {
        AccessLogEntry {
            remote_ip: "203.0.113.9".parse().unwrap(),
            time: Local.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap(),
            method: "GET".to_string(),
            target: "/shared/a.txt?x=1".to_string(),
            protocol: "HTTP/1.1".to_string(),
            status: 200,
            bytes: 1234,
            referer: None,
            user_agent: Some("curl/8.4".to_string()),
        }
    }

    #[test]
    fn test_combined_format() {
        let line = entry().to_line();
        let prefix = "203.0.113.9 - - [05/Mar/2024:14:07:09 ";
        assert!(line.starts_with(prefix), "{}", line);
        assert!(line.ends_with(
            "] \"GET /shared/a.txt?x=1 HTTP/1.1\" 200 1234 \"-\" \"curl/8.4\""
        ));
    }

    #[test]
    fn test_quotes_are_escaped() {
        let mut entry = entry();
        entry.user_agent = Some("evil\" \\agent".to_string());
        entry.referer = Some(String::new());
        let line = entry.to_line();
        assert!(line.ends_with("\"-\" \"evil\\\" \\\\agent\""), "{}", line);
    }

    #[tokio::test]
    async fn test_logs_bytes_sent_after_body_completes() {
        let buf = SharedBuf::default();
        let logger = Arc::new(AccessLogger::from_writer(buf.clone()));
        let stage = AccessLog::new(logger);
        let ctx = context(Method::GET, "/hello");

        let response = stage.apply(&ctx, ok("hello world")).await;
        assert!(buf.contents().is_empty());

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"hello world");

        let contents = buf.contents();
        assert_eq!(contents.lines().count(), 1);
        assert!(contents.contains("\"GET /hello HTTP/1.1\" 200 11 "), "{}", contents);
    }

    #[tokio::test]
    async fn test_dropped_body_logs_once() {
        let buf = SharedBuf::default();
        let stage = AccessLog::new(Arc::new(AccessLogger::from_writer(buf.clone())));
        let ctx = context(Method::GET, "/aborted");

        let response = stage.apply(&ctx, ok("never sent")).await;
        drop(response);

        let contents = buf.contents();
        assert_eq!(contents.lines().count(), 1);
        assert!(contents.contains(" 200 0 "), "{}", contents);
    }

    #[test]
    fn test_open_appends_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        let logger = AccessLogger::open(&path).unwrap();
        logger.log(&entry());
        logger.log(&entry());
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[test]
    fn test_disabled_logger_writes_nothing() {
        AccessLogger::disabled().log(&entry());
    }
}
