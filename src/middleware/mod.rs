//! Response pipeline
//!
//! A [`Pipeline`] is an ordered list of [`Stage`]s run around a handler. The
//! first stage is the outermost: stages see the handler's response in reverse
//! order, so `[SecurityHeaders, CacheAndCompression]` compresses first and
//! adds security headers last.

pub mod access_log;
pub mod compression;
pub mod security;

pub use access_log::{AccessLog, AccessLogEntry, AccessLogger};
pub use compression::CacheAndCompression;
pub use security::SecurityHeaders;

use crate::body::GatewayBody;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use hyper::header::{HeaderName, ACCEPT_ENCODING, HOST, REFERER, USER_AGENT};
use hyper::{Method, Request, Response, Version};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

/// What the stages know about the request, captured before the handler runs
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub remote_addr: SocketAddr,
    pub started_at: DateTime<Local>,
    pub method: Method,
    /// Path and query as sent by the client
    pub target: String,
    pub version: Version,
    pub host: Option<String>,
    pub is_tls: bool,
    pub accept_encoding: Option<String>,
    pub referer: Option<String>,
    pub user_agent: Option<String>,
}

impl RequestContext {
    pub fn from_request<B>(req: &Request<B>, remote_addr: SocketAddr, is_tls: bool) -> Self {
        let header = |name: HeaderName| {
            req.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(String::from)
        };
        let host = header(HOST).or_else(|| req.uri().host().map(String::from));
        Self {
            remote_addr,
            started_at: Local::now(),
            method: req.method().clone(),
            target: req
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string()),
            version: req.version(),
            host,
            is_tls,
            accept_encoding: header(ACCEPT_ENCODING),
            referer: header(REFERER),
            user_agent: header(USER_AGENT),
        }
    }

    /// Protocol as written in the request line, e.g. `HTTP/1.1`
    pub fn protocol(&self) -> String {
        format!("{:?}", self.version)
    }
}

/// One response transform in a [`Pipeline`]
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn apply(
        &self,
        ctx: &RequestContext,
        response: Response<GatewayBody>,
    ) -> Response<GatewayBody>;
}

/// Ordered stage list applied by a fixed runner
#[derive(Clone, Default)]
pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `stage` inside the stages added so far
    pub fn with(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    pub fn with_shared(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run `handler` and pass its response through every stage, innermost first
    pub async fn run<F>(&self, ctx: &RequestContext, handler: F) -> Response<GatewayBody>
    where
        F: Future<Output = Response<GatewayBody>> + Send,
    {
        let mut response = handler.await;
        for stage in self.stages.iter().rev() {
            response = stage.apply(ctx, response).await;
        }
        response
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{context, ok};
    use super::*;
    use parking_lot::Mutex;

    struct Record {
        name: &'static str,
        seen: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Stage for Record {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn apply(
            &self,
            _ctx: &RequestContext,
            mut response: Response<GatewayBody>,
        ) -> Response<GatewayBody> {
            self.seen.lock().push(self.name);
            response
                .headers_mut()
                .insert("x-last-stage", self.name.parse().unwrap());
            response
        }
    }

    #[tokio::test]
    async fn test_outermost_stage_runs_last() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new()
            .with(Record { name: "outer", seen: Arc::clone(&seen) })
            .with(Record { name: "inner", seen: Arc::clone(&seen) });

        assert_eq!(pipeline.names(), vec!["outer", "inner"]);

        let ctx = context(Method::GET, "/");
        let response = pipeline.run(&ctx, async { ok("x") }).await;
        assert_eq!(*seen.lock(), vec!["inner", "outer"]);
        assert_eq!(response.headers().get("x-last-stage").unwrap(), "outer");
    }

    #[tokio::test]
    async fn test_empty_pipeline_passes_through() {
        let pipeline = Pipeline::new();
        assert!(pipeline.is_empty());
        let ctx = context(Method::GET, "/");
        let response = pipeline.run(&ctx, async { ok("x") }).await;
        assert_eq!(response.status(), hyper::StatusCode::OK);
    }

    #[test]
    fn test_context_captures_request_fields() {
        let req = Request::builder()
            .method(Method::GET)
            .uri("/shared/a.txt?x=1")
            .header(HOST, "example.com")
            .header(USER_AGENT, "curl/8")
            .header(ACCEPT_ENCODING, "gzip")
            .body(())
            .unwrap();
        let ctx = RequestContext::from_request(&req, "127.0.0.1:1000".parse().unwrap(), true);
        assert_eq!(ctx.target, "/shared/a.txt?x=1");
        assert_eq!(ctx.protocol(), "HTTP/1.1");
        assert_eq!(ctx.host.as_deref(), Some("example.com"));
        assert_eq!(ctx.user_agent.as_deref(), Some("curl/8"));
        assert!(ctx.referer.is_none());
        assert!(ctx.is_tls);
    }
}
