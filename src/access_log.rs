//! Access logging bound to handlers

use crate::context::{RequestContext, Template};
use tracing::info;

pub const DEFAULT_ACCESS_LOG_FORMAT: &str = "${client.ip} \"${http.request.method} ${http.request.path}\" ${http.response.status} ${http.request.duration_ms}ms";

pub trait AccessLogger: Send + Sync {
    /// Called once per completed request
    fn log(&self, ctx: &RequestContext);
}

/// Formats one line per request and emits it through `tracing` under the
/// `access` target
pub struct TracingAccessLogger {
    format: Template,
}

impl TracingAccessLogger {
    pub fn new(format: &str) -> anyhow::Result<Self> {
        Ok(Self {
            format: Template::parse(format)?,
        })
    }

    pub fn format_line(&self, ctx: &RequestContext) -> String {
        self.format.expand(&ctx.variables())
    }
}

impl AccessLogger for TracingAccessLogger {
    fn log(&self, ctx: &RequestContext) {
        info!(target: "access", request_id = %ctx.request_id, "{}", self.format_line(ctx));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::test_context;
    use hyper::{Method, StatusCode};

    #[test]
    fn test_default_format() {
        let logger = TracingAccessLogger::new("${client.ip} \"${http.request.method} ${http.request.path}\" ${http.response.status}").unwrap();
        let mut ctx = test_context(Method::GET, "/index.html", "example.com");
        ctx.status = Some(StatusCode::OK);
        assert_eq!(logger.format_line(&ctx), "192.0.2.10 \"GET /index.html\" 200");
    }

    #[test]
    fn test_default_format_parses() {
        assert!(TracingAccessLogger::new(DEFAULT_ACCESS_LOG_FORMAT).is_ok());
    }
}
