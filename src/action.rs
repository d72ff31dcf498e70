//! Actions executed for resolved handlers

use crate::config::{HandlerConfig, RedirectConfig, ReplyConfig};
use crate::context::{RequestContext, Template};
use crate::error::{empty_body, error_response, full_body, ProxyBody, ProxyErrorCode, RelayAbort};
use crate::fastcgi::{FastCgiAction, FastCgiConnector};
use crate::loadbalancer::LoadBalancers;
use crate::pump::PumpRegistry;
use crate::reverse_proxy::ReverseProxyAction;
use crate::serve::ServeAction;
use crate::stats::ServiceStats;
use anyhow::Context;
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE, LOCATION};
use hyper::{Request, Response, StatusCode};
use std::sync::Arc;
use tracing::warn;

/// Application-supplied collaborators
#[derive(Clone, Default)]
pub struct Extensions {
    pub fastcgi_connector: Option<Arc<dyn FastCgiConnector>>,
}

/// Shared resources available while building actions
#[derive(Clone)]
pub struct ActionEnv {
    pub load_balancers: LoadBalancers,
    pub pumps: PumpRegistry,
    pub stats: Arc<ServiceStats>,
    pub extensions: Extensions,
}

pub enum Action {
    Reply(ReplyAction),
    Redirect(RedirectAction),
    Serve(ServeAction),
    ReverseProxy(ReverseProxyAction),
    Status(StatusAction),
    FastCgi(FastCgiAction),
}

impl Action {
    /// Build the action configured on a handler, if any
    pub fn from_config(config: &HandlerConfig, env: &ActionEnv) -> anyhow::Result<Option<Self>> {
        let action = if let Some(reply) = &config.reply {
            Action::Reply(ReplyAction::new(reply)?)
        } else if let Some(redirect) = &config.redirect {
            Action::Redirect(RedirectAction::new(redirect)?)
        } else if let Some(serve) = &config.serve {
            Action::Serve(ServeAction::new(serve))
        } else if let Some(proxy) = &config.reverse_proxy {
            Action::ReverseProxy(ReverseProxyAction::new(proxy, env)?)
        } else if config.status.is_some() {
            Action::Status(StatusAction::new(env.stats.clone()))
        } else if let Some(fastcgi) = &config.fastcgi {
            let connector = env
                .extensions
                .fastcgi_connector
                .clone()
                .context("fastcgi action requires a FastCGI connector")?;
            Action::FastCgi(FastCgiAction::new(fastcgi, connector)?)
        } else {
            return Ok(None);
        };
        Ok(Some(action))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Action::Reply(_) => "reply",
            Action::Redirect(_) => "redirect",
            Action::Serve(_) => "serve",
            Action::ReverseProxy(_) => "reverse_proxy",
            Action::Status(_) => "status",
            Action::FastCgi(_) => "fastcgi",
        }
    }

    pub fn start(&self) -> anyhow::Result<()> {
        match self {
            Action::Serve(a) => a.start(),
            Action::ReverseProxy(a) => a.start(),
            Action::FastCgi(a) => a.start(),
            Action::Reply(_) | Action::Redirect(_) | Action::Status(_) => Ok(()),
        }
    }

    pub fn stop(&self) {
        match self {
            Action::ReverseProxy(a) => a.stop(),
            Action::FastCgi(a) => a.stop(),
            Action::Reply(_) | Action::Redirect(_) | Action::Serve(_) | Action::Status(_) => {}
        }
    }

    pub async fn handle(
        &self,
        ctx: &RequestContext,
        req: Request<Incoming>,
    ) -> Result<Response<ProxyBody>, RelayAbort> {
        match self {
            Action::Reply(a) => Ok(a.handle(ctx)),
            Action::Redirect(a) => Ok(a.handle(ctx)),
            Action::Serve(a) => Ok(a.handle(ctx).await),
            Action::ReverseProxy(a) => a.handle(ctx, req).await,
            Action::Status(a) => Ok(a.handle()),
            Action::FastCgi(a) => Ok(a.handle(ctx, req).await),
        }
    }
}

fn status_code(code: u16) -> anyhow::Result<StatusCode> {
    StatusCode::from_u16(code).with_context(|| format!("invalid status code {}", code))
}

/// Fixed response
pub struct ReplyAction {
    status: StatusCode,
    body: Template,
    headers: Vec<(HeaderName, HeaderValue)>,
}

impl ReplyAction {
    pub fn new(config: &ReplyConfig) -> anyhow::Result<Self> {
        let mut headers = config
            .headers
            .iter()
            .map(|(name, value)| {
                let name = HeaderName::from_bytes(name.as_bytes())
                    .with_context(|| format!("invalid header name '{}'", name))?;
                let value = HeaderValue::from_str(value)
                    .with_context(|| format!("invalid value for header '{}'", name))?;
                Ok((name, value))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        headers.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));

        Ok(Self {
            status: status_code(config.status)?,
            body: Template::parse(&config.body)?,
            headers,
        })
    }

    pub fn handle(&self, ctx: &RequestContext) -> Response<ProxyBody> {
        let body = self.body.expand(&ctx.variables());
        let mut response = Response::new(full_body(body));
        *response.status_mut() = self.status;
        let headers = response.headers_mut();
        if !self.headers.iter().any(|(name, _)| name == CONTENT_TYPE) {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        }
        for (name, value) in &self.headers {
            headers.append(name.clone(), value.clone());
        }
        response
    }
}

pub struct RedirectAction {
    status: StatusCode,
    location: Template,
}

impl RedirectAction {
    pub fn new(config: &RedirectConfig) -> anyhow::Result<Self> {
        let status = status_code(config.status)?;
        if !status.is_redirection() {
            anyhow::bail!("redirect status {} is not a 3xx code", config.status);
        }
        Ok(Self {
            status,
            location: Template::parse(&config.location)?,
        })
    }

    pub fn handle(&self, ctx: &RequestContext) -> Response<ProxyBody> {
        let location = self.location.expand(&ctx.variables());
        let mut response = Response::new(empty_body());
        *response.status_mut() = self.status;
        match HeaderValue::from_str(&location) {
            Ok(value) => {
                response.headers_mut().insert(LOCATION, value);
            }
            Err(_) => {
                warn!(request_id = %ctx.request_id, location = %location, "Invalid redirect location");
                return error_response(ProxyErrorCode::InternalError);
            }
        }
        response
    }
}

/// Reports service statistics as JSON
pub struct StatusAction {
    stats: Arc<ServiceStats>,
}

impl StatusAction {
    pub fn new(stats: Arc<ServiceStats>) -> Self {
        Self { stats }
    }

    pub fn handle(&self) -> Response<ProxyBody> {
        let document = serde_json::json!({
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_secs": self.stats.uptime().as_secs(),
            "requests": self.stats.get_requests(),
            "active_pumps": self.stats.active_pumps(),
            "pools": self.stats.pool_snapshots(),
        });

        Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "application/json")
            .body(full_body(document.to_string()))
            .expect("valid response with StatusCode enum and static headers")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::test_context;
    use crate::pool::{PoolConfig, PooledClient};
    use http_body_util::BodyExt;
    use hyper::Method;
    use std::collections::HashMap;

    async fn body_string(response: Response<ProxyBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_reply() {
        let mut headers = HashMap::new();
        headers.insert("X-Served-By".to_string(), "switchyard".to_string());
        let reply = ReplyAction::new(&ReplyConfig {
            status: 201,
            body: "hello ${http.request.path}".to_string(),
            headers,
        })
        .unwrap();

        let response = reply.handle(&test_context(Method::GET, "/x", "a.com"));
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers().get("x-served-by").unwrap(), "switchyard");
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );
        assert_eq!(body_string(response).await, "hello /x");
    }

    #[test]
    fn test_reply_invalid_status() {
        let reply = ReplyAction::new(&ReplyConfig {
            status: 1000,
            body: String::new(),
            headers: HashMap::new(),
        });
        assert!(reply.is_err());
    }

    #[test]
    fn test_redirect() {
        let redirect = RedirectAction::new(&RedirectConfig {
            status: 301,
            location: "https://${http.request.host}${http.request.path}".to_string(),
        })
        .unwrap();

        let response = redirect.handle(&test_context(Method::GET, "/docs", "example.com"));
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            response.headers().get(LOCATION).unwrap(),
            "https://example.com/docs"
        );
    }

    #[test]
    fn test_redirect_requires_3xx() {
        assert!(RedirectAction::new(&RedirectConfig {
            status: 200,
            location: "/".to_string(),
        })
        .is_err());
    }

    #[tokio::test]
    async fn test_status_document() {
        let stats = Arc::new(ServiceStats::new(PumpRegistry::new()));
        stats.record_request();
        stats.register_pool(PooledClient::new(
            "127.0.0.1:9".to_string(),
            PoolConfig::default(),
        ));

        let response = StatusAction::new(stats).handle();
        assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), "application/json");

        let doc: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(doc["name"], "switchyard");
        assert_eq!(doc["requests"], 1);
        assert_eq!(doc["active_pumps"], 0);
        assert_eq!(doc["pools"][0]["address"], "127.0.0.1:9");
    }
}
