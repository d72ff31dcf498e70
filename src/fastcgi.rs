//! FastCGI action
//!
//! The wire protocol is provided by the embedding application through a
//! [`FastCgiConnector`]; this module builds CGI parameters from the request,
//! streams the body as stdin and turns the CGI response into an HTTP one.

use crate::config::FastCgiConfig;
use crate::context::{RequestContext, Template};
use crate::error::{error_response, ProxyBody, ProxyErrorCode};
use async_trait::async_trait;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::{Request, Response, StatusCode};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn};

const SERVER_SOFTWARE: &str = concat!("switchyard/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastCgiRole {
    Responder,
    Authorizer,
    Filter,
}

/// Response of a FastCGI application: the parsed CGI header block and the
/// remaining stdout stream
pub struct FastCgiResponse {
    pub headers: HeaderMap,
    pub body: ProxyBody,
}

#[derive(Debug, Error)]
pub enum FastCgiError {
    /// The application refused the request (FCGI_OVERLOADED)
    #[error("application overloaded")]
    Overloaded,
    #[error("application did not answer in time")]
    Timeout,
    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait FastCgiClient: Send + Sync {
    async fn send_request(
        &self,
        role: FastCgiRole,
        params: Vec<(String, String)>,
        stdin: ProxyBody,
    ) -> Result<FastCgiResponse, FastCgiError>;
}

/// Creates clients for FastCGI application addresses
pub trait FastCgiConnector: Send + Sync {
    fn connect(&self, address: &str) -> anyhow::Result<Arc<dyn FastCgiClient>>;
}

pub struct FastCgiAction {
    address: String,
    script_root: PathBuf,
    parameters: Vec<(String, Template)>,
    connector: Arc<dyn FastCgiConnector>,
    client: RwLock<Option<Arc<dyn FastCgiClient>>>,
}

impl FastCgiAction {
    pub fn new(config: &FastCgiConfig, connector: Arc<dyn FastCgiConnector>) -> anyhow::Result<Self> {
        let mut parameters = config
            .parameters
            .iter()
            .map(|(name, value)| Ok((name.clone(), Template::parse(value)?)))
            .collect::<anyhow::Result<Vec<_>>>()?;
        parameters.sort_by(|a, b| a.0.cmp(&b.0));

        Ok(Self {
            address: config.address.clone(),
            script_root: PathBuf::from(&config.script_root),
            parameters,
            connector,
            client: RwLock::new(None),
        })
    }

    pub fn start(&self) -> anyhow::Result<()> {
        let client = self.connector.connect(&self.address)?;
        *self.client.write() = Some(client);
        debug!(address = %self.address, "FastCGI client ready");
        Ok(())
    }

    pub fn stop(&self) {
        self.client.write().take();
    }

    pub async fn handle(&self, ctx: &RequestContext, req: Request<Incoming>) -> Response<ProxyBody> {
        let Some(client) = self.client.read().clone() else {
            error!(request_id = %ctx.request_id, "FastCGI action used before start");
            return error_response(ProxyErrorCode::InternalError);
        };

        let params = self.params(ctx, req.headers());
        let stdin = req.into_body().boxed();

        match client.send_request(FastCgiRole::Responder, params, stdin).await {
            Ok(response) => cgi_response(response),
            Err(FastCgiError::Overloaded) => {
                warn!(request_id = %ctx.request_id, address = %self.address, "FastCGI application overloaded");
                error_response(ProxyErrorCode::UpstreamOverloaded)
            }
            Err(FastCgiError::Timeout) => {
                warn!(request_id = %ctx.request_id, address = %self.address, "FastCGI request timed out");
                error_response(ProxyErrorCode::RequestTimeout)
            }
            Err(FastCgiError::Other(e)) => {
                error!(request_id = %ctx.request_id, address = %self.address, error = %e, "FastCGI request failed");
                error_response(ProxyErrorCode::UpstreamFailure)
            }
        }
    }

    /// Build the CGI/1.1 parameter set for a request
    pub fn params(&self, ctx: &RequestContext, headers: &HeaderMap) -> Vec<(String, String)> {
        let (script_name, path_info) = split_script_path(ctx);
        let script_filename = join_script_path(&self.script_root, &script_name);
        let request_uri = match &ctx.query {
            Some(q) => format!("{}?{}", ctx.path, q),
            None => ctx.path.clone(),
        };

        let mut params = vec![
            ("GATEWAY_INTERFACE".to_string(), "CGI/1.1".to_string()),
            ("SERVER_SOFTWARE".to_string(), SERVER_SOFTWARE.to_string()),
            ("SERVER_PROTOCOL".to_string(), "HTTP/1.1".to_string()),
            ("SERVER_NAME".to_string(), ctx.host.clone()),
            ("REQUEST_METHOD".to_string(), ctx.method.to_string()),
            ("REQUEST_URI".to_string(), request_uri),
            ("QUERY_STRING".to_string(), ctx.query.clone().unwrap_or_default()),
            ("SCRIPT_NAME".to_string(), script_name),
            ("SCRIPT_FILENAME".to_string(), script_filename),
            ("PATH_INFO".to_string(), path_info),
            ("REMOTE_ADDR".to_string(), ctx.client_addr.ip().to_string()),
            ("REMOTE_PORT".to_string(), ctx.client_addr.port().to_string()),
        ];

        if ctx.tls {
            params.push(("HTTPS".to_string(), "on".to_string()));
        }
        if let Some(user) = &ctx.user {
            params.push(("REMOTE_USER".to_string(), user.clone()));
        }

        for (name, value) in headers {
            let Ok(value) = value.to_str() else {
                continue;
            };
            let key = if name == header::CONTENT_TYPE {
                "CONTENT_TYPE".to_string()
            } else if name == header::CONTENT_LENGTH {
                "CONTENT_LENGTH".to_string()
            } else {
                format!("HTTP_{}", name.as_str().to_ascii_uppercase().replace('-', "_"))
            };
            match params.iter_mut().find(|(k, _)| *k == key) {
                Some((_, existing)) => {
                    existing.push_str(", ");
                    existing.push_str(value);
                }
                None => params.push((key, value.to_string())),
            }
        }

        let vars = ctx.variables();
        for (name, value) in &self.parameters {
            params.push((name.clone(), value.expand(&vars)));
        }

        params
    }
}

/// Split the request path into the script name and the extra path info.
/// When a prefix pattern left a subpath, that subpath is the path info.
fn split_script_path(ctx: &RequestContext) -> (String, String) {
    match ctx.subpath.as_deref() {
        Some(subpath) if !subpath.is_empty() => {
            let script = ctx
                .path
                .strip_suffix(subpath)
                .unwrap_or(&ctx.path)
                .trim_end_matches('/');
            (script.to_string(), format!("/{}", subpath))
        }
        _ => (ctx.path.clone(), String::new()),
    }
}

fn join_script_path(root: &Path, script_name: &str) -> String {
    root.join(script_name.trim_start_matches('/'))
        .to_string_lossy()
        .into_owned()
}

/// Turn CGI response headers into an HTTP response. `Status` sets the status
/// code; a `Location` without `Status` is a redirect.
fn cgi_response(response: FastCgiResponse) -> Response<ProxyBody> {
    let FastCgiResponse { mut headers, body } = response;

    let status = match headers.remove("status") {
        Some(value) => parse_cgi_status(&value).unwrap_or_else(|| {
            warn!(status = ?value, "Invalid CGI Status header");
            StatusCode::BAD_GATEWAY
        }),
        None if headers.contains_key(header::LOCATION) => StatusCode::FOUND,
        None => StatusCode::OK,
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn parse_cgi_status(value: &HeaderValue) -> Option<StatusCode> {
    let code = value.to_str().ok()?.split_whitespace().next()?;
    StatusCode::from_bytes(code.as_bytes()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::test_context;
    use crate::error::full_body;
    use hyper::Method;
    use std::collections::HashMap;

    fn action(script_root: &str) -> FastCgiAction {
        struct Unused;
        impl FastCgiConnector for Unused {
            fn connect(&self, _address: &str) -> anyhow::Result<Arc<dyn FastCgiClient>> {
                anyhow::bail!("not connected")
            }
        }

        let mut parameters = HashMap::new();
        parameters.insert("APP_ENV".to_string(), "test-${http.request.method}".to_string());
        FastCgiAction::new(
            &FastCgiConfig {
                address: "127.0.0.1:9000".to_string(),
                script_root: script_root.to_string(),
                parameters,
            },
            Arc::new(Unused),
        )
        .unwrap()
    }

    fn lookup<'a>(params: &'a [(String, String)], key: &str) -> Option<&'a str> {
        params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_params() {
        let ctx = test_context(Method::POST, "/index.php?page=2", "example.com");
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("5"));
        headers.insert("x-custom-thing", HeaderValue::from_static("yes"));

        let params = action("/srv/www").params(&ctx, &headers);
        assert_eq!(lookup(&params, "GATEWAY_INTERFACE"), Some("CGI/1.1"));
        assert_eq!(lookup(&params, "REQUEST_METHOD"), Some("POST"));
        assert_eq!(lookup(&params, "REQUEST_URI"), Some("/index.php?page=2"));
        assert_eq!(lookup(&params, "QUERY_STRING"), Some("page=2"));
        assert_eq!(lookup(&params, "SCRIPT_NAME"), Some("/index.php"));
        assert_eq!(lookup(&params, "SCRIPT_FILENAME"), Some("/srv/www/index.php"));
        assert_eq!(lookup(&params, "PATH_INFO"), Some(""));
        assert_eq!(lookup(&params, "REMOTE_ADDR"), Some("192.0.2.10"));
        assert_eq!(lookup(&params, "CONTENT_TYPE"), Some("text/plain"));
        assert_eq!(lookup(&params, "CONTENT_LENGTH"), Some("5"));
        assert_eq!(lookup(&params, "HTTP_X_CUSTOM_THING"), Some("yes"));
        assert_eq!(lookup(&params, "APP_ENV"), Some("test-POST"));
        assert_eq!(lookup(&params, "HTTPS"), None);
    }

    #[test]
    fn test_params_with_subpath() {
        let mut ctx = test_context(Method::GET, "/app.php/users/7", "example.com");
        ctx.subpath = Some("users/7".to_string());
        ctx.tls = true;

        let params = action("/srv").params(&ctx, &HeaderMap::new());
        assert_eq!(lookup(&params, "SCRIPT_NAME"), Some("/app.php"));
        assert_eq!(lookup(&params, "PATH_INFO"), Some("/users/7"));
        assert_eq!(lookup(&params, "SCRIPT_FILENAME"), Some("/srv/app.php"));
        assert_eq!(lookup(&params, "HTTPS"), Some("on"));
    }

    #[test]
    fn test_cgi_status_mapping() {
        let mut headers = HeaderMap::new();
        headers.insert("status", HeaderValue::from_static("404 Not Found"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html"));
        let response = cgi_response(FastCgiResponse {
            headers,
            body: full_body("missing"),
        });
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.headers().get("status").is_none());
        assert_eq!(response.headers().get(header::CONTENT_TYPE).unwrap(), "text/html");

        let mut headers = HeaderMap::new();
        headers.insert(header::LOCATION, HeaderValue::from_static("/login"));
        let response = cgi_response(FastCgiResponse {
            headers,
            body: full_body(""),
        });
        assert_eq!(response.status(), StatusCode::FOUND);

        let response = cgi_response(FastCgiResponse {
            headers: HeaderMap::new(),
            body: full_body("ok"),
        });
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_start_fails_without_connection() {
        assert!(action("/srv").start().is_err());
    }
}
