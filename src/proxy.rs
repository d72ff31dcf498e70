use crate::error::{empty_body, error_response, ProxyBody, ProxyErrorCode, RelayAbort};
use crate::handler::{resolve, Handler};
use crate::context::RequestContext;
use crate::headers::X_REQUEST_ID;
use crate::stats::ServiceStats;
use hyper::body::Incoming;
use hyper::header::HeaderValue;
use hyper::http::uri::Authority;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

/// HTTP(S) listener dispatching requests through a handler tree
pub struct ProxyServer {
    listener: TcpListener,
    handlers: Arc<Vec<Handler>>,
    stats: Arc<ServiceStats>,
    shutdown_rx: watch::Receiver<bool>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl ProxyServer {
    pub async fn bind(
        bind_addr: SocketAddr,
        handlers: Arc<Vec<Handler>>,
        stats: Arc<ServiceStats>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", bind_addr, e))?;
        Ok(Self {
            listener,
            handlers,
            stats,
            shutdown_rx,
            tls_acceptor: None,
        })
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.listener.local_addr()?;
        let protocol = if self.tls_acceptor.is_some() { "HTTPS" } else { "HTTP" };
        info!(addr = %addr, protocol, "Proxy server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let tls_acceptor = self.tls_acceptor.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let _ = stream.set_nodelay(true);
                            let handlers = Arc::clone(&self.handlers);
                            let stats = Arc::clone(&self.stats);
                            let tls_acceptor = tls_acceptor.clone();

                            tokio::spawn(async move {
                                if let Some(acceptor) = tls_acceptor {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            if let Err(e) = handle_connection(tls_stream, addr, handlers, stats, true).await {
                                                debug!(addr = %addr, error = %e, "TLS connection error");
                                            }
                                        }
                                        Err(e) => {
                                            debug!(addr = %addr, error = %e, "TLS handshake failed");
                                        }
                                    }
                                } else if let Err(e) = handle_connection(stream, addr, handlers, stats, false).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.wait_for(|stopping| *stopping) => {
                    info!(addr = %addr, "Proxy server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    handlers: Arc<Vec<Handler>>,
    stats: Arc<ServiceStats>,
    is_tls: bool,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let handlers = Arc::clone(&handlers);
        let stats = Arc::clone(&stats);
        async move { handle_request(req, handlers, stats, addr, is_tls).await }
    });

    // HTTP/1.1 only; upgraded connections are handed to the pump as raw
    // streams, which requires the io type to be recoverable by downcast
    http1::Builder::new()
        .serve_connection(io, service)
        .with_upgrades()
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    handlers: Arc<Vec<Handler>>,
    stats: Arc<ServiceStats>,
    client_addr: SocketAddr,
    is_tls: bool,
) -> Result<Response<ProxyBody>, RelayAbort> {
    stats.record_request();

    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let host_header = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(String::from)
        .or_else(|| req.uri().authority().map(|a| a.to_string()));

    let Some(hostname) = host_header.as_deref().and_then(extract_hostname) else {
        debug!(request_id = %request_id, client = %client_addr, "Missing or invalid Host header");
        return Ok(with_request_id(
            error_response(ProxyErrorCode::MissingHostHeader),
            &request_id,
        ));
    };

    let mut ctx = RequestContext::new(
        request_id,
        req.method().clone(),
        req.uri().path(),
        req.uri().query(),
        hostname,
        client_addr,
        is_tls,
    );
    ctx.host_header = host_header;

    let result = dispatch(&handlers, &mut ctx, req).await;

    match &result {
        Ok(response) => {
            ctx.status = Some(response.status());
            debug!(
                request_id = %ctx.request_id,
                method = %ctx.method,
                path = %ctx.path,
                status = response.status().as_u16(),
                "Request handled"
            );
        }
        Err(e) => {
            warn!(request_id = %ctx.request_id, error = %e, "Aborting client connection");
        }
    }

    if let Some(logger) = &ctx.access_logger {
        logger.log(&ctx);
    }

    result.map(|response| with_request_id(response, &ctx.request_id))
}

/// Resolve the handler, authenticate and run the action
async fn dispatch(
    handlers: &[Handler],
    ctx: &mut RequestContext,
    req: Request<Incoming>,
) -> Result<Response<ProxyBody>, RelayAbort> {
    let Some(handler) = resolve(handlers, ctx, None) else {
        debug!(request_id = %ctx.request_id, host = %ctx.host, path = %ctx.path, "No handler matched");
        return Ok(error_response(ProxyErrorCode::NoHandler));
    };

    if let Some(authenticator) = ctx.authenticator.clone() {
        match authenticator.authenticate(ctx, req.headers()) {
            Ok(user) => ctx.user = user,
            Err(rejection) => {
                info!(
                    request_id = %ctx.request_id,
                    client = %ctx.client_addr,
                    reason = %rejection.reason,
                    "Authentication rejected"
                );
                return Ok(rejection.response);
            }
        }
    }

    match handler.action() {
        Some(action) => action.handle(ctx, req).await,
        None => Ok(Response::new(empty_body())),
    }
}

fn with_request_id(mut response: Response<ProxyBody>, request_id: &str) -> Response<ProxyBody> {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(X_REQUEST_ID, value);
    }
    response
}

fn extract_hostname(host: &str) -> Option<String> {
    let authority: Authority = host.parse().ok()?;
    let hostname = authority.host();

    // Validate length (DNS max is 253 characters)
    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }

    // Validate characters: alphanumeric, hyphen, underscore, dot, and the
    // brackets and colons of IPv6 literals
    if !hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '[' | ']' | ':'))
    {
        return None;
    }

    Some(hostname.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_hostname() {
        assert_eq!(extract_hostname("Example.COM"), Some("example.com".to_string()));
        assert_eq!(extract_hostname("example.com:8080"), Some("example.com".to_string()));
        assert_eq!(extract_hostname("[::1]:8080"), Some("[::1]".to_string()));
        assert_eq!(extract_hostname(""), None);
        assert_eq!(extract_hostname("bad host"), None);
    }

    #[test]
    fn test_hostname_length_limit() {
        let long = "a".repeat(MAX_HOSTNAME_LEN + 1);
        assert_eq!(extract_hostname(&long), None);
        let max = "a".repeat(MAX_HOSTNAME_LEN);
        assert_eq!(extract_hostname(&max), Some(max.clone()));
    }

    #[test]
    fn test_with_request_id() {
        let response = with_request_id(Response::new(empty_body()), "abc-123");
        assert_eq!(response.headers().get(X_REQUEST_ID).unwrap(), "abc-123");
    }
}
