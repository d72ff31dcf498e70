//! Reverse proxy action
//!
//! Relays requests to a single upstream or to the members of a load balancer
//! over pooled HTTP/1.1 connections. Protocol upgrades hijack the upstream
//! connection out of its pool and bridge it to the client connection with a
//! byte pump.

use crate::action::ActionEnv;
use crate::config::ReverseProxyConfig;
use crate::context::RequestContext;
use crate::error::{empty_body, error_response, ProxyBody, ProxyErrorCode, PoolError, RelayAbort};
use crate::headers::{
    append_forwarded_for, apply_operations, extract_upgrade, remove_connection_headers,
    remove_hop_headers, HeaderOperation, X_FORWARDED_HOST, X_FORWARDED_PROTO, X_REQUEST_ID,
};
use crate::loadbalancer::{LoadBalancer, LoadBalancerError};
use crate::pool::{PoolConfig, Pooled, PooledClient};
use crate::pump::PumpRegistry;
use anyhow::Context;
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes, Frame, Incoming, SizeHint};
use hyper::header::{HeaderValue, CONNECTION, UPGRADE};
use hyper::upgrade::{OnUpgrade, Upgraded};
use hyper::{Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::TokioIo;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context as TaskContext, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, warn};

enum Target {
    Single(PooledClient),
    Balanced {
        load_balancer: Arc<LoadBalancer>,
        /// One client per load balancer address, same index
        clients: Vec<PooledClient>,
    },
}

pub struct ReverseProxyAction {
    target: Target,
    /// Path prefix of a single upstream URI, prepended to request paths
    base_path: Option<String>,
    request_ops: Vec<HeaderOperation>,
    response_ops: Vec<HeaderOperation>,
    pumps: PumpRegistry,
}

impl ReverseProxyAction {
    pub fn new(config: &ReverseProxyConfig, env: &ActionEnv) -> anyhow::Result<Self> {
        let pool_config = PoolConfig {
            max_connections: config.max_connections,
            acquire_timeout: config.acquire_timeout(),
            connect_timeout: config.connect_timeout(),
            request_timeout: config.request_timeout(),
        };

        let (target, base_path) = match (&config.uri, &config.load_balancer) {
            (Some(uri), None) => {
                let (address, base_path) = parse_upstream_uri(uri)?;
                (
                    Target::Single(PooledClient::new(address, pool_config)),
                    base_path,
                )
            }
            (None, Some(name)) => {
                let load_balancer = LoadBalancer::lookup(&env.load_balancers, name)?;
                let clients = load_balancer
                    .addresses()
                    .iter()
                    .map(|address| PooledClient::new(address.clone(), pool_config.clone()))
                    .collect();
                (
                    Target::Balanced {
                        load_balancer,
                        clients,
                    },
                    None,
                )
            }
            _ => anyhow::bail!("reverse_proxy requires exactly one of 'uri' or 'load_balancer'"),
        };

        let action = Self {
            target,
            base_path,
            request_ops: HeaderOperation::from_configs(&config.request_header_operations)
                .context("invalid request header operation")?,
            response_ops: HeaderOperation::from_configs(&config.response_header_operations)
                .context("invalid response header operation")?,
            pumps: env.pumps.clone(),
        };

        for client in action.clients() {
            env.stats.register_pool(client.clone());
        }

        Ok(action)
    }

    fn clients(&self) -> &[PooledClient] {
        match &self.target {
            Target::Single(client) => std::slice::from_ref(client),
            Target::Balanced { clients, .. } => clients,
        }
    }

    pub fn start(&self) -> anyhow::Result<()> {
        for client in self.clients() {
            client.start();
        }
        Ok(())
    }

    pub fn stop(&self) {
        for client in self.clients() {
            client.stop();
        }
    }

    fn select_client(&self) -> Result<&PooledClient, LoadBalancerError> {
        match &self.target {
            Target::Single(client) => Ok(client),
            Target::Balanced {
                load_balancer,
                clients,
            } => {
                let index = load_balancer.next_index()?;
                clients
                    .get(index)
                    .ok_or_else(|| LoadBalancerError::Empty(load_balancer.name().to_string()))
            }
        }
    }

    pub async fn handle(
        &self,
        ctx: &RequestContext,
        mut req: Request<Incoming>,
    ) -> Result<Response<ProxyBody>, RelayAbort> {
        let client = match self.select_client() {
            Ok(client) => client,
            Err(e) => {
                error!(request_id = %ctx.request_id, error = %e, "Cannot select upstream");
                return Ok(error_response(ProxyErrorCode::InternalError));
            }
        };

        let upgrade = extract_upgrade(req.headers());
        let client_upgrade = upgrade.as_ref().map(|_| hyper::upgrade::on(&mut req));

        let mut pooled = match client.acquire().await {
            Ok(pooled) => pooled,
            Err(e) => {
                warn!(
                    request_id = %ctx.request_id,
                    upstream = %client.address(),
                    error = %e,
                    "Failed to get upstream connection"
                );
                return Ok(error_response(e.error_code()));
            }
        };

        let upstream_req = self.rewrite_request(ctx, req, upgrade);
        let response = match client.send(&mut pooled, upstream_req).await {
            Ok(response) => response,
            Err(e) => {
                match &e {
                    PoolError::ClientStopping => {
                        debug!(request_id = %ctx.request_id, upstream = %client.address(), "Relay interrupted by pool stop")
                    }
                    _ => warn!(
                        request_id = %ctx.request_id,
                        upstream = %client.address(),
                        error = %e,
                        "Upstream request failed"
                    ),
                }
                pooled.destroy();
                return Ok(error_response(e.error_code()));
            }
        };

        debug!(
            request_id = %ctx.request_id,
            upstream = %client.address(),
            status = %response.status(),
            "Upstream responded"
        );

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            return self.switch_protocols(ctx, pooled, client_upgrade, response);
        }

        let (mut parts, body) = response.into_parts();
        remove_connection_headers(&mut parts.headers);
        remove_hop_headers(&mut parts.headers);
        apply_operations(&mut parts.headers, &self.response_ops, &ctx.variables());

        let body = PooledBody::new(body, pooled, ctx.request_id.clone());
        Ok(Response::from_parts(parts, body.boxed()))
    }

    fn rewrite_request(
        &self,
        ctx: &RequestContext,
        req: Request<Incoming>,
        upgrade: Option<HeaderValue>,
    ) -> Request<ProxyBody> {
        let (mut parts, body) = req.into_parts();
        let headers = &mut parts.headers;

        remove_connection_headers(headers);
        remove_hop_headers(headers);

        append_forwarded_for(headers, ctx.client_addr.ip());
        if let Some(host) = ctx
            .host_header
            .as_deref()
            .and_then(|h| HeaderValue::from_str(h).ok())
        {
            headers.insert(X_FORWARDED_HOST, host);
        }
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(ctx.scheme()));
        if let Ok(id) = HeaderValue::from_str(&ctx.request_id) {
            headers.insert(X_REQUEST_ID, id);
        }

        if let Some(protocols) = upgrade {
            headers.insert(UPGRADE, protocols);
            headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
        }

        apply_operations(headers, &self.request_ops, &ctx.variables());

        parts.uri = origin_form(&parts.uri, self.base_path.as_deref());
        parts.version = Version::HTTP_11;

        Request::from_parts(parts, body.boxed())
    }

    /// Complete a 101 response: hand the upstream connection over to a pump
    /// bridging it with the client connection
    fn switch_protocols(
        &self,
        ctx: &RequestContext,
        pooled: Pooled,
        client_upgrade: Option<OnUpgrade>,
        mut response: Response<Incoming>,
    ) -> Result<Response<ProxyBody>, RelayAbort> {
        let Some(client_upgrade) = client_upgrade else {
            error!(
                request_id = %ctx.request_id,
                "Upstream switched protocols without an upgrade request"
            );
            pooled.destroy();
            return Err(RelayAbort::UnrequestedUpgrade);
        };

        let upstream_upgrade = hyper::upgrade::on(&mut response);
        let Some(conn) = pooled.hijack() else {
            return Ok(error_response(ProxyErrorCode::InternalError));
        };

        let (mut parts, _) = response.into_parts();
        apply_operations(&mut parts.headers, &self.response_ops, &ctx.variables());

        let pumps = self.pumps.clone();
        let request_id = ctx.request_id.clone();
        tokio::spawn(async move {
            // The connection task must outlive the upgrade
            let _conn = conn;
            match tokio::try_join!(client_upgrade, upstream_upgrade) {
                Ok((client, upstream)) => match bridge(&pumps, client, upstream).await {
                    Ok(pump_id) => debug!(request_id = %request_id, pump_id, "Upgraded connection bridged"),
                    Err(e) => debug!(request_id = %request_id, error = %e, "Failed to bridge upgraded connection"),
                },
                Err(e) => error!(request_id = %request_id, error = %e, "Protocol upgrade failed"),
            }
        });

        Ok(Response::from_parts(parts, empty_body()))
    }
}

/// Parse a single upstream URI into a connect address and a base path
fn parse_upstream_uri(uri: &str) -> anyhow::Result<(String, Option<String>)> {
    let parsed: Uri = uri
        .parse()
        .with_context(|| format!("invalid upstream uri '{}'", uri))?;

    match parsed.scheme_str() {
        Some("http") | None => {}
        Some(scheme) => anyhow::bail!("unsupported upstream scheme '{}' in '{}'", scheme, uri),
    }

    let authority = parsed
        .authority()
        .with_context(|| format!("upstream uri '{}' has no host", uri))?;
    let address = match authority.port_u16() {
        Some(_) => authority.as_str().to_string(),
        None => format!("{}:80", authority.host()),
    };

    let base_path = match parsed.path().trim_end_matches('/') {
        "" => None,
        path => Some(path.to_string()),
    };

    Ok((address, base_path))
}

/// Request target in origin form, under the upstream base path if any
fn origin_form(uri: &Uri, base_path: Option<&str>) -> Uri {
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let target = match base_path {
        Some(base) => format!("{}{}", base, path_and_query),
        None => path_and_query.to_string(),
    };
    target.parse().unwrap_or_else(|_| Uri::from_static("/"))
}

trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

/// Recover the underlying stream of an upgraded connection together with the
/// bytes hyper already read past the HTTP exchange
fn into_raw(upgraded: Upgraded) -> (Box<dyn Stream>, Bytes) {
    let upgraded = match upgraded.downcast::<TokioIo<TcpStream>>() {
        Ok(parts) => return (Box::new(parts.io.into_inner()), parts.read_buf),
        Err(upgraded) => upgraded,
    };
    match upgraded.downcast::<TokioIo<tokio_rustls::server::TlsStream<TcpStream>>>() {
        Ok(parts) => (Box::new(parts.io.into_inner()), parts.read_buf),
        Err(upgraded) => (Box::new(TokioIo::new(upgraded)), Bytes::new()),
    }
}

async fn bridge(pumps: &PumpRegistry, client: Upgraded, upstream: Upgraded) -> io::Result<u64> {
    let (mut client_io, client_buffered) = into_raw(client);
    let (mut upstream_io, upstream_buffered) = into_raw(upstream);

    if !client_buffered.is_empty() {
        upstream_io.write_all(&client_buffered).await?;
    }
    if !upstream_buffered.is_empty() {
        client_io.write_all(&upstream_buffered).await?;
    }

    Ok(pumps.start(client_io, upstream_io))
}

/// Upstream response body that returns its connection to the pool at end of
/// stream and destroys it on error
struct PooledBody {
    inner: Incoming,
    pooled: Option<Pooled>,
    request_id: String,
}

impl PooledBody {
    fn new(inner: Incoming, pooled: Pooled, request_id: String) -> Self {
        let mut body = Self {
            inner,
            pooled: Some(pooled),
            request_id,
        };
        if body.inner.is_end_stream() {
            body.release();
        }
        body
    }

    fn release(&mut self) {
        if let Some(pooled) = self.pooled.take() {
            pooled.release();
        }
    }
}

impl Body for PooledBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, hyper::Error>>> {
        let this = self.get_mut();
        let frame = ready!(Pin::new(&mut this.inner).poll_frame(cx));
        match &frame {
            None => this.release(),
            Some(Ok(_)) if this.inner.is_end_stream() => this.release(),
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!(request_id = %this.request_id, error = %e, "Upstream body error");
                if let Some(pooled) = this.pooled.take() {
                    pooled.destroy();
                }
            }
        }
        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReverseProxyConfig;
    use crate::loadbalancer::LoadBalancer;
    use crate::stats::ServiceStats;
    use std::collections::HashMap;

    fn env() -> ActionEnv {
        let mut load_balancers = HashMap::new();
        load_balancers.insert(
            "api".to_string(),
            Arc::new(
                LoadBalancer::new(
                    "api".to_string(),
                    vec!["127.0.0.1:3001".to_string(), "127.0.0.1:3002".to_string()],
                )
                .unwrap(),
            ),
        );
        let pumps = PumpRegistry::new();
        ActionEnv {
            load_balancers,
            stats: Arc::new(ServiceStats::new(pumps.clone())),
            pumps,
            extensions: Default::default(),
        }
    }

    fn config(toml: &str) -> ReverseProxyConfig {
        toml::from_str(toml).unwrap()
    }

    #[test]
    fn test_parse_upstream_uri() {
        assert_eq!(
            parse_upstream_uri("http://127.0.0.1:3000").unwrap(),
            ("127.0.0.1:3000".to_string(), None)
        );
        assert_eq!(
            parse_upstream_uri("http://backend.internal/api/").unwrap(),
            ("backend.internal:80".to_string(), Some("/api".to_string()))
        );
        assert!(parse_upstream_uri("https://secure.example.com").is_err());
        assert!(parse_upstream_uri("/relative/only").is_err());
    }

    #[test]
    fn test_origin_form() {
        let uri: Uri = "http://example.com/a/b?x=1".parse().unwrap();
        assert_eq!(origin_form(&uri, None), "/a/b?x=1");
        assert_eq!(origin_form(&uri, Some("/api")), "/api/a/b?x=1");

        let uri: Uri = "/".parse().unwrap();
        assert_eq!(origin_form(&uri, Some("/api")), "/api/");
    }

    #[test]
    fn test_balanced_target_has_client_per_address() {
        let env = env();
        let action = ReverseProxyAction::new(&config(r#"load_balancer = "api""#), &env).unwrap();
        let addresses: Vec<_> = action.clients().iter().map(|c| c.address().to_string()).collect();
        assert_eq!(addresses, vec!["127.0.0.1:3001", "127.0.0.1:3002"]);
        assert_eq!(env.stats.pool_snapshots().len(), 2);

        assert_eq!(action.select_client().unwrap().address(), "127.0.0.1:3001");
        assert_eq!(action.select_client().unwrap().address(), "127.0.0.1:3002");
        assert_eq!(action.select_client().unwrap().address(), "127.0.0.1:3001");
    }

    #[test]
    fn test_unknown_load_balancer() {
        let result = ReverseProxyAction::new(&config(r#"load_balancer = "nope""#), &env());
        assert!(result.is_err());
    }

    #[test]
    fn test_pool_settings_from_config() {
        let action = ReverseProxyAction::new(
            &config(
                r#"
uri = "http://127.0.0.1:4000"
max_connections = 3
acquire_timeout_ms = 250
"#,
            ),
            &env(),
        )
        .unwrap();
        let client = action.select_client().unwrap();
        assert_eq!(client.config().max_connections, 3);
        assert_eq!(
            client.config().acquire_timeout,
            std::time::Duration::from_millis(250)
        );
    }
}
