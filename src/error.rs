//! Error types and plain-text error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use thiserror::Error;

/// Body type used for every response produced by the proxy
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Errors raised while parsing path or domain name patterns
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatternError {
    #[error("empty pattern")]
    Empty,
    #[error("empty segment in path pattern '{0}'")]
    EmptySegment(String),
    #[error("empty label in domain name pattern '{0}'")]
    EmptyLabel(String),
    #[error("invalid escape sequence in pattern '{0}'")]
    InvalidEscape(String),
}

/// Errors raised by a pooled upstream client
#[derive(Debug, Error)]
pub enum PoolError {
    /// No connection became available within the acquisition timeout
    #[error("no connection available")]
    NoConnectionAvailable,
    /// The client is stopping or stopped
    #[error("client stopping")]
    ClientStopping,
    #[error("cannot connect to {address}: {source}")]
    Connect {
        address: String,
        source: std::io::Error,
    },
    #[error("connection to {0} timed out")]
    ConnectTimeout(String),
    #[error("HTTP handshake with {address} failed: {source}")]
    Handshake {
        address: String,
        source: hyper::Error,
    },
    /// The guard no longer holds a connection
    #[error("connection already returned to the pool")]
    Detached,
    #[error("upstream did not answer within {0:?}")]
    RequestTimeout(std::time::Duration),
    #[error("upstream transport error: {0}")]
    Transport(#[source] hyper::Error),
}

impl PoolError {
    /// Map a pool or relay failure to the client-facing error code
    pub fn error_code(&self) -> ProxyErrorCode {
        match self {
            PoolError::NoConnectionAvailable | PoolError::ClientStopping => {
                ProxyErrorCode::NoConnectionAvailable
            }
            PoolError::RequestTimeout(_) => ProxyErrorCode::RequestTimeout,
            _ => ProxyErrorCode::UpstreamFailure,
        }
    }
}

/// Reasons for aborting a client exchange without sending a response.
///
/// Returning one of these from a request handler makes the serving layer close
/// the client connection.
#[derive(Debug, Error)]
pub enum RelayAbort {
    #[error("upstream switched protocols without an upgrade request")]
    UnrequestedUpgrade,
}

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyErrorCode {
    /// Missing Host header in request
    MissingHostHeader,
    /// No handler matched the request
    NoHandler,
    /// Method not supported by the action
    MethodNotAllowed,
    /// Access to the resource is forbidden
    Forbidden,
    /// Resource not found
    NotFound,
    /// No upstream connection available
    NoConnectionAvailable,
    /// Upstream reported it is overloaded
    UpstreamOverloaded,
    /// Request timed out waiting for upstream
    RequestTimeout,
    /// Upstream transport failure
    UpstreamFailure,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            ProxyErrorCode::NoHandler => StatusCode::NOT_FOUND,
            ProxyErrorCode::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ProxyErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ProxyErrorCode::NotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::NoConnectionAvailable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::UpstreamOverloaded => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::UpstreamFailure => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ProxyErrorCode::NoHandler => "NO_HANDLER",
            ProxyErrorCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            ProxyErrorCode::Forbidden => "FORBIDDEN",
            ProxyErrorCode::NotFound => "NOT_FOUND",
            ProxyErrorCode::NoConnectionAvailable => "NO_CONNECTION_AVAILABLE",
            ProxyErrorCode::UpstreamOverloaded => "UPSTREAM_OVERLOADED",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::UpstreamFailure => "UPSTREAM_FAILURE",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Wrap a complete byte buffer into the proxy body type
pub fn full_body(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into()).map_err(|never| match never {}).boxed()
}

/// Empty proxy body
pub fn empty_body() -> ProxyBody {
    http_body_util::Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

/// Create a plain-text error response with X-Proxy-Error header.
///
/// The body is the canonical reason phrase only; details belong in the log.
pub fn error_response(code: ProxyErrorCode) -> Response<ProxyBody> {
    let status = code.status_code();
    let body = format!("{}\n", status.canonical_reason().unwrap_or("error"));

    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain; charset=utf-8")
        .header("X-Proxy-Error", code.as_header_value())
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static headers")
}
