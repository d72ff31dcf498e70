//! Per-request state shared by handler resolution, actions and access logging

use crate::access_log::AccessLogger;
use crate::auth::Authenticator;
use hyper::{Method, StatusCode};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

/// State carried through the handling of one inbound request
#[derive(Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    /// Host name without port, lowercased
    pub host: String,
    /// Original Host header value, port included
    pub host_header: Option<String>,
    pub client_addr: SocketAddr,
    pub tls: bool,
    pub start: Instant,

    /// Remainder of the path left by the deepest matching prefix pattern
    pub subpath: Option<String>,
    pub authenticator: Option<Arc<dyn Authenticator>>,
    pub access_logger: Option<Arc<dyn AccessLogger>>,

    /// User name established by authentication
    pub user: Option<String>,
    pub status: Option<StatusCode>,
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("request_id", &self.request_id)
            .field("method", &self.method)
            .field("path", &self.path)
            .field("host", &self.host)
            .field("client_addr", &self.client_addr)
            .field("subpath", &self.subpath)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl RequestContext {
    pub fn new(
        request_id: String,
        method: Method,
        path: &str,
        query: Option<&str>,
        host: String,
        client_addr: SocketAddr,
        tls: bool,
    ) -> Self {
        Self {
            request_id,
            method,
            path: path.to_string(),
            query: query.map(String::from),
            host,
            host_header: None,
            client_addr,
            tls,
            start: Instant::now(),
            subpath: None,
            authenticator: None,
            access_logger: None,
            user: None,
            status: None,
        }
    }

    pub fn scheme(&self) -> &'static str {
        if self.tls {
            "https"
        } else {
            "http"
        }
    }

    /// The path used by relative patterns and by actions serving a subtree
    pub fn effective_subpath(&self) -> &str {
        match &self.subpath {
            Some(subpath) => subpath,
            None => self.path.strip_prefix('/').unwrap_or(&self.path),
        }
    }

    /// Build the per-request variable map used by templates and access logs
    pub fn variables(&self) -> HashMap<&'static str, String> {
        let mut vars = HashMap::new();
        vars.insert("http.request.id", self.request_id.clone());
        vars.insert("http.request.method", self.method.to_string());
        vars.insert("http.request.path", self.path.clone());
        vars.insert("http.request.query", self.query.clone().unwrap_or_default());
        vars.insert("http.request.subpath", self.subpath.clone().unwrap_or_default());
        vars.insert("http.request.host", self.host.clone());
        vars.insert("http.request.scheme", self.scheme().to_string());
        vars.insert("http.request.user", self.user.clone().unwrap_or_default());
        vars.insert("client.address", self.client_addr.to_string());
        vars.insert("client.ip", self.client_addr.ip().to_string());
        vars.insert("client.port", self.client_addr.port().to_string());
        vars.insert(
            "http.response.status",
            self.status.map(|s| s.as_u16().to_string()).unwrap_or_default(),
        );
        vars.insert(
            "http.request.duration_ms",
            self.start.elapsed().as_millis().to_string(),
        );
        vars
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    Variable(String),
}

/// A string with `${name}` references to request variables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    parts: Vec<Part>,
}

impl Template {
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let mut parts = Vec::new();
        let mut rest = s;

        while let Some(start) = rest.find("${") {
            if start > 0 {
                parts.push(Part::Literal(rest[..start].to_string()));
            }
            let Some(end) = rest[start..].find('}') else {
                anyhow::bail!("unterminated variable reference in '{}'", s);
            };
            let name = rest[start + 2..start + end].trim();
            if name.is_empty() {
                anyhow::bail!("empty variable reference in '{}'", s);
            }
            parts.push(Part::Variable(name.to_string()));
            rest = &rest[start + end + 1..];
        }

        if !rest.is_empty() {
            parts.push(Part::Literal(rest.to_string()));
        }

        Ok(Self { parts })
    }

    /// Expand the template; unknown variables expand to an empty string
    pub fn expand(&self, vars: &HashMap<&'static str, String>) -> String {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Literal(s) => out.push_str(s),
                Part::Variable(name) => {
                    if let Some(value) = vars.get(name.as_str()) {
                        out.push_str(value);
                    }
                }
            }
        }
        out
    }
}
