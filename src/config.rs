use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::access_log::DEFAULT_ACCESS_LOG_FORMAT;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Named load balancers referenced by reverse proxy actions and TCP servers
    #[serde(default)]
    pub load_balancers: Vec<LoadBalancerConfig>,

    /// HTTP listeners and their handler trees
    #[serde(default)]
    pub http_servers: Vec<HttpServerConfig>,

    /// Raw TCP relay listeners
    #[serde(default)]
    pub tcp_servers: Vec<TcpServerConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoadBalancerConfig {
    pub name: String,

    /// Upstream addresses (host:port), used in this order
    #[serde(default)]
    pub servers: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpServerConfig {
    /// Listen address, e.g. "0.0.0.0:8080"
    pub listen: String,

    /// Serve HTTPS with the given certificate and key
    pub tls: Option<TlsConfig>,

    /// Root handlers, evaluated in declaration order
    #[serde(default)]
    pub handlers: Vec<HandlerConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TlsConfig {
    /// Path to certificate chain file (PEM format)
    pub certificate: String,

    /// Path to private key file (PEM format)
    pub private_key: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TcpServerConfig {
    pub listen: String,

    /// Fixed upstream address
    pub address: Option<String>,

    /// Name of a load balancer to pick upstream addresses from
    pub load_balancer: Option<String>,

    /// Upstream connect timeout in milliseconds (default: 10000)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

impl TcpServerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// One node of the handler tree
#[derive(Debug, Deserialize, Clone, Default)]
pub struct HandlerConfig {
    #[serde(rename = "match", default)]
    pub match_spec: MatchConfig,

    pub authentication: Option<AuthenticationConfig>,

    pub access_log: Option<AccessLogConfig>,

    pub reply: Option<ReplyConfig>,
    pub redirect: Option<RedirectConfig>,
    pub serve: Option<ServeConfig>,
    pub reverse_proxy: Option<ReverseProxyConfig>,
    pub status: Option<StatusConfig>,
    pub fastcgi: Option<FastCgiConfig>,

    /// Child handlers, evaluated in declaration order
    #[serde(default)]
    pub handlers: Vec<HandlerConfig>,
}

impl HandlerConfig {
    fn action_count(&self) -> usize {
        [
            self.reply.is_some(),
            self.redirect.is_some(),
            self.serve.is_some(),
            self.reverse_proxy.is_some(),
            self.status.is_some(),
            self.fastcgi.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count()
    }

    fn validate(&self, location: &str, load_balancers: &HashSet<&str>, errors: &mut Vec<String>) {
        let actions = self.action_count();
        if actions > 1 {
            errors.push(format!("{}: at most one action may be configured", location));
        }
        if actions == 0 && self.handlers.is_empty() {
            errors.push(format!("{}: handler has neither an action nor child handlers", location));
        }

        let m = &self.match_spec;
        if m.host.is_some() && m.host_regexp.is_some() {
            errors.push(format!("{}: 'host' and 'host_regexp' are mutually exclusive", location));
        }
        if m.path.is_some() && m.path_regexp.is_some() {
            errors.push(format!("{}: 'path' and 'path_regexp' are mutually exclusive", location));
        }

        if let Some(auth) = &self.authentication {
            if auth.basic.is_none() {
                errors.push(format!("{}: authentication requires a method", location));
            }
        }

        if let Some(redirect) = &self.redirect {
            if !(300..400).contains(&redirect.status) {
                errors.push(format!(
                    "{}: redirect status {} is not a 3xx code",
                    location, redirect.status
                ));
            }
        }

        if let Some(proxy) = &self.reverse_proxy {
            match (&proxy.uri, &proxy.load_balancer) {
                (Some(_), Some(_)) | (None, None) => errors.push(format!(
                    "{}: reverse_proxy requires exactly one of 'uri' or 'load_balancer'",
                    location
                )),
                (None, Some(name)) if !load_balancers.contains(name.as_str()) => errors.push(
                    format!("{}: unknown load balancer '{}'", location, name),
                ),
                _ => {}
            }
            if proxy.max_connections == 0 {
                errors.push(format!("{}: 'max_connections' must be greater than 0", location));
            }
        }

        for (i, child) in self.handlers.iter().enumerate() {
            child.validate(&format!("{}.handlers[{}]", location, i), load_balancers, errors);
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct MatchConfig {
    /// HTTP method (any if not set)
    pub method: Option<String>,

    /// Domain name pattern, e.g. "*.example.com"
    pub host: Option<String>,

    /// Regular expression matched against the host name
    pub host_regexp: Option<String>,

    /// Path pattern, e.g. "/static/"
    pub path: Option<String>,

    /// Regular expression matched against the request path; a named group
    /// `subpath` sets the subpath
    pub path_regexp: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthenticationConfig {
    pub basic: Option<BasicAuthConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BasicAuthConfig {
    #[serde(default = "default_realm")]
    pub realm: String,

    /// User name to hex-encoded SHA-256 password hash
    #[serde(default)]
    pub users: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AccessLogConfig {
    #[serde(default = "default_access_log_format")]
    pub format: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReplyConfig {
    #[serde(default = "default_reply_status")]
    pub status: u16,

    /// Response body template
    #[serde(default)]
    pub body: String,

    #[serde(default)]
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RedirectConfig {
    #[serde(default = "default_redirect_status")]
    pub status: u16,

    /// Location template, e.g. "https://${http.request.host}${http.request.path}"
    pub location: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServeConfig {
    /// Directory files are served from
    pub root: String,

    #[serde(default = "default_index_files")]
    pub index_files: Vec<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StatusConfig {}

#[derive(Debug, Deserialize, Clone)]
pub struct FastCgiConfig {
    /// Address of the FastCGI application
    pub address: String,

    /// Directory prepended to the script path for SCRIPT_FILENAME
    #[serde(default)]
    pub script_root: String,

    /// Extra parameters passed with every request
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReverseProxyConfig {
    /// Single upstream, e.g. "http://127.0.0.1:3000"
    pub uri: Option<String>,

    /// Name of a load balancer
    pub load_balancer: Option<String>,

    #[serde(default)]
    pub request_header_operations: Vec<HeaderOperationConfig>,

    #[serde(default)]
    pub response_header_operations: Vec<HeaderOperationConfig>,

    /// Maximum connections per upstream address (default: 64)
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum time to wait for a pooled connection in milliseconds (default: 5000)
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_ms: u64,

    /// Upstream connect timeout in milliseconds (default: 10000)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Maximum time for the upstream to answer in seconds (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl ReverseProxyConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Header operation applied to forwarded requests or responses
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum HeaderOperationConfig {
    /// Replace all values of a header
    Set { name: String, value: String },
    /// Append a value to a header
    Add { name: String, value: String },
    /// Remove a header
    Remove { name: String },
}

// Default value functions
fn default_connect_timeout() -> u64 {
    10_000 // 10 seconds
}

fn default_acquire_timeout() -> u64 {
    5_000 // 5 seconds waiting for a free connection
}

fn default_request_timeout() -> u64 {
    30 // 30 seconds max for upstream to respond
}

fn default_max_connections() -> usize {
    64
}

fn default_realm() -> String {
    "switchyard".to_string()
}

fn default_access_log_format() -> String {
    DEFAULT_ACCESS_LOG_FORMAT.to_string()
}

fn default_reply_status() -> u16 {
    200
}

fn default_redirect_status() -> u16 {
    302
}

fn default_index_files() -> Vec<String> {
    vec!["index.html".to_string()]
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        let mut load_balancers = HashSet::new();
        for lb in &self.load_balancers {
            if lb.name.is_empty() {
                errors.push("load balancer with an empty name".to_string());
            } else if !load_balancers.insert(lb.name.as_str()) {
                errors.push(format!("duplicate load balancer '{}'", lb.name));
            }
            if lb.servers.is_empty() {
                errors.push(format!("load balancer '{}' has no servers", lb.name));
            }
        }

        for (i, server) in self.http_servers.iter().enumerate() {
            if server.listen.parse::<SocketAddr>().is_err() {
                errors.push(format!(
                    "http_servers[{}]: invalid listen address '{}'",
                    i, server.listen
                ));
            }
            for (j, handler) in server.handlers.iter().enumerate() {
                handler.validate(
                    &format!("http_servers[{}].handlers[{}]", i, j),
                    &load_balancers,
                    &mut errors,
                );
            }
        }

        for (i, server) in self.tcp_servers.iter().enumerate() {
            if server.listen.parse::<SocketAddr>().is_err() {
                errors.push(format!(
                    "tcp_servers[{}]: invalid listen address '{}'",
                    i, server.listen
                ));
            }
            match (&server.address, &server.load_balancer) {
                (Some(_), Some(_)) | (None, None) => errors.push(format!(
                    "tcp_servers[{}]: exactly one of 'address' or 'load_balancer' is required",
                    i
                )),
                (None, Some(name)) if !load_balancers.contains(name.as_str()) => {
                    errors.push(format!("tcp_servers[{}]: unknown load balancer '{}'", i, name))
                }
                _ => {}
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
