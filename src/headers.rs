//! Header rewriting for relayed requests and responses

use crate::config::HeaderOperationConfig;
use crate::context::Template;
use anyhow::Context;
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use std::collections::HashMap;
use std::net::IpAddr;
use tracing::warn;

pub const X_REQUEST_ID: &str = "x-request-id";
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_FORWARDED_HOST: &str = "x-forwarded-host";
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Fields meaningful only for a single transport-level connection
const HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Remove the fields listed in the Connection header
pub fn remove_connection_headers(headers: &mut HeaderMap) {
    let listed: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    for name in listed {
        headers.remove(name.as_str());
    }
}

pub fn remove_hop_headers(headers: &mut HeaderMap) {
    for name in HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Whether the Connection header carries an `upgrade` token
pub fn connection_has_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

/// Protocols requested through `Connection: upgrade` + `Upgrade`
pub fn extract_upgrade(headers: &HeaderMap) -> Option<HeaderValue> {
    if !connection_has_upgrade(headers) {
        return None;
    }
    headers.get(header::UPGRADE).cloned()
}

/// Append the client address to X-Forwarded-For, keeping existing entries
pub fn append_forwarded_for(headers: &mut HeaderMap, ip: IpAddr) {
    let existing: Vec<String> = headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(|v| v.trim().trim_end_matches(',').trim_end().to_string())
        .filter(|v| !v.is_empty())
        .collect();

    let mut value = existing.join(", ");
    if !value.is_empty() {
        value.push_str(", ");
    }
    value.push_str(&ip.to_string());

    match HeaderValue::from_str(&value) {
        Ok(v) => {
            headers.insert(X_FORWARDED_FOR, v);
        }
        Err(_) => {
            // Existing value was not visible ASCII; start over with the client
            if let Ok(v) = HeaderValue::from_str(&ip.to_string()) {
                headers.insert(X_FORWARDED_FOR, v);
            }
        }
    }
}

/// Header operation with its value template parsed
#[derive(Debug, Clone)]
pub enum HeaderOperation {
    Set { name: HeaderName, value: Template },
    Add { name: HeaderName, value: Template },
    Remove { name: HeaderName },
}

impl HeaderOperation {
    pub fn from_config(config: &HeaderOperationConfig) -> anyhow::Result<Self> {
        fn header_name(name: &str) -> anyhow::Result<HeaderName> {
            HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("invalid header name '{}'", name))
        }

        Ok(match config {
            HeaderOperationConfig::Set { name, value } => HeaderOperation::Set {
                name: header_name(name)?,
                value: Template::parse(value)?,
            },
            HeaderOperationConfig::Add { name, value } => HeaderOperation::Add {
                name: header_name(name)?,
                value: Template::parse(value)?,
            },
            HeaderOperationConfig::Remove { name } => HeaderOperation::Remove {
                name: header_name(name)?,
            },
        })
    }

    pub fn from_configs(configs: &[HeaderOperationConfig]) -> anyhow::Result<Vec<Self>> {
        configs.iter().map(Self::from_config).collect()
    }
}

/// Apply header operations in order. Values expanding to invalid header
/// values are skipped.
pub fn apply_operations(
    headers: &mut HeaderMap,
    operations: &[HeaderOperation],
    vars: &HashMap<&'static str, String>,
) {
    for op in operations {
        match op {
            HeaderOperation::Set { name, value } => {
                if let Some(v) = expand_value(name, value, vars) {
                    headers.insert(name.clone(), v);
                }
            }
            HeaderOperation::Add { name, value } => {
                if let Some(v) = expand_value(name, value, vars) {
                    headers.append(name.clone(), v);
                }
            }
            HeaderOperation::Remove { name } => {
                headers.remove(name);
            }
        }
    }
}

fn expand_value(
    name: &HeaderName,
    value: &Template,
    vars: &HashMap<&'static str, String>,
) -> Option<HeaderValue> {
    let expanded = value.expand(vars);
    match HeaderValue::from_str(&expanded) {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(header = %name, value = %expanded, "Skipping invalid header value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::test_context;
    use hyper::Method;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.append(
                HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_remove_connection_headers() {
        let mut map = headers(&[
            ("connection", "keep-alive, X-Secret"),
            ("x-secret", "1"),
            ("x-kept", "2"),
        ]);
        remove_connection_headers(&mut map);
        remove_hop_headers(&mut map);
        assert!(map.get("x-secret").is_none());
        assert!(map.get("connection").is_none());
        assert_eq!(map.get("x-kept").unwrap(), "2");
    }

    #[test]
    fn test_remove_hop_headers() {
        let mut map = headers(&[
            ("te", "trailers"),
            ("transfer-encoding", "chunked"),
            ("proxy-authorization", "Basic abc"),
            ("upgrade", "websocket"),
            ("accept", "*/*"),
        ]);
        remove_hop_headers(&mut map);
        assert_eq!(map.len(), 1);
        assert!(map.contains_key("accept"));
    }

    #[test]
    fn test_extract_upgrade() {
        let map = headers(&[("connection", "keep-alive, Upgrade"), ("upgrade", "websocket")]);
        assert_eq!(extract_upgrade(&map).unwrap(), "websocket");

        let map = headers(&[("upgrade", "websocket")]);
        assert!(extract_upgrade(&map).is_none());
        assert!(!connection_has_upgrade(&map));
    }

    #[test]
    fn test_forwarded_for_appends_one_address() {
        let ip: IpAddr = "192.0.2.10".parse().unwrap();

        let mut map = HeaderMap::new();
        append_forwarded_for(&mut map, ip);
        assert_eq!(map.get(X_FORWARDED_FOR).unwrap(), "192.0.2.10");

        let mut map = headers(&[("x-forwarded-for", "203.0.113.1, 198.51.100.2")]);
        append_forwarded_for(&mut map, ip);
        assert_eq!(
            map.get(X_FORWARDED_FOR).unwrap(),
            "203.0.113.1, 198.51.100.2, 192.0.2.10"
        );

        let mut map = headers(&[("x-forwarded-for", "203.0.113.1, ")]);
        append_forwarded_for(&mut map, ip);
        assert_eq!(map.get(X_FORWARDED_FOR).unwrap(), "203.0.113.1, 192.0.2.10");
    }

    #[test]
    fn test_forwarded_for_joins_repeated_fields() {
        let ip: IpAddr = "2001:db8::1".parse().unwrap();
        let mut map = headers(&[("x-forwarded-for", "203.0.113.1"), ("x-forwarded-for", "198.51.100.2")]);
        append_forwarded_for(&mut map, ip);
        assert_eq!(
            map.get_all(X_FORWARDED_FOR).iter().count(),
            1
        );
        assert_eq!(
            map.get(X_FORWARDED_FOR).unwrap(),
            "203.0.113.1, 198.51.100.2, 2001:db8::1"
        );
    }

    #[test]
    fn test_apply_operations() {
        let configs = vec![
            HeaderOperationConfig::Set {
                name: "X-Path".to_string(),
                value: "${http.request.path}".to_string(),
            },
            HeaderOperationConfig::Add {
                name: "Via".to_string(),
                value: "switchyard".to_string(),
            },
            HeaderOperationConfig::Remove {
                name: "Cookie".to_string(),
            },
        ];
        let ops = HeaderOperation::from_configs(&configs).unwrap();
        let ctx = test_context(Method::GET, "/a/b", "example.com");

        let mut map = headers(&[("x-path", "old"), ("via", "1.1 edge"), ("cookie", "a=b")]);
        apply_operations(&mut map, &ops, &ctx.variables());

        assert_eq!(map.get("x-path").unwrap(), "/a/b");
        let via: Vec<_> = map.get_all("via").iter().collect();
        assert_eq!(via, vec!["1.1 edge", "switchyard"]);
        assert!(map.get("cookie").is_none());
    }

    #[test]
    fn test_invalid_header_name_rejected() {
        let config = HeaderOperationConfig::Remove {
            name: "bad header".to_string(),
        };
        assert!(HeaderOperation::from_config(&config).is_err());
    }
}
