//! Request matching for handlers

use crate::config::MatchConfig;
use crate::context::RequestContext;
use crate::pattern::{DomainNamePattern, PathPattern};
use anyhow::Context;
use hyper::Method;
use regex::Regex;

const SUBPATH_GROUP: &str = "subpath";

#[derive(Debug, Clone)]
pub enum DomainMatcher {
    Pattern(DomainNamePattern),
    Regex(Regex),
}

impl DomainMatcher {
    fn matches(&self, host: &str) -> bool {
        match self {
            DomainMatcher::Pattern(pattern) => pattern.matches(host),
            DomainMatcher::Regex(re) => re.is_match(host),
        }
    }
}

#[derive(Debug, Clone)]
pub enum PathMatcher {
    Pattern(PathPattern),
    Regex(Regex),
}

impl PathMatcher {
    /// Returns `Some(subpath)` on a match. `None` inside means the match does
    /// not produce a subpath and the inherited one is kept.
    fn matches(&self, ctx: &RequestContext) -> Option<Option<String>> {
        match self {
            PathMatcher::Pattern(pattern) => {
                let candidate = if pattern.is_relative() {
                    ctx.effective_subpath()
                } else {
                    ctx.path.as_str()
                };
                let subpath = pattern.matches(candidate)?;
                // Exact patterns consume the whole path and leave no subpath
                Some(pattern.is_prefix().then_some(subpath))
            }
            PathMatcher::Regex(re) => {
                let captures = re.captures(&ctx.path)?;
                Some(
                    captures
                        .name(SUBPATH_GROUP)
                        .map(|m| m.as_str().trim_start_matches('/').to_string()),
                )
            }
        }
    }
}

/// Result of a successful match
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchOutcome {
    pub subpath: Option<String>,
}

/// Conditions a request must meet for a handler to apply. Absent conditions
/// always match.
#[derive(Debug, Clone, Default)]
pub struct MatchSpec {
    pub method: Option<Method>,
    pub domain: Option<DomainMatcher>,
    pub path: Option<PathMatcher>,
}

impl MatchSpec {
    pub fn from_config(config: &MatchConfig) -> anyhow::Result<Self> {
        let method = config
            .method
            .as_deref()
            .map(|m| {
                Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                    .with_context(|| format!("invalid method '{}'", m))
            })
            .transpose()?;

        let domain = match (&config.host, &config.host_regexp) {
            (Some(host), _) => Some(DomainMatcher::Pattern(
                DomainNamePattern::parse(host)
                    .with_context(|| format!("invalid host pattern '{}'", host))?,
            )),
            (None, Some(re)) => Some(DomainMatcher::Regex(
                Regex::new(re).with_context(|| format!("invalid host regexp '{}'", re))?,
            )),
            (None, None) => None,
        };

        let path = match (&config.path, &config.path_regexp) {
            (Some(path), _) => Some(PathMatcher::Pattern(
                PathPattern::parse(path)
                    .with_context(|| format!("invalid path pattern '{}'", path))?,
            )),
            (None, Some(re)) => Some(PathMatcher::Regex(
                Regex::new(re).with_context(|| format!("invalid path regexp '{}'", re))?,
            )),
            (None, None) => None,
        };

        Ok(Self {
            method,
            domain,
            path,
        })
    }

    /// Evaluate every present condition against the request
    pub fn matches(&self, ctx: &RequestContext) -> Option<MatchOutcome> {
        if let Some(method) = &self.method {
            if *method != ctx.method {
                return None;
            }
        }

        if let Some(domain) = &self.domain {
            if !domain.matches(&ctx.host) {
                return None;
            }
        }

        let subpath = match &self.path {
            Some(path) => path.matches(ctx)?,
            None => None,
        };

        Some(MatchOutcome { subpath })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::test_context;

    fn spec(toml: &str) -> MatchSpec {
        let config: MatchConfig = toml::from_str(toml).unwrap();
        MatchSpec::from_config(&config).unwrap()
    }

    #[test]
    fn test_empty_spec_matches_everything() {
        let ctx = test_context(Method::DELETE, "/anything", "example.com");
        assert_eq!(spec("").matches(&ctx), Some(MatchOutcome::default()));
    }

    #[test]
    fn test_method_match() {
        let s = spec(r#"method = "post""#);
        assert!(s.matches(&test_context(Method::POST, "/", "a.com")).is_some());
        assert!(s.matches(&test_context(Method::GET, "/", "a.com")).is_none());
    }

    #[test]
    fn test_host_pattern_and_regexp() {
        let s = spec(r#"host = "*.example.com""#);
        assert!(s.matches(&test_context(Method::GET, "/", "api.example.com")).is_some());
        assert!(s.matches(&test_context(Method::GET, "/", "example.com")).is_none());

        let s = spec(r#"host_regexp = "^(www\\.)?example\\.org$""#);
        assert!(s.matches(&test_context(Method::GET, "/", "www.example.org")).is_some());
        assert!(s.matches(&test_context(Method::GET, "/", "example.net")).is_none());
    }

    #[test]
    fn test_path_prefix_sets_subpath() {
        let s = spec(r#"path = "/static/""#);
        let outcome = s
            .matches(&test_context(Method::GET, "/static/css/site.css", "a.com"))
            .unwrap();
        assert_eq!(outcome.subpath.as_deref(), Some("css/site.css"));
    }

    #[test]
    fn test_exact_path_keeps_inherited_subpath() {
        let s = spec(r#"path = "/robots.txt""#);
        let outcome = s
            .matches(&test_context(Method::GET, "/robots.txt", "a.com"))
            .unwrap();
        assert_eq!(outcome.subpath, None);

        let s = spec(r#"path = "intro""#);
        let mut ctx = test_context(Method::GET, "/docs/intro", "a.com");
        ctx.subpath = Some("intro".to_string());
        assert_eq!(s.matches(&ctx).unwrap().subpath, None);
    }

    #[test]
    fn test_relative_path_matches_subpath() {
        let s = spec(r#"path = "css/""#);
        let mut ctx = test_context(Method::GET, "/static/css/site.css", "a.com");
        ctx.subpath = Some("css/site.css".to_string());
        let outcome = s.matches(&ctx).unwrap();
        assert_eq!(outcome.subpath.as_deref(), Some("site.css"));

        ctx.subpath = Some("js/app.js".to_string());
        assert!(s.matches(&ctx).is_none());
    }

    #[test]
    fn test_path_regexp_subpath_group() {
        let s = spec(r#"path_regexp = "^/users/[0-9]+(?P<subpath>/.*)?$""#);
        let outcome = s
            .matches(&test_context(Method::GET, "/users/42/avatar", "a.com"))
            .unwrap();
        assert_eq!(outcome.subpath.as_deref(), Some("avatar"));

        let outcome = s.matches(&test_context(Method::GET, "/users/42", "a.com")).unwrap();
        assert_eq!(outcome.subpath, None);

        assert!(s.matches(&test_context(Method::GET, "/users/x", "a.com")).is_none());
    }

    #[test]
    fn test_all_conditions_required() {
        let s = spec(
            r#"
method = "GET"
host = "example.com"
path = "/api/"
"#,
        );
        assert!(s.matches(&test_context(Method::GET, "/api/v1", "example.com")).is_some());
        assert!(s.matches(&test_context(Method::GET, "/web", "example.com")).is_none());
        assert!(s.matches(&test_context(Method::GET, "/api/v1", "other.com")).is_none());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config: MatchConfig = toml::from_str(r#"path = "/a//b""#).unwrap();
        assert!(MatchSpec::from_config(&config).is_err());

        let config: MatchConfig = toml::from_str(r#"host_regexp = "(""#).unwrap();
        assert!(MatchSpec::from_config(&config).is_err());
    }
}
