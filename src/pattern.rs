//! Path and domain name patterns used by handler match specifications
//!
//! Path patterns are slash-separated sequences of literal or wildcard segments.
//! A pattern without a leading slash is relative and matches against the subpath
//! left over by an ancestor handler; a pattern with a trailing slash is a prefix
//! pattern and hands the unmatched remainder back as the new subpath.
//!
//! Domain name patterns are dot-separated label sequences where `*` matches
//! exactly one label.

use crate::error::PatternError;
use std::fmt;

const PATH_SEPARATOR: char = '/';
const LABEL_SEPARATOR: char = '.';
const WILDCARD: &str = "*";
const ESCAPE: char = '\\';

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Wildcard,
}

impl Segment {
    fn parse(s: &str, pattern: &str) -> Result<Self, PatternError> {
        if s == WILDCARD {
            return Ok(Segment::Wildcard);
        }

        if let Some(rest) = s.strip_prefix(ESCAPE) {
            if rest.is_empty() {
                return Err(PatternError::InvalidEscape(pattern.to_string()));
            }
            return Ok(Segment::Literal(rest.to_string()));
        }

        Ok(Segment::Literal(s.to_string()))
    }

    fn matches(&self, candidate: &str) -> bool {
        match self {
            Segment::Wildcard => true,
            Segment::Literal(s) => s == candidate,
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Wildcard => f.write_str(WILDCARD),
            Segment::Literal(s) if s.starts_with('*') || s.starts_with(ESCAPE) => {
                write!(f, "{}{}", ESCAPE, s)
            }
            Segment::Literal(s) => f.write_str(s),
        }
    }
}

/// A parsed request path pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    segments: Vec<Segment>,
    relative: bool,
    prefix: bool,
}

impl PathPattern {
    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        if pattern.is_empty() {
            return Err(PatternError::Empty);
        }

        let relative = !pattern.starts_with(PATH_SEPARATOR);
        let mut body = pattern.strip_prefix(PATH_SEPARATOR).unwrap_or(pattern);

        // "/" alone is the absolute prefix pattern matching every path
        let mut prefix = body.is_empty();
        if let Some(stripped) = body.strip_suffix(PATH_SEPARATOR) {
            prefix = true;
            body = stripped;
        }

        let mut segments = Vec::new();
        if !body.is_empty() {
            for part in body.split(PATH_SEPARATOR) {
                if part.is_empty() {
                    return Err(PatternError::EmptySegment(pattern.to_string()));
                }
                segments.push(Segment::parse(part, pattern)?);
            }
        } else if relative || pattern.len() > 1 {
            // "//" or a relative pattern consisting only of a separator
            return Err(PatternError::EmptySegment(pattern.to_string()));
        }

        Ok(Self {
            segments,
            relative,
            prefix,
        })
    }

    pub fn is_relative(&self) -> bool {
        self.relative
    }

    pub fn is_prefix(&self) -> bool {
        self.prefix
    }

    /// Match a candidate and return the subpath on success.
    ///
    /// For absolute patterns the candidate is a full request path; a leading
    /// slash is ignored. For relative patterns it is the subpath produced by
    /// an ancestor. The returned subpath is empty unless the pattern is a
    /// prefix pattern and the candidate has remaining segments.
    pub fn matches(&self, candidate: &str) -> Option<String> {
        let candidate = candidate.strip_prefix(PATH_SEPARATOR).unwrap_or(candidate);
        let parts: Vec<&str> = if candidate.is_empty() {
            Vec::new()
        } else {
            candidate.split(PATH_SEPARATOR).collect()
        };

        if parts.len() < self.segments.len() {
            return None;
        }

        for (segment, part) in self.segments.iter().zip(parts.iter()) {
            if !segment.matches(part) {
                return None;
            }
        }

        let rest = &parts[self.segments.len()..];
        if rest.is_empty() {
            return Some(String::new());
        }

        if !self.prefix {
            return None;
        }

        Some(rest.join("/"))
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.relative {
            f.write_str("/")?;
        }
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            write!(f, "{}", segment)?;
        }
        if self.prefix && !self.segments.is_empty() {
            f.write_str("/")?;
        }
        Ok(())
    }
}

/// A parsed domain name pattern such as `*.example.com`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainNamePattern {
    labels: Vec<Segment>,
}

impl DomainNamePattern {
    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        let name = pattern.strip_suffix(LABEL_SEPARATOR).unwrap_or(pattern);
        if name.is_empty() {
            return Err(PatternError::Empty);
        }

        let labels = name
            .split(LABEL_SEPARATOR)
            .map(|label| {
                if label.is_empty() {
                    return Err(PatternError::EmptyLabel(pattern.to_string()));
                }
                Segment::parse(&label.to_ascii_lowercase(), pattern)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { labels })
    }

    pub fn matches(&self, domain: &str) -> bool {
        let domain = domain.strip_suffix(LABEL_SEPARATOR).unwrap_or(domain);
        if domain.is_empty() {
            return false;
        }

        let domain = domain.to_ascii_lowercase();
        let labels: Vec<&str> = domain.split(LABEL_SEPARATOR).collect();

        labels.len() == self.labels.len()
            && self
                .labels
                .iter()
                .zip(labels.iter())
                .all(|(pattern, label)| pattern.matches(label))
    }
}

impl fmt::Display for DomainNamePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, label) in self.labels.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{}", label)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> PathPattern {
        PathPattern::parse(s).unwrap()
    }

    #[test]
    fn test_parse_path_patterns() {
        let p = path("/foo/bar");
        assert!(!p.is_relative());
        assert!(!p.is_prefix());

        let p = path("/foo/");
        assert!(p.is_prefix());

        let p = path("foo/*");
        assert!(p.is_relative());
        assert!(!p.is_prefix());

        let p = path("/");
        assert!(p.is_prefix());
        assert!(!p.is_relative());
    }

    #[test]
    fn test_parse_rejects_empty_segments() {
        assert!(matches!(PathPattern::parse(""), Err(PatternError::Empty)));
        assert!(matches!(
            PathPattern::parse("/foo//bar"),
            Err(PatternError::EmptySegment(_))
        ));
        assert!(matches!(
            PathPattern::parse("//"),
            Err(PatternError::EmptySegment(_))
        ));
        assert!(matches!(
            PathPattern::parse("/foo//"),
            Err(PatternError::EmptySegment(_))
        ));
    }

    #[test]
    fn test_parse_rejects_malformed_escape() {
        assert!(matches!(
            PathPattern::parse("/foo/\\/bar"),
            Err(PatternError::InvalidEscape(_))
        ));
    }

    #[test]
    fn test_prefix_subpath_extraction() {
        let p = path("/foo/");
        assert_eq!(p.matches("/foo/bar/baz"), Some("bar/baz".to_string()));
        assert_eq!(p.matches("/foo"), Some(String::new()));
        assert_eq!(p.matches("/foo/"), Some(String::new()));
        assert_eq!(p.matches("/bar/foo"), None);

        let p = path("/foo");
        assert_eq!(p.matches("/foo/bar"), None);
        assert_eq!(p.matches("/foo"), Some(String::new()));
    }

    #[test]
    fn test_root_prefix_matches_everything() {
        let p = path("/");
        assert_eq!(p.matches("/"), Some(String::new()));
        assert_eq!(p.matches("/a/b"), Some("a/b".to_string()));
    }

    #[test]
    fn test_wildcard_segment() {
        let p = path("/foo/*/baz");
        assert_eq!(p.matches("/foo/X/baz"), Some(String::new()));
        assert_eq!(p.matches("/foo/anything-here/baz"), Some(String::new()));
        assert_eq!(p.matches("/foo/baz"), None);
        assert_eq!(p.matches("/foo/X/Y/baz"), None);
    }

    #[test]
    fn test_paths_are_case_sensitive() {
        assert_eq!(path("/Foo").matches("/foo"), None);
    }

    #[test]
    fn test_escaped_star_is_literal() {
        let p = path("/files/\\*");
        assert_eq!(p.matches("/files/*"), Some(String::new()));
        assert_eq!(p.matches("/files/other"), None);
        assert_eq!(p.to_string(), "/files/\\*");
    }

    #[test]
    fn test_relative_pattern_matches_subpath() {
        let p = path("v1/*/");
        assert_eq!(p.matches("v1/users/42"), Some("42".to_string()));
        assert_eq!(p.matches("v2/users"), None);
    }

    #[test]
    fn test_display_round_trip_preserves_behavior() {
        let candidates = ["/", "/a", "/a/b", "/a/b/c", "/*/b", "/a/*", "/\\/x"];
        for s in ["/", "/a", "/a/", "/*/b", "a/*/", "/a/\\*/", "/\\\\x", "x"] {
            let original = path(s);
            let reparsed = path(&original.to_string());
            assert_eq!(original, reparsed, "pattern {s}");
            for c in candidates {
                assert_eq!(original.matches(c), reparsed.matches(c), "pattern {s} candidate {c}");
            }
        }
    }

    #[test]
    fn test_domain_wildcard_spans_one_label() {
        let p = DomainNamePattern::parse("*.com").unwrap();
        assert!(p.matches("example.com"));
        assert!(!p.matches("foo.example.com"));
        assert!(!p.matches("com"));
    }

    #[test]
    fn test_domain_trailing_dot_and_case() {
        let p = DomainNamePattern::parse("Example.COM.").unwrap();
        assert!(p.matches("example.com"));
        assert!(p.matches("EXAMPLE.com."));
        assert!(!p.matches("example.org"));
        assert_eq!(p.to_string(), "example.com");
    }

    #[test]
    fn test_domain_parse_errors() {
        assert!(matches!(DomainNamePattern::parse(""), Err(PatternError::Empty)));
        assert!(matches!(DomainNamePattern::parse("."), Err(PatternError::Empty)));
        assert!(matches!(
            DomainNamePattern::parse("foo..com"),
            Err(PatternError::EmptyLabel(_))
        ));
    }
}
