//! Request authentication bound to handlers
//!
//! An authenticator inspects the request and either accepts it, optionally
//! naming the authenticated user, or rejects it with a complete response.

use crate::config::BasicAuthConfig;
use crate::context::RequestContext;
use crate::error::{full_body, ProxyBody};
use base64::Engine;
use hyper::header::{HeaderMap, HeaderValue, AUTHORIZATION, WWW_AUTHENTICATE};
use hyper::{Response, StatusCode};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;

/// Rejection produced by an authenticator. The response is sent as is; the
/// reason only goes to the log.
pub struct AuthRejection {
    pub reason: String,
    pub response: Response<ProxyBody>,
}

impl fmt::Debug for AuthRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthRejection")
            .field("reason", &self.reason)
            .field("status", &self.response.status())
            .finish()
    }
}

pub trait Authenticator: Send + Sync {
    fn authenticate(
        &self,
        ctx: &RequestContext,
        headers: &HeaderMap,
    ) -> Result<Option<String>, AuthRejection>;
}

/// HTTP Basic authentication against SHA-256 password hashes
pub struct BasicAuthenticator {
    realm: String,
    users: HashMap<String, [u8; 32]>,
}

impl BasicAuthenticator {
    pub fn new(config: &BasicAuthConfig) -> anyhow::Result<Self> {
        let mut users = HashMap::new();
        for (name, hash) in &config.users {
            let bytes = hex::decode(hash.trim())
                .map_err(|e| anyhow::anyhow!("invalid password hash for user '{}': {}", name, e))?;
            let hash: [u8; 32] = bytes.try_into().map_err(|_| {
                anyhow::anyhow!("password hash for user '{}' is not a SHA-256 digest", name)
            })?;
            users.insert(name.clone(), hash);
        }

        if config.realm.contains('"') {
            anyhow::bail!("basic authentication realm must not contain quotes");
        }

        Ok(Self {
            realm: config.realm.clone(),
            users,
        })
    }

    fn challenge(&self, reason: &str) -> AuthRejection {
        let value = format!("Basic realm=\"{}\"", self.realm);
        let response = Response::builder()
            .status(StatusCode::UNAUTHORIZED)
            .header(
                WWW_AUTHENTICATE,
                HeaderValue::from_str(&value).unwrap_or(HeaderValue::from_static("Basic")),
            )
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(full_body("Unauthorized\n"))
            .expect("valid response with StatusCode enum and static headers");

        AuthRejection {
            reason: reason.to_string(),
            response,
        }
    }

    fn forbidden(&self, reason: String) -> AuthRejection {
        let response = Response::builder()
            .status(StatusCode::FORBIDDEN)
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(full_body("Forbidden\n"))
            .expect("valid response with StatusCode enum and static headers");

        AuthRejection { reason, response }
    }
}

impl Authenticator for BasicAuthenticator {
    fn authenticate(
        &self,
        _ctx: &RequestContext,
        headers: &HeaderMap,
    ) -> Result<Option<String>, AuthRejection> {
        let Some(value) = headers.get(AUTHORIZATION) else {
            return Err(self.challenge("missing credentials"));
        };

        let (name, password) = parse_basic_credentials(value)
            .ok_or_else(|| self.challenge("malformed basic credentials"))?;

        let Some(expected) = self.users.get(&name) else {
            return Err(self.forbidden(format!("unknown user '{}'", name)));
        };

        let digest = Sha256::digest(password.as_bytes());
        if !constant_time_eq(digest.as_slice(), expected) {
            return Err(self.forbidden(format!("invalid password for user '{}'", name)));
        }

        Ok(Some(name))
    }
}

fn parse_basic_credentials(value: &HeaderValue) -> Option<(String, String)> {
    let value = value.to_str().ok()?;
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (name, password) = decoded.split_once(':')?;
    Some((name.to_string(), password.to_string()))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::test_context;
    use hyper::Method;

    fn authenticator() -> BasicAuthenticator {
        let mut users = HashMap::new();
        users.insert(
            "alice".to_string(),
            hex::encode(Sha256::digest(b"wonderland")),
        );
        BasicAuthenticator::new(&BasicAuthConfig {
            realm: "test".to_string(),
            users,
        })
        .unwrap()
    }

    fn basic(user: &str, password: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let encoded =
            base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, password));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Basic {}", encoded)).unwrap(),
        );
        headers
    }

    #[test]
    fn test_valid_credentials() {
        let ctx = test_context(Method::GET, "/", "example.com");
        let user = authenticator()
            .authenticate(&ctx, &basic("alice", "wonderland"))
            .unwrap();
        assert_eq!(user.as_deref(), Some("alice"));
    }

    #[test]
    fn test_missing_credentials_challenges() {
        let ctx = test_context(Method::GET, "/", "example.com");
        let rejection = authenticator()
            .authenticate(&ctx, &HeaderMap::new())
            .unwrap_err();
        assert_eq!(rejection.response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            rejection.response.headers().get(WWW_AUTHENTICATE).unwrap(),
            "Basic realm=\"test\""
        );
    }

    #[test]
    fn test_wrong_password_is_forbidden() {
        let ctx = test_context(Method::GET, "/", "example.com");
        let rejection = authenticator()
            .authenticate(&ctx, &basic("alice", "nope"))
            .unwrap_err();
        assert_eq!(rejection.response.status(), StatusCode::FORBIDDEN);

        let rejection = authenticator()
            .authenticate(&ctx, &basic("bob", "wonderland"))
            .unwrap_err();
        assert_eq!(rejection.response.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_invalid_hash_rejected() {
        let mut users = HashMap::new();
        users.insert("alice".to_string(), "abcd".to_string());
        assert!(BasicAuthenticator::new(&BasicAuthConfig {
            realm: "test".to_string(),
            users,
        })
        .is_err());
    }
}
