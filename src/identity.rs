//! Request identity.
//!
//! The upload core never authenticates; it only needs an opaque owner id
//! to scope sessions and storage paths.  [`IdentityProvider`] is the seam
//! where that id comes from.  The shipped [`StaticTokens`] provider maps
//! `Authorization: Bearer <token>` onto owner ids from the config file.

use std::collections::HashMap;

use axum::http::HeaderMap;
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::storage::validate_name;

/// Authenticated owner of a request, inserted into request extensions by
/// the auth middleware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner(pub String);

impl Owner {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Resolves the owner of a request, if any.
pub trait IdentityProvider: Send + Sync + 'static {
    fn current_owner(&self, headers: &HeaderMap) -> Option<Owner>;
}

/// Bearer tokens configured ahead of time.
pub struct StaticTokens {
    tokens: Vec<(String, Owner)>,
}

impl StaticTokens {
    /// Build from a `token -> owner` map.  Entries whose owner id cannot be
    /// used as a directory name are skipped with a warning.
    pub fn new(tokens: &HashMap<String, String>) -> Self {
        let tokens = tokens
            .iter()
            .filter(|(token, owner)| {
                if token.is_empty() {
                    warn!(owner = %owner, "ignoring empty bearer token");
                    return false;
                }
                if let Err(e) = validate_name(owner) {
                    warn!(owner = %owner, error = %e, "ignoring token with unusable owner id");
                    return false;
                }
                true
            })
            .map(|(token, owner)| (token.clone(), Owner(owner.clone())))
            .collect();
        Self { tokens }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl IdentityProvider for StaticTokens {
    fn current_owner(&self, headers: &HeaderMap) -> Option<Owner> {
        let presented = bearer_token(headers)?;
        // Compare against every entry so timing does not reveal which matched.
        let mut found = None;
        for (token, owner) in &self.tokens {
            if constant_time_eq(token, presented) {
                found = Some(owner);
            }
        }
        found.cloned()
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get("authorization")?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Constant-time string comparison.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
