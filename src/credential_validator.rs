//! Client-credential boundary.
//!
//! The proxy's own client-facing tokens are issued, persisted, and usage-
//! logged by an external store, out of scope for this engine. This module
//! only defines the interface the ingress would call before enqueueing,
//! plus a minimal in-memory implementation good enough to run the engine
//! standalone and in tests, mirroring the shape of a typical
//! `validate_api_key` check without reimplementing its SQL-backed store.

use std::collections::HashSet;

use parking_lot::RwLock;

use crate::types::ClientCredential;

pub trait ClientCredentialValidator: Send + Sync {
    fn validate(&self, token: &str) -> Option<ClientCredential>;
}

/// An in-memory allowlist. Not a replacement for a real issuance/usage-
/// logging store — just enough surface to drive the demo binary and tests
/// without a database.
#[derive(Default)]
pub struct StaticCredentialValidator {
    tokens: RwLock<HashSet<String>>,
}

impl StaticCredentialValidator {
    pub fn new(tokens: impl IntoIterator<Item = String>) -> Self {
        Self {
            tokens: RwLock::new(tokens.into_iter().collect()),
        }
    }

    pub fn insert(&self, token: impl Into<String>) {
        self.tokens.write().insert(token.into());
    }
}

impl ClientCredentialValidator for StaticCredentialValidator {
    fn validate(&self, token: &str) -> Option<ClientCredential> {
        if self.tokens.read().contains(token) {
            Some(ClientCredential(token.to_string()))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_token_is_rejected() {
        let validator = StaticCredentialValidator::new(["abc".to_string()]);
        assert!(validator.validate("abc").is_some());
        assert!(validator.validate("xyz").is_none());
    }
}
