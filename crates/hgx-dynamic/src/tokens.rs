//! Application tokens
//!
//! A token scopes private objects to one application of an identity. Tokens
//! are issued by the connection; a session may only adopt a token that was
//! issued before. Each token may name a startup object, which an application
//! reads back when it reconnects.

use std::collections::BTreeMap;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use hgx_core::{Address, AppToken, HgxError, Result};

/// Portable copy of the token table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSnapshot {
    /// Issued tokens with their startup objects
    pub tokens: Vec<(AppToken, Option<Address>)>,
}

/// Issued tokens and their startup objects
#[derive(Debug, Default)]
pub struct TokenRegistry {
    issued: BTreeMap<AppToken, Option<Address>>,
}

impl TokenRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a token that has not been issued before
    pub fn issue(&mut self) -> AppToken {
        let mut rng = rand::rngs::OsRng;
        loop {
            let mut bytes = [0u8; 4];
            rng.fill_bytes(&mut bytes);
            let token = AppToken::from_bytes(bytes);
            if !self.issued.contains_key(&token) {
                self.issued.insert(token, None);
                return token;
            }
        }
    }

    /// Whether `token` was issued
    pub fn contains(&self, token: &AppToken) -> bool {
        self.issued.contains_key(token)
    }

    /// Fail with `UnknownToken` unless `token` was issued
    pub fn require(&self, token: &AppToken) -> Result<()> {
        if self.contains(token) {
            Ok(())
        } else {
            Err(HgxError::UnknownToken { token: *token })
        }
    }

    /// Name the object an application loads first
    pub fn register_startup(&mut self, token: &AppToken, address: Address) -> Result<()> {
        let slot = self
            .issued
            .get_mut(token)
            .ok_or(HgxError::UnknownToken { token: *token })?;
        *slot = Some(address);
        Ok(())
    }

    /// Startup object registered for `token`
    pub fn startup_object(&self, token: &AppToken) -> Result<Option<Address>> {
        self.issued
            .get(token)
            .copied()
            .ok_or(HgxError::UnknownToken { token: *token })
    }

    /// Serializable copy of the registry
    pub fn snapshot(&self) -> TokenSnapshot {
        TokenSnapshot {
            tokens: self.issued.iter().map(|(t, s)| (*t, *s)).collect(),
        }
    }

    /// Merge a snapshot; existing startup objects are overwritten
    pub fn restore(&mut self, snapshot: TokenSnapshot) {
        self.issued.extend(snapshot.tokens);
    }

    /// Number of issued tokens
    pub fn len(&self) -> usize {
        self.issued.len()
    }

    /// Whether no token was issued
    pub fn is_empty(&self) -> bool {
        self.issued.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_issued_tokens_are_unique() {
        let mut registry = TokenRegistry::new();
        let tokens: Vec<_> = (0..64).map(|_| registry.issue()).collect();
        let mut deduped = tokens.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(deduped.len(), tokens.len());
    }

    #[test]
    fn test_unknown_token_rejected() {
        let registry = TokenRegistry::new();
        assert_matches!(
            registry.require(&AppToken::from_bytes([1, 2, 3, 4])),
            Err(HgxError::UnknownToken { .. })
        );
    }

    #[test]
    fn test_startup_object() {
        let mut registry = TokenRegistry::new();
        let token = registry.issue();
        assert_eq!(registry.startup_object(&token).unwrap(), None);
        let address = Address::from_bytes([3u8; 32]);
        registry.register_startup(&token, address).unwrap();
        assert_eq!(registry.startup_object(&token).unwrap(), Some(address));
    }

    #[test]
    fn test_snapshot_restore() {
        let mut registry = TokenRegistry::new();
        let token = registry.issue();
        registry
            .register_startup(&token, Address::from_bytes([3u8; 32]))
            .unwrap();
        let json = serde_json::to_string(&registry.snapshot()).unwrap();

        let mut restored = TokenRegistry::new();
        restored.restore(serde_json::from_str(&json).unwrap());
        assert!(restored.contains(&token));
        assert_eq!(restored.snapshot(), registry.snapshot());
    }
}
