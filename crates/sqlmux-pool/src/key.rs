//! Pool identity.

use std::sync::Arc;

/// Identity of a connection pool.
///
/// Two requests share a pool exactly when their keys compare equal: the
/// canonical configuration string plus, when present, an opaque auth
/// context discriminator (so connections authenticated differently never
/// mix in one pool).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    connection_string: Arc<str>,
    auth_context: Option<Arc<str>>,
}

impl PoolKey {
    /// Key for a canonical configuration string.
    #[must_use]
    pub fn new(connection_string: impl Into<Arc<str>>) -> Self {
        Self {
            connection_string: connection_string.into(),
            auth_context: None,
        }
    }

    /// Attach an auth context discriminator.
    #[must_use]
    pub fn with_auth_context(mut self, context: impl Into<Arc<str>>) -> Self {
        self.auth_context = Some(context.into());
        self
    }

    /// The canonical configuration string.
    #[must_use]
    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    /// The auth context discriminator, if any.
    #[must_use]
    pub fn auth_context(&self) -> Option<&str> {
        self.auth_context.as_deref()
    }
}

impl std::fmt::Display for PoolKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.auth_context {
            Some(context) => write!(f, "{} [{context}]", self.connection_string),
            None => f.write_str(&self.connection_string),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_strings_share_identity() {
        let a = PoolKey::new("server=db1;database=app");
        let b = PoolKey::new("server=db1;database=app");
        assert_eq!(a, b);
    }

    #[test]
    fn test_auth_context_separates_pools() {
        let plain = PoolKey::new("server=db1");
        let scoped = PoolKey::new("server=db1").with_auth_context("tenant-7");
        assert_ne!(plain, scoped);
        assert_eq!(scoped.auth_context(), Some("tenant-7"));
    }

    #[test]
    fn test_keys_hash_consistently() {
        let mut map = hashbrown::HashMap::new();
        map.insert(PoolKey::new("server=db1"), 1);
        assert_eq!(map.get(&PoolKey::new("server=db1")), Some(&1));
    }
}
