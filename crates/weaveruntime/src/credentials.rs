//! Run-time credential resolution.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};
use weavecore::{CredentialRef, NodeError, NodeSpec, Secret};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CredentialError {
    #[error("credential '{0}' not found")]
    NotFound(String),

    #[error("credential store unavailable: {0}")]
    Unavailable(String),
}

/// Turns credential references into usable secrets.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(&self, reference: &CredentialRef) -> Result<Secret, CredentialError>;
}

/// Resolver backed by a fixed in-memory map.
#[derive(Default)]
pub struct StaticCredentialResolver {
    secrets: HashMap<CredentialRef, Secret>,
}

impl StaticCredentialResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, reference: impl Into<CredentialRef>, secret: impl Into<String>) -> Self {
        self.secrets.insert(reference.into(), Secret::new(secret));
        self
    }
}

#[async_trait]
impl CredentialResolver for StaticCredentialResolver {
    async fn resolve(&self, reference: &CredentialRef) -> Result<Secret, CredentialError> {
        self.secrets
            .get(reference)
            .cloned()
            .ok_or_else(|| CredentialError::NotFound(reference.to_string()))
    }
}

/// Resolver reading `WEAVE_CREDENTIAL_<REFERENCE>` environment variables.
///
/// The reference is upper-cased and every non-alphanumeric character becomes
/// an underscore, so `github.token` reads `WEAVE_CREDENTIAL_GITHUB_TOKEN`.
#[derive(Debug, Clone)]
pub struct EnvCredentialResolver {
    prefix: String,
}

impl EnvCredentialResolver {
    pub fn new() -> Self {
        Self::with_prefix("WEAVE_CREDENTIAL_")
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn variable_name(&self, reference: &CredentialRef) -> String {
        let suffix: String = reference
            .as_str()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect();
        format!("{}{}", self.prefix, suffix)
    }
}

impl Default for EnvCredentialResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialResolver for EnvCredentialResolver {
    async fn resolve(&self, reference: &CredentialRef) -> Result<Secret, CredentialError> {
        std::env::var(self.variable_name(reference))
            .map(Secret::new)
            .map_err(|_| CredentialError::NotFound(reference.to_string()))
    }
}

type CachedSecret = Arc<OnceCell<Result<Secret, CredentialError>>>;

/// Per-run cache: each distinct reference hits the resolver at most once,
/// even when several nodes ask for it concurrently.
pub struct CredentialCache {
    resolver: Arc<dyn CredentialResolver>,
    cells: Mutex<HashMap<CredentialRef, CachedSecret>>,
}

impl CredentialCache {
    pub fn new(resolver: Arc<dyn CredentialResolver>) -> Self {
        Self {
            resolver,
            cells: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, reference: &CredentialRef) -> Result<Secret, CredentialError> {
        let cell = {
            let mut cells = self.cells.lock().await;
            cells.entry(reference.clone()).or_default().clone()
        };
        cell.get_or_init(|| async {
            tracing::debug!(credential = %reference, "resolving credential");
            self.resolver.resolve(reference).await
        })
        .await
        .clone()
    }

    /// Resolve every credential slot bound on `node`.
    pub async fn resolve_node(&self, node: &NodeSpec) -> Result<HashMap<String, Secret>, NodeError> {
        let mut resolved = HashMap::with_capacity(node.credentials.len());
        for (slot, reference) in &node.credentials {
            let secret = self.get(reference).await.map_err(|e| NodeError::CredentialResolution {
                slot: slot.clone(),
                message: e.to_string(),
            })?;
            resolved.insert(slot.clone(), secret);
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingResolver {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CredentialResolver for CountingResolver {
        async fn resolve(&self, reference: &CredentialRef) -> Result<Secret, CredentialError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if reference.as_str() == "missing" {
                Err(CredentialError::NotFound(reference.to_string()))
            } else {
                Ok(Secret::new(format!("secret-{}", reference)))
            }
        }
    }

    #[tokio::test]
    async fn resolves_each_reference_once() {
        let resolver = Arc::new(CountingResolver {
            calls: AtomicUsize::new(0),
        });
        let cache = CredentialCache::new(resolver.clone());
        let reference = CredentialRef::from("smtp");

        let (a, b) = tokio::join!(cache.get(&reference), cache.get(&reference));
        assert_eq!(a.unwrap().expose(), "secret-smtp");
        assert_eq!(b.unwrap().expose(), "secret-smtp");
        assert!(cache.get(&CredentialRef::from("missing")).await.is_err());
        assert!(cache.get(&CredentialRef::from("missing")).await.is_err());
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn node_failure_names_the_slot() {
        let cache = CredentialCache::new(Arc::new(StaticCredentialResolver::new()));
        let node = NodeSpec::new("mail", "email.send").with_credential("smtp", "prod-smtp");

        let err = cache.resolve_node(&node).await.unwrap_err();
        assert!(matches!(err, NodeError::CredentialResolution { ref slot, .. } if slot == "smtp"));
    }

    #[test]
    fn env_variable_names_are_normalised() {
        let resolver = EnvCredentialResolver::new();
        assert_eq!(
            resolver.variable_name(&CredentialRef::from("github.token")),
            "WEAVE_CREDENTIAL_GITHUB_TOKEN"
        );
    }
}
