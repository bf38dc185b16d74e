use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use tracing::{info, warn};

use crate::capabilities::{KeyNamespace, KeyValueStore, KvKey};
use crate::error::{CoreError, CoreResult};

/// Bearer token. Debug output is redacted.
#[derive(Clone, Debug)]
pub struct AuthToken(SecretString);

impl AuthToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(SecretString::new(token.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

/// Source of the current bearer token. `Ok(None)` means signed out.
#[async_trait::async_trait]
pub trait TokenProvider: Send + Sync {
    async fn auth_token(&self) -> CoreResult<Option<AuthToken>>;
}

/// Token persisted in the session namespace of a key/value store.
pub struct TokenStore {
    kv: Arc<dyn KeyValueStore>,
    key: KvKey,
}

impl TokenStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, key: &str) -> CoreResult<Self> {
        Ok(Self {
            kv,
            key: KvKey::new(KeyNamespace::Session, key)?,
        })
    }

    pub async fn save(&self, token: &AuthToken) -> CoreResult<()> {
        let data = serde_json::to_vec(token.expose()).map_err(|e| {
            CoreError::Storage(crate::capabilities::KvError::Serialization {
                message: e.to_string(),
            })
        })?;
        self.kv.set(&self.key, data).await?;
        info!("auth token stored");
        Ok(())
    }

    pub async fn clear(&self) -> CoreResult<()> {
        if self.kv.delete(&self.key).await? {
            info!("auth token cleared");
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl TokenProvider for TokenStore {
    async fn auth_token(&self) -> CoreResult<Option<AuthToken>> {
        let Some(value) = self.kv.get(&self.key).await? else {
            return Ok(None);
        };
        match value.deserialize::<String>() {
            Ok(token) if !token.trim().is_empty() => Ok(Some(AuthToken::new(token))),
            Ok(_) => Ok(None),
            Err(e) => {
                // A token we cannot read is treated as signed out.
                warn!(error = %e, "stored auth token is unreadable");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::MemoryKvStore;

    #[tokio::test]
    async fn test_missing_token_is_none() {
        let store = TokenStore::new(Arc::new(MemoryKvStore::new()), "jwt").unwrap();
        assert!(store.auth_token().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_and_clear() {
        let store = TokenStore::new(Arc::new(MemoryKvStore::new()), "jwt").unwrap();
        store.save(&AuthToken::new("abc")).await.unwrap();
        assert_eq!(store.auth_token().await.unwrap().unwrap().expose(), "abc");

        store.clear().await.unwrap();
        assert!(store.auth_token().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_token_reads_as_signed_out() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKvStore::new());
        let key = KvKey::new(KeyNamespace::Session, "jwt").unwrap();
        kv.set(&key, b"{broken".to_vec()).await.unwrap();

        let store = TokenStore::new(kv, "jwt").unwrap();
        assert!(store.auth_token().await.unwrap().is_none());
    }

    #[test]
    fn test_debug_is_redacted() {
        let token = AuthToken::new("super-secret");
        assert!(!format!("{token:?}").contains("super-secret"));
    }
}
