//! Token authentication backed by the KV store.

use std::sync::Arc;

use async_trait::async_trait;
use lumen_gateway::{Authenticator, GatewayError, GatewayResult, KvStore};

/// Resolves `im:auth:token:{token}` to a user id. Tokens are written by the
/// external auth service.
pub struct StoreTokenAuthenticator {
    store: Arc<dyn KvStore>,
}

impl StoreTokenAuthenticator {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub fn key(token: &str) -> String {
        format!("im:auth:token:{}", token)
    }
}

#[async_trait]
impl Authenticator for StoreTokenAuthenticator {
    async fn authenticate(&self, token: &str) -> GatewayResult<i64> {
        if token.is_empty() {
            return Err(GatewayError::Unauthorized("missing token".to_string()));
        }

        let value = self
            .store
            .get(&Self::key(token))
            .await?
            .ok_or_else(|| GatewayError::Unauthorized("unknown token".to_string()))?;

        match value.parse::<i64>() {
            Ok(uid) if uid > 0 => Ok(uid),
            _ => Err(GatewayError::Unauthorized(format!(
                "token maps to invalid user id {:?}",
                value
            ))),
        }
    }
}
