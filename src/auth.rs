use std::sync::{Arc, RwLock};

/// Supplies the signed-in user. The timer core never signs anyone in or out.
pub trait AuthContext: Send + Sync {
    fn current_user_id(&self) -> Option<String>;
}

/// Holder for the current user and the bearer token the HTTP ledger sends.
/// The host app pushes both in after its own sign-in flow.
pub struct AuthManager {
    user_id: RwLock<Option<String>>,
    access_token: Arc<tokio::sync::RwLock<Option<String>>>,
}

impl Default for AuthManager {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthManager {
    pub fn new() -> Self {
        Self {
            user_id: RwLock::new(None),
            access_token: Arc::new(tokio::sync::RwLock::new(None)),
        }
    }

    /// Signed in as `user_id`, convenient for tests and offline use.
    pub fn signed_in(user_id: &str) -> Self {
        let manager = Self::new();
        manager.set_user(Some(user_id.to_string()));
        manager
    }

    pub fn set_user(&self, user_id: Option<String>) {
        match self.user_id.write() {
            Ok(mut guard) => *guard = user_id.filter(|id| !id.trim().is_empty()),
            Err(poisoned) => *poisoned.into_inner() = user_id,
        }
    }

    pub async fn set_access_token(&self, access_token: Option<String>) {
        *self.access_token.write().await = access_token;
    }

    pub async fn get_access_token(&self) -> Result<String, String> {
        self.access_token
            .read()
            .await
            .clone()
            .ok_or_else(|| "Access token not set. Call set_access_token first.".to_string())
    }
}

impl AuthContext for AuthManager {
    fn current_user_id(&self) -> Option<String> {
        match self.user_id.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_user_id_is_signed_out() {
        let auth = AuthManager::new();
        auth.set_user(Some("   ".to_string()));
        assert_eq!(auth.current_user_id(), None);

        auth.set_user(Some("user-1".to_string()));
        assert_eq!(auth.current_user_id(), Some("user-1".to_string()));
    }

    #[tokio::test]
    async fn test_access_token_missing() {
        let auth = AuthManager::new();
        assert!(auth.get_access_token().await.is_err());
        auth.set_access_token(Some("tok".into())).await;
        assert_eq!(auth.get_access_token().await.unwrap(), "tok");
    }
}
