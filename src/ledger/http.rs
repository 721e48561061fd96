use super::SessionLedger;
use crate::auth::AuthManager;
use crate::config::SyncConfig;
use crate::error::LedgerError;
use crate::models::{Finalization, RemoteSessionRecord, UserAggregates};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// REST backend for the ledger.
///
/// Routes, relative to `api_base_url`:
/// - `POST /users/{uid}/sessions` create (409 = already exists)
/// - `GET  /users/{uid}/sessions/{sid}` existence check (404 = absent)
/// - `PUT  /users/{uid}/sessions/{sid}/finalize`
/// - `GET  /users/{uid}/aggregates`, `PUT` with `If-Match: <version>`
pub struct HttpSessionLedger {
    client: Client,
    api_base_url: String,
    app_version: String,
    auth: Arc<AuthManager>,
}

impl HttpSessionLedger {
    pub fn new(config: &SyncConfig, auth: Arc<AuthManager>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            api_base_url: config.api_base_url.trim_end_matches('/').to_string(),
            app_version: config.app_version.clone(),
            auth,
        }
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        idempotency_key: Option<&str>,
    ) -> Result<RequestBuilder, LedgerError> {
        let token = self
            .auth
            .get_access_token()
            .await
            .map_err(LedgerError::Unauthenticated)?;
        let url = format!("{}{}", self.api_base_url, path);
        let mut request = self
            .client
            .request(method, &url)
            .bearer_auth(token)
            .header("X-App-Version", &self.app_version);
        if let Some(key) = idempotency_key {
            request = request.header("X-Idempotency-Key", key);
        }
        Ok(request)
    }

    async fn send(request: RequestBuilder) -> Result<Response, LedgerError> {
        request
            .send()
            .await
            .map_err(|e| LedgerError::Unreachable(e.to_string()))
    }

    async fn http_error(response: Response) -> LedgerError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let message = if body.is_empty() {
            status.canonical_reason().unwrap_or("Unknown").to_string()
        } else {
            body
        };
        if status == StatusCode::UNAUTHORIZED {
            return LedgerError::Unauthenticated(message);
        }
        LedgerError::Http {
            status: status.as_u16(),
            message,
        }
    }

    fn session_path(user_id: &str, session_id: &str) -> String {
        format!("/users/{}/sessions/{}", user_id, session_id)
    }
}

#[async_trait]
impl SessionLedger for HttpSessionLedger {
    async fn create_session(
        &self,
        user_id: &str,
        record: &RemoteSessionRecord,
    ) -> Result<String, LedgerError> {
        let request = self
            .request(
                Method::POST,
                &format!("/users/{}/sessions", user_id),
                Some(&record.session_id),
            )
            .await?
            .json(record);
        let response = Self::send(request).await?;

        match response.status() {
            s if s.is_success() => {
                let body: serde_json::Value = response.json().await.unwrap_or_default();
                Ok(body["id"]
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| record.session_id.clone()))
            }
            StatusCode::CONFLICT => {
                info!(
                    "[LEDGER] Session {} already exists remotely, treating create as applied",
                    record.session_id
                );
                Ok(record.session_id.clone())
            }
            _ => Err(Self::http_error(response).await),
        }
    }

    async fn finalize_session(
        &self,
        user_id: &str,
        session_id: &str,
        finalization: &Finalization,
    ) -> Result<(), LedgerError> {
        let path = format!("{}/finalize", Self::session_path(user_id, session_id));
        let request = self
            .request(Method::PUT, &path, Some(session_id))
            .await?
            .json(finalization);
        let response = Self::send(request).await?;

        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(LedgerError::NotFound(session_id.to_string())),
            _ => Err(Self::http_error(response).await),
        }
    }

    async fn get_session(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<Option<RemoteSessionRecord>, LedgerError> {
        let request = self
            .request(Method::GET, &Self::session_path(user_id, session_id), None)
            .await?;
        let response = Self::send(request).await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => response
                .json::<RemoteSessionRecord>()
                .await
                .map(Some)
                .map_err(|e| LedgerError::Payload(format!("session {}: {}", session_id, e))),
            _ => Err(Self::http_error(response).await),
        }
    }

    async fn load_aggregates(&self, user_id: &str) -> Result<UserAggregates, LedgerError> {
        let request = self
            .request(Method::GET, &format!("/users/{}/aggregates", user_id), None)
            .await?;
        let response = Self::send(request).await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(UserAggregates::default()),
            s if s.is_success() => response
                .json::<UserAggregates>()
                .await
                .map_err(|e| LedgerError::Payload(format!("aggregates for {}: {}", user_id, e))),
            _ => Err(Self::http_error(response).await),
        }
    }

    async fn compare_and_swap_aggregates(
        &self,
        user_id: &str,
        expected_version: u64,
        next: &UserAggregates,
    ) -> Result<bool, LedgerError> {
        let request = self
            .request(Method::PUT, &format!("/users/{}/aggregates", user_id), None)
            .await?
            .header("If-Match", expected_version.to_string())
            .json(next);
        let response = Self::send(request).await?;

        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
                debug!(
                    "[LEDGER] Aggregates for {} moved past version {}",
                    user_id, expected_version
                );
                Ok(false)
            }
            _ => Err(Self::http_error(response).await),
        }
    }
}
