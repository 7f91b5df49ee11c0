//! Remote persistence interface and HTTP implementation

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::models::{Collection, Entity, EntityId};
use crate::util;

/// Request timeout; a slow server is handled like an unreachable one
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Errors from the remote store
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Sync endpoint or credentials are unusable
    #[error("Invalid sync configuration: {0}")]
    Configuration(String),
    /// Network unreachable or the request failed mid-flight
    #[error("Network error: {0}")]
    Network(String),
    /// The request timed out
    #[error("Request timed out")]
    Timeout,
    /// Server-side failure (5xx)
    #[error("Server error (HTTP {0})")]
    Server(u16),
    /// Session is missing or expired
    #[error("Not authorized")]
    Unauthorized,
    /// The server holds a copy that has to be reconciled first
    #[error("Conflict with the remote copy")]
    Conflict {
        /// The server's current copy
        current: Box<Entity>,
    },
    /// Response body did not match the expected shape
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl RemoteError {
    /// Whether the failed write should stay queued and be retried later
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout | Self::Server(_))
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Network(e.to_string())
        }
    }
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// Trait for the account-scoped remote store
///
/// Implementations are full-record and idempotent: `update` replaces the
/// whole record keyed by id, and deleting an id the server does not know
/// is a success. Both properties keep replay safe to repeat.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Create a record, returning the server's stored copy
    async fn create(&self, entity: &Entity) -> RemoteResult<Entity>;

    /// Replace a record by id, returning the server's stored copy
    async fn update(&self, entity: &Entity) -> RemoteResult<Entity>;

    /// Delete by id; unknown ids succeed
    async fn delete(&self, collection: Collection, id: EntityId) -> RemoteResult<()>;

    /// List every record the account owns in a collection
    async fn list(&self, collection: Collection) -> RemoteResult<Vec<Entity>>;
}

/// HTTP implementation of [`RemoteStore`]
///
/// Every request is scoped to the owner and authenticated with a bearer
/// token. A `409 Conflict` response carries the server's current copy of
/// the record, which surfaces as [`RemoteError::Conflict`].
pub struct HttpRemoteStore {
    base_url: String,
    owner: String,
    token: String,
    client: reqwest::Client,
}

impl fmt::Debug for HttpRemoteStore {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("HttpRemoteStore")
            .field("base_url", &self.base_url)
            .field("owner", &self.owner)
            .field("token", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl HttpRemoteStore {
    /// Create a client for the given endpoint, owner and access token
    pub fn new(
        base_url: impl Into<String>,
        owner: impl Into<String>,
        token: impl Into<String>,
    ) -> RemoteResult<Self> {
        let base_url = normalize_base_url(base_url.into())?;
        Ok(Self {
            base_url,
            owner: owner.into(),
            token: token.into(),
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()?,
        })
    }

    fn collection_url(&self, collection: Collection) -> String {
        format!("{}/v1/{}", self.base_url, collection.table())
    }

    fn record_url(&self, collection: Collection, id: EntityId) -> String {
        format!("{}/v1/{}/{id}", self.base_url, collection.table())
    }

    /// Map a non-success status onto a [`RemoteError`]
    async fn check_status(
        collection: Collection,
        response: reqwest::Response,
    ) -> RemoteResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(RemoteError::Unauthorized),
            StatusCode::CONFLICT => {
                let value = response.json::<serde_json::Value>().await?;
                let current = Entity::from_value(collection, value)
                    .map_err(|e| RemoteError::InvalidResponse(e.to_string()))?;
                Err(RemoteError::Conflict {
                    current: Box::new(current),
                })
            }
            s if s.is_server_error() => Err(RemoteError::Server(s.as_u16())),
            s => {
                let body = response.text().await.unwrap_or_default();
                Err(RemoteError::InvalidResponse(parse_api_error(s, &body)))
            }
        }
    }

    async fn decode_entity(
        collection: Collection,
        response: reqwest::Response,
    ) -> RemoteResult<Entity> {
        let value = response.json::<serde_json::Value>().await?;
        Entity::from_value(collection, value)
            .map_err(|e| RemoteError::InvalidResponse(e.to_string()))
    }

    fn encode(entity: &Entity) -> RemoteResult<serde_json::Value> {
        entity
            .to_value()
            .map_err(|e| RemoteError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn create(&self, entity: &Entity) -> RemoteResult<Entity> {
        let collection = entity.collection();
        let response = self
            .client
            .post(self.collection_url(collection))
            .query(&[("owner", self.owner.as_str())])
            .bearer_auth(&self.token)
            .json(&Self::encode(entity)?)
            .send()
            .await?;

        let response = Self::check_status(collection, response).await?;
        Self::decode_entity(collection, response).await
    }

    async fn update(&self, entity: &Entity) -> RemoteResult<Entity> {
        let collection = entity.collection();
        let response = self
            .client
            .put(self.record_url(collection, entity.id()))
            .query(&[("owner", self.owner.as_str())])
            .bearer_auth(&self.token)
            .json(&Self::encode(entity)?)
            .send()
            .await?;

        let response = Self::check_status(collection, response).await?;
        Self::decode_entity(collection, response).await
    }

    async fn delete(&self, collection: Collection, id: EntityId) -> RemoteResult<()> {
        let response = self
            .client
            .delete(self.record_url(collection, id))
            .query(&[("owner", self.owner.as_str())])
            .bearer_auth(&self.token)
            .send()
            .await?;

        // Deleting something the server never had still counts as done
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check_status(collection, response).await?;
        Ok(())
    }

    async fn list(&self, collection: Collection) -> RemoteResult<Vec<Entity>> {
        let response = self
            .client
            .get(self.collection_url(collection))
            .query(&[("owner", self.owner.as_str())])
            .bearer_auth(&self.token)
            .send()
            .await?;

        let response = Self::check_status(collection, response).await?;
        let values = response.json::<Vec<serde_json::Value>>().await?;
        values
            .into_iter()
            .map(|value| {
                Entity::from_value(collection, value)
                    .map_err(|e| RemoteError::InvalidResponse(e.to_string()))
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return format!("{} ({})", message.trim(), status.as_u16());
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", trimmed, status.as_u16())
    }
}

fn normalize_base_url(raw: String) -> RemoteResult<String> {
    let trimmed = raw.trim();
    if !util::is_http_url(trimmed) {
        return Err(RemoteError::Configuration(
            "Base URL must include http:// or https://".to_string(),
        ));
    }
    Ok(trimmed.trim_end_matches('/').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(
            normalize_base_url("https://api.example.com/".to_string()).unwrap(),
            "https://api.example.com"
        );
        assert!(normalize_base_url("api.example.com".to_string()).is_err());
        assert!(normalize_base_url(String::new()).is_err());
    }

    #[test]
    fn test_urls_are_owner_agnostic() {
        // Owner rides in the query string, not the path
        let store =
            HttpRemoteStore::new("https://api.example.com", "user-1", "secret").unwrap();
        assert_eq!(
            store.collection_url(Collection::Notes),
            "https://api.example.com/v1/notes"
        );
        let id = EntityId::new();
        assert_eq!(
            store.record_url(Collection::Todos, id),
            format!("https://api.example.com/v1/todos/{id}")
        );
    }

    #[test]
    fn test_debug_redacts_token() {
        let store =
            HttpRemoteStore::new("https://api.example.com", "user-1", "secret").unwrap();
        let debug = format!("{store:?}");
        assert!(!debug.contains("secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(RemoteError::Network("reset".to_string()).is_transient());
        assert!(RemoteError::Timeout.is_transient());
        assert!(RemoteError::Server(503).is_transient());
        assert!(!RemoteError::Unauthorized.is_transient());
        assert!(!RemoteError::InvalidResponse("bad".to_string()).is_transient());
        assert!(!RemoteError::Configuration("bad".to_string()).is_transient());
    }

    #[test]
    fn test_parse_api_error_prefers_message() {
        let status = StatusCode::BAD_REQUEST;
        assert_eq!(
            parse_api_error(status, "{\"message\":\"nope\"}"),
            "nope (400)"
        );
        assert_eq!(
            parse_api_error(status, "{\"error\":\"broken\"}"),
            "broken (400)"
        );
        assert_eq!(parse_api_error(status, ""), "HTTP 400");
        assert_eq!(parse_api_error(status, "plain text"), "plain text (400)");
    }
}
