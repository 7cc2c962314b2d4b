//! Remote control-plane backend
//!
//! Entity keys map onto REST paths (`/projects/{p}/environments/{e}/...`).
//! Every request carries the `account_id` query parameter and a bearer token;
//! the service enforces lock ids on writes and cascades environment deletes.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;

use crate::backend::{Backend, StateError, StateResult, StateStore};
use crate::key::{ChildKind, EntityKey};
use crate::lock::{EntityLock, LockInfo};

/// Connection details shared by the store and its locks
#[derive(Clone)]
struct RemoteClient {
    client: reqwest::Client,
    base_url: Url,
    account_id: String,
    api_token: String,
}

impl RemoteClient {
    /// URL of `key`, followed by `extra` segments; names are percent-encoded
    fn url(&self, key: &EntityKey, extra: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        // RemoteStore::new only accepts base URLs that can take path segments
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(entity_segments(key))
                .extend(extra);
        }
        url
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.client
            .request(method, url)
            .bearer_auth(&self.api_token)
            .query(&[("account_id", self.account_id.as_str())])
    }
}

/// State store backed by the hosted control-plane API
pub struct RemoteStore {
    backend: Backend,
    remote: RemoteClient,
}

impl RemoteStore {
    pub fn new(url: &str, account_id: &str, api_token: &str) -> StateResult<Self> {
        let base_url = Url::parse(url)
            .map_err(|e| StateError::configuration(format!("invalid API URL {}: {}", url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(StateError::configuration(format!(
                "invalid API URL {}: not a base URL",
                url
            )));
        }

        Ok(Self {
            backend: Backend::Remote {
                url: url.to_string(),
                account_id: account_id.to_string(),
            },
            remote: RemoteClient {
                client: reqwest::Client::new(),
                base_url,
                account_id: account_id.to_string(),
                api_token: api_token.to_string(),
            },
        })
    }
}

#[async_trait]
impl StateStore for RemoteStore {
    fn backend(&self) -> &Backend {
        &self.backend
    }

    async fn read(&self, key: &EntityKey) -> StateResult<Option<Vec<u8>>> {
        let response = send(self.remote.request(Method::GET, self.remote.url(key, &[]))).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = error_for_status(response, key).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| StateError::Http(e.to_string()))?;
        Ok(Some(bytes.to_vec()))
    }

    async fn write(&self, key: &EntityKey, body: Vec<u8>, lock_id: Option<&str>) -> StateResult<()> {
        let mut request = self
            .remote
            .request(Method::POST, self.remote.url(key, &[]))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(lock_id) = lock_id {
            request = request.query(&[("lock_id", lock_id)]);
        }
        let response = send(request).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(StateError::not_found(key));
        }
        error_for_status(response, key).await?;
        Ok(())
    }

    async fn delete(&self, key: &EntityKey, lock_id: Option<&str>) -> StateResult<()> {
        let mut request = self.remote.request(Method::DELETE, self.remote.url(key, &[]));
        if let Some(lock_id) = lock_id {
            request = request.query(&[("lock_id", lock_id)]);
        }
        let response = send(request).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        error_for_status(response, key).await?;
        Ok(())
    }

    async fn list(&self, parent: &EntityKey, kind: ChildKind) -> StateResult<Vec<String>> {
        let url = self.remote.url(parent, &[kind.collection()]);
        let response = send(self.remote.request(Method::GET, url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let response = error_for_status(response, parent).await?;
        let entries: serde_json::Map<String, serde_json::Value> = response
            .json()
            .await
            .map_err(|e| StateError::Serialization(e.to_string()))?;

        // serde_json::Map iterates in sorted key order
        Ok(entries.into_iter().map(|(name, _)| name).collect())
    }

    fn entity_lock(&self, key: &EntityKey) -> Arc<dyn EntityLock> {
        Arc::new(RemoteLock {
            remote: self.remote.clone(),
            key: key.clone(),
        })
    }

    fn destination_uri(&self, key: &EntityKey) -> String {
        let mut url = self.remote.url(key, &[]);
        url.query_pairs_mut()
            .append_pair("account_id", &self.remote.account_id);
        url.to_string()
    }

    async fn delete_environment(&self, key: &EntityKey, lock_id: &str) -> StateResult<()> {
        // The service removes the environment's resources and services itself
        self.delete(key, Some(lock_id)).await
    }
}

#[derive(Debug, Deserialize)]
struct LockResponse {
    lock_id: String,
}

/// Lock held through the service's `/lock` and `/unlock` endpoints
pub struct RemoteLock {
    remote: RemoteClient,
    key: EntityKey,
}

impl RemoteLock {
    fn url(&self, action: &str) -> Url {
        self.remote.url(&self.key, &[action])
    }
}

#[async_trait]
impl EntityLock for RemoteLock {
    async fn try_acquire(&self, info: &LockInfo) -> StateResult<String> {
        let request = self
            .remote
            .request(Method::POST, self.url("lock"))
            .json(&info.lock_operation);
        let response = send(request).await?;

        if is_lock_conflict(response.status()) {
            let holder = response.json::<LockInfo>().await.ok();
            return Err(StateError::locked(&self.key, holder.as_ref()));
        }
        if response.status() == StatusCode::NOT_FOUND {
            return Err(StateError::not_found(&self.key));
        }

        let response = error_for_status(response, &self.key).await?;
        let lock: LockResponse = response
            .json()
            .await
            .map_err(|e| StateError::Serialization(e.to_string()))?;
        Ok(lock.lock_id)
    }

    async fn release(&self, lock_id: &str) -> StateResult<()> {
        let request = self
            .remote
            .request(Method::POST, self.url("unlock"))
            .query(&[("lock_id", lock_id)]);
        let response = send(request).await?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(StateError::LockNotFound(lock_id.to_string())),
            status if is_lock_conflict(status) => {
                let holder = response.json::<LockInfo>().await.ok();
                Err(StateError::LockMismatch {
                    expected: lock_id.to_string(),
                    actual: holder
                        .map(|h| h.lock_id)
                        .unwrap_or_else(|| "unknown".to_string()),
                })
            }
            _ => {
                error_for_status(response, &self.key).await?;
                Ok(())
            }
        }
    }

    async fn read_info(&self) -> StateResult<Option<LockInfo>> {
        let response = send(self.remote.request(Method::GET, self.url("lock"))).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = error_for_status(response, &self.key).await?;
        response
            .json()
            .await
            .map(Some)
            .map_err(|e| StateError::Serialization(e.to_string()))
    }

    async fn force_release(&self) -> StateResult<()> {
        let request = self
            .remote
            .request(Method::POST, self.url("unlock"))
            .query(&[("force", "true")]);
        let response = send(request).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(StateError::LockNotFound(self.key.to_string()));
        }
        error_for_status(response, &self.key).await?;
        Ok(())
    }
}

/// REST path segments of an entity
fn entity_segments(key: &EntityKey) -> Vec<&str> {
    match key {
        EntityKey::Project { project } => vec!["projects", project.as_str()],
        EntityKey::Environment {
            project,
            environment,
        } => vec!["projects", project.as_str(), "environments", environment.as_str()],
        EntityKey::Resource {
            project,
            environment,
            resource,
        } => vec![
            "projects",
            project.as_str(),
            "environments",
            environment.as_str(),
            "resources",
            resource.as_str(),
        ],
        EntityKey::Service {
            project,
            environment,
            service,
        } => vec![
            "projects",
            project.as_str(),
            "environments",
            environment.as_str(),
            "services",
            service.as_str(),
        ],
    }
}

fn is_lock_conflict(status: StatusCode) -> bool {
    status == StatusCode::CONFLICT || status == StatusCode::PRECONDITION_FAILED
}

async fn send(request: RequestBuilder) -> StateResult<Response> {
    request
        .send()
        .await
        .map_err(|e| StateError::Http(e.to_string()))
}

/// Turn a non-success response into an error carrying the response body
async fn error_for_status(response: Response, key: &EntityKey) -> StateResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(StateError::Http(format!(
        "control plane returned {} for {}: {}",
        status, key, body
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> RemoteClient {
        RemoteClient {
            client: reqwest::Client::new(),
            base_url: Url::parse("https://cp.example/api/").unwrap(),
            account_id: "a".to_string(),
            api_token: "t".to_string(),
        }
    }

    #[test]
    fn test_entity_urls() {
        let remote = client();
        assert_eq!(
            remote.url(&EntityKey::project("p"), &[]).path(),
            "/api/projects/p"
        );
        assert_eq!(
            remote
                .url(&EntityKey::environment("p", "dev"), &["resources"])
                .path(),
            "/api/projects/p/environments/dev/resources"
        );
        assert_eq!(
            remote.url(&EntityKey::resource("p", "dev", "db"), &[]).path(),
            "/api/projects/p/environments/dev/resources/db"
        );
        assert_eq!(
            remote.url(&EntityKey::service("p", "dev", "api"), &[]).path(),
            "/api/projects/p/environments/dev/services/api"
        );
    }

    #[test]
    fn test_names_are_percent_encoded() {
        let url = client().url(&EntityKey::resource("p", "dev", "my db/x?y"), &["lock"]);
        assert_eq!(
            url.path(),
            "/api/projects/p/environments/dev/resources/my%20db%2Fx%3Fy/lock"
        );
        assert!(url.query().is_none());
    }

    #[test]
    fn test_lock_urls() {
        let lock = RemoteLock {
            remote: client(),
            key: EntityKey::resource("p", "dev", "db"),
        };
        assert_eq!(
            lock.url("unlock").as_str(),
            "https://cp.example/api/projects/p/environments/dev/resources/db/unlock"
        );
    }

    #[test]
    fn test_destination_uri() {
        let store = RemoteStore::new("https://cp.example/", "acct", "token").unwrap();
        assert_eq!(
            store.destination_uri(&EntityKey::service("p", "prod", "api")),
            "https://cp.example/projects/p/environments/prod/services/api?account_id=acct"
        );
        assert_eq!(store.backend().backend_type(), "remote");
    }

    #[test]
    fn test_rejects_unusable_base_url() {
        assert!(matches!(
            RemoteStore::new("not a url", "acct", "token"),
            Err(StateError::Configuration(_))
        ));
        assert!(matches!(
            RemoteStore::new("mailto:ops@example.com", "acct", "token"),
            Err(StateError::Configuration(_))
        ));
    }

    #[test]
    fn test_lock_conflict_statuses() {
        assert!(is_lock_conflict(StatusCode::CONFLICT));
        assert!(is_lock_conflict(StatusCode::PRECONDITION_FAILED));
        assert!(!is_lock_conflict(StatusCode::OK));
    }
}
