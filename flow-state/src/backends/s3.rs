//! S3 backend for state storage

use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::ServerSideEncryption;

use crate::backend::{Backend, StateError, StateResult, StateStore};
use crate::config::StateConfig;
use crate::key::{ChildKind, EntityKey, STATE_FILE};
use crate::lock::{EntityLock, LockInfo};

/// S3-based state store: entity keys become object keys under a prefix
pub struct S3Store {
    client: Client,
    backend: Backend,
    bucket: String,
    prefix: String,
    /// Whether to encrypt records at rest (default: true)
    encrypt: bool,
}

impl S3Store {
    /// Create a store for `bucket`/`prefix` using the ambient AWS credentials
    pub async fn from_config(
        bucket: &str,
        prefix: &str,
        config: &StateConfig,
    ) -> StateResult<Self> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &config.s3_region {
            loader = loader.region(aws_sdk_s3::config::Region::new(region.clone()));
        }
        let aws_config = loader.load().await;

        Ok(Self::with_client(
            Client::new(&aws_config),
            bucket,
            prefix,
            config.s3_encrypt,
        ))
    }

    pub fn with_client(client: Client, bucket: &str, prefix: &str, encrypt: bool) -> Self {
        Self {
            client,
            backend: Backend::ObjectStorage {
                bucket: bucket.to_string(),
                prefix: prefix.to_string(),
            },
            bucket: bucket.to_string(),
            prefix: prefix.to_string(),
            encrypt,
        }
    }

    /// Get the bucket name
    pub fn bucket_name(&self) -> &str {
        &self.bucket
    }

    fn object_key(&self, relative: &str) -> String {
        object_key(&self.prefix, relative)
    }

    async fn get(&self, object_key: &str) -> StateResult<Option<Vec<u8>>> {
        get_object(&self.client, &self.bucket, object_key).await
    }
}

#[async_trait]
impl StateStore for S3Store {
    fn backend(&self) -> &Backend {
        &self.backend
    }

    async fn read(&self, key: &EntityKey) -> StateResult<Option<Vec<u8>>> {
        self.get(&self.object_key(&key.state_key())).await
    }

    async fn write(
        &self,
        key: &EntityKey,
        body: Vec<u8>,
        _lock_id: Option<&str>,
    ) -> StateResult<()> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(self.object_key(&key.state_key()))
            .body(ByteStream::from(body))
            .content_type("application/json");

        if self.encrypt {
            request = request.server_side_encryption(ServerSideEncryption::Aes256);
        }

        request
            .send()
            .await
            .map_err(|e| StateError::Aws(format!("Failed to write {}: {}", key, e)))?;

        Ok(())
    }

    async fn delete(&self, key: &EntityKey, _lock_id: Option<&str>) -> StateResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.object_key(&key.state_key()))
            .send()
            .await
            .map_err(|e| StateError::Aws(format!("Failed to delete {}: {}", key, e)))?;

        Ok(())
    }

    async fn list(&self, parent: &EntityKey, kind: ChildKind) -> StateResult<Vec<String>> {
        let base = self.object_key(&parent.children_prefix(kind));
        let mut names = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&base)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| StateError::Aws(format!("Failed to list {}: {}", base, e)))?;

            for object in output.contents() {
                if let Some(name) = object.key().and_then(|k| child_name(&base, k)) {
                    names.push(name.to_string());
                }
            }

            match output.next_continuation_token() {
                Some(token) if output.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        names.sort();
        names.dedup();
        Ok(names)
    }

    fn entity_lock(&self, key: &EntityKey) -> Arc<dyn EntityLock> {
        Arc::new(S3Lock {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            object_key: self.object_key(&key.lock_key()),
            key: key.clone(),
            encrypt: self.encrypt,
        })
    }

    fn destination_uri(&self, key: &EntityKey) -> String {
        format!("s3://{}/{}", self.bucket, self.object_key(&key.path()))
    }
}

/// Lock object created with `If-None-Match: *`, so only one writer can create it
pub struct S3Lock {
    client: Client,
    bucket: String,
    object_key: String,
    key: EntityKey,
    encrypt: bool,
}

impl S3Lock {
    async fn read_lock(&self) -> StateResult<Option<LockInfo>> {
        match get_object(&self.client, &self.bucket, &self.object_key).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StateError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    async fn delete_lock(&self) -> StateResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&self.object_key)
            .send()
            .await
            .map_err(|e| StateError::Aws(e.to_string()))?;

        Ok(())
    }
}

#[async_trait]
impl EntityLock for S3Lock {
    async fn try_acquire(&self, info: &LockInfo) -> StateResult<String> {
        let body =
            serde_json::to_vec_pretty(info).map_err(|e| StateError::Serialization(e.to_string()))?;

        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&self.object_key)
            .if_none_match("*")
            .body(ByteStream::from(body))
            .content_type("application/json");

        if self.encrypt {
            request = request.server_side_encryption(ServerSideEncryption::Aes256);
        }

        match request.send().await {
            Ok(_) => Ok(info.lock_id.clone()),
            Err(err) if is_conflict_status(http_status(&err)) => {
                let holder = self.read_lock().await.ok().flatten();
                Err(StateError::locked(&self.key, holder.as_ref()))
            }
            Err(err) => Err(StateError::Aws(err.to_string())),
        }
    }

    async fn release(&self, lock_id: &str) -> StateResult<()> {
        match self.read_lock().await? {
            Some(existing) if existing.lock_id != lock_id => Err(StateError::LockMismatch {
                expected: lock_id.to_string(),
                actual: existing.lock_id,
            }),
            Some(_) => self.delete_lock().await,
            None => Err(StateError::LockNotFound(lock_id.to_string())),
        }
    }

    async fn read_info(&self) -> StateResult<Option<LockInfo>> {
        self.read_lock().await
    }

    async fn force_release(&self) -> StateResult<()> {
        if self.read_lock().await?.is_none() {
            return Err(StateError::LockNotFound(self.key.to_string()));
        }
        self.delete_lock().await
    }
}

async fn get_object(client: &Client, bucket: &str, key: &str) -> StateResult<Option<Vec<u8>>> {
    let result = client.get_object().bucket(bucket).key(key).send().await;

    match result {
        Ok(output) => {
            let body = output
                .body
                .collect()
                .await
                .map_err(|e| StateError::Io(e.to_string()))?;
            Ok(Some(body.into_bytes().to_vec()))
        }
        Err(err) if http_status(&err) == Some(404) => Ok(None),
        Err(err) => Err(StateError::Aws(err.to_string())),
    }
}

/// Join the store prefix and a relative key
fn object_key(prefix: &str, relative: &str) -> String {
    if prefix.is_empty() {
        relative.to_string()
    } else {
        format!("{}/{}", prefix, relative)
    }
}

/// `{base}{name}/flow.state` -> `name`; anything deeper or different is not a child record
fn child_name<'a>(base: &str, object_key: &'a str) -> Option<&'a str> {
    let rest = object_key.strip_prefix(base)?;
    let name = rest.strip_suffix(STATE_FILE)?.strip_suffix('/')?;
    if name.is_empty() || name.contains('/') {
        None
    } else {
        Some(name)
    }
}

/// HTTP status of the raw response behind an SDK error, if any
fn http_status<E>(err: &SdkError<E>) -> Option<u16> {
    err.raw_response().map(|raw| raw.status().as_u16())
}

/// 412 PreconditionFailed, or 409 ConditionalRequestConflict while racing another writer
fn is_conflict_status(status: Option<u16>) -> bool {
    matches!(status, Some(409) | Some(412))
}
