//! Store implementations for each backend

mod local;
mod remote;
mod s3;

use std::sync::Arc;

pub use local::{LocalFileLock, LocalStore};
pub use remote::{RemoteLock, RemoteStore};
pub use s3::{S3Lock, S3Store};

use crate::backend::{Backend, StateError, StateResult, StateStore};
use crate::config::StateConfig;

/// Open the store for a backend descriptor
///
/// This is the single place where the backend variant is inspected; everything
/// above it works against [`StateStore`].
pub async fn open_store(backend: &Backend, config: &StateConfig) -> StateResult<Arc<dyn StateStore>> {
    log::debug!("opening {} state store at {}", backend.backend_type(), backend);
    match backend {
        Backend::Local { path } => Ok(Arc::new(LocalStore::new(path.clone()))),
        Backend::ObjectStorage { bucket, prefix } => {
            let store = S3Store::from_config(bucket, prefix, config).await?;
            Ok(Arc::new(store))
        }
        Backend::Remote { url, account_id } => {
            let token = config.api_token.as_deref().ok_or_else(|| {
                StateError::configuration("remote backend requires an API token (FLOW_API_TOKEN)")
            })?;
            Ok(Arc::new(RemoteStore::new(url, account_id, token)?))
        }
    }
}
