//! Narrow object-store interface the reconciliation engine runs against.
//!
//! Documents are schema-free `DynamicObject`s addressed by
//! `(apiVersion, kind, namespace, name)`. [`KubeStore`] talks to a real API
//! server; [`MemoryStore`] keeps everything in process.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::TypeMeta;
use kube::core::DynamicObject;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub mod kubernetes;
pub mod memory;

pub use kubernetes::KubeStore;
pub use memory::{Fault, MemoryStore, Verb};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeKey {
    pub api_version: String,
    pub kind: String,
}

impl TypeKey {
    pub fn new(api_version: &str, kind: &str) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
        }
    }

    pub fn type_meta(&self) -> TypeMeta {
        TypeMeta {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub api_version: String,
    pub kind: String,
    /// Empty for cluster-scoped objects.
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(type_key: &TypeKey, namespace: &str, name: &str) -> Self {
        Self {
            api_version: type_key.api_version.clone(),
            kind: type_key.kind.clone(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Derive the key of an object. Missing type information or name yields empty fields.
    pub fn of(obj: &DynamicObject) -> Self {
        let (api_version, kind) = obj
            .types
            .as_ref()
            .map(|t| (t.api_version.clone(), t.kind.clone()))
            .unwrap_or_default();
        Self {
            api_version,
            kind,
            namespace: obj.metadata.namespace.clone().unwrap_or_default(),
            name: obj.metadata.name.clone().unwrap_or_default(),
        }
    }

    pub fn type_key(&self) -> TypeKey {
        TypeKey::new(&self.api_version, &self.kind)
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{}", self.kind, self.name)
        } else {
            write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("conflict on {key}: {message}")]
    Conflict { key: String, message: String },
    #[error("operation cancelled: {0}")]
    Cancelled(&'static str),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("api error: {0}")]
    Api(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StoreError::Cancelled(_))
    }
}

/// Generic CRUD over structured documents.
///
/// `update`, `update_status` and `patch_merge` (when the patch carries
/// `metadata.resourceVersion`) fail with [`StoreError::Conflict`] on a stale
/// version. `create` reports [`StoreError::AlreadyExists`], `delete` reports
/// [`StoreError::NotFound`].
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>, StoreError>;

    async fn list(
        &self,
        type_key: &TypeKey,
        namespace: &str,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>, StoreError>;

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError>;

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError>;

    async fn update_status(
        &self,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, StoreError>;

    async fn patch_merge(
        &self,
        key: &ObjectKey,
        patch: &Value,
    ) -> Result<DynamicObject, StoreError>;

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError>;
}

/// Store handle scoped to one reconcile cycle. Every call aborts with
/// [`StoreError::Cancelled`] once the token fires or the deadline passes.
#[derive(Clone)]
pub struct Session {
    store: Arc<dyn ObjectStore>,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl Session {
    pub fn new(store: Arc<dyn ObjectStore>, cancel: CancellationToken) -> Self {
        Self {
            store,
            cancel,
            deadline: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    async fn guard<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        if self.cancel.is_cancelled() {
            return Err(StoreError::Cancelled("shutdown"));
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(StoreError::Cancelled("shutdown")),
            _ = until(self.deadline) => Err(StoreError::Cancelled("deadline exceeded")),
            res = fut => res,
        }
    }

    /// Sleep that is cut short by cancellation, used between retries.
    pub async fn sleep(&self, duration: Duration) -> Result<(), StoreError> {
        self.guard(async {
            tokio::time::sleep(duration).await;
            Ok(())
        })
        .await
    }

    pub async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>, StoreError> {
        self.guard(self.store.get(key)).await
    }

    pub async fn list(
        &self,
        type_key: &TypeKey,
        namespace: &str,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>, StoreError> {
        self.guard(self.store.list(type_key, namespace, label_selector))
            .await
    }

    pub async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        self.guard(self.store.create(obj)).await
    }

    pub async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        self.guard(self.store.update(obj)).await
    }

    pub async fn update_status(
        &self,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, StoreError> {
        self.guard(self.store.update_status(obj)).await
    }

    pub async fn patch_merge(
        &self,
        key: &ObjectKey,
        patch: &Value,
    ) -> Result<DynamicObject, StoreError> {
        self.guard(self.store.patch_merge(key, patch)).await
    }

    pub async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        self.guard(self.store.delete(key)).await
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

/// Split `group/version` into its parts; core kinds (`v1`) have an empty group.
pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

/// Convert a typed resource into a dynamic document.
pub fn to_dynamic<K: serde::Serialize>(obj: &K) -> Result<DynamicObject, StoreError> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

/// Parse a dynamic document into a typed resource.
pub fn from_dynamic<K: serde::de::DeserializeOwned>(
    obj: &DynamicObject,
) -> Result<K, StoreError> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;
    use serde_json::json;

    #[test]
    fn split_api_version_handles_core_group() {
        assert_eq!(split_api_version("v1"), ("", "v1"));
        assert_eq!(split_api_version("apps/v1"), ("apps", "v1"));
    }

    #[test]
    fn key_of_dynamic_object() {
        let obj = DynamicObject {
            types: Some(TypeMeta {
                api_version: "apps/v1".into(),
                kind: "Deployment".into(),
            }),
            metadata: ObjectMeta {
                name: Some("web".into()),
                namespace: Some("ns1".into()),
                ..Default::default()
            },
            data: json!({}),
        };
        let key = ObjectKey::of(&obj);
        assert_eq!(key.to_string(), "Deployment/ns1/web");
        assert_eq!(key.type_key(), TypeKey::new("apps/v1", "Deployment"));
    }

    #[tokio::test]
    async fn session_aborts_when_cancelled() {
        let token = CancellationToken::new();
        let session = Session::new(Arc::new(MemoryStore::new()), token.clone());
        token.cancel();
        let key = ObjectKey::new(&TypeKey::new("v1", "ConfigMap"), "ns", "cm");
        let err = session.get(&key).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn session_sleep_respects_deadline() {
        let session = Session::new(
            Arc::new(MemoryStore::new()),
            CancellationToken::new(),
        )
        .with_timeout(Duration::from_millis(50));
        let err = session.sleep(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, StoreError::Cancelled("deadline exceeded")));
    }
}
