use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::{DynamicObject, GroupVersionKind};
use kube::discovery::ApiResource;
use kube::Client;
use serde_json::Value;
use tracing::trace;

use super::{ObjectKey, ObjectStore, StoreError, TypeKey, split_api_version};

/// [`ObjectStore`] backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    field_manager: String,
}

impl KubeStore {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    fn api(&self, type_key: &TypeKey, namespace: &str) -> Api<DynamicObject> {
        let (group, version) = split_api_version(&type_key.api_version);
        let gvk = GroupVersionKind::gvk(group, version, &type_key.kind);
        let ar = ApiResource::from_gvk(&gvk);
        if namespace.is_empty() {
            Api::all_with(self.client.clone(), &ar)
        } else {
            Api::namespaced_with(self.client.clone(), namespace, &ar)
        }
    }

    fn post_params(&self) -> PostParams {
        PostParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        }
    }
}

fn map_err(key: &ObjectKey, err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => {
            StoreError::NotFound(key.to_string())
        }
        kube::Error::Api(resp)
            if resp.code == 409 && resp.reason == "AlreadyExists" =>
        {
            StoreError::AlreadyExists(key.to_string())
        }
        kube::Error::Api(resp) if resp.code == 409 => StoreError::Conflict {
            key: key.to_string(),
            message: resp.message,
        },
        kube::Error::SerdeError(e) => StoreError::Serialization(e),
        other => StoreError::Api(other.to_string()),
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>, StoreError> {
        trace!(%key, "kube: get");
        self.api(&key.type_key(), &key.namespace)
            .get_opt(&key.name)
            .await
            .map_err(|e| map_err(key, e))
    }

    async fn list(
        &self,
        type_key: &TypeKey,
        namespace: &str,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>, StoreError> {
        let mut lp = ListParams::default();
        if let Some(sel) = label_selector {
            lp = lp.labels(sel);
        }
        let list = self
            .api(type_key, namespace)
            .list(&lp)
            .await
            .map_err(|e| map_err(&ObjectKey::new(type_key, namespace, "*"), e))?;
        Ok(list.items)
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let key = ObjectKey::of(obj);
        trace!(%key, "kube: create");
        self.api(&key.type_key(), &key.namespace)
            .create(&self.post_params(), obj)
            .await
            .map_err(|e| map_err(&key, e))
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let key = ObjectKey::of(obj);
        trace!(%key, "kube: replace");
        self.api(&key.type_key(), &key.namespace)
            .replace(&key.name, &self.post_params(), obj)
            .await
            .map_err(|e| map_err(&key, e))
    }

    async fn update_status(
        &self,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, StoreError> {
        let key = ObjectKey::of(obj);
        trace!(%key, "kube: replace status");
        let body = serde_json::to_vec(obj)?;
        self.api(&key.type_key(), &key.namespace)
            .replace_status(&key.name, &self.post_params(), body)
            .await
            .map_err(|e| map_err(&key, e))
    }

    async fn patch_merge(
        &self,
        key: &ObjectKey,
        patch: &Value,
    ) -> Result<DynamicObject, StoreError> {
        trace!(%key, "kube: merge patch");
        let pp = PatchParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        };
        self.api(&key.type_key(), &key.namespace)
            .patch(&key.name, &pp, &Patch::Merge(patch))
            .await
            .map_err(|e| map_err(key, e))
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        trace!(%key, "kube: delete");
        self.api(&key.type_key(), &key.namespace)
            .delete(&key.name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| map_err(key, e))
    }
}
