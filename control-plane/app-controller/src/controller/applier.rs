//! Creates or merge-patches the child resources declared by an Application.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::DynamicObject;
use kube::{Resource, ResourceExt};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::crd::{Application, ResourceTemplate};
use crate::store::{ObjectKey, Session, StoreError};

#[derive(thiserror::Error, Debug)]
pub enum ApplyError {
    #[error("failed to decode resource template #{index}: {reason}")]
    Decode { index: usize, reason: String },
    #[error("the resource {kind}/{name} is controlled by other resource")]
    Ownership { kind: String, name: String },
    #[error("failed to {op} {key}: {source}")]
    Store {
        op: &'static str,
        key: ObjectKey,
        #[source]
        source: StoreError,
    },
    #[error("the resource {kind}/{name} was created concurrently and is not yet observed")]
    Pending { kind: String, name: String },
    #[error("Application {0} has no uid; cannot own resources")]
    MissingOwner(String),
}

/// Outcome of one apply pass.
#[derive(Debug, Default)]
pub struct Applied {
    /// Children as stored after this pass, in template order.
    pub children: Vec<DynamicObject>,
    pub errors: Vec<ApplyError>,
    /// Children whose racing creator's object vanished before it could be read.
    pub deferred: usize,
}

/// Decode a template into a namespaced, owned child document.
pub fn render(
    index: usize,
    template: &ResourceTemplate,
    namespace: &str,
    owner: &OwnerReference,
) -> Result<DynamicObject, ApplyError> {
    let decode = |reason: String| ApplyError::Decode { index, reason };
    if !template.0.is_object() {
        return Err(decode("template is not an object".into()));
    }
    let mut obj: DynamicObject =
        serde_json::from_value(template.0.clone()).map_err(|e| decode(e.to_string()))?;
    match &obj.types {
        Some(t) if !t.api_version.is_empty() && !t.kind.is_empty() => {}
        _ => return Err(decode("apiVersion and kind are required".into())),
    }
    if obj.metadata.name.as_deref().unwrap_or_default().is_empty() {
        return Err(decode("metadata.name is required".into()));
    }

    obj.metadata.namespace = Some(namespace.to_string());
    let refs = obj.metadata.owner_references.get_or_insert_with(Vec::new);
    refs.retain(|r| r.uid != owner.uid && r.controller != Some(true));
    refs.push(owner.clone());
    Ok(obj)
}

/// True when `obj` has owners but none of them is the controller `uid`.
pub fn owned_elsewhere(obj: &DynamicObject, uid: &str) -> bool {
    let refs = obj.owner_references();
    !refs.is_empty()
        && !refs
            .iter()
            .any(|r| r.controller == Some(true) && r.uid == uid)
}

/// Merge patch carrying the declared fields plus the observed version.
fn merge_patch(desired: &DynamicObject, resource_version: Option<String>) -> Result<Value, StoreError> {
    let mut patch = serde_json::to_value(desired)?;
    if let Some(meta) = patch.get_mut("metadata").and_then(Value::as_object_mut) {
        meta.insert(
            "resourceVersion".into(),
            resource_version.map(Value::String).unwrap_or(Value::Null),
        );
    }
    Ok(patch)
}

/// Apply every template of `app`. Per-template failures are collected and
/// never stop the remaining templates; only cancellation aborts the pass.
#[instrument(skip_all, fields(app = %app.name_any(), templates = app.spec.resources.len()))]
pub async fn apply_all(session: &Session, app: &Application) -> Result<Applied, StoreError> {
    let mut out = Applied::default();
    let Some(owner) = app.controller_owner_ref(&()) else {
        out.errors.push(ApplyError::MissingOwner(app.name_any()));
        return Ok(out);
    };
    let namespace = app.namespace().unwrap_or_default();

    let mut desired = Vec::with_capacity(app.spec.resources.len());
    for (index, template) in app.spec.resources.iter().enumerate() {
        match render(index, template, &namespace, &owner) {
            Ok(obj) => desired.push(obj),
            Err(e) => {
                warn!(error = %e, "apply: skipping template");
                out.errors.push(e);
            }
        }
    }

    for obj in desired {
        let key = ObjectKey::of(&obj);
        match apply_one(session, &obj, &key, &owner.uid).await {
            Ok(Some(stored)) => out.children.push(stored),
            Ok(None) => {
                out.deferred += 1;
                out.errors.push(ApplyError::Pending {
                    kind: key.kind.clone(),
                    name: key.name.clone(),
                });
            }
            Err(ApplyError::Store { source, .. }) if source.is_cancelled() => {
                return Err(source);
            }
            Err(e) => {
                warn!(%key, error = %e, "apply: child failed");
                out.errors.push(e);
            }
        }
    }
    Ok(out)
}

/// `Ok(None)` means another writer created the child and it was gone again before it
/// could be read back; the next cycle retries it.
async fn apply_one(
    session: &Session,
    desired: &DynamicObject,
    key: &ObjectKey,
    owner_uid: &str,
) -> Result<Option<DynamicObject>, ApplyError> {
    let store_err = |op, source| ApplyError::Store {
        op,
        key: key.clone(),
        source,
    };

    let existing = match session.get(key).await.map_err(|e| store_err("get", e))? {
        Some(existing) => existing,
        None => match session.create(desired).await {
            Ok(created) => {
                info!(%key, "apply: created");
                return Ok(Some(created));
            }
            // another writer got there first; treat its object like a pre-existing one
            Err(e) if e.is_already_exists() => {
                let Some(raced) = session.get(key).await.map_err(|e| store_err("get", e))? else {
                    debug!(%key, "apply: created concurrently and gone again; deferring");
                    return Ok(None);
                };
                debug!(%key, "apply: created concurrently; checking ownership");
                raced
            }
            Err(e) => return Err(store_err("create", e)),
        },
    };

    if owned_elsewhere(&existing, owner_uid) {
        return Err(ApplyError::Ownership {
            kind: key.kind.clone(),
            name: key.name.clone(),
        });
    }

    let patch = merge_patch(desired, existing.resource_version())
        .map_err(|e| store_err("encode patch for", e))?;
    let patched = session
        .patch_merge(key, &patch)
        .await
        .map_err(|e| store_err("patch", e))?;
    if patched.resource_version() != existing.resource_version() {
        info!(%key, "apply: patched");
    } else {
        debug!(%key, "apply: unchanged");
    }
    Ok(Some(patched))
}
