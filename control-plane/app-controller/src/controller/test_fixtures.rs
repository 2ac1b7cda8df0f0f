use std::sync::Arc;

use k8s_openapi::api::apps::v1::ControllerRevision;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::apimachinery::pkg::runtime::RawExtension;
use kube::api::ObjectMeta;
use kube::core::DynamicObject;
use kube::{Resource, ResourceExt};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use super::canonical::revision_document;
use super::history::{APPLICATION_UID_LABEL, REVISION_NAME_LABEL, revision_type};
use crate::crd::{Application, ApplicationSpec, ResourceTemplate};
use crate::store::{MemoryStore, Session, from_dynamic, to_dynamic};

pub const NS: &str = "default";

pub fn config_map(name: &str, data: Value) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {"name": name},
        "data": data,
    })
}

pub fn spec(templates: Vec<Value>) -> ApplicationSpec {
    ApplicationSpec {
        resources: templates.into_iter().map(ResourceTemplate).collect(),
        ..Default::default()
    }
}

pub fn application(name: &str, templates: Vec<Value>) -> Application {
    let mut app = Application::new(name, spec(templates));
    app.metadata.namespace = Some(NS.into());
    app.metadata.uid = Some(format!("{name}-uid"));
    app
}

/// Store `app` and return it as the store now holds it.
pub fn seed_app(store: &MemoryStore, app: &Application) -> Application {
    from_dynamic(&store.insert(to_dynamic(app).unwrap())).unwrap()
}

pub fn session(store: &MemoryStore) -> Session {
    Session::new(Arc::new(store.clone()), CancellationToken::new())
}

pub fn owner_ref(uid: &str) -> OwnerReference {
    OwnerReference {
        api_version: "apps/v1".into(),
        kind: "Deployment".into(),
        name: "someone-else".into(),
        uid: uid.into(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// A revision of `app` holding `templates`, as another cycle would have written it.
pub fn revision(app: &Application, name: &str, sequence: i64, templates: Vec<Value>) -> DynamicObject {
    let rev = ControllerRevision {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: app.namespace(),
            labels: Some(
                [
                    (APPLICATION_UID_LABEL.to_string(), app.uid().unwrap_or_default()),
                    (REVISION_NAME_LABEL.to_string(), name.to_string()),
                ]
                .into(),
            ),
            owner_references: app.controller_owner_ref(&()).map(|o| vec![o]),
            ..Default::default()
        },
        data: Some(RawExtension(revision_document(&spec(templates)).unwrap())),
        revision: sequence,
    };
    let mut obj = to_dynamic(&rev).unwrap();
    obj.types = Some(revision_type().type_meta());
    obj
}

/// Stored revisions of the namespace, oldest first.
pub fn stored_revisions(store: &MemoryStore) -> Vec<ControllerRevision> {
    let mut revs: Vec<ControllerRevision> = store
        .objects(&revision_type(), NS)
        .iter()
        .map(|o| from_dynamic(o).unwrap())
        .collect();
    revs.sort_by_key(|r| r.revision);
    revs
}
