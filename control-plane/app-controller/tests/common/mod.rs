#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use app_controller::controller::canonical::revision_document;
use app_controller::controller::history::{APPLICATION_UID_LABEL, REVISION_NAME_LABEL, revision_type};
use app_controller::controller::reconcile::application_key;
use app_controller::controller::retry::Backoff;
use app_controller::controller::{Outcome, ReconcileErr, Reconciler};
use app_controller::crd::{Application, ApplicationSpec, ApplicationStatus, ResourceTemplate};
use app_controller::store::{
    MemoryStore, ObjectKey, ObjectStore, Session, TypeKey, from_dynamic, to_dynamic,
};
use k8s_openapi::api::apps::v1::ControllerRevision;
use k8s_openapi::apimachinery::pkg::runtime::RawExtension;
use kube::api::ObjectMeta;
use kube::core::DynamicObject;
use kube::{Resource, ResourceExt};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

pub const NS: &str = "default";

// DNS-1123 safe numeric suffix for unique names
pub const DIGITS: [char; 10] =
    ['0', '1', '2', '3', '4', '5', '6', '7', '8', '9'];
pub fn uniq(prefix: &str) -> String {
    format!("{prefix}-{}", nanoid::nanoid!(6, &DIGITS))
}

pub fn config_map(name: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {"name": name, "labels": {"app": "demo"}},
        "data": {"name": name},
    })
}

pub fn deployment(name: &str) -> Value {
    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {"name": name},
        "spec": {
            "replicas": 1,
            "selector": {"matchLabels": {"app": name}},
            "template": {
                "metadata": {"labels": {"app": name}},
                "spec": {"containers": [{"name": "main", "image": "nginx:1.27"}]}
            }
        }
    })
}

pub fn cm_key(name: &str) -> ObjectKey {
    ObjectKey::new(&TypeKey::new("v1", "ConfigMap"), NS, name)
}

pub fn deployment_key(name: &str) -> ObjectKey {
    ObjectKey::new(&TypeKey::new("apps/v1", "Deployment"), NS, name)
}

pub fn templates(values: Vec<Value>) -> Vec<ResourceTemplate> {
    values.into_iter().map(ResourceTemplate).collect()
}

/// Reconciler over a [`MemoryStore`] with fast status retries.
pub struct Harness {
    pub store: MemoryStore,
    pub reconciler: Reconciler,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            store: MemoryStore::new(),
            reconciler: Reconciler::default()
                .with_status_backoff(Backoff::new(5, Duration::from_millis(1))),
        }
    }

    pub fn with_reconciler(mut self, f: impl FnOnce(Reconciler) -> Reconciler) -> Self {
        self.reconciler = f(self.reconciler);
        self
    }

    pub fn session(&self) -> Session {
        Session::new(Arc::new(self.store.clone()), CancellationToken::new())
    }

    /// Store a new Application and return it as stored (uid, generation set).
    pub fn create_app(&self, name: &str, templates_: Vec<Value>, retention: Option<i32>) -> Application {
        let mut app = Application::new(
            name,
            ApplicationSpec {
                resources: templates(templates_),
                revision_history_limit: retention,
                ..Default::default()
            },
        );
        app.metadata.namespace = Some(NS.into());
        from_dynamic(&self.store.insert(to_dynamic(&app).unwrap())).unwrap()
    }

    pub async fn reconcile(&self, name: &str) -> Result<Outcome, ReconcileErr> {
        self.reconciler.reconcile(&self.session(), NS, name).await
    }

    pub fn app(&self, name: &str) -> Application {
        from_dynamic(&self.store.object(&application_key(NS, name)).unwrap()).unwrap()
    }

    pub fn status(&self, name: &str) -> ApplicationStatus {
        self.app(name).status.unwrap_or_default()
    }

    /// Replace the spec of a stored Application, as a user edit would.
    pub async fn edit_spec(&self, name: &str, f: impl FnOnce(&mut ApplicationSpec)) {
        let mut app = self.app(name);
        f(&mut app.spec);
        self.store.update(&to_dynamic(&app).unwrap()).await.unwrap();
    }

    pub fn child(&self, key: &ObjectKey) -> Option<DynamicObject> {
        self.store.object(key)
    }

    /// Stored revisions, ordered by sequence number.
    pub fn revisions(&self) -> Vec<ControllerRevision> {
        let mut revs: Vec<ControllerRevision> = self
            .store
            .objects(&revision_type(), NS)
            .iter()
            .map(|o| from_dynamic(o).unwrap())
            .collect();
        revs.sort_by_key(|r| r.revision);
        revs
    }

    pub fn sequences(&self) -> Vec<i64> {
        self.revisions().iter().map(|r| r.revision).collect()
    }

    /// Store a revision of `app` as an earlier (or concurrent) cycle would have.
    pub fn seed_revision(&self, app: &Application, name: &str, sequence: i64, templates_: Vec<Value>) {
        let spec = ApplicationSpec {
            resources: templates(templates_),
            ..Default::default()
        };
        let rev = ControllerRevision {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some(NS.into()),
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
            data: Some(RawExtension(revision_document(&spec).unwrap())),
            revision: sequence,
        };
        let mut obj = to_dynamic(&rev).unwrap();
        obj.types = Some(revision_type().type_meta());
        self.store.insert(obj);
    }
}
