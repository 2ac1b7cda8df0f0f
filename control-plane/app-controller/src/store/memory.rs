use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::DynamicObject;
use serde_json::Value;
use tracing::trace;

use super::{ObjectKey, ObjectStore, StoreError, TypeKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Get,
    List,
    Create,
    Update,
    UpdateStatus,
    Patch,
    Delete,
}

/// Failure injected into the next matching call(s).
#[derive(Debug, Clone)]
pub enum Fault {
    Conflict,
    Api(String),
    /// Another writer stores the same object first; the call then reports
    /// `AlreadyExists`.
    RaceCreate,
    /// Like [`Fault::RaceCreate`], but the other writer's copy is controlled
    /// by the owner with the given uid.
    RaceCreateOwnedBy(String),
    /// The call reports `AlreadyExists` although the racing object is
    /// already gone again.
    RaceCreateGone,
}

#[derive(Debug)]
struct Injected {
    verb: Verb,
    kind: String,
    fault: Fault,
    remaining: usize,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectKey, DynamicObject>,
    resource_version: u64,
    uid: u64,
    faults: Vec<Injected>,
    calls: Vec<(Verb, ObjectKey)>,
}

impl State {
    fn record(&mut self, verb: Verb, key: &ObjectKey) {
        self.calls.push((verb, key.clone()));
    }

    fn take_fault(&mut self, verb: Verb, kind: &str) -> Option<Fault> {
        let idx = self
            .faults
            .iter()
            .position(|f| f.verb == verb && f.kind == kind && f.remaining > 0)?;
        let injected = &mut self.faults[idx];
        injected.remaining -= 1;
        let fault = injected.fault.clone();
        if injected.remaining == 0 {
            self.faults.remove(idx);
        }
        Some(fault)
    }

    fn next_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }

    /// Stamp server-owned metadata on a freshly created object.
    fn admit(&mut self, mut obj: DynamicObject) -> DynamicObject {
        if obj.metadata.uid.is_none() {
            self.uid += 1;
            obj.metadata.uid = Some(format!("uid-{}", self.uid));
        }
        obj.metadata.generation = Some(1);
        obj.metadata.resource_version = Some(self.next_version());
        obj
    }

    fn current(&self, key: &ObjectKey) -> Result<DynamicObject, StoreError> {
        self.objects
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }
}

fn fault_error(fault: Fault, key: &ObjectKey) -> StoreError {
    match fault {
        Fault::Conflict => StoreError::Conflict {
            key: key.to_string(),
            message: "the object has been modified; please apply your changes to the latest version and try again".into(),
        },
        Fault::Api(msg) => StoreError::Api(msg),
        Fault::RaceCreate | Fault::RaceCreateOwnedBy(_) | Fault::RaceCreateGone => {
            StoreError::AlreadyExists(key.to_string())
        }
    }
}

fn check_version(
    key: &ObjectKey,
    current: &DynamicObject,
    incoming: Option<&str>,
) -> Result<(), StoreError> {
    match incoming {
        Some(rv) if Some(rv) != current.metadata.resource_version.as_deref() => {
            Err(StoreError::Conflict {
                key: key.to_string(),
                message: format!(
                    "resourceVersion {rv} is stale (current {})",
                    current.metadata.resource_version.as_deref().unwrap_or("")
                ),
            })
        }
        _ => Ok(()),
    }
}

fn without_status(data: &Value) -> Value {
    let mut v = data.clone();
    if let Some(map) = v.as_object_mut() {
        map.remove("status");
    }
    v
}

fn set_status(data: &mut Value, status: Option<Value>) {
    if let Some(map) = data.as_object_mut() {
        match status {
            Some(s) => {
                map.insert("status".into(), s);
            }
            None => {
                map.remove("status");
            }
        }
    }
}

fn matches_selector(obj: &DynamicObject, selector: Option<&str>) -> bool {
    let Some(selector) = selector else {
        return true;
    };
    let labels = obj.metadata.labels.clone().unwrap_or_default();
    selector
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .all(|term| match term.split_once("!=") {
            Some((k, v)) => labels.get(k.trim()).map(String::as_str) != Some(v.trim()),
            None => match term.split_once('=') {
                Some((k, v)) => {
                    let v = v.trim_start_matches('=');
                    labels.get(k.trim()).map(String::as_str) == Some(v.trim())
                }
                None => labels.contains_key(term),
            },
        })
}

/// In-process [`ObjectStore`] with Kubernetes-like versioning semantics.
///
/// Every mutation bumps `resourceVersion`; spec changes bump `generation`;
/// no-op patches leave the object untouched. Faults can be injected per verb
/// and kind to exercise conflict and race handling.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed an object as if it had been created earlier, bypassing faults.
    pub fn insert(&self, obj: DynamicObject) -> DynamicObject {
        let mut state = self.lock();
        let key = ObjectKey::of(&obj);
        let stored = state.admit(obj);
        state.objects.insert(key, stored.clone());
        stored
    }

    pub fn object(&self, key: &ObjectKey) -> Option<DynamicObject> {
        self.lock().objects.get(key).cloned()
    }

    pub fn objects(&self, type_key: &TypeKey, namespace: &str) -> Vec<DynamicObject> {
        self.lock()
            .objects
            .iter()
            .filter(|(k, _)| {
                k.api_version == type_key.api_version
                    && k.kind == type_key.kind
                    && (namespace.is_empty() || k.namespace == namespace)
            })
            .map(|(_, o)| o.clone())
            .collect()
    }

    pub fn inject(&self, verb: Verb, kind: &str, fault: Fault, times: usize) {
        self.lock().faults.push(Injected {
            verb,
            kind: kind.to_string(),
            fault,
            remaining: times,
        });
    }

    /// Number of calls made with `verb` against objects of `kind`.
    pub fn calls(&self, verb: Verb, kind: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|(v, k)| *v == verb && k.kind == kind)
            .count()
    }

    pub fn reset_calls(&self) {
        self.lock().calls.clear();
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>, StoreError> {
        let mut state = self.lock();
        state.record(Verb::Get, key);
        if let Some(fault) = state.take_fault(Verb::Get, &key.kind) {
            return Err(fault_error(fault, key));
        }
        Ok(state.objects.get(key).cloned())
    }

    async fn list(
        &self,
        type_key: &TypeKey,
        namespace: &str,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>, StoreError> {
        let mut state = self.lock();
        let key = ObjectKey::new(type_key, namespace, "");
        state.record(Verb::List, &key);
        if let Some(fault) = state.take_fault(Verb::List, &type_key.kind) {
            return Err(fault_error(fault, &key));
        }
        Ok(state
            .objects
            .iter()
            .filter(|(k, o)| {
                k.api_version == type_key.api_version
                    && k.kind == type_key.kind
                    && (namespace.is_empty() || k.namespace == namespace)
                    && matches_selector(o, label_selector)
            })
            .map(|(_, o)| o.clone())
            .collect())
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let mut state = self.lock();
        let key = ObjectKey::of(obj);
        state.record(Verb::Create, &key);
        if let Some(fault) = state.take_fault(Verb::Create, &key.kind) {
            let raced = match &fault {
                Fault::RaceCreate => Some(obj.clone()),
                Fault::RaceCreateOwnedBy(uid) => {
                    let mut theirs = obj.clone();
                    theirs.metadata.owner_references = Some(vec![OwnerReference {
                        api_version: "apps/v1".into(),
                        kind: "Deployment".into(),
                        name: "racer".into(),
                        uid: uid.clone(),
                        controller: Some(true),
                        ..Default::default()
                    }]);
                    Some(theirs)
                }
                _ => None,
            };
            if let Some(raced) = raced {
                let stored = state.admit(raced);
                state.objects.insert(key.clone(), stored);
            }
            return Err(fault_error(fault, &key));
        }
        if key.name.is_empty() {
            return Err(StoreError::Api(format!(
                "{} name is required",
                key.kind
            )));
        }
        if state.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(key.to_string()));
        }
        let stored = state.admit(obj.clone());
        trace!(%key, rv = ?stored.metadata.resource_version, "memory: created");
        state.objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let mut state = self.lock();
        let key = ObjectKey::of(obj);
        state.record(Verb::Update, &key);
        if let Some(fault) = state.take_fault(Verb::Update, &key.kind) {
            return Err(fault_error(fault, &key));
        }
        let current = state.current(&key)?;
        check_version(&key, &current, obj.metadata.resource_version.as_deref())?;

        let mut next = obj.clone();
        set_status(&mut next.data, current.data.get("status").cloned());
        next.metadata.uid = current.metadata.uid.clone();
        next.metadata.generation = current.metadata.generation;
        next.metadata.resource_version = current.metadata.resource_version.clone();
        if next == current {
            return Ok(current);
        }
        if without_status(&next.data) != without_status(&current.data) {
            next.metadata.generation = Some(current.metadata.generation.unwrap_or(0) + 1);
        }
        next.metadata.resource_version = Some(state.next_version());
        state.objects.insert(key, next.clone());
        Ok(next)
    }

    async fn update_status(
        &self,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, StoreError> {
        let mut state = self.lock();
        let key = ObjectKey::of(obj);
        state.record(Verb::UpdateStatus, &key);
        if let Some(fault) = state.take_fault(Verb::UpdateStatus, &key.kind) {
            return Err(fault_error(fault, &key));
        }
        let current = state.current(&key)?;
        check_version(&key, &current, obj.metadata.resource_version.as_deref())?;

        let mut next = current.clone();
        set_status(&mut next.data, obj.data.get("status").cloned());
        if next == current {
            return Ok(current);
        }
        next.metadata.resource_version = Some(state.next_version());
        state.objects.insert(key, next.clone());
        Ok(next)
    }

    async fn patch_merge(
        &self,
        key: &ObjectKey,
        patch: &Value,
    ) -> Result<DynamicObject, StoreError> {
        let mut state = self.lock();
        state.record(Verb::Patch, key);
        if let Some(fault) = state.take_fault(Verb::Patch, &key.kind) {
            return Err(fault_error(fault, key));
        }
        let current = state.current(key)?;
        let incoming_rv = patch
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str);
        check_version(key, &current, incoming_rv)?;

        let mut patch = patch.clone();
        if let Some(meta) = patch.get_mut("metadata").and_then(Value::as_object_mut) {
            meta.remove("resourceVersion");
        }
        let mut doc = serde_json::to_value(&current)?;
        json_patch::merge(&mut doc, &patch);
        let mut next: DynamicObject = serde_json::from_value(doc)?;
        next.metadata.uid = current.metadata.uid.clone();
        next.metadata.name = current.metadata.name.clone();
        next.metadata.namespace = current.metadata.namespace.clone();
        next.metadata.generation = current.metadata.generation;
        next.metadata.resource_version = current.metadata.resource_version.clone();
        if next == current {
            trace!(%key, "memory: no-op patch");
            return Ok(current);
        }
        if without_status(&next.data) != without_status(&current.data) {
            next.metadata.generation = Some(current.metadata.generation.unwrap_or(0) + 1);
        }
        next.metadata.resource_version = Some(state.next_version());
        state.objects.insert(key.clone(), next.clone());
        Ok(next)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.record(Verb::Delete, key);
        if let Some(fault) = state.take_fault(Verb::Delete, &key.kind) {
            return Err(fault_error(fault, key));
        }
        state
            .objects
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }
}
