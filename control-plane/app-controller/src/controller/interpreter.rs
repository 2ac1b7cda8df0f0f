//! Kind-specific readiness rules for child resources.
//!
//! Each interpreter turns a child document into `Ready`, `InProgress` or
//! `Unknown`. Kinds without a dedicated interpreter fall back to the generic
//! condition-based rule.

use std::collections::HashMap;
use std::sync::Arc;

use kube::core::DynamicObject;
use serde_json::Value;

use crate::crd::ComputedStatus;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum InterpretError {
    #[error("{kind} {name}: malformed status: {reason}")]
    MalformedStatus {
        kind: String,
        name: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Interpretation {
    pub status: ComputedStatus,
    /// Raw `status` section as observed.
    pub raw: Option<Value>,
}

pub trait StatusInterpreter: Send + Sync {
    fn interpret(&self, obj: &DynamicObject) -> Result<Interpretation, InterpretError>;
}

impl<F> StatusInterpreter for F
where
    F: Fn(&DynamicObject) -> Result<Interpretation, InterpretError> + Send + Sync,
{
    fn interpret(&self, obj: &DynamicObject) -> Result<Interpretation, InterpretError> {
        self(obj)
    }
}

/// Per-kind interpreter lookup with a generic fallback.
#[derive(Clone)]
pub struct InterpreterRegistry {
    by_kind: HashMap<String, Arc<dyn StatusInterpreter>>,
    fallback: Arc<dyn StatusInterpreter>,
}

impl Default for InterpreterRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl InterpreterRegistry {
    /// Registry with no kind-specific rules.
    pub fn empty() -> Self {
        Self {
            by_kind: HashMap::new(),
            fallback: Arc::new(generic),
        }
    }

    pub fn builtin() -> Self {
        Self::empty()
            .with("Deployment", deployment)
            .with("StatefulSet", stateful_set)
            .with("DaemonSet", daemon_set)
            .with("ReplicaSet", replica_set)
            .with("Pod", pod)
            .with("Job", job)
            .with("PersistentVolumeClaim", pvc)
            .with("Service", service)
    }

    pub fn with(mut self, kind: &str, interpreter: impl StatusInterpreter + 'static) -> Self {
        self.by_kind.insert(kind.to_string(), Arc::new(interpreter));
        self
    }

    pub fn interpret(&self, obj: &DynamicObject) -> Result<Interpretation, InterpretError> {
        let kind = obj.types.as_ref().map(|t| t.kind.as_str()).unwrap_or("");
        match self.by_kind.get(kind) {
            Some(i) => i.interpret(obj),
            None => self.fallback.interpret(obj),
        }
    }
}

fn kind_of(obj: &DynamicObject) -> String {
    obj.types.as_ref().map(|t| t.kind.clone()).unwrap_or_default()
}

/// `Ok(None)` when the object has no status yet, an error when it is not an object.
fn status_of(obj: &DynamicObject) -> Result<Option<&serde_json::Map<String, Value>>, InterpretError> {
    match obj.data.get("status") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(other) => Err(InterpretError::MalformedStatus {
            kind: kind_of(obj),
            name: obj.metadata.name.clone().unwrap_or_default(),
            reason: format!("expected object, found {}", json_type(other)),
        }),
    }
}

fn json_type(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn int(map: &serde_json::Map<String, Value>, field: &str) -> i64 {
    map.get(field).and_then(Value::as_i64).unwrap_or(0)
}

fn spec_int(obj: &DynamicObject, field: &str, default: i64) -> i64 {
    obj.data
        .get("spec")
        .and_then(|s| s.get(field))
        .and_then(Value::as_i64)
        .unwrap_or(default)
}

fn condition_status<'a>(
    map: &'a serde_json::Map<String, Value>,
    type_: &str,
) -> Option<&'a str> {
    map.get("conditions")
        .and_then(Value::as_array)?
        .iter()
        .find(|c| c.get("type").and_then(Value::as_str) == Some(type_))
        .and_then(|c| c.get("status"))
        .and_then(Value::as_str)
}

/// The controller has not yet observed the latest spec.
fn generation_pending(obj: &DynamicObject, status: &serde_json::Map<String, Value>) -> bool {
    match (obj.metadata.generation, status.get("observedGeneration").and_then(Value::as_i64)) {
        (Some(generation), Some(observed)) => observed < generation,
        _ => false,
    }
}

fn done(status: ComputedStatus, raw: Option<&serde_json::Map<String, Value>>) -> Interpretation {
    Interpretation {
        status,
        raw: raw.map(|m| Value::Object(m.clone())),
    }
}

fn ready_if(cond: bool) -> ComputedStatus {
    if cond {
        ComputedStatus::Ready
    } else {
        ComputedStatus::InProgress
    }
}

/// Conditions `Ready`/`Available` decide when present; a status-less object is ready.
pub fn generic(obj: &DynamicObject) -> Result<Interpretation, InterpretError> {
    let Some(status) = status_of(obj)? else {
        return Ok(done(ComputedStatus::Ready, None));
    };
    if generation_pending(obj, status) {
        return Ok(done(ComputedStatus::InProgress, Some(status)));
    }
    let cond = condition_status(status, "Ready").or_else(|| condition_status(status, "Available"));
    let computed = match cond {
        Some("True") => ComputedStatus::Ready,
        Some("False") => ComputedStatus::InProgress,
        Some(_) => ComputedStatus::Unknown,
        None => ComputedStatus::Ready,
    };
    Ok(done(computed, Some(status)))
}

pub fn deployment(obj: &DynamicObject) -> Result<Interpretation, InterpretError> {
    let Some(status) = status_of(obj)? else {
        return Ok(done(ComputedStatus::InProgress, None));
    };
    if generation_pending(obj, status) {
        return Ok(done(ComputedStatus::InProgress, Some(status)));
    }
    if condition_status(status, "Progressing") == Some("False") {
        return Ok(done(ComputedStatus::Unknown, Some(status)));
    }
    let replicas = spec_int(obj, "replicas", 1);
    let ready = int(status, "updatedReplicas") >= replicas
        && int(status, "availableReplicas") >= replicas
        && int(status, "readyReplicas") >= replicas
        && int(status, "replicas") <= replicas;
    Ok(done(ready_if(ready), Some(status)))
}

pub fn stateful_set(obj: &DynamicObject) -> Result<Interpretation, InterpretError> {
    let Some(status) = status_of(obj)? else {
        return Ok(done(ComputedStatus::InProgress, None));
    };
    if generation_pending(obj, status) {
        return Ok(done(ComputedStatus::InProgress, Some(status)));
    }
    let replicas = spec_int(obj, "replicas", 1);
    let revision_settled = match (status.get("currentRevision"), status.get("updateRevision")) {
        (Some(cur), Some(upd)) => cur == upd,
        _ => true,
    };
    let ready = int(status, "readyReplicas") >= replicas
        && int(status, "currentReplicas") >= replicas
        && revision_settled;
    Ok(done(ready_if(ready), Some(status)))
}

pub fn daemon_set(obj: &DynamicObject) -> Result<Interpretation, InterpretError> {
    let Some(status) = status_of(obj)? else {
        return Ok(done(ComputedStatus::InProgress, None));
    };
    if generation_pending(obj, status) {
        return Ok(done(ComputedStatus::InProgress, Some(status)));
    }
    let desired = int(status, "desiredNumberScheduled");
    let ready = int(status, "numberAvailable") >= desired
        && int(status, "updatedNumberScheduled") >= desired
        && int(status, "numberReady") >= desired;
    Ok(done(ready_if(ready), Some(status)))
}

pub fn replica_set(obj: &DynamicObject) -> Result<Interpretation, InterpretError> {
    let Some(status) = status_of(obj)? else {
        return Ok(done(ComputedStatus::InProgress, None));
    };
    if generation_pending(obj, status) {
        return Ok(done(ComputedStatus::InProgress, Some(status)));
    }
    let replicas = spec_int(obj, "replicas", 1);
    let ready = int(status, "availableReplicas") >= replicas
        && int(status, "readyReplicas") >= replicas;
    Ok(done(ready_if(ready), Some(status)))
}

pub fn pod(obj: &DynamicObject) -> Result<Interpretation, InterpretError> {
    let Some(status) = status_of(obj)? else {
        return Ok(done(ComputedStatus::InProgress, None));
    };
    let computed = match status.get("phase").and_then(Value::as_str) {
        Some("Succeeded") => ComputedStatus::Ready,
        Some("Running") => ready_if(condition_status(status, "Ready") == Some("True")),
        Some("Pending") => ComputedStatus::InProgress,
        Some("Failed") | Some("Unknown") => ComputedStatus::Unknown,
        _ => ComputedStatus::InProgress,
    };
    Ok(done(computed, Some(status)))
}

pub fn job(obj: &DynamicObject) -> Result<Interpretation, InterpretError> {
    let Some(status) = status_of(obj)? else {
        return Ok(done(ComputedStatus::InProgress, None));
    };
    let computed = if condition_status(status, "Complete") == Some("True") {
        ComputedStatus::Ready
    } else if condition_status(status, "Failed") == Some("True") {
        ComputedStatus::Unknown
    } else {
        ComputedStatus::InProgress
    };
    Ok(done(computed, Some(status)))
}

pub fn pvc(obj: &DynamicObject) -> Result<Interpretation, InterpretError> {
    let Some(status) = status_of(obj)? else {
        return Ok(done(ComputedStatus::InProgress, None));
    };
    let bound = status.get("phase").and_then(Value::as_str) == Some("Bound");
    Ok(done(ready_if(bound), Some(status)))
}

pub fn service(obj: &DynamicObject) -> Result<Interpretation, InterpretError> {
    let status = status_of(obj)?;
    let is_lb = obj
        .data
        .get("spec")
        .and_then(|s| s.get("type"))
        .and_then(Value::as_str)
        == Some("LoadBalancer");
    if !is_lb {
        return Ok(done(ComputedStatus::Ready, status));
    }
    let has_ingress = status
        .and_then(|s| s.get("loadBalancer"))
        .and_then(|lb| lb.get("ingress"))
        .and_then(Value::as_array)
        .map(|a| !a.is_empty())
        .unwrap_or(false);
    Ok(done(ready_if(has_ingress), status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> DynamicObject {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn deployment_ready_when_all_replicas_available() {
        let registry = InterpreterRegistry::builtin();
        let d = obj(json!({
            "apiVersion": "apps/v1", "kind": "Deployment",
            "metadata": {"name": "web", "generation": 2},
            "spec": {"replicas": 2},
            "status": {"observedGeneration": 2, "replicas": 2, "updatedReplicas": 2,
                       "readyReplicas": 2, "availableReplicas": 2}
        }));
        let out = registry.interpret(&d).unwrap();
        assert_eq!(out.status, ComputedStatus::Ready);
        assert_eq!(out.raw.unwrap()["readyReplicas"], 2);
    }

    #[test]
    fn deployment_in_progress_while_generation_unobserved() {
        let d = obj(json!({
            "apiVersion": "apps/v1", "kind": "Deployment",
            "metadata": {"name": "web", "generation": 3},
            "spec": {"replicas": 1},
            "status": {"observedGeneration": 2, "replicas": 1, "updatedReplicas": 1,
                       "readyReplicas": 1, "availableReplicas": 1}
        }));
        assert_eq!(deployment(&d).unwrap().status, ComputedStatus::InProgress);
    }

    #[test]
    fn status_less_config_map_is_ready() {
        let cm = obj(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "cm"}}));
        let out = InterpreterRegistry::builtin().interpret(&cm).unwrap();
        assert_eq!(out.status, ComputedStatus::Ready);
        assert!(out.raw.is_none());
    }

    #[test]
    fn generic_follows_ready_condition() {
        let o = obj(json!({
            "apiVersion": "example.io/v1", "kind": "Widget", "metadata": {"name": "w"},
            "status": {"conditions": [{"type": "Ready", "status": "False"}]}
        }));
        assert_eq!(generic(&o).unwrap().status, ComputedStatus::InProgress);
    }

    #[test]
    fn malformed_status_is_an_error() {
        let o = obj(json!({
            "apiVersion": "example.io/v1", "kind": "Widget", "metadata": {"name": "w"},
            "status": "broken"
        }));
        let err = InterpreterRegistry::builtin().interpret(&o).unwrap_err();
        assert!(err.to_string().contains("malformed status"));
    }

    #[test]
    fn load_balancer_service_waits_for_ingress() {
        let svc = obj(json!({
            "apiVersion": "v1", "kind": "Service", "metadata": {"name": "s"},
            "spec": {"type": "LoadBalancer"}, "status": {"loadBalancer": {}}
        }));
        assert_eq!(service(&svc).unwrap().status, ComputedStatus::InProgress);
    }

    #[test]
    fn custom_interpreter_overrides_builtin() {
        let registry = InterpreterRegistry::builtin().with(
            "Deployment",
            |_: &DynamicObject| -> Result<Interpretation, InterpretError> {
                Ok(Interpretation {
                    status: ComputedStatus::Unknown,
                    raw: None,
                })
            },
        );
        let d = obj(json!({"apiVersion": "apps/v1", "kind": "Deployment", "metadata": {"name": "d"}}));
        assert_eq!(registry.interpret(&d).unwrap().status, ComputedStatus::Unknown);
    }
}
