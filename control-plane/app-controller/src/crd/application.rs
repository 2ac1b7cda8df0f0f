use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use schemars::r#gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const KIND: &str = "Application";
pub const API_VERSION: &str = "applications.app.io/v1beta1";

/// Default number of old revisions kept when the spec leaves it unset.
pub const DEFAULT_REVISION_HISTORY_LIMIT: i32 = 10;
pub const MAX_REVISION_HISTORY_LIMIT: i32 = 50;
pub const MAX_RESOURCES: usize = 50;

#[derive(
    CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema,
)]
#[kube(
    group = "applications.app.io",
    version = "v1beta1",
    kind = "Application",
    plural = "applications",
    shortname = "app",
    category = "all",
    namespaced,
    status = "ApplicationStatus",
    printcolumn = r#"{"name":"Type","type":"string","description":"The type of the application","jsonPath":".spec.descriptor.type"}"#,
    printcolumn = r#"{"name":"Version","type":"string","description":"The version of the application","jsonPath":".spec.descriptor.version"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","description":"Numbers of components ready","jsonPath":".status.componentsReady"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSpec {
    /// Label query over the kinds created by the application.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
    /// Child resource templates; each is an arbitrary Kubernetes object.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(length(max = 50))]
    pub resources: Vec<ResourceTemplate>,
    #[serde(default)]
    pub descriptor: Descriptor,
    /// Number of old revisions kept for audit and rollback (default 10).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(range(min = 0, max = 50))]
    pub revision_history_limit: Option<i32>,
}

/// Opaque child resource document. Unknown fields are preserved verbatim.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(transparent)]
pub struct ResourceTemplate(pub Value);

impl JsonSchema for ResourceTemplate {
    fn schema_name() -> String {
        "ResourceTemplate".into()
    }

    fn is_referenceable() -> bool {
        false
    }

    fn json_schema(_: &mut SchemaGenerator) -> Schema {
        unknown_fields_object()
    }
}

fn preserve_unknown_fields(_: &mut SchemaGenerator) -> Schema {
    unknown_fields_object()
}

fn unknown_fields_object() -> Schema {
    let mut obj = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    obj.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".into(),
        Value::Bool(true),
    );
    Schema::Object(obj)
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ImageSpec {
    /// Absolute URL or RFC 2397 data URL of the icon.
    pub src: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub size: String,
    #[serde(default, rename = "type", skip_serializing_if = "String::is_empty")]
    pub type_: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ContactData {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub email: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct Link {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
}

/// Informational metadata about the application. Never affects reconciliation.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct Descriptor {
    /// Type of the application (e.g. WordPress, MySQL).
    #[serde(default, rename = "type", skip_serializing_if = "String::is_empty")]
    pub type_: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub icons: Vec<ImageSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub maintainers: Vec<ContactData>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owners: Vec<ContactData>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<Link>,
    /// Quick start notes, CommonMark allowed.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub notes: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// Latest observed conditions, at most one per type.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_statuses: Vec<ResourceStatus>,
    /// `ready/total` over child resources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub components_ready: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Last time reason, message or status changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<String>,
    /// Last time status changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Hash)]
pub enum ConditionType {
    // controller considers the application ready
    Ready,
    // functionally tested
    Qualified,
    // observedGeneration == generation and the controller is done acting
    Settled,
    // tracks finalizer failures
    Cleanup,
    // last recorded error
    Error,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum ComputedStatus {
    Ready,
    InProgress,
    Unknown,
}

impl std::fmt::Display for ComputedStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComputedStatus::Ready => write!(f, "Ready"),
            ComputedStatus::InProgress => write!(f, "InProgress"),
            ComputedStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    pub resource: ResourceReference,
    pub computed_status: ComputedStatus,
    /// Raw `status` of the child as last observed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub status: Option<Value>,
}

/// Locates a child resource inside the cluster.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceReference {
    pub api_version: String,
    pub kind: String,
    /// Empty for cluster-scoped kinds.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("Application {name} is invalid: {}", join_field_errors(.errors))]
pub struct ValidationErrors {
    pub name: String,
    pub errors: Vec<FieldError>,
}

fn join_field_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl ApplicationSpec {
    /// Retention limit with the default applied and clamped to the schema bounds.
    pub fn retention_limit(&self) -> usize {
        self.revision_history_limit
            .unwrap_or(DEFAULT_REVISION_HISTORY_LIMIT)
            .clamp(0, MAX_REVISION_HISTORY_LIMIT) as usize
    }

    /// Admission bounds, re-checked before anything is written for the Application.
    pub fn validate(&self, name: &str) -> Result<(), ValidationErrors> {
        let mut errors = Vec::new();
        if let Some(limit) = self.revision_history_limit {
            if !(0..=MAX_REVISION_HISTORY_LIMIT).contains(&limit) {
                errors.push(FieldError {
                    path: "spec.revisionHistoryLimit".into(),
                    message: format!(
                        "invalid value {limit}: must be between 0 and {MAX_REVISION_HISTORY_LIMIT}"
                    ),
                });
            }
        }
        if self.resources.len() > MAX_RESOURCES {
            errors.push(FieldError {
                path: "spec.resources".into(),
                message: format!(
                    "the number of resources is {}: must be at most {MAX_RESOURCES}",
                    self.resources.len()
                ),
            });
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationErrors {
                name: name.to_string(),
                errors,
            })
        }
    }
}
