pub mod application;

pub use application::{
    API_VERSION, Application, ApplicationSpec, ApplicationStatus, ComputedStatus, Condition,
    ConditionStatus, ConditionType, ResourceReference, ResourceStatus,
    ResourceTemplate, KIND, ValidationErrors,
};
