/// Widget Domain Layer
///
/// Types shared by every part of the engine:
/// - Execution descriptors and outcomes
/// - Health states and widget parameter declarations
/// - The `key=value` properties format

// Core widget type definitions
pub mod types;

// Properties text parsing and serialization
pub mod properties;

// Re-export commonly used types
pub use properties::Properties;
pub use types::{
    CategoryRecord, ExecutionDescriptor, ExecutionOutcome, FailureKind, HealthState, ParamKind,
    ProjectRecord, ProjectView, WidgetDefinition, WidgetInstanceRecord, WidgetParam, WidgetView,
};
