/// Core widget type definitions
///
/// Execution descriptors, outcomes, health states and the records the
/// persistence layer hands back. Descriptors are rebuilt from records on
/// every tick and never mutated afterwards.

use crate::widget::properties::Properties;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Health status shown to viewers for a widget instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthState {
    /// Never succeeded, failed fatally, or explicitly reset
    Stopped,
    /// Last execution succeeded
    Running,
    /// Last execution failed recoverably
    Warning,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Stopped => "STOPPED",
            HealthState::Running => "RUNNING",
            HealthState::Warning => "WARNING",
        }
    }
}

impl std::str::FromStr for HealthState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STOPPED" => Ok(HealthState::Stopped),
            "RUNNING" => Ok(HealthState::Running),
            "WARNING" => Ok(HealthState::Warning),
            other => Err(anyhow::anyhow!("Unknown health state: {}", other)),
        }
    }
}

/// How a single script invocation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    None,
    Recoverable,
    Fatal,
}

/// Declared type of a widget parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParamKind {
    Text,
    /// Secret value: decrypted before binding, masked in every log
    Password,
    Number,
    Boolean,
    Combo,
}

/// Parameter declaration carried by a widget definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WidgetParam {
    /// Property key, bound to the script as an uppercase global
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub default_value: Option<String>,
    pub kind: ParamKind,
    #[serde(default)]
    pub required: bool,
}

impl WidgetParam {
    pub fn is_secret(&self) -> bool {
        matches!(self.kind, ParamKind::Password)
    }
}

/// Self-contained input to one script execution
///
/// Assembled from the persisted widget instance, its widget definition and the
/// shared configuration of the widget's category.
#[derive(Debug, Clone)]
pub struct ExecutionDescriptor {
    pub project_id: i64,
    pub widget_instance_id: i64,
    /// Script source text
    pub script: String,
    /// Merged properties: category configuration first, instance overrides
    pub properties: Properties,
    /// Parameter declarations from the widget definition
    pub params: Vec<WidgetParam>,
    /// Last successful JSON payload
    pub previous_result: Option<String>,
    /// Interval between fires; 0 or negative means "do not recur"
    pub delay_seconds: i64,
    /// Configured timeout, floored at await time
    pub timeout_seconds: Option<i64>,
    /// The instance succeeded at least once
    pub prior_outcome_was_success: bool,
    pub current_health_state: HealthState,
}

impl ExecutionDescriptor {
    /// Whether this widget should be fired on a timer at all
    pub fn recurs(&self) -> bool {
        self.delay_seconds > 0
    }

    /// Recurrence interval (zero when the widget does not recur)
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_seconds.max(0) as u64)
    }

    /// Assemble a descriptor from persisted records
    ///
    /// Both store implementations go through here so merge order and
    /// defaults stay identical.
    pub fn from_records(
        instance: &WidgetInstanceRecord,
        widget: &WidgetDefinition,
        category_config: Option<&str>,
    ) -> Self {
        let category = category_config.map(Properties::parse).unwrap_or_default();
        let own = Properties::parse(&instance.properties);

        Self {
            project_id: instance.project_id,
            widget_instance_id: instance.id,
            script: widget.script.clone(),
            properties: Properties::merge(&category, &own),
            params: widget.params.clone(),
            previous_result: instance.data.clone(),
            delay_seconds: widget.delay_seconds,
            timeout_seconds: widget.timeout_seconds,
            prior_outcome_was_success: instance.last_success_date.is_some(),
            current_health_state: instance.state,
        }
    }
}

/// Self-contained result of one script execution
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub project_id: i64,
    pub widget_instance_id: i64,
    /// JSON payload, present only on success
    pub data: Option<String>,
    /// Captured output or failure message, secrets already masked
    pub log: Option<String>,
    pub failure_kind: FailureKind,
    pub launched_at: DateTime<Utc>,
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self.failure_kind, FailureKind::None)
    }
}

/// A dashboard as persisted by the CRUD layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub id: i64,
    /// Public token clients use to subscribe
    pub token: String,
    pub name: String,
}

/// A widget category with configuration shared by all its widgets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryRecord {
    pub id: i64,
    pub name: String,
    /// Properties text (`key=value` lines)
    pub config: String,
}

/// A widget definition: script, parameters and timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WidgetDefinition {
    pub id: i64,
    pub category_id: Option<i64>,
    pub name: String,
    pub script: String,
    pub params: Vec<WidgetParam>,
    pub delay_seconds: i64,
    pub timeout_seconds: Option<i64>,
}

/// One placement of a widget on a dashboard grid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WidgetInstanceRecord {
    pub id: i64,
    pub project_id: i64,
    pub widget_id: i64,
    /// Properties text (`key=value` lines)
    pub properties: String,
    pub state: HealthState,
    pub last_success: bool,
    pub data: Option<String>,
    pub log: Option<String>,
    pub last_execution_date: Option<DateTime<Utc>>,
    pub last_success_date: Option<DateTime<Utc>>,
}

impl WidgetInstanceRecord {
    /// Fresh, never executed instance
    pub fn new(id: i64, project_id: i64, widget_id: i64, properties: impl Into<String>) -> Self {
        Self {
            id,
            project_id,
            widget_id,
            properties: properties.into(),
            state: HealthState::Stopped,
            last_success: false,
            data: None,
            log: None,
            last_execution_date: None,
            last_success_date: None,
        }
    }
}

/// Client-facing widget payload published with REFRESH_WIDGET
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetView {
    pub id: i64,
    pub project_id: i64,
    pub widget_id: i64,
    pub name: String,
    pub state: HealthState,
    /// Parsed data payload when it is valid JSON
    pub data: Option<serde_json::Value>,
    pub log: Option<String>,
    pub last_execution_date: Option<DateTime<Utc>>,
    pub last_success_date: Option<DateTime<Utc>>,
}

impl WidgetView {
    pub fn from_records(instance: &WidgetInstanceRecord, widget: &WidgetDefinition) -> Self {
        Self {
            id: instance.id,
            project_id: instance.project_id,
            widget_id: widget.id,
            name: widget.name.clone(),
            state: instance.state,
            data: instance
                .data
                .as_deref()
                .and_then(|raw| serde_json::from_str(raw).ok()),
            log: instance.log.clone(),
            last_execution_date: instance.last_execution_date,
            last_success_date: instance.last_success_date,
        }
    }
}

/// Client-facing dashboard payload published with RELOAD / CONNECT_DASHBOARD
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectView {
    pub id: i64,
    pub token: String,
    pub name: String,
    pub widgets: Vec<WidgetView>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn widget() -> WidgetDefinition {
        WidgetDefinition {
            id: 7,
            category_id: Some(1),
            name: "Build status".to_string(),
            script: "function run() return '{}' end".to_string(),
            params: vec![],
            delay_seconds: 30,
            timeout_seconds: Some(10),
        }
    }

    #[test]
    fn instance_properties_override_category_config() {
        let mut instance = WidgetInstanceRecord::new(3, 1, 7, "URL=https://instance\nTOKEN=abc");
        instance.last_success = true;
        instance.last_success_date = Some(Utc::now());
        instance.state = HealthState::Running;
        instance.data = Some("{\"count\":1}".to_string());

        let descriptor = ExecutionDescriptor::from_records(
            &instance,
            &widget(),
            Some("URL=https://category\nPROXY=none"),
        );

        assert_eq!(descriptor.properties.get("URL"), Some("https://instance"));
        assert_eq!(descriptor.properties.get("PROXY"), Some("none"));
        assert_eq!(descriptor.properties.get("TOKEN"), Some("abc"));
        assert_eq!(descriptor.previous_result.as_deref(), Some("{\"count\":1}"));
        assert!(descriptor.prior_outcome_was_success);
        assert_eq!(descriptor.current_health_state, HealthState::Running);
        assert_eq!(descriptor.delay(), Duration::from_secs(30));
    }

    #[test]
    fn any_past_success_counts_as_prior_success() {
        let mut instance = WidgetInstanceRecord::new(3, 1, 7, "");
        assert!(!ExecutionDescriptor::from_records(&instance, &widget(), None).prior_outcome_was_success);

        // Last run failed, an earlier one succeeded
        instance.last_success = false;
        instance.last_success_date = Some(Utc::now());
        instance.state = HealthState::Warning;
        assert!(ExecutionDescriptor::from_records(&instance, &widget(), None).prior_outcome_was_success);
    }

    #[test]
    fn non_positive_delay_does_not_recur() {
        let mut definition = widget();
        definition.delay_seconds = -1;
        let descriptor =
            ExecutionDescriptor::from_records(&WidgetInstanceRecord::new(1, 1, 7, ""), &definition, None);
        assert!(!descriptor.recurs());
        assert_eq!(descriptor.delay(), Duration::ZERO);
    }

    #[test]
    fn health_state_round_trips_through_text() {
        for state in [HealthState::Stopped, HealthState::Running, HealthState::Warning] {
            assert_eq!(state.as_str().parse::<HealthState>().unwrap(), state);
        }
        assert!("BROKEN".parse::<HealthState>().is_err());
    }

    #[test]
    fn view_drops_unparseable_data() {
        let mut instance = WidgetInstanceRecord::new(1, 1, 7, "");
        instance.data = Some("not json".to_string());
        let view = WidgetView::from_records(&instance, &widget());
        assert!(view.data.is_none());

        instance.data = Some("{\"ok\":true}".to_string());
        let view = WidgetView::from_records(&instance, &widget());
        assert_eq!(view.data, Some(serde_json::json!({"ok": true})));
    }
}
