/// Persistence Collaborator
///
/// The engine never owns dashboards, widgets or users. It reads execution
/// descriptors and writes execution outcomes through `WidgetStore`:
/// - `memory`: lock-guarded maps for tests and demos
/// - `sqlite`: sqlx-backed store for the standalone server

use crate::widget::{ExecutionDescriptor, HealthState, ProjectView, WidgetView};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

// In-memory store
pub mod memory;

// SQLite store using sqlx
pub mod sqlite;

pub use memory::InMemoryWidgetStore;
pub use sqlite::SqliteWidgetStore;

/// Everything the engine needs from the CRUD layer
#[async_trait]
pub trait WidgetStore: Send + Sync {
    /// Fresh descriptor for one widget instance, `None` once it is deleted
    async fn execution_descriptor(&self, widget_instance_id: i64) -> Result<Option<ExecutionDescriptor>>;

    /// Descriptors for every widget instance on a dashboard
    async fn execution_descriptors_for_project(&self, project_id: i64) -> Result<Vec<ExecutionDescriptor>>;

    /// Record a successful execution
    async fn persist_success(
        &self,
        widget_instance_id: i64,
        timestamp: DateTime<Utc>,
        log: Option<String>,
        data: String,
        state: HealthState,
    ) -> Result<()>;

    /// Record a failed execution (data left untouched)
    async fn persist_failure(
        &self,
        widget_instance_id: i64,
        timestamp: DateTime<Utc>,
        log: Option<String>,
        state: HealthState,
    ) -> Result<()>;

    /// Public token of a dashboard
    async fn project_token(&self, project_id: i64) -> Result<Option<String>>;

    /// Dashboard id behind a public token
    async fn project_id_for_token(&self, token: &str) -> Result<Option<i64>>;

    /// Client payload for one widget instance
    async fn widget_view(&self, widget_instance_id: i64) -> Result<Option<WidgetView>>;

    /// Client payload for a whole dashboard
    async fn project_view(&self, project_id: i64) -> Result<Option<ProjectView>>;
}
