/// In-memory widget store
///
/// Keeps the CRUD records in `RwLock`ed maps. Used by the test-suite and by
/// embedders that keep their dashboards elsewhere and only mirror them here.

use crate::store::WidgetStore;
use crate::widget::{
    CategoryRecord, ExecutionDescriptor, HealthState, ProjectRecord, ProjectView, WidgetDefinition,
    WidgetInstanceRecord, WidgetView,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::RwLock;

#[derive(Debug, Default)]
struct Records {
    projects: BTreeMap<i64, ProjectRecord>,
    categories: BTreeMap<i64, CategoryRecord>,
    widgets: BTreeMap<i64, WidgetDefinition>,
    instances: BTreeMap<i64, WidgetInstanceRecord>,
}

impl Records {
    fn descriptor(&self, widget_instance_id: i64) -> Option<ExecutionDescriptor> {
        let instance = self.instances.get(&widget_instance_id)?;
        let widget = self.widgets.get(&instance.widget_id)?;
        let category_config = widget
            .category_id
            .and_then(|id| self.categories.get(&id))
            .map(|category| category.config.as_str());
        Some(ExecutionDescriptor::from_records(instance, widget, category_config))
    }

    fn view(&self, widget_instance_id: i64) -> Option<WidgetView> {
        let instance = self.instances.get(&widget_instance_id)?;
        let widget = self.widgets.get(&instance.widget_id)?;
        Some(WidgetView::from_records(instance, widget))
    }
}

/// Widget store backed by process memory
#[derive(Debug, Default)]
pub struct InMemoryWidgetStore {
    records: RwLock<Records>,
}

impl InMemoryWidgetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_project(&self, project: ProjectRecord) {
        self.write().projects.insert(project.id, project);
    }

    pub fn insert_category(&self, category: CategoryRecord) {
        self.write().categories.insert(category.id, category);
    }

    pub fn insert_widget(&self, widget: WidgetDefinition) {
        self.write().widgets.insert(widget.id, widget);
    }

    pub fn insert_instance(&self, instance: WidgetInstanceRecord) {
        self.write().instances.insert(instance.id, instance);
    }

    pub fn remove_instance(&self, widget_instance_id: i64) -> Option<WidgetInstanceRecord> {
        self.write().instances.remove(&widget_instance_id)
    }

    /// Snapshot of a persisted widget instance
    pub fn instance(&self, widget_instance_id: i64) -> Option<WidgetInstanceRecord> {
        self.read().instances.get(&widget_instance_id).cloned()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Records> {
        // A poisoned lock only means a writer panicked mid-insert; the maps stay usable
        self.records.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Records> {
        self.records.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl WidgetStore for InMemoryWidgetStore {
    async fn execution_descriptor(&self, widget_instance_id: i64) -> Result<Option<ExecutionDescriptor>> {
        Ok(self.read().descriptor(widget_instance_id))
    }

    async fn execution_descriptors_for_project(&self, project_id: i64) -> Result<Vec<ExecutionDescriptor>> {
        let records = self.read();
        Ok(records
            .instances
            .values()
            .filter(|instance| instance.project_id == project_id)
            .filter_map(|instance| records.descriptor(instance.id))
            .collect())
    }

    async fn persist_success(
        &self,
        widget_instance_id: i64,
        timestamp: DateTime<Utc>,
        log: Option<String>,
        data: String,
        state: HealthState,
    ) -> Result<()> {
        let mut records = self.write();
        let instance = records
            .instances
            .get_mut(&widget_instance_id)
            .ok_or_else(|| anyhow::anyhow!("Widget instance not found: {}", widget_instance_id))?;

        instance.state = state;
        instance.last_success = true;
        instance.data = Some(data);
        instance.log = log;
        instance.last_execution_date = Some(timestamp);
        instance.last_success_date = Some(timestamp);
        Ok(())
    }

    async fn persist_failure(
        &self,
        widget_instance_id: i64,
        timestamp: DateTime<Utc>,
        log: Option<String>,
        state: HealthState,
    ) -> Result<()> {
        let mut records = self.write();
        let instance = records
            .instances
            .get_mut(&widget_instance_id)
            .ok_or_else(|| anyhow::anyhow!("Widget instance not found: {}", widget_instance_id))?;

        instance.state = state;
        instance.last_success = false;
        instance.log = log;
        instance.last_execution_date = Some(timestamp);
        Ok(())
    }

    async fn project_token(&self, project_id: i64) -> Result<Option<String>> {
        Ok(self.read().projects.get(&project_id).map(|p| p.token.clone()))
    }

    async fn project_id_for_token(&self, token: &str) -> Result<Option<i64>> {
        Ok(self
            .read()
            .projects
            .values()
            .find(|p| p.token == token)
            .map(|p| p.id))
    }

    async fn widget_view(&self, widget_instance_id: i64) -> Result<Option<WidgetView>> {
        Ok(self.read().view(widget_instance_id))
    }

    async fn project_view(&self, project_id: i64) -> Result<Option<ProjectView>> {
        let records = self.read();
        let Some(project) = records.projects.get(&project_id) else {
            return Ok(None);
        };

        let widgets = records
            .instances
            .values()
            .filter(|instance| instance.project_id == project_id)
            .filter_map(|instance| records.view(instance.id))
            .collect();

        Ok(Some(ProjectView {
            id: project.id,
            token: project.token.clone(),
            name: project.name.clone(),
            widgets,
        }))
    }
}
