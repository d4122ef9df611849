/// SQLite persistence for the standalone server
///
/// Mirrors the dashboard CRUD layer's tables closely enough for the engine to
/// read descriptors and record outcomes. Schema creation is idempotent.

use crate::store::WidgetStore;
use crate::widget::{
    CategoryRecord, ExecutionDescriptor, HealthState, ProjectRecord, ProjectView, WidgetDefinition,
    WidgetInstanceRecord, WidgetParam, WidgetView,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool, SqliteRow},
    Row,
};
use std::path::Path;

/// sqlx-backed widget store
#[derive(Debug, Clone)]
pub struct SqliteWidgetStore {
    /// SQLite connection pool for the dashboard database
    pool: SqlitePool,
}

impl SqliteWidgetStore {
    /// Wrap an existing pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (or create) `{data_dir}/pulseboard.db` and ensure the schema
    pub async fn connect(data_dir: &str) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .map_err(|e| anyhow::anyhow!("Failed to create data directory '{}': {}", data_dir, e))?;
        let db_path = Path::new(data_dir).join("pulseboard.db");

        tracing::info!("🗄️ Opening dashboard database: {}", db_path.display());

        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;

        let store = Self::new(pool);
        store.init_schema().await?;
        Ok(store)
    }

    /// Create tables and indexes. Safe to call multiple times.
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS projects (
                id INTEGER PRIMARY KEY,
                token TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS categories (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                config TEXT NOT NULL DEFAULT ''
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS widgets (
                id INTEGER PRIMARY KEY,
                category_id INTEGER REFERENCES categories(id),
                name TEXT NOT NULL,
                script TEXT NOT NULL,
                params JSON NOT NULL DEFAULT '[]',
                delay_seconds INTEGER NOT NULL DEFAULT 0,
                timeout_seconds INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS widget_instances (
                id INTEGER PRIMARY KEY,
                project_id INTEGER NOT NULL REFERENCES projects(id),
                widget_id INTEGER NOT NULL REFERENCES widgets(id),
                properties TEXT NOT NULL DEFAULT '',
                state TEXT NOT NULL DEFAULT 'STOPPED',
                last_success INTEGER NOT NULL DEFAULT 0,
                data TEXT,
                log TEXT,
                last_execution_date TEXT,
                last_success_date TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_widget_instances_project ON widget_instances(project_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn insert_project(&self, project: &ProjectRecord) -> Result<()> {
        sqlx::query("INSERT INTO projects (id, token, name) VALUES (?, ?, ?)")
            .bind(project.id)
            .bind(&project.token)
            .bind(&project.name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn insert_category(&self, category: &CategoryRecord) -> Result<()> {
        sqlx::query("INSERT INTO categories (id, name, config) VALUES (?, ?, ?)")
            .bind(category.id)
            .bind(&category.name)
            .bind(&category.config)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn insert_widget(&self, widget: &WidgetDefinition) -> Result<()> {
        let params_json = serde_json::to_string(&widget.params)?;

        sqlx::query(
            r#"
            INSERT INTO widgets (id, category_id, name, script, params, delay_seconds, timeout_seconds)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(widget.id)
        .bind(widget.category_id)
        .bind(&widget.name)
        .bind(&widget.script)
        .bind(&params_json)
        .bind(widget.delay_seconds)
        .bind(widget.timeout_seconds)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_widget_instance(&self, instance: &WidgetInstanceRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO widget_instances
                (id, project_id, widget_id, properties, state, last_success, data, log,
                 last_execution_date, last_success_date)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(instance.id)
        .bind(instance.project_id)
        .bind(instance.widget_id)
        .bind(&instance.properties)
        .bind(instance.state.as_str())
        .bind(instance.last_success)
        .bind(&instance.data)
        .bind(&instance.log)
        .bind(instance.last_execution_date.map(|d| d.to_rfc3339()))
        .bind(instance.last_success_date.map(|d| d.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_instance(&self, widget_instance_id: i64) -> Result<Option<WidgetInstanceRecord>> {
        let row = sqlx::query("SELECT * FROM widget_instances WHERE id = ?")
            .bind(widget_instance_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(instance_from_row).transpose()
    }

    async fn fetch_instances_for_project(&self, project_id: i64) -> Result<Vec<WidgetInstanceRecord>> {
        let rows = sqlx::query("SELECT * FROM widget_instances WHERE project_id = ? ORDER BY id")
            .bind(project_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(instance_from_row).collect()
    }

    async fn fetch_widget(&self, widget_id: i64) -> Result<Option<WidgetDefinition>> {
        let row = sqlx::query("SELECT * FROM widgets WHERE id = ?")
            .bind(widget_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(widget_from_row).transpose()
    }

    async fn fetch_category_config(&self, category_id: Option<i64>) -> Result<Option<String>> {
        let Some(category_id) = category_id else {
            return Ok(None);
        };
        let row = sqlx::query("SELECT config FROM categories WHERE id = ?")
            .bind(category_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>("config")))
    }

    async fn descriptor_for(&self, instance: &WidgetInstanceRecord) -> Result<Option<ExecutionDescriptor>> {
        let Some(widget) = self.fetch_widget(instance.widget_id).await? else {
            tracing::warn!("⚠️ Widget instance {} references missing widget {}", instance.id, instance.widget_id);
            return Ok(None);
        };
        let category_config = self.fetch_category_config(widget.category_id).await?;
        Ok(Some(ExecutionDescriptor::from_records(
            instance,
            &widget,
            category_config.as_deref(),
        )))
    }

    async fn view_for(&self, instance: &WidgetInstanceRecord) -> Result<Option<WidgetView>> {
        Ok(self
            .fetch_widget(instance.widget_id)
            .await?
            .map(|widget| WidgetView::from_records(instance, &widget)))
    }
}

fn parse_timestamp(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.map(|value| {
        DateTime::parse_from_rfc3339(&value)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| anyhow::anyhow!("Invalid timestamp '{}': {}", value, e))
    })
    .transpose()
}

fn instance_from_row(row: &SqliteRow) -> Result<WidgetInstanceRecord> {
    let state: String = row.try_get("state")?;
    Ok(WidgetInstanceRecord {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        widget_id: row.try_get("widget_id")?,
        properties: row.try_get("properties")?,
        state: state.parse()?,
        last_success: row.try_get("last_success")?,
        data: row.try_get("data")?,
        log: row.try_get("log")?,
        last_execution_date: parse_timestamp(row.try_get("last_execution_date")?)?,
        last_success_date: parse_timestamp(row.try_get("last_success_date")?)?,
    })
}

fn widget_from_row(row: &SqliteRow) -> Result<WidgetDefinition> {
    let params_json: String = row.try_get("params")?;
    let params: Vec<WidgetParam> = serde_json::from_str(&params_json)?;
    Ok(WidgetDefinition {
        id: row.try_get("id")?,
        category_id: row.try_get("category_id")?,
        name: row.try_get("name")?,
        script: row.try_get("script")?,
        params,
        delay_seconds: row.try_get("delay_seconds")?,
        timeout_seconds: row.try_get("timeout_seconds")?,
    })
}

#[async_trait]
impl WidgetStore for SqliteWidgetStore {
    async fn execution_descriptor(&self, widget_instance_id: i64) -> Result<Option<ExecutionDescriptor>> {
        match self.fetch_instance(widget_instance_id).await? {
            Some(instance) => self.descriptor_for(&instance).await,
            None => Ok(None),
        }
    }

    async fn execution_descriptors_for_project(&self, project_id: i64) -> Result<Vec<ExecutionDescriptor>> {
        let mut descriptors = Vec::new();
        for instance in self.fetch_instances_for_project(project_id).await? {
            if let Some(descriptor) = self.descriptor_for(&instance).await? {
                descriptors.push(descriptor);
            }
        }
        Ok(descriptors)
    }

    async fn persist_success(
        &self,
        widget_instance_id: i64,
        timestamp: DateTime<Utc>,
        log: Option<String>,
        data: String,
        state: HealthState,
    ) -> Result<()> {
        let timestamp = timestamp.to_rfc3339();
        let result = sqlx::query(
            r#"
            UPDATE widget_instances
            SET state = ?, last_success = 1, data = ?, log = ?,
                last_execution_date = ?, last_success_date = ?
            WHERE id = ?
            "#,
        )
        .bind(state.as_str())
        .bind(&data)
        .bind(&log)
        .bind(&timestamp)
        .bind(&timestamp)
        .bind(widget_instance_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(anyhow::anyhow!("Widget instance not found: {}", widget_instance_id));
        }
        Ok(())
    }

    async fn persist_failure(
        &self,
        widget_instance_id: i64,
        timestamp: DateTime<Utc>,
        log: Option<String>,
        state: HealthState,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE widget_instances
            SET state = ?, last_success = 0, log = ?, last_execution_date = ?
            WHERE id = ?
            "#,
        )
        .bind(state.as_str())
        .bind(&log)
        .bind(timestamp.to_rfc3339())
        .bind(widget_instance_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(anyhow::anyhow!("Widget instance not found: {}", widget_instance_id));
        }
        Ok(())
    }

    async fn project_token(&self, project_id: i64) -> Result<Option<String>> {
        let row = sqlx::query("SELECT token FROM projects WHERE id = ?")
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>("token")))
    }

    async fn project_id_for_token(&self, token: &str) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT id FROM projects WHERE token = ?")
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>("id")))
    }

    async fn widget_view(&self, widget_instance_id: i64) -> Result<Option<WidgetView>> {
        match self.fetch_instance(widget_instance_id).await? {
            Some(instance) => self.view_for(&instance).await,
            None => Ok(None),
        }
    }

    async fn project_view(&self, project_id: i64) -> Result<Option<ProjectView>> {
        let Some(row) = sqlx::query("SELECT id, token, name FROM projects WHERE id = ?")
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };

        let mut widgets = Vec::new();
        for instance in self.fetch_instances_for_project(project_id).await? {
            if let Some(view) = self.view_for(&instance).await? {
                widgets.push(view);
            }
        }

        Ok(Some(ProjectView {
            id: row.try_get("id")?,
            token: row.try_get("token")?,
            name: row.try_get("name")?,
            widgets,
        }))
    }
}
