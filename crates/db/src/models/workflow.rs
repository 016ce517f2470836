use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use strum_macros::{Display, EnumString};
use ts_rs::TS;
use uuid::Uuid;

/// Steps the engine knows how to execute. Anything else is rejected at
/// submission, before any side effects.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display, TS,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    Sync,
    AiUpdate,
    Push,
    Build,
    Run,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize, TS)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStatus::Pending => write!(f, "pending"),
            WorkflowStatus::Running => write!(f, "running"),
            WorkflowStatus::Completed => write!(f, "completed"),
            WorkflowStatus::Failed => write!(f, "failed"),
            WorkflowStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct StepState {
    pub name: StepName,
    pub status: StepStatus,
    #[ts(type = "Date")]
    pub started_at: Option<DateTime<Utc>>,
    #[ts(type = "Date")]
    pub finished_at: Option<DateTime<Utc>>,
    #[ts(type = "unknown")]
    pub result: Option<serde_json::Value>,
    pub error_kind: Option<String>,
}

impl StepState {
    pub fn pending(name: StepName) -> Self {
        Self {
            name,
            status: StepStatus::Pending,
            started_at: None,
            finished_at: None,
            result: None,
            error_kind: None,
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct Workflow {
    pub id: Uuid,
    pub project_id: Uuid,
    pub caller_user_id: Uuid,
    #[ts(type = "Array<StepState>")]
    pub steps: sqlx::types::Json<Vec<StepState>>,
    pub status: WorkflowStatus,
    pub error_kind: Option<String>,
    #[ts(type = "Date")]
    pub started_at: Option<DateTime<Utc>>,
    #[ts(type = "Date")]
    pub finished_at: Option<DateTime<Utc>>,
    #[ts(type = "Date")]
    pub created_at: DateTime<Utc>,
}

const SELECT_COLUMNS: &str =
    "id, project_id, caller_user_id, steps, status, error_kind, started_at, finished_at, created_at";

impl Workflow {
    pub async fn create(
        pool: &SqlitePool,
        workflow_id: Uuid,
        project_id: Uuid,
        caller_user_id: Uuid,
        steps: &[StepName],
    ) -> Result<Self, sqlx::Error> {
        let step_states: Vec<StepState> = steps.iter().map(|s| StepState::pending(*s)).collect();
        sqlx::query_as::<_, Workflow>(&format!(
            "INSERT INTO workflows (id, project_id, caller_user_id, steps, status, created_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5)
             RETURNING {SELECT_COLUMNS}"
        ))
        .bind(workflow_id)
        .bind(project_id)
        .bind(caller_user_id)
        .bind(sqlx::types::Json(step_states))
        .bind(Utc::now())
        .fetch_one(pool)
        .await
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Workflow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM workflows WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    pub async fn find_by_project(
        pool: &SqlitePool,
        project_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Workflow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM workflows WHERE project_id = ?1 ORDER BY created_at"
        ))
        .bind(project_id)
        .fetch_all(pool)
        .await
    }

    /// Moves a pending workflow to running. Returns false when the workflow
    /// is no longer pending (e.g. cancelled while queued).
    pub async fn mark_started(pool: &SqlitePool, id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE workflows SET status = 'running', started_at = ?2
             WHERE id = ?1 AND status = 'pending'",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn update_steps(
        pool: &SqlitePool,
        id: Uuid,
        steps: &[StepState],
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE workflows SET steps = ?2 WHERE id = ?1")
            .bind(id)
            .bind(sqlx::types::Json(steps.to_vec()))
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Cancels a workflow that has not started running yet. Loses the race
    /// gracefully once the scheduler picked it up.
    pub async fn mark_cancelled_if_pending(
        pool: &SqlitePool,
        id: Uuid,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE workflows SET status = 'cancelled', error_kind = 'CANCELLED', finished_at = ?2
             WHERE id = ?1 AND status = 'pending'",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Terminal states are written once and never rewritten; the guard makes
    /// a second transition a no-op.
    pub async fn mark_terminal(
        pool: &SqlitePool,
        id: Uuid,
        status: WorkflowStatus,
        error_kind: Option<&str>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE workflows SET status = ?2, error_kind = ?3, finished_at = ?4
             WHERE id = ?1 AND status IN ('pending', 'running')",
        )
        .bind(id)
        .bind(status)
        .bind(error_kind)
        .bind(Utc::now())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        DBService,
        models::{
            identity::{Role, Tenant, User},
            project::{CreateProject, Project},
        },
    };

    use super::*;

    async fn seed_project(db: &DBService) -> (Uuid, Uuid) {
        let tenant = Tenant::create(&db.pool, Uuid::new_v4(), "acme")
            .await
            .unwrap();
        let user = User::create(&db.pool, Uuid::new_v4(), tenant.id, "u@acme.dev", Role::Dev)
            .await
            .unwrap();
        let project = Project::create(
            &db.pool,
            &CreateProject {
                owner_user_id: user.id,
                name: "p1".to_string(),
                language: "node".to_string(),
                framework: None,
                local_path: "/store/p1".to_string(),
                remote_url: None,
                branch: None,
                protected: None,
            },
            tenant.id,
            Uuid::new_v4(),
        )
        .await
        .unwrap();
        (project.id, user.id)
    }

    #[tokio::test]
    async fn steps_roundtrip_through_json_column() {
        let db = DBService::new_in_memory().await.unwrap();
        let (project_id, caller) = seed_project(&db).await;

        let wf = Workflow::create(
            &db.pool,
            Uuid::new_v4(),
            project_id,
            caller,
            &[StepName::Sync, StepName::AiUpdate, StepName::Push],
        )
        .await
        .unwrap();
        assert_eq!(wf.status, WorkflowStatus::Pending);
        assert_eq!(wf.steps.0.len(), 3);
        assert!(wf.steps.0.iter().all(|s| s.status == StepStatus::Pending));

        let fetched = Workflow::find_by_id(&db.pool, wf.id).await.unwrap().unwrap();
        assert_eq!(fetched.steps.0[1].name, StepName::AiUpdate);
    }

    #[tokio::test]
    async fn terminal_status_is_never_rewritten() {
        let db = DBService::new_in_memory().await.unwrap();
        let (project_id, caller) = seed_project(&db).await;
        let wf = Workflow::create(&db.pool, Uuid::new_v4(), project_id, caller, &[StepName::Sync])
            .await
            .unwrap();

        assert!(Workflow::mark_started(&db.pool, wf.id).await.unwrap());
        assert!(
            Workflow::mark_terminal(&db.pool, wf.id, WorkflowStatus::Failed, Some("EXTERNAL"))
                .await
                .unwrap()
        );
        // A second terminal write is refused.
        assert!(
            !Workflow::mark_terminal(&db.pool, wf.id, WorkflowStatus::Completed, None)
                .await
                .unwrap()
        );

        let fetched = Workflow::find_by_id(&db.pool, wf.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, WorkflowStatus::Failed);
        assert_eq!(fetched.error_kind.as_deref(), Some("EXTERNAL"));
    }

    #[tokio::test]
    async fn step_names_parse_from_wire_strings() {
        use std::str::FromStr;
        assert_eq!(StepName::from_str("ai_update").unwrap(), StepName::AiUpdate);
        assert_eq!(StepName::from_str("sync").unwrap(), StepName::Sync);
        assert!(StepName::from_str("deploy").is_err());
    }
}
