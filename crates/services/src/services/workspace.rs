use std::path::PathBuf;

use dashmap::DashMap;
use db::{DBService, models::project::Project};
use serde::Serialize;
use thiserror::Error;
use ts_rs::TS;
use uuid::Uuid;

use super::error::ErrorKind;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("project not found: {0}")]
    ProjectNotFound(Uuid),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkspaceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkspaceError::ProjectNotFound(_) => ErrorKind::NotFound,
            WorkspaceError::Database(_) | WorkspaceError::Io(_) => ErrorKind::Internal,
        }
    }
}

/// A project's on-disk tree plus how many editor sessions currently hold it
/// open. Scoped to one project, lives on one node.
#[derive(Debug, Clone, Serialize, TS)]
pub struct Workspace {
    pub project_id: Uuid,
    pub root: String,
    pub language: String,
    pub open_sessions: u32,
}

/// Tracks workspaces for the browser IDE: opening ensures the tree exists
/// and stamps the project's last-opened time.
pub struct WorkspaceManager {
    db: DBService,
    sessions: DashMap<Uuid, u32>,
}

impl WorkspaceManager {
    pub fn new(db: DBService) -> Self {
        Self {
            db,
            sessions: DashMap::new(),
        }
    }

    async fn load(&self, project_id: Uuid) -> Result<Project, WorkspaceError> {
        Project::find_by_id(&self.db.pool, project_id)
            .await?
            .ok_or(WorkspaceError::ProjectNotFound(project_id))
    }

    fn snapshot(&self, project: &Project) -> Workspace {
        Workspace {
            project_id: project.id,
            root: project.local_path.clone(),
            language: project.language.clone(),
            open_sessions: self.sessions.get(&project.id).map(|c| *c).unwrap_or(0),
        }
    }

    pub async fn open(&self, project_id: Uuid) -> Result<Workspace, WorkspaceError> {
        let project = self.load(project_id).await?;
        tokio::fs::create_dir_all(PathBuf::from(&project.local_path)).await?;
        *self.sessions.entry(project_id).or_insert(0) += 1;
        Project::touch_last_opened(&self.db.pool, project_id).await?;
        Ok(self.snapshot(&project))
    }

    pub async fn close(&self, project_id: Uuid) -> Result<Workspace, WorkspaceError> {
        let project = self.load(project_id).await?;
        if let Some(mut count) = self.sessions.get_mut(&project_id) {
            *count = count.saturating_sub(1);
        }
        self.sessions.remove_if(&project_id, |_, count| *count == 0);
        Ok(self.snapshot(&project))
    }

    pub async fn get(&self, project_id: Uuid) -> Result<Workspace, WorkspaceError> {
        let project = self.load(project_id).await?;
        Ok(self.snapshot(&project))
    }
}

#[cfg(test)]
mod tests {
    use db::models::{
        identity::{Role, Tenant, User},
        project::CreateProject,
    };

    use super::*;

    async fn fixture() -> (WorkspaceManager, Uuid, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = DBService::new_in_memory().await.unwrap();
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
                language: "python".to_string(),
                framework: None,
                local_path: dir.path().join("p1").display().to_string(),
                remote_url: None,
                branch: None,
                protected: None,
            },
            tenant.id,
            Uuid::new_v4(),
        )
        .await
        .unwrap();
        (WorkspaceManager::new(db), project.id, dir)
    }

    #[tokio::test]
    async fn open_creates_tree_and_counts_sessions() {
        let (manager, project_id, dir) = fixture().await;

        let first = manager.open(project_id).await.unwrap();
        assert_eq!(first.open_sessions, 1);
        assert!(dir.path().join("p1").is_dir());

        let second = manager.open(project_id).await.unwrap();
        assert_eq!(second.open_sessions, 2);

        let after_close = manager.close(project_id).await.unwrap();
        assert_eq!(after_close.open_sessions, 1);
        manager.close(project_id).await.unwrap();
        assert_eq!(manager.get(project_id).await.unwrap().open_sessions, 0);
    }

    #[tokio::test]
    async fn unknown_project_is_not_found() {
        let (manager, _, _dir) = fixture().await;
        let err = manager.open(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
