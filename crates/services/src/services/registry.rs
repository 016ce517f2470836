use db::{
    DBService,
    models::{
        identity::User,
        project::{
            CreateProject, Project, ProjectFilter, ProjectPage, ProjectStatus, UpdateProject,
        },
    },
};
use thiserror::Error;
use uuid::Uuid;

use super::{
    access::{AccessError, AccessResolver, Identity, Operation},
    error::{CoreError, ErrorKind},
};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Access(#[from] AccessError),
    #[error("project not found: {0}")]
    ProjectNotFound(Uuid),
    #[error("owner not found: {0}")]
    OwnerNotFound(Uuid),
}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::Access(err) => err.kind(),
            RegistryError::ProjectNotFound(_) | RegistryError::OwnerNotFound(_) => {
                ErrorKind::NotFound
            }
            RegistryError::Database(_) => ErrorKind::Internal,
        }
    }
}

impl From<RegistryError> for CoreError {
    fn from(err: RegistryError) -> Self {
        match &err {
            RegistryError::Database(_) => CoreError::internal(err.to_string()),
            _ => CoreError::new(err.kind(), err.to_string()),
        }
    }
}

fn empty_page(filter: &ProjectFilter) -> ProjectPage {
    ProjectPage {
        items: Vec::new(),
        total: 0,
        page: filter.page.max(1),
        page_size: filter.page_size.clamp(1, 100),
    }
}

/// Canonical project metadata plus filtered listings. All authorization goes
/// through the access resolver.
#[derive(Clone)]
pub struct ProjectRegistry {
    db: DBService,
    access: AccessResolver,
}

impl ProjectRegistry {
    pub fn new(db: DBService, access: AccessResolver) -> Self {
        Self { db, access }
    }

    /// Filtered listing with the caller's visibility applied. An empty
    /// visible set short-circuits without touching project storage; an
    /// unbounded caller's explicitly requested narrowing passes through.
    pub async fn list(
        &self,
        identity: &Identity,
        mut filter: ProjectFilter,
    ) -> Result<ProjectPage, RegistryError> {
        let visible = self.access.visible_user_ids(identity).await?;
        match visible {
            // Unbounded visibility: the universal set intersected with any
            // requested ids is just the requested ids, so the filter is
            // kept as-is.
            None => {
                if filter
                    .visible_user_ids
                    .as_ref()
                    .is_some_and(|ids| ids.is_empty())
                {
                    return Ok(empty_page(&filter));
                }
            }
            Some(ids) => {
                if ids.is_empty() {
                    return Ok(empty_page(&filter));
                }
                // Narrow a caller-supplied filter to the visible set.
                let requested = filter.visible_user_ids.take();
                let mut ids: Vec<Uuid> = ids.into_iter().collect();
                if let Some(requested) = requested {
                    ids.retain(|id| requested.contains(id));
                    if ids.is_empty() {
                        return Ok(empty_page(&filter));
                    }
                }
                ids.sort();
                filter.visible_user_ids = Some(ids);
            }
        }
        Ok(Project::list(&self.db.pool, &filter).await?)
    }

    pub async fn get(&self, identity: &Identity, id: Uuid) -> Result<Project, RegistryError> {
        let project = Project::find_by_id(&self.db.pool, id)
            .await?
            .ok_or(RegistryError::ProjectNotFound(id))?;
        self.access.authorize(identity, &project, Operation::Read)?;
        Ok(project)
    }

    pub async fn create(
        &self,
        identity: &Identity,
        data: &CreateProject,
    ) -> Result<Project, RegistryError> {
        self.access
            .authorize_user_target(identity, data.owner_user_id)
            .await?;
        // tenant_id is denormalized from the owner and never diverges.
        let owner = User::find_by_id(&self.db.pool, data.owner_user_id)
            .await?
            .ok_or(RegistryError::OwnerNotFound(data.owner_user_id))?;
        Ok(Project::create(&self.db.pool, data, owner.tenant_id, Uuid::new_v4()).await?)
    }

    pub async fn update(
        &self,
        identity: &Identity,
        id: Uuid,
        patch: &UpdateProject,
    ) -> Result<Project, RegistryError> {
        let project = Project::find_by_id(&self.db.pool, id)
            .await?
            .ok_or(RegistryError::ProjectNotFound(id))?;
        self.access.authorize(identity, &project, Operation::Write)?;
        // Status and protection are not descriptive edits: deleting through
        // a patch follows the delete rules, and toggling protection is
        // reserved to the callers allowed to bypass it.
        if patch.status == Some(ProjectStatus::Deleted) && project.status != ProjectStatus::Deleted
        {
            self.access
                .authorize(identity, &project, Operation::Delete)?;
        }
        if let Some(protected) = patch.protected {
            if protected != project.protected {
                self.access.authorize_protection_change(identity, &project)?;
            }
        }
        Ok(Project::update(&self.db.pool, id, patch).await?)
    }

    /// Soft delete by default; `hard` removes the row and is gated on ADMIN
    /// or ENTERPRISE in the owner's tenant.
    pub async fn delete(
        &self,
        identity: &Identity,
        id: Uuid,
        hard: bool,
    ) -> Result<(), RegistryError> {
        let project = Project::find_by_id(&self.db.pool, id)
            .await?
            .ok_or(RegistryError::ProjectNotFound(id))?;
        self.access
            .authorize(identity, &project, Operation::Delete)?;
        if hard {
            self.access.authorize_hard_delete(identity, &project)?;
            Project::hard_delete(&self.db.pool, id).await?;
        } else {
            Project::set_status(&self.db.pool, id, ProjectStatus::Deleted).await?;
        }
        Ok(())
    }

    pub async fn touch_last_opened(&self, id: Uuid) -> Result<(), RegistryError> {
        Ok(Project::touch_last_opened(&self.db.pool, id).await?)
    }
}
