use std::collections::HashSet;

use db::{
    DBService,
    models::{
        identity::{Role, User},
        project::Project,
    },
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ts_rs::TS;
use uuid::Uuid;

use super::error::{CoreError, ErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Read,
    Write,
    Delete,
    Run,
    Stop,
}

/// The authenticated caller, as resolved by the platform's auth layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
pub struct Identity {
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub role: Role,
}

#[derive(Debug, Error)]
pub enum AccessError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("access denied: {0}")]
    Denied(String),
    #[error("user not found: {0}")]
    UserNotFound(Uuid),
}

impl From<AccessError> for CoreError {
    fn from(err: AccessError) -> Self {
        match err {
            AccessError::Denied(reason) => CoreError::denied(reason),
            AccessError::UserNotFound(id) => CoreError::not_found(format!("user {id}")),
            AccessError::Database(db_err) => CoreError::from(db_err),
        }
    }
}

/// The single source of truth for authorization. No other component
/// implements role checks.
#[derive(Clone)]
pub struct AccessResolver {
    db: DBService,
}

impl AccessResolver {
    pub fn new(db: DBService) -> Self {
        Self { db }
    }

    /// User ids whose projects the caller may see. `None` means unbounded
    /// (ADMIN only); an empty set means nothing is visible.
    pub async fn visible_user_ids(
        &self,
        identity: &Identity,
    ) -> Result<Option<HashSet<Uuid>>, AccessError> {
        match identity.role {
            Role::Admin => Ok(None),
            Role::Enterprise => {
                let members = User::ids_in_tenant(&self.db.pool, identity.tenant_id).await?;
                Ok(Some(members.into_iter().collect()))
            }
            Role::ProDev | Role::Dev => Ok(Some(HashSet::from([identity.user_id]))),
        }
    }

    /// Pure decision over (identity, project, op); no I/O.
    pub fn authorize(
        &self,
        identity: &Identity,
        project: &Project,
        op: Operation,
    ) -> Result<(), AccessError> {
        match identity.role {
            Role::Admin => Ok(()),
            Role::Enterprise => {
                if project.tenant_id == identity.tenant_id {
                    Ok(())
                } else {
                    Err(AccessError::Denied(format!(
                        "project {} belongs to another tenant",
                        project.id
                    )))
                }
            }
            Role::ProDev | Role::Dev => {
                if project.owner_user_id != identity.user_id {
                    return Err(AccessError::Denied(format!(
                        "project {} is owned by another user",
                        project.id
                    )));
                }
                if op == Operation::Delete && project.protected {
                    return Err(AccessError::Denied(
                        "protected projects require an enterprise or admin caller to delete"
                            .to_string(),
                    ));
                }
                Ok(())
            }
        }
    }

    /// Authorizes acting on behalf of `target_user_id` (e.g. creating a
    /// resource for them). One tenant lookup when target differs from the
    /// caller.
    pub async fn authorize_user_target(
        &self,
        identity: &Identity,
        target_user_id: Uuid,
    ) -> Result<(), AccessError> {
        if identity.user_id == target_user_id {
            return Ok(());
        }
        match identity.role {
            Role::Admin => Ok(()),
            Role::Enterprise => {
                let target_tenant = User::tenant_of(&self.db.pool, target_user_id)
                    .await?
                    .ok_or(AccessError::UserNotFound(target_user_id))?;
                if target_tenant == identity.tenant_id {
                    Ok(())
                } else {
                    Err(AccessError::Denied(format!(
                        "user {target_user_id} belongs to another tenant"
                    )))
                }
            }
            Role::ProDev | Role::Dev => Err(AccessError::Denied(
                "developers may only act on their own resources".to_string(),
            )),
        }
    }

    /// Hard deletes bypass the soft-delete default only for ADMIN, or for
    /// ENTERPRISE callers inside the owner's tenant.
    pub fn authorize_hard_delete(
        &self,
        identity: &Identity,
        project: &Project,
    ) -> Result<(), AccessError> {
        match identity.role {
            Role::Admin => Ok(()),
            Role::Enterprise if project.tenant_id == identity.tenant_id => Ok(()),
            _ => Err(AccessError::Denied(
                "hard delete requires an admin or an enterprise caller in the owner's tenant"
                    .to_string(),
            )),
        }
    }

    /// Toggling a project's protection flag is reserved to the callers who
    /// may bypass it on delete: ADMIN, or ENTERPRISE inside the project's
    /// tenant. Anything looser would let an owner clear the flag and then
    /// delete normally.
    pub fn authorize_protection_change(
        &self,
        identity: &Identity,
        project: &Project,
    ) -> Result<(), AccessError> {
        match identity.role {
            Role::Admin => Ok(()),
            Role::Enterprise if project.tenant_id == identity.tenant_id => Ok(()),
            _ => Err(AccessError::Denied(
                "changing protection requires an admin or an enterprise caller in the project's tenant"
                    .to_string(),
            )),
        }
    }
}

impl AccessError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AccessError::Denied(_) => ErrorKind::Denied,
            AccessError::UserNotFound(_) => ErrorKind::NotFound,
            AccessError::Database(_) => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use db::models::project::ProjectStatus;

    use super::*;

    fn project(owner: Uuid, tenant: Uuid, protected: bool) -> Project {
        Project {
            id: Uuid::new_v4(),
            owner_user_id: owner,
            tenant_id: tenant,
            name: "p1".to_string(),
            language: "node".to_string(),
            framework: None,
            local_path: "/store/p1".to_string(),
            remote_url: None,
            branch: "main".to_string(),
            status: ProjectStatus::Active,
            protected,
            created_at: Utc::now(),
            last_opened_at: None,
        }
    }

    fn identity(role: Role, tenant: Uuid) -> Identity {
        Identity {
            user_id: Uuid::new_v4(),
            tenant_id: tenant,
            role,
        }
    }

    async fn resolver() -> AccessResolver {
        AccessResolver::new(DBService::new_in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn admin_is_unbounded() {
        let resolver = resolver().await;
        let admin = identity(Role::Admin, Uuid::new_v4());
        assert!(resolver.visible_user_ids(&admin).await.unwrap().is_none());

        let other_tenant_project = project(Uuid::new_v4(), Uuid::new_v4(), true);
        for op in [
            Operation::Read,
            Operation::Write,
            Operation::Delete,
            Operation::Run,
            Operation::Stop,
        ] {
            assert!(resolver.authorize(&admin, &other_tenant_project, op).is_ok());
        }
    }

    #[tokio::test]
    async fn enterprise_is_tenant_bounded() {
        let resolver = resolver().await;
        let tenant = Uuid::new_v4();
        let enterprise = identity(Role::Enterprise, tenant);

        let same_tenant = project(Uuid::new_v4(), tenant, true);
        assert!(
            resolver
                .authorize(&enterprise, &same_tenant, Operation::Delete)
                .is_ok()
        );

        let foreign = project(Uuid::new_v4(), Uuid::new_v4(), false);
        assert!(
            resolver
                .authorize(&enterprise, &foreign, Operation::Read)
                .is_err()
        );
    }

    #[tokio::test]
    async fn dev_owns_only_their_projects() {
        let resolver = resolver().await;
        let tenant = Uuid::new_v4();
        let dev = identity(Role::Dev, tenant);

        let own = project(dev.user_id, tenant, false);
        assert!(resolver.authorize(&dev, &own, Operation::Write).is_ok());
        assert!(resolver.authorize(&dev, &own, Operation::Delete).is_ok());

        let peer = project(Uuid::new_v4(), tenant, false);
        assert!(resolver.authorize(&dev, &peer, Operation::Read).is_err());

        let visible = resolver.visible_user_ids(&dev).await.unwrap().unwrap();
        assert_eq!(visible, HashSet::from([dev.user_id]));
    }

    #[tokio::test]
    async fn protected_delete_denied_for_owning_dev() {
        let resolver = resolver().await;
        let tenant = Uuid::new_v4();
        let dev = identity(Role::Dev, tenant);
        let own_protected = project(dev.user_id, tenant, true);

        // Owner may still read and mutate, only delete is gated.
        assert!(
            resolver
                .authorize(&dev, &own_protected, Operation::Write)
                .is_ok()
        );
        assert!(
            resolver
                .authorize(&dev, &own_protected, Operation::Delete)
                .is_err()
        );

        let pro = identity(Role::ProDev, tenant);
        let own_protected_pro = project(pro.user_id, tenant, true);
        assert!(
            resolver
                .authorize(&pro, &own_protected_pro, Operation::Delete)
                .is_err()
        );
    }

    #[tokio::test]
    async fn protection_changes_are_enterprise_or_admin_only() {
        let resolver = resolver().await;
        let tenant = Uuid::new_v4();

        let dev = identity(Role::Dev, tenant);
        let own = project(dev.user_id, tenant, true);
        assert!(resolver.authorize_protection_change(&dev, &own).is_err());

        let pro = identity(Role::ProDev, tenant);
        let own_pro = project(pro.user_id, tenant, true);
        assert!(resolver.authorize_protection_change(&pro, &own_pro).is_err());

        let enterprise = identity(Role::Enterprise, tenant);
        assert!(resolver.authorize_protection_change(&enterprise, &own).is_ok());
        let foreign = project(Uuid::new_v4(), Uuid::new_v4(), true);
        assert!(
            resolver
                .authorize_protection_change(&enterprise, &foreign)
                .is_err()
        );

        let admin = identity(Role::Admin, Uuid::new_v4());
        assert!(resolver.authorize_protection_change(&admin, &foreign).is_ok());
    }

    #[tokio::test]
    async fn enterprise_visibility_lists_tenant_members() {
        use db::models::identity::Tenant;

        let db = DBService::new_in_memory().await.unwrap();
        let tenant = Tenant::create(&db.pool, Uuid::new_v4(), "acme")
            .await
            .unwrap();
        let u1 = User::create(&db.pool, Uuid::new_v4(), tenant.id, "a@acme.dev", Role::Dev)
            .await
            .unwrap();
        let u2 = User::create(
            &db.pool,
            Uuid::new_v4(),
            tenant.id,
            "b@acme.dev",
            Role::Enterprise,
        )
        .await
        .unwrap();

        let resolver = AccessResolver::new(db);
        let enterprise = Identity {
            user_id: u2.id,
            tenant_id: tenant.id,
            role: Role::Enterprise,
        };
        let visible = resolver
            .visible_user_ids(&enterprise)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(visible, HashSet::from([u1.id, u2.id]));
    }

    #[tokio::test]
    async fn user_target_checks_tenant_membership() {
        use db::models::identity::Tenant;

        let db = DBService::new_in_memory().await.unwrap();
        let tenant = Tenant::create(&db.pool, Uuid::new_v4(), "acme")
            .await
            .unwrap();
        let member = User::create(&db.pool, Uuid::new_v4(), tenant.id, "m@acme.dev", Role::Dev)
            .await
            .unwrap();
        let resolver = AccessResolver::new(db);

        let enterprise = identity(Role::Enterprise, tenant.id);
        assert!(
            resolver
                .authorize_user_target(&enterprise, member.id)
                .await
                .is_ok()
        );
        assert!(
            resolver
                .authorize_user_target(&enterprise, Uuid::new_v4())
                .await
                .is_err()
        );

        let dev = identity(Role::Dev, tenant.id);
        assert!(resolver.authorize_user_target(&dev, dev.user_id).await.is_ok());
        assert!(resolver.authorize_user_target(&dev, member.id).await.is_err());
    }
}
