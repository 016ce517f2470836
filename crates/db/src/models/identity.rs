use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use ts_rs::TS;
use uuid::Uuid;

/// Caller roles, ordered from widest to narrowest visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type, Serialize, Deserialize, TS)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Admin,
    Enterprise,
    ProDev,
    Dev,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Admin => write!(f, "admin"),
            Role::Enterprise => write!(f, "enterprise"),
            Role::ProDev => write!(f, "pro_dev"),
            Role::Dev => write!(f, "dev"),
        }
    }
}

/// Tenant read model. Lifecycle is owned by the platform layer.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    #[ts(type = "Record<string, unknown>")]
    pub plan_limits: sqlx::types::Json<serde_json::Value>,
    pub active: bool,
    #[ts(type = "Date")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct User {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub email: String,
    pub role: Role,
    pub active: bool,
    #[ts(type = "Date")]
    pub created_at: DateTime<Utc>,
}

impl Tenant {
    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Tenant>(
            "SELECT id, name, plan_limits, active, created_at FROM tenants WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    pub async fn create(pool: &SqlitePool, id: Uuid, name: &str) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Tenant>(
            "INSERT INTO tenants (id, name, plan_limits, active, created_at)
             VALUES (?1, ?2, '{}', 1, ?3)
             RETURNING id, name, plan_limits, active, created_at",
        )
        .bind(id)
        .bind(name)
        .bind(Utc::now())
        .fetch_one(pool)
        .await
    }
}

impl User {
    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, User>(
            "SELECT id, tenant_id, email, role, active, created_at FROM users WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    /// Tenant of a user, without materializing the whole row.
    pub async fn tenant_of(pool: &SqlitePool, id: Uuid) -> Result<Option<Uuid>, sqlx::Error> {
        sqlx::query_scalar::<_, Uuid>("SELECT tenant_id FROM users WHERE id = ?1")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Active member ids of a tenant.
    pub async fn ids_in_tenant(
        pool: &SqlitePool,
        tenant_id: Uuid,
    ) -> Result<Vec<Uuid>, sqlx::Error> {
        sqlx::query_scalar::<_, Uuid>("SELECT id FROM users WHERE tenant_id = ?1 AND active = 1")
            .bind(tenant_id)
            .fetch_all(pool)
            .await
    }

    pub async fn create(
        pool: &SqlitePool,
        id: Uuid,
        tenant_id: Uuid,
        email: &str,
        role: Role,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, User>(
            "INSERT INTO users (id, tenant_id, email, role, active, created_at)
             VALUES (?1, ?2, ?3, ?4, 1, ?5)
             RETURNING id, tenant_id, email, role, active, created_at",
        )
        .bind(id)
        .bind(tenant_id)
        .bind(email)
        .bind(role)
        .bind(Utc::now())
        .fetch_one(pool)
        .await
    }
}
