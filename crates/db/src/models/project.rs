use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};
use ts_rs::TS;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize, TS)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    Active,
    Archived,
    Deleted,
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProjectStatus::Active => write!(f, "active"),
            ProjectStatus::Archived => write!(f, "archived"),
            ProjectStatus::Deleted => write!(f, "deleted"),
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct Project {
    pub id: Uuid,
    pub owner_user_id: Uuid,
    /// Derived from the owner at creation; never diverges afterwards.
    pub tenant_id: Uuid,
    pub name: String,
    pub language: String,
    pub framework: Option<String>,
    pub local_path: String,
    pub remote_url: Option<String>,
    pub branch: String,
    pub status: ProjectStatus,
    pub protected: bool,
    #[ts(type = "Date")]
    pub created_at: DateTime<Utc>,
    #[ts(type = "Date")]
    pub last_opened_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize, TS)]
pub struct CreateProject {
    pub owner_user_id: Uuid,
    pub name: String,
    pub language: String,
    pub framework: Option<String>,
    pub local_path: String,
    pub remote_url: Option<String>,
    pub branch: Option<String>,
    pub protected: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize, TS)]
pub struct UpdateProject {
    pub name: Option<String>,
    pub language: Option<String>,
    pub framework: Option<String>,
    pub remote_url: Option<String>,
    pub branch: Option<String>,
    pub status: Option<ProjectStatus>,
    pub protected: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize, TS)]
pub struct ProjectFilter {
    /// `None` applies no owner filter (unbounded caller); an empty list
    /// matches nothing.
    pub visible_user_ids: Option<Vec<Uuid>>,
    pub tenant_id: Option<Uuid>,
    pub status: Option<ProjectStatus>,
    pub language: Option<String>,
    pub framework: Option<String>,
    /// Case-insensitive substring over the project name.
    pub search: Option<String>,
    /// 1-based.
    pub page: u32,
    pub page_size: u32,
}

#[derive(Debug, Clone, Serialize, TS)]
pub struct ProjectPage {
    pub items: Vec<Project>,
    pub total: i64,
    pub page: u32,
    pub page_size: u32,
}

const SELECT_COLUMNS: &str = "id, owner_user_id, tenant_id, name, language, framework, \
     local_path, remote_url, branch, status, protected, created_at, last_opened_at";

fn escape_like(term: &str) -> String {
    term.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

impl Project {
    pub async fn count(pool: &SqlitePool) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM projects")
            .fetch_one(pool)
            .await
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Project>(&format!(
            "SELECT {SELECT_COLUMNS} FROM projects WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    pub async fn create(
        pool: &SqlitePool,
        data: &CreateProject,
        tenant_id: Uuid,
        project_id: Uuid,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Project>(&format!(
            "INSERT INTO projects (id, owner_user_id, tenant_id, name, language, framework, \
                 local_path, remote_url, branch, status, protected, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'active', ?10, ?11)
             RETURNING {SELECT_COLUMNS}"
        ))
        .bind(project_id)
        .bind(data.owner_user_id)
        .bind(tenant_id)
        .bind(&data.name)
        .bind(&data.language)
        .bind(&data.framework)
        .bind(&data.local_path)
        .bind(&data.remote_url)
        .bind(data.branch.as_deref().unwrap_or("main"))
        .bind(data.protected.unwrap_or(false))
        .bind(Utc::now())
        .fetch_one(pool)
        .await
    }

    /// Owner and tenant are immutable; only descriptive fields change.
    pub async fn update(
        pool: &SqlitePool,
        id: Uuid,
        payload: &UpdateProject,
    ) -> Result<Self, sqlx::Error> {
        let existing = Self::find_by_id(pool, id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)?;

        let name = payload.name.clone().unwrap_or(existing.name);
        let language = payload.language.clone().unwrap_or(existing.language);
        let framework = payload.framework.clone().or(existing.framework);
        let remote_url = payload.remote_url.clone().or(existing.remote_url);
        let branch = payload.branch.clone().unwrap_or(existing.branch);
        let status = payload.status.unwrap_or(existing.status);
        let protected = payload.protected.unwrap_or(existing.protected);

        sqlx::query_as::<_, Project>(&format!(
            "UPDATE projects
             SET name = ?2, language = ?3, framework = ?4, remote_url = ?5, branch = ?6, \
                 status = ?7, protected = ?8
             WHERE id = ?1
             RETURNING {SELECT_COLUMNS}"
        ))
        .bind(id)
        .bind(name)
        .bind(language)
        .bind(framework)
        .bind(remote_url)
        .bind(branch)
        .bind(status)
        .bind(protected)
        .fetch_one(pool)
        .await
    }

    pub async fn set_status(
        pool: &SqlitePool,
        id: Uuid,
        status: ProjectStatus,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("UPDATE projects SET status = ?2 WHERE id = ?1")
            .bind(id)
            .bind(status)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn hard_delete(pool: &SqlitePool, id: Uuid) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM projects WHERE id = ?1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn touch_last_opened(pool: &SqlitePool, id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE projects SET last_opened_at = ?2 WHERE id = ?1")
            .bind(id)
            .bind(Utc::now())
            .execute(pool)
            .await?;
        Ok(())
    }

    fn push_filters(qb: &mut QueryBuilder<'_, Sqlite>, filter: &ProjectFilter) {
        qb.push(" WHERE 1=1");
        if let Some(ids) = &filter.visible_user_ids {
            if ids.is_empty() {
                // Nothing is visible; callers short-circuit before hitting
                // storage, this clause only backstops direct use.
                qb.push(" AND 0");
            } else {
                qb.push(" AND owner_user_id IN (");
                let mut separated = qb.separated(", ");
                for id in ids {
                    separated.push_bind(*id);
                }
                qb.push(")");
            }
        }
        if let Some(tenant_id) = filter.tenant_id {
            qb.push(" AND tenant_id = ").push_bind(tenant_id);
        }
        match filter.status {
            Some(status) => {
                qb.push(" AND status = ").push_bind(status);
            }
            None => {
                qb.push(" AND status != 'deleted'");
            }
        }
        if let Some(language) = &filter.language {
            qb.push(" AND language = ").push_bind(language.clone());
        }
        if let Some(framework) = &filter.framework {
            qb.push(" AND framework = ").push_bind(framework.clone());
        }
        if let Some(search) = &filter.search {
            let pattern = format!("%{}%", escape_like(search));
            qb.push(" AND name LIKE ")
                .push_bind(pattern)
                .push(" ESCAPE '\\'");
        }
    }

    pub async fn list(
        pool: &SqlitePool,
        filter: &ProjectFilter,
    ) -> Result<ProjectPage, sqlx::Error> {
        let page = filter.page.max(1);
        let page_size = filter.page_size.clamp(1, 100);

        let mut count_qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM projects");
        Self::push_filters(&mut count_qb, filter);
        let total: i64 = count_qb.build_query_scalar().fetch_one(pool).await?;

        let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {SELECT_COLUMNS} FROM projects"));
        Self::push_filters(&mut qb, filter);
        qb.push(" ORDER BY created_at DESC, id");
        qb.push(" LIMIT ").push_bind(page_size as i64);
        qb.push(" OFFSET ").push_bind(((page - 1) * page_size) as i64);
        let items = qb.build_query_as::<Project>().fetch_all(pool).await?;

        Ok(ProjectPage {
            items,
            total,
            page,
            page_size,
        })
    }
}
