use std::{env, str::FromStr};

use sqlx::{
    Error, SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};

pub mod models;

#[derive(Clone)]
pub struct DBService {
    pub pool: SqlitePool,
}

impl DBService {
    /// Connects using `DATABASE_URL` (default: a local `orchestrator.db`
    /// file) and applies embedded migrations.
    pub async fn new() -> Result<DBService, Error> {
        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://orchestrator.db".to_string());
        let options = SqliteConnectOptions::from_str(&database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(DBService { pool })
    }

    /// In-memory database for tests. A single connection keeps the
    /// `:memory:` store alive for the pool's lifetime.
    pub async fn new_in_memory() -> Result<DBService, Error> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(DBService { pool })
    }
}
