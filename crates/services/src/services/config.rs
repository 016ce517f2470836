use std::{env, path::PathBuf, str::FromStr, time::Duration};

use llm::ModelTier;
use secrecy::SecretString;

/// Core configuration, read once at startup and threaded through the
/// dependency bundle.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Filesystem root for project trees; one subtree per project id.
    pub storage_root: PathBuf,
    pub llm_base_url: String,
    pub llm_primary_model: Option<String>,
    pub llm_tier: ModelTier,
    pub max_wf_concurrency: usize,
    pub batch_window_ms: u64,
    pub max_batch: usize,
    pub grace_ms: u64,
    pub git_user_name: String,
    pub git_user_email: String,
    /// Opaque secrets handed to the auth/crypto collaborators; the core
    /// never derives policy from them.
    pub jwt_secret: Option<SecretString>,
    pub vault_master_key: Option<SecretString>,
}

fn env_parsed<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("storage"),
            llm_base_url: "http://localhost:11434".to_string(),
            llm_primary_model: None,
            llm_tier: ModelTier::Balanced,
            max_wf_concurrency: 8,
            batch_window_ms: 50,
            max_batch: 5,
            grace_ms: 5000,
            git_user_name: "AI Orchestrator".to_string(),
            git_user_email: "ai-orchestrator@example.com".to_string(),
            jwt_secret: None,
            vault_master_key: None,
        }
    }
}

impl CoreConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            storage_root: env::var("STORAGE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.storage_root),
            llm_base_url: env::var("LLM_BASE_URL").unwrap_or(defaults.llm_base_url),
            llm_primary_model: env::var("LLM_PRIMARY_MODEL").ok(),
            llm_tier: env::var("LLM_TIER")
                .ok()
                .and_then(|raw| ModelTier::from_str(&raw).ok())
                .unwrap_or(defaults.llm_tier),
            max_wf_concurrency: env_parsed("MAX_WF_CONCURRENCY", defaults.max_wf_concurrency),
            batch_window_ms: env_parsed("BATCH_WINDOW_MS", defaults.batch_window_ms),
            max_batch: env_parsed("MAX_BATCH", defaults.max_batch),
            grace_ms: env_parsed("GRACE_MS", defaults.grace_ms),
            git_user_name: env::var("GIT_USER_NAME").unwrap_or(defaults.git_user_name),
            git_user_email: env::var("GIT_USER_EMAIL").unwrap_or(defaults.git_user_email),
            jwt_secret: env::var("JWT_SECRET").ok().map(SecretString::from),
            vault_master_key: env::var("VAULT_MASTER_KEY").ok().map(SecretString::from),
        }
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    pub fn project_root(&self, project_id: uuid::Uuid) -> PathBuf {
        self.storage_root.join(project_id.to_string())
    }
}
