use std::sync::Arc;

use aidgent_agent::{
    AgentRuntime, InMemoryRetriever, LlmClient, NoopRetriever, OpenAiCompatibleClient,
    OpenAiEmbedder, Retriever,
};
use aidgent_core::config::{AppConfig, ConfigError, LoadOptions};
use aidgent_core::slots::PolicyError;
use aidgent_core::{PolicyBundle, SearchParams};
use aidgent_db::{
    connect_with_config, migrations, DbPool, SqlMessageRepository, SqlSessionRepository,
    SqlSummaryRepository,
};
use thiserror::Error;
use tracing::{info, warn};

use crate::chat::ChatState;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub runtime: Arc<AgentRuntime>,
}

impl Application {
    pub fn chat_state(&self) -> ChatState {
        ChatState::new(
            self.runtime.clone(),
            Arc::new(SqlSessionRepository::new(self.db_pool.clone())),
            Arc::new(SqlMessageRepository::new(self.db_pool.clone())),
            Arc::new(SqlSummaryRepository::new(self.db_pool.clone())),
        )
    }
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("model client setup failed: {0}")]
    ModelClient(String),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let bundle = PolicyBundle::load(&config.policy)?.shared();

    let db_pool = connect_with_config(&config.database)
        .await
        .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let llm: Arc<dyn LlmClient> = Arc::new(
        OpenAiCompatibleClient::from_config(&config.llm)
            .map_err(|error| BootstrapError::ModelClient(format!("{error:#}")))?,
    );
    let (retriever, search) = build_retriever(&config).await?;

    Ok(Application {
        runtime: Arc::new(AgentRuntime::new(bundle, llm, retriever, search)),
        config,
        db_pool,
    })
}

/// Builds the retriever and indexes the document directory once. A failed
/// initial index leaves the retriever empty; `POST /rag/reindex` can retry.
async fn build_retriever(
    config: &AppConfig,
) -> Result<(Arc<dyn Retriever>, Option<SearchParams>), BootstrapError> {
    let retrieval = &config.retrieval;
    if !retrieval.enabled {
        info!(
            event_name = "system.bootstrap.retrieval_disabled",
            correlation_id = "bootstrap",
            "retrieval disabled, turns run without reference snippets"
        );
        return Ok((Arc::new(NoopRetriever), None));
    }

    let embedder = OpenAiEmbedder::from_config(&config.llm, retrieval)
        .map_err(|error| BootstrapError::ModelClient(format!("{error:#}")))?;
    let retriever = InMemoryRetriever::new(embedder, retrieval);
    match retriever.reindex().await {
        Ok(summary) => info!(
            event_name = "system.bootstrap.retrieval_indexed",
            correlation_id = "bootstrap",
            indexed_docs = summary.indexed_docs,
            chunks = summary.chunks,
            "reference documents indexed"
        ),
        Err(error) => warn!(
            event_name = "system.bootstrap.retrieval_index_failed",
            correlation_id = "bootstrap",
            error = %error,
            "initial document index failed, continuing with an empty index"
        ),
    }

    let search = SearchParams {
        top_k: retrieval.top_k,
        min_score: retrieval.min_score,
        mmr: retrieval.mmr,
    };
    Ok((Arc::new(retriever), Some(search)))
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use aidgent_core::config::{ConfigOverrides, LlmProvider, LoadOptions};

    use crate::bootstrap::{bootstrap, BootstrapError};

    fn write_policy_dir(dir: &Path) {
        fs::write(dir.join("system_prompt_th.txt"), "คุณคือผู้ช่วยคัดกรองอาการ").expect("prompt");
        fs::write(
            dir.join("slot_policy.toml"),
            "[intents.resp_upper]\nrequired_slots = [\"main_symptoms\", \"duration\"]\n",
        )
        .expect("policy");
        fs::write(dir.join("slot_questions_th.toml"), "[resp_upper]\nduration = \"กี่วันแล้ว\"\n")
            .expect("questions");
        fs::write(
            dir.join("safety_th.toml"),
            "[strings]\nemergency_main = \"โทร 1669\"\n\n[[rules]]\nkey = \"chest\"\nlabel = \"เจ็บหน้าอก\"\npatterns = [\"เจ็บหน้าอก\"]\n",
        )
        .expect("safety");
    }

    fn options(policy_dir: &Path, config_path: &Path) -> LoadOptions {
        LoadOptions {
            config_path: Some(config_path.to_path_buf()),
            require_file: true,
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:".to_string()),
                llm_provider: Some(LlmProvider::Ollama),
                policy_dir: Some(policy_dir.to_path_buf()),
                retrieval_enabled: Some(false),
                ..ConfigOverrides::default()
            },
        }
    }

    #[tokio::test]
    async fn bootstrap_wires_database_and_runtime() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_policy_dir(dir.path());
        let config_path = dir.path().join("aidgent.toml");
        fs::write(&config_path, "").expect("config");

        let app = bootstrap(options(dir.path(), &config_path)).await.expect("bootstrap");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master \
             WHERE type = 'table' AND name IN ('session', 'message', 'soap_summary', 'citation')",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("count tables");
        assert_eq!(table_count, 4, "bootstrap should apply every migration");
        assert_eq!(app.runtime.bundle().slots.policy.intents.len(), 1);

        app.db_pool.close().await;
    }

    #[tokio::test]
    async fn bootstrap_fails_fast_on_missing_policy_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config_path = dir.path().join("aidgent.toml");
        fs::write(&config_path, "").expect("config");

        let result = bootstrap(options(dir.path(), &config_path)).await;

        assert!(matches!(result, Err(BootstrapError::Policy(_))));
    }
}
