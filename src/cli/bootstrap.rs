use anyhow::{Context, Result};
use rusqlite::Connection;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::Config;
use crate::core::brain::AgentLoop;
use crate::core::credentials::{CredentialStore, SecretCipher};
use crate::core::llm::LanguageModel;
use crate::core::llm::openai::OpenAiCompatProvider;
use crate::core::mcp::StdioConnector;
use crate::core::pool::ConnectionPool;
use crate::core::service::ServiceRegistry;
use crate::core::transcript::SqliteTranscript;
use crate::platform::{NativePlatform, Platform};

/// Everything a command needs, opened from one config.
pub struct Runtime {
    pub config: Config,
    pub credentials: Arc<CredentialStore>,
    pub transcripts: Arc<SqliteTranscript>,
    pub registry: Arc<ServiceRegistry>,
}

impl Runtime {
    pub async fn open(config: Config) -> Result<Self> {
        let data_dir = config.data_dir();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;
        NativePlatform::restrict_dir_permissions(&data_dir);

        let db_path = config.database_path();
        let conn = Connection::open(&db_path)
            .with_context(|| format!("failed to open database {}", db_path.display()))?;
        let db = Arc::new(Mutex::new(conn));

        let credentials = CredentialStore::new(db.clone(), config.secrets_dir(), SecretCipher::from_machine_identity()?);
        credentials.initialize().await?;

        let transcripts = SqliteTranscript::new(db);
        transcripts.initialize().await?;

        info!(data_dir = %data_dir.display(), "runtime opened");
        Ok(Self {
            registry: Arc::new(config.registry()),
            credentials: Arc::new(credentials),
            transcripts: Arc::new(transcripts),
            config,
        })
    }

    pub fn pool(&self) -> Arc<ConnectionPool> {
        let connector = Arc::new(StdioConnector::new(self.config.connection_timeouts()));
        Arc::new(ConnectionPool::new(
            self.credentials.clone(),
            self.registry.clone(),
            connector,
            self.config.pool_settings(),
        ))
    }

    pub fn model(&self) -> Result<Arc<dyn LanguageModel>> {
        let llm = &self.config.llm;
        let api_key = std::env::var(&llm.api_key_env).ok().filter(|k| !k.is_empty());
        if api_key.is_none() {
            warn!("{} is not set; calling the model without an API key", llm.api_key_env);
        }
        Ok(Arc::new(OpenAiCompatProvider::new(&llm.base_url, &llm.model, api_key)?))
    }

    pub fn agent(&self, pool: Arc<ConnectionPool>) -> Result<AgentLoop> {
        Ok(AgentLoop::new(pool, self.model()?, self.config.agent_settings()))
    }
}
