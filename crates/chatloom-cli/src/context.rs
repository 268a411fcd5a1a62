//! Wires the cache, backend, sync queue and engine together.

use std::path::PathBuf;
use std::sync::Arc;

use chatloom_app::AppConfig;
use chatloom_core::{
    ChatEngine, ConversationStore, DefaultMigrator, EngineEvent, StreamStateManager, SyncService,
    UsageTracker,
};
use chatloom_llm::{BatteryDelta, TokenUsage};
use chatloom_ollama::{OllamaConfig, OllamaTransport};
use chatloom_remote::{BackendConfig, HttpBackend};
use tokio::sync::mpsc;

use crate::Cli;
use crate::storage::SqliteOffline;
use crate::sync::QueueSync;

/// Resolved connection settings. Flags beat the environment, the
/// environment beats `config.yaml`.
#[derive(Debug, Clone)]
pub struct Settings {
    pub backend: BackendConfig,
    pub ollama: OllamaConfig,
    pub db_path: Option<PathBuf>,
    pub model: Option<String>,
}

impl Settings {
    pub fn resolve(cli: &Cli, file: &AppConfig) -> Self {
        Self::resolve_with(cli, BackendConfig::from_env(), OllamaConfig::from_env(), file)
    }

    fn resolve_with(
        cli: &Cli,
        env_backend: BackendConfig,
        env_ollama: OllamaConfig,
        file: &AppConfig,
    ) -> Self {
        let defaults = BackendConfig::default();

        let base_url = cli
            .base_url
            .clone()
            .or_else(|| non_default(env_backend.base_url.clone(), &defaults.base_url))
            .or_else(|| file.backend_url.clone())
            .unwrap_or(defaults.base_url);
        let api_key = env_backend.api_key.or_else(|| file.api_key.clone());

        let ollama_url = cli
            .ollama_url
            .clone()
            .or_else(|| non_default(env_ollama.base_url, &OllamaConfig::default().base_url))
            .or_else(|| file.ollama_url.clone())
            .unwrap_or_else(|| OllamaConfig::default().base_url);

        Self {
            backend: BackendConfig {
                base_url: base_url.trim_end_matches('/').to_string(),
                api_key,
            },
            ollama: OllamaConfig {
                base_url: ollama_url.trim_end_matches('/').to_string(),
            },
            db_path: cli.db.clone(),
            model: cli.model.clone(),
        }
    }
}

fn non_default(value: String, default: &str) -> Option<String> {
    (value != default).then_some(value)
}

pub struct Context {
    pub engine: ChatEngine,
    pub events: mpsc::UnboundedReceiver<EngineEvent>,
    pub storage: Arc<SqliteOffline>,
    pub sync: Arc<QueueSync>,
    pub model: Option<String>,
}

impl Context {
    pub async fn open(cli: &Cli) -> Result<Self, Box<dyn std::error::Error>> {
        let file = chatloom_app::load_config()?;
        let settings = Settings::resolve(cli, &file);

        let db_path = match settings.db_path.clone() {
            Some(path) => path,
            None => chatloom_app::cache_db_path()?,
        };
        tracing::debug!(path = %db_path.display(), "opening cache");
        let storage = Arc::new(SqliteOffline::open(&db_path)?);

        let backend = HttpBackend::new(settings.backend.clone());
        let sync = Arc::new(QueueSync::new(Arc::clone(&storage), backend.clone()));

        // Rekeys temporary ids in the cache, so drain before hydrating.
        match sync.process_sync_queue().await {
            Ok(0) => {}
            Ok(sent) => tracing::info!(sent, "delivered queued writes"),
            Err(err) => tracing::warn!(error = %err, "could not replay sync queue"),
        }

        let store = ConversationStore::new(
            storage.clone(),
            Arc::new(backend.clone()),
            sync.clone(),
            Arc::new(DefaultMigrator),
        )
        .with_config(file.engine.clone());
        let (conversations, messages) = storage.snapshot()?;
        store.hydrate(conversations, messages);

        let recovery = StreamStateManager::new(storage.clone())
            .save_every(file.engine.save_every_tokens);
        for state in recovery.interrupted_streams() {
            tracing::warn!(
                stream_id = %state.stream_id,
                conversation_id = %state.conversation_id,
                tokens = state.tokens_generated,
                "found interrupted stream"
            );
        }

        let mut engine = ChatEngine::new(
            Arc::new(store),
            Arc::new(backend.clone()),
            Arc::new(recovery),
        );
        engine
            .local_transport(Arc::new(OllamaTransport::new(settings.ollama.clone())))
            .image_pipeline(Arc::new(backend))
            .usage_tracker(Arc::new(LogUsage));
        let events = engine.subscribe();

        Ok(Self {
            engine,
            events,
            storage,
            sync,
            model: settings.model,
        })
    }
}

struct LogUsage;

impl UsageTracker for LogUsage {
    fn record_usage(&self, usage: TokenUsage, battery: Option<BatteryDelta>) {
        tracing::info!(
            input = usage.input_tokens,
            output = usage.output_tokens,
            battery = ?battery,
            "token usage"
        );
    }
}
