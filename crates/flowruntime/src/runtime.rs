use crate::context::{ContextStorageConfig, ContextStore};
use crate::credentials::{ProjectSecret, SecretSetting, VaultOptions};
use crate::flows::FlowManager;
use crate::registry::NodeRegistry;
use crate::storage::{LocalStorage, RuntimeSettings, Settings, Storage};
use flowcore::{EventBus, FlowError, Result, RuntimeEvent};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Main runtime: storage, context, credentials and the flow manager wired
/// together, plus the task routing node events to catch/status nodes.
pub struct FlowRuntime {
    config: RuntimeConfig,
    registry: Arc<NodeRegistry>,
    event_bus: Arc<EventBus>,
    storage: Arc<dyn Storage>,
    context: Arc<ContextStore>,
    manager: Arc<FlowManager>,
    shutdown: CancellationToken,
    dispatcher: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl FlowRuntime {
    /// Runtime persisting to files under `config.user_dir`
    pub async fn new(config: RuntimeConfig, registry: NodeRegistry) -> Result<Self> {
        let storage: Arc<dyn Storage> =
            Arc::new(LocalStorage::new(&config.user_dir, &config.flow_file));
        Self::with_storage(config, registry, storage).await
    }

    /// Runtime over a custom storage collaborator
    pub async fn with_storage(
        config: RuntimeConfig,
        registry: NodeRegistry,
        storage: Arc<dyn Storage>,
    ) -> Result<Self> {
        let settings: Arc<dyn Settings> =
            Arc::new(RuntimeSettings::load(Arc::clone(&storage)).await?);
        let context = Arc::new(ContextStore::from_config(
            &config.context_storage,
            &config.user_dir,
            config.function_global_context.clone(),
        )?);
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));
        let registry = Arc::new(registry);

        let manager = Arc::new(FlowManager::new(
            Arc::clone(&registry),
            Arc::clone(&storage),
            settings,
            Arc::clone(&context),
            Arc::clone(&event_bus),
            config.vault_options(),
        ));

        Ok(Self {
            config,
            registry,
            event_bus,
            storage,
            context,
            manager,
            shutdown: CancellationToken::new(),
            dispatcher: parking_lot::Mutex::new(None),
        })
    }

    /// Open context stores, start routing events, load and start flows.
    /// Returns the loaded revision.
    pub async fn start(&self) -> Result<String> {
        self.context.open().await?;
        self.spawn_dispatcher();
        let rev = self.manager.load().await?;
        tracing::info!(rev = %rev, state = ?self.manager.state(), "Runtime started");
        Ok(rev)
    }

    fn spawn_dispatcher(&self) {
        let mut dispatcher = self.dispatcher.lock();
        if dispatcher.is_some() {
            return;
        }
        let mut events = self.event_bus.subscribe();
        let manager = Arc::clone(&self.manager);
        let shutdown = self.shutdown.clone();

        *dispatcher = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => manager.handle_event(&event).await,
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Event dispatcher lagged behind");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            tracing::debug!("Event dispatcher stopped");
        }));
    }

    /// Stop all nodes and flush context stores
    pub async fn shutdown(&self) -> Result<()> {
        self.manager.stop().await;
        self.shutdown.cancel();
        let dispatcher = self.dispatcher.lock().take();
        if let Some(task) = dispatcher {
            let _ = task.await;
        }
        self.context.close().await?;
        tracing::info!("Runtime stopped");
        Ok(())
    }

    pub fn manager(&self) -> &Arc<FlowManager> {
        &self.manager
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn context(&self) -> &Arc<ContextStore> {
        &self.context
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Subscribe to runtime events
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<RuntimeEvent> {
        self.event_bus.subscribe()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }
}

fn default_user_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_flow_file() -> String {
    "flows.json".to_string()
}

fn default_event_buffer_size() -> usize {
    1000
}

/// Configuration for the runtime
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_user_dir")]
    pub user_dir: PathBuf,

    #[serde(default = "default_flow_file")]
    pub flow_file: String,

    #[serde(default = "default_event_buffer_size")]
    pub event_buffer_size: usize,

    /// Absent: generated system key. `false`: no encryption. String: user key.
    #[serde(default)]
    pub credential_secret: SecretSetting,

    #[serde(default)]
    pub project: Option<ProjectSecret>,

    #[serde(default)]
    pub context_storage: ContextStorageConfig,

    /// Seed of the global context
    #[serde(default)]
    pub function_global_context: Map<String, Value>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            user_dir: default_user_dir(),
            flow_file: default_flow_file(),
            event_buffer_size: default_event_buffer_size(),
            credential_secret: SecretSetting::default(),
            project: None,
            context_storage: ContextStorageConfig::default(),
            function_global_context: Map::new(),
        }
    }
}

impl RuntimeConfig {
    pub fn with_user_dir(mut self, user_dir: impl Into<PathBuf>) -> Self {
        self.user_dir = user_dir.into();
        self
    }

    /// Read a JSON settings file
    pub async fn from_file(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        serde_json::from_slice(&bytes).map_err(|e| {
            FlowError::InvalidRequest(format!("invalid settings file {}: {}", path.display(), e))
        })
    }

    pub fn vault_options(&self) -> VaultOptions {
        VaultOptions {
            credential_secret: self.credential_secret.clone(),
            project: self.project.clone(),
        }
    }
}
