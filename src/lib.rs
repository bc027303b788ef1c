pub mod agent_core;
pub mod commands;
pub mod inference;
pub mod mcp_client;

#[cfg(test)]
mod test_http;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use agent_core::{AgentError, ConversationStore, StreamController, ToolCallOrchestrator};
use commands::events::{spawn_event_pump, StreamPushEvent};
use inference::config::{expand_tilde, load_settings, settings_path};
use inference::{AppSettings, ProviderRegistry};
use mcp_client::config::{ensure_default_config, load_servers_config};
use mcp_client::{McpRegistry, ServerSnapshot};

/// Application identifier used for the data directory.
pub const APP_ID: &str = "com.agentdesktop.app";

/// Return the platform-standard data directory for Agent Desktop.
///
/// - macOS: `~/Library/Application Support/com.agentdesktop.app/`
/// - Windows: `{FOLDERID_RoamingAppData}\com.agentdesktop.app\`
/// - Linux: `$XDG_DATA_HOME/com.agentdesktop.app/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.agent-desktop/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join(APP_ID);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".agent-desktop")
}

/// Folder handed to the default filesystem server: `~/Documents/AgentWorkspace`.
pub fn default_workspace() -> PathBuf {
    dirs::document_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("AgentWorkspace")
}

// ─── Logging ─────────────────────────────────────────────────────────────────

/// Initialize the tracing subscriber, writing to `<log_dir>/agent.log`.
///
/// On each call:
/// 1. Rotates existing logs (agent.log → agent.log.1 → .2 → .3, keeps last 3).
/// 2. Opens a fresh agent.log with a line-flushing writer for crash resilience.
/// 3. Logs a startup banner with the log path for discoverability.
///
/// If a global subscriber is already installed this is a no-op beyond the
/// file rotation.
pub fn init_tracing(log_dir: &Path) -> std::io::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    std::fs::create_dir_all(log_dir)?;
    let log_path = log_dir.join("agent.log");

    // Rotate: agent.log.2 → .3, .1 → .2, agent.log → .1
    rotate_log_file(&log_path, 3);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("agent_desktop=info,warn"));

    let installed = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(FlushingWriter::new(log_file))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .try_init()
        .is_ok();

    if installed {
        tracing::info!(
            version = env!("CARGO_PKG_VERSION"),
            log_dir = %log_dir.display(),
            log_file = %log_path.display(),
            pid = std::process::id(),
            "=== Agent Desktop starting ==="
        );
    }
    Ok(())
}

/// Rotate log files: `agent.log` → `agent.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write.
///
/// Without explicit flushing, log entries may sit in OS buffers and be lost
/// on crash.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

// ─── App State ───────────────────────────────────────────────────────────────

/// Resolved file locations.
#[derive(Debug, Clone, PartialEq)]
pub struct AppPaths {
    pub data_dir: PathBuf,
    pub settings_file: PathBuf,
    pub mcp_config: PathBuf,
    pub workspace: PathBuf,
}

impl AppPaths {
    pub fn resolve(data_dir: &Path, settings_file: PathBuf, settings: &AppSettings) -> Self {
        let mcp_config = settings
            .mcp
            .config_path
            .as_deref()
            .map(|p| PathBuf::from(expand_tilde(p)))
            .unwrap_or_else(|| data_dir.join("mcp").join("mcp.json"));
        let workspace = settings
            .mcp
            .workspace
            .as_deref()
            .map(|p| PathBuf::from(expand_tilde(p)))
            .unwrap_or_else(default_workspace);
        Self {
            data_dir: data_dir.to_path_buf(),
            settings_file,
            mcp_config,
            workspace,
        }
    }
}

/// Process-wide state shared by every command.
pub struct AppState {
    pub settings: AppSettings,
    pub paths: AppPaths,
    pub registry: Arc<McpRegistry>,
    pub providers: Arc<ProviderRegistry>,
    pub streams: Arc<StreamController>,
    pub conversations: Arc<ConversationStore>,
    pub orchestrator: Arc<ToolCallOrchestrator>,
    _pump: JoinHandle<()>,
}

impl AppState {
    /// Wire the components together and start the event pump.
    ///
    /// Returns the receiving end of the UI push channel. Must be called
    /// from within a Tokio runtime.
    pub fn new(
        settings: AppSettings,
        paths: AppPaths,
        providers: ProviderRegistry,
        registry: McpRegistry,
    ) -> (Self, mpsc::UnboundedReceiver<StreamPushEvent>) {
        let providers = Arc::new(providers);
        let registry = Arc::new(registry);
        let conversations = Arc::new(ConversationStore::new());

        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let (push_tx, push_rx) = mpsc::unbounded_channel();

        let streams = Arc::new(StreamController::new(
            Arc::clone(&providers),
            &settings.stream,
            session_tx,
        ));
        let orchestrator = Arc::new(ToolCallOrchestrator::new(
            Arc::clone(&registry),
            Arc::clone(&streams),
            Arc::clone(&conversations),
        ));
        let pump = spawn_event_pump(session_rx, Arc::clone(&orchestrator), push_tx);

        let state = Self {
            settings,
            paths,
            registry,
            providers,
            streams,
            conversations,
            orchestrator,
            _pump: pump,
        };
        (state, push_rx)
    }

    /// Load settings from `data_dir`, build providers, write the default MCP
    /// config on first run, and connect the configured servers.
    pub async fn bootstrap(
        data_dir: &Path,
    ) -> Result<(Self, mpsc::UnboundedReceiver<StreamPushEvent>), AgentError> {
        let settings_file = settings_path(data_dir);
        let settings = load_settings(&settings_file)?;
        let paths = AppPaths::resolve(data_dir, settings_file, &settings);
        let providers = ProviderRegistry::from_settings(&settings.llm)?;

        tracing::info!(
            settings_file = %paths.settings_file.display(),
            mcp_config = %paths.mcp_config.display(),
            provider = %settings.llm.provider,
            model = %settings.llm.model,
            "bootstrapping app state"
        );

        let (state, push_rx) = Self::new(settings, paths, providers, McpRegistry::default());

        if state.settings.mcp.enabled {
            if let Err(e) = ensure_default_config(&state.paths.mcp_config, &state.paths.workspace)
            {
                tracing::warn!(error = %e, "could not write default MCP config");
            }
            state.reload_mcp().await;
        } else {
            tracing::info!("MCP disabled in settings");
        }

        Ok((state, push_rx))
    }

    /// Re-read the MCP config file and reconcile the registry against it.
    pub async fn reload_mcp(&self) -> Vec<ServerSnapshot> {
        let config = load_servers_config(&self.paths.mcp_config, &self.paths.workspace);
        self.registry.reconcile(&config).await;
        self.registry.list_servers().await
    }

    /// Cancel every stream and close every MCP connection.
    pub async fn shutdown(&self) {
        self.streams.stop_all();
        self.registry.shutdown().await;
        tracing::info!("app state shut down");
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
