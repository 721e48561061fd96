use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

pub mod auth;
pub mod clock;
pub mod config;
mod database;
mod engine;
pub mod error;
pub mod facade;
pub mod ledger;
pub mod models;
pub mod monitor;
mod network;
pub mod notifications;
pub mod sync;

pub use auth::{AuthContext, AuthManager};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AppConfig, SyncConfig, TimerConfig};
pub use database::Database;
pub use engine::{MutationSink, SessionMachine};
pub use error::{LedgerError, NotificationError, TimerError};
pub use facade::{CyclePolicy, TimerFacade};
pub use ledger::{HttpSessionLedger, MemoryLedger, SessionLedger};
pub use monitor::{LifecycleEvent, MonitorOutcome, SuspensionMonitor};
pub use network::check_online_status;
pub use notifications::{
    NotificationPlatform, NotificationScheduler, TokioNotificationPlatform,
};
pub use sync::{LedgerWriter, ReplayReport, SyncManager};


/// Install the fmt subscriber. Level from `RUST_LOG`, `info` when unset.
/// Safe to call more than once.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}

/// Everything wired once at process start and handed to the UI layer.
pub struct FocusRuntime {
    pub config: AppConfig,
    pub db: Arc<Database>,
    pub machine: Arc<SessionMachine>,
    pub monitor: Arc<SuspensionMonitor>,
    pub sync: Arc<SyncManager>,
    pub facade: TimerFacade,
    /// Result of cold-start recovery: a session is waiting to be resumed
    pub recovered: bool,
    tasks: Vec<JoinHandle<()>>,
}

impl FocusRuntime {
    /// Open storage, spawn the ledger writer and run cold-start recovery.
    /// Must be called inside a tokio runtime.
    pub fn bootstrap(
        config: AppConfig,
        auth: Arc<dyn AuthContext>,
        ledger: Arc<dyn SessionLedger>,
        platform: Arc<dyn NotificationPlatform>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, TimerError> {
        std::fs::create_dir_all(&config.data_dir).map_err(|e| {
            TimerError::PersistenceFailure(format!(
                "Failed to create data directory {:?}: {}",
                config.data_dir, e
            ))
        })?;
        let db_path = config.database_path();
        info!("[DB] Opening database at {:?}", db_path);
        let db = Arc::new(Database::open_with_recovery(&db_path)?);

        let sync = Arc::new(SyncManager::new(db.clone(), ledger, &config.sync));
        let (writer, writer_task) = LedgerWriter::spawn(sync.clone());
        let notifier = Arc::new(NotificationScheduler::new(
            platform,
            clock.clone(),
            config.timer.progress_checkpoints_minutes.clone(),
        ));
        let machine = Arc::new(SessionMachine::new(
            db.clone(),
            Arc::new(writer),
            notifier,
            clock.clone(),
        )?);

        let recovered = machine.recover_from_cold_start()?;
        info!(
            "[RECOVERY] Cold start done: recovered={}, since long break={}",
            recovered,
            machine.sessions_since_long_break()
        );

        let monitor = Arc::new(SuspensionMonitor::new(
            machine.clone(),
            db.clone(),
            clock,
            config.timer.interruption_ttl_secs,
        ));
        let facade = TimerFacade::new(
            auth,
            machine.clone(),
            monitor.clone(),
            sync.clone(),
            CyclePolicy::new(config.timer.long_break_interval),
        );

        Ok(Self {
            config,
            db,
            machine,
            monitor,
            sync,
            facade,
            recovered,
            tasks: vec![writer_task],
        })
    }

    /// Start periodic offline-queue replay.
    pub fn start_background_sync(&mut self) {
        let handle = sync::spawn_background_sync(self.sync.clone(), self.config.sync.clone());
        self.tasks.push(handle);
        info!("[SYNC] Background replay scheduled");
    }

    /// Persist the snapshot, wait for submitted remote writes, stop background tasks.
    pub async fn shutdown(self) {
        if let Err(e) = self.machine.persist_current() {
            error!("[TIMER] Failed to persist snapshot on shutdown: {}", e);
        }
        self.machine.flush().await;
        for task in self.tasks {
            task.abort();
        }
        info!("[TIMER] Runtime shut down");
    }
}
