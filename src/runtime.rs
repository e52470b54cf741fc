use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use flume::Sender;

use crate::config::WatchConfig;
use crate::database::WatchDatabase;
use crate::notification::{AlertTemplate, NotificationComposer};
use crate::reconcile::ReconciliationEngine;
use crate::scheduler::{ReconcileScheduler, WatchEvent};
use crate::store::{ConversationStore, MailTransport, OrganizationDirectory};

/// Fully wired service: stores, composer, engine and scheduler.
pub struct WatchRuntime {
    pub config: WatchConfig,
    pub directory: Arc<dyn OrganizationDirectory>,
    pub engine: Arc<ReconciliationEngine>,
    pub scheduler: Arc<ReconcileScheduler>,
}

pub struct WatchRuntimeBuilder {
    config: WatchConfig,
    event_tx: Sender<WatchEvent>,
    conversations: Option<Arc<dyn ConversationStore>>,
    directory: Option<Arc<dyn OrganizationDirectory>>,
    mail: Option<Arc<dyn MailTransport>>,
}

impl WatchRuntimeBuilder {
    pub fn new(config: WatchConfig, event_tx: Sender<WatchEvent>) -> Self {
        Self {
            config,
            event_tx,
            conversations: None,
            directory: None,
            mail: None,
        }
    }

    pub fn with_conversation_store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.conversations = Some(store);
        self
    }

    pub fn with_directory(mut self, directory: Arc<dyn OrganizationDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn with_mail_transport(mut self, mail: Arc<dyn MailTransport>) -> Self {
        self.mail = Some(mail);
        self
    }

    /// Stores not supplied explicitly are served by the SQLite database at
    /// `config.database_path`, which is only opened if something needs it.
    pub fn build(self) -> Result<WatchRuntime> {
        let config = self.config;
        let windows = config.windows().context("Invalid reconciliation windows")?;
        let template = AlertTemplate::from_config(&config).context("Invalid alert settings")?;

        let mut database: Option<Arc<WatchDatabase>> = None;
        let mut open_database = || -> Result<Arc<WatchDatabase>> {
            if let Some(db) = &database {
                return Ok(db.clone());
            }
            let db = WatchDatabase::new(&config.database_path).with_context(|| {
                format!("Failed to open database at {}", config.database_path)
            })?;
            tracing::info!("Using SQLite store at {}", config.database_path);
            let db = Arc::new(db);
            database = Some(db.clone());
            Ok(db)
        };

        let conversations = match self.conversations {
            Some(store) => store,
            None => open_database()? as Arc<dyn ConversationStore>,
        };
        let directory = match self.directory {
            Some(directory) => directory,
            None => open_database()? as Arc<dyn OrganizationDirectory>,
        };
        let mail = match self.mail {
            Some(mail) => mail,
            None => open_database()? as Arc<dyn MailTransport>,
        };

        let composer = Arc::new(NotificationComposer::new(directory.clone(), mail, template));
        let engine = Arc::new(ReconciliationEngine::new(
            conversations,
            composer,
            config.organization_name.clone(),
            windows,
        ));
        let scheduler = Arc::new(ReconcileScheduler::new(
            engine.clone(),
            Duration::from_secs(config.reconcile_interval_secs),
            config.run_on_startup,
            self.event_tx,
        ));

        tracing::info!(
            "Alerting '{}' for conversations idle {}-{}m; reset after {}m",
            config.organization_name,
            windows.notify_after.num_minutes(),
            windows.notify_until.num_minutes(),
            windows.reset_after.num_minutes()
        );

        Ok(WatchRuntime {
            config,
            directory,
            engine,
            scheduler,
        })
    }
}

impl WatchRuntime {
    pub fn bootstrap(config: WatchConfig, event_tx: Sender<WatchEvent>) -> Result<Self> {
        WatchRuntimeBuilder::new(config, event_tx).build()
    }
}
