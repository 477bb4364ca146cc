//! Engine assembly: one struct owning the shared resources and wiring
//! the components together.

use std::sync::Arc;

use anyhow::{Context, Result};
use odoo_rpc::OdooClient;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::breaker::{FailureNotifier, GlobalBreaker, LogAlertSink, ModuleBreaker};
use crate::config::Config;
use crate::lock::{LockFactory, PgLockFactory};
use crate::queue::{Enqueuer, QueueStore, Scheduler};
use crate::rpc::ErpTransport;
use crate::settings::SettingsRepo;
use crate::sync::{MappingRepo, ModuleResolver, PgMappingStore, Reconciler};

/// Shared engine state: database pool, transport, stores and breakers.
pub struct SyncKernel {
    pub config: Config,
    pub pool: PgPool,
    pub settings: Arc<SettingsRepo>,
    pub queue: Arc<QueueStore>,
    pub mapping_store: Arc<PgMappingStore>,
    pub mappings: Arc<dyn MappingRepo>,
    pub transport: Arc<dyn ErpTransport>,
    pub locks: Arc<dyn LockFactory>,
    pub resolver: ModuleResolver,
    pub notifier: Arc<FailureNotifier>,
    pub global_breaker: Arc<GlobalBreaker>,
    pub module_breakers: Arc<ModuleBreaker>,
}

impl SyncKernel {
    /// Connect to the database and the remote system.
    pub async fn connect(config: Config, resolver: ModuleResolver) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.database_url)
            .await
            .context("Failed to connect to database")?;

        let transport: Arc<dyn ErpTransport> = Arc::new(
            OdooClient::new(config.odoo()).context("Failed to build odoo client")?,
        );

        Ok(Self::assemble(config, pool, transport, resolver))
    }

    /// Wire the components over an existing pool and transport (tests,
    /// embedded use).
    pub fn assemble(
        config: Config,
        pool: PgPool,
        transport: Arc<dyn ErpTransport>,
        resolver: ModuleResolver,
    ) -> Self {
        let locks: Arc<dyn LockFactory> = Arc::new(PgLockFactory::new(pool.clone()));
        let settings = Arc::new(SettingsRepo::new(pool.clone()));
        let queue = Arc::new(QueueStore::new(pool.clone(), config.site_id));
        let mapping_store = Arc::new(PgMappingStore::new(pool.clone()));
        let mappings: Arc<dyn MappingRepo> = mapping_store.clone();
        let notifier = Arc::new(FailureNotifier::new(
            Arc::clone(&settings),
            Arc::new(LogAlertSink),
        ));
        let global_breaker = Arc::new(GlobalBreaker::new(
            Arc::clone(&locks),
            Arc::clone(&settings),
            Arc::clone(&notifier),
        ));
        let module_breakers = Arc::new(ModuleBreaker::new(
            Arc::clone(&locks),
            Arc::clone(&settings),
            Arc::clone(&notifier),
        ));

        Self {
            config,
            pool,
            settings,
            queue,
            mapping_store,
            mappings,
            transport,
            locks,
            resolver,
            notifier,
            global_breaker,
            module_breakers,
        }
    }

    /// Apply pending schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;
        Ok(())
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.settings),
            Arc::clone(&self.transport),
            Arc::clone(&self.mappings),
            Arc::clone(&self.resolver),
            Arc::clone(&self.global_breaker),
            Arc::clone(&self.module_breakers),
            Arc::clone(&self.notifier),
            Arc::clone(&self.locks),
            self.config.site_id,
        )
    }

    pub fn enqueuer(&self) -> Enqueuer {
        Enqueuer::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.settings),
            Arc::clone(&self.notifier),
        )
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(Arc::clone(&self.transport), Arc::clone(&self.mappings))
    }
}
