//! Test harness with testcontainers for integration testing.
//!
//! One Postgres container is shared across the whole test run; every
//! harness gets its own freshly-created database inside it, so tests can
//! open breakers, claim rate-limit windows and take advisory locks
//! without seeing each other.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::PgPool;
use test_context::AsyncTestContext;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};
use tokio::sync::OnceCell;

use engine_core::config::Config;
use engine_core::kernel::SyncKernel;
use engine_core::rpc::ErpTransport;
use engine_core::sync::{resolver_from, SyncModule};
use engine_core::testing::{MockTransport, ScriptedModule};

// =============================================================================
// Shared Test Infrastructure
// =============================================================================

/// Shared container state: started once, reused by every test.
struct SharedTestInfra {
    admin_url: String,
    host: String,
    port: u16,
    // Keep the container alive for the entire test run
    _postgres: ContainerAsync<GenericImage>,
}

static SHARED_INFRA: OnceCell<SharedTestInfra> = OnceCell::const_new();

static DB_COUNTER: AtomicU32 = AtomicU32::new(0);

impl SharedTestInfra {
    async fn init() -> Result<Self> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let postgres = GenericImage::new("postgres", "16")
            .with_wait_for(testcontainers::core::WaitFor::message_on_stderr(
                "database system is ready to accept connections",
            ))
            .with_exposed_port(testcontainers::core::ContainerPort::Tcp(5432))
            .with_env_var("POSTGRES_PASSWORD", "postgres")
            .with_env_var("POSTGRES_USER", "postgres")
            .with_env_var("POSTGRES_DB", "postgres")
            .start()
            .await
            .context("Failed to start Postgres container")?;

        let host = postgres.get_host().await?.to_string();
        let port = postgres.get_host_port_ipv4(5432).await?;
        let admin_url = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

        Ok(Self {
            admin_url,
            host,
            port,
            _postgres: postgres,
        })
    }

    async fn get() -> &'static Self {
        SHARED_INFRA
            .get_or_init(|| async {
                Self::init()
                    .await
                    .expect("Failed to initialize shared test infrastructure")
            })
            .await
    }
}

// =============================================================================
// PgHarness
// =============================================================================

/// Engine wired against a real Postgres database and the scripted remote
/// doubles. Each harness owns a private database in the shared container.
pub struct PgHarness {
    pub kernel: SyncKernel,
    pub db_pool: PgPool,
    pub transport: Arc<MockTransport>,
    pub module: Arc<ScriptedModule>,
}

impl PgHarness {
    /// Module id and entity pair the scripted module registers.
    pub const MODULE: &'static str = "crm";
    pub const ENTITY: &'static str = "contact";
    pub const REMOTE_MODEL: &'static str = "res.partner";

    pub async fn new() -> Result<Self> {
        let infra = SharedTestInfra::get().await;

        // A private database per harness: breaker rows, settings CAS
        // windows and advisory locks stay invisible to other tests.
        let db_name = format!(
            "wp4odoo_test_{}_{}",
            std::process::id(),
            DB_COUNTER.fetch_add(1, Ordering::SeqCst)
        );
        let admin_pool = PgPool::connect(&infra.admin_url)
            .await
            .context("Failed to connect for database creation")?;
        sqlx::query(&format!(r#"CREATE DATABASE "{db_name}""#))
            .execute(&admin_pool)
            .await
            .context("Failed to create test database")?;
        admin_pool.close().await;

        let db_url = format!(
            "postgresql://postgres:postgres@{}:{}/{}",
            infra.host, infra.port, db_name
        );
        let db_pool = PgPool::connect(&db_url)
            .await
            .context("Failed to connect to test database")?;

        let transport = Arc::new(MockTransport::new());
        let module = Arc::new(ScriptedModule::new(
            Self::MODULE,
            vec![(Self::ENTITY, Self::REMOTE_MODEL)],
        ));

        let config = Config {
            database_url: db_url,
            odoo_url: "http://odoo.invalid".to_string(),
            odoo_database: "test".to_string(),
            odoo_username: "sync@test.invalid".to_string(),
            odoo_api_key: "test-key".to_string(),
            site_id: 1,
        };

        let transport_dyn: Arc<dyn ErpTransport> = transport.clone();
        let module_dyn: Arc<dyn SyncModule> = module.clone();
        let kernel = SyncKernel::assemble(
            config,
            db_pool.clone(),
            transport_dyn,
            resolver_from(vec![module_dyn]),
        );
        kernel.migrate().await?;

        Ok(Self {
            kernel,
            db_pool,
            transport,
            module,
        })
    }
}

impl AsyncTestContext for PgHarness {
    async fn setup() -> Self {
        Self::new().await.expect("Failed to create test harness")
    }

    async fn teardown(self) {
        self.db_pool.close().await;
    }
}
