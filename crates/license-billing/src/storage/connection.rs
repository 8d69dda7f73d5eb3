use crate::config::DatabaseConfig;
use crate::error::{BillingError, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

/// PostgreSQL pool shared by the sqlx repositories
#[derive(Clone)]
pub struct DatabaseConnection {
    pool: PgPool,
    lock_timeout_ms: u64,
}

impl DatabaseConnection {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        // Never log credentials
        let display_url = match config.url.rsplit_once('@') {
            Some((_, rest)) => rest,
            None => &config.url,
        };
        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connecting to database: {}",
            display_url
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout())
            .idle_timeout(config.idle_timeout())
            .max_lifetime(config.max_lifetime())
            .connect(&config.url)
            .await
            .map_err(|e| BillingError::from_sqlx("connect", e))?;

        Ok(Self {
            pool,
            lock_timeout_ms: config.lock_timeout_ms,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn lock_timeout_ms(&self) -> u64 {
        self.lock_timeout_ms
    }

    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| BillingError::DatabaseError {
                operation: "run_migrations".to_string(),
                source: Box::new(e),
            })?;
        info!("Database migrations completed");
        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| BillingError::from_sqlx("health_check", e))?;
        Ok(())
    }
}
