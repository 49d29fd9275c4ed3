//! # perch-db
//!
//! Persistence layer for Perch: PostgreSQL pool, repositories, and the
//! presence store (Redis with an in-process fallback).
//!
//! Durable rows hold ownership and audit state; the presence store holds
//! soft state that is rebuildable from the hub's in-process registry.

pub mod presence;
pub mod repository;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;

pub use presence::PresenceStore;

/// Shared database handle passed through Axum state.
#[derive(Clone)]
pub struct Database {
    pub pool: sqlx::PgPool,
}

impl Database {
    /// Connect using the URL in `config.database.url`.
    pub async fn connect(config: &perch_common::config::AppConfig) -> Result<Self> {
        tracing::info!("Connecting to PostgreSQL…");
        let pool = PgPoolOptions::new()
            .max_connections(config.database.max_connections)
            .min_connections(config.database.min_connections)
            .connect(&config.database.url)
            .await?;
        Ok(Self { pool })
    }

    /// Run embedded migrations.
    pub async fn migrate(&self) -> Result<()> {
        tracing::info!("Running database migrations…");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        tracing::info!("Migrations complete");
        Ok(())
    }
}
