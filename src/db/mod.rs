//! Block cursor persistence
//!
//! Each sync loop stores the next block it has to process, keyed by chain id
//! and role. On restart the loop resumes from there and anything that was in
//! flight is re-derived from chain state.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use eyre::{Result, WrapErr};
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::health::Role;
use crate::types::ChainId;

#[async_trait]
pub trait BlockStore: Send + Sync + 'static {
    async fn store_block(&self, chain_id: ChainId, role: Role, height: u64) -> Result<()>;

    async fn try_load_latest_block(&self, chain_id: ChainId, role: Role) -> Result<Option<u64>>;
}

/// Create a database connection pool
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .wrap_err("Failed to connect to database")
}

/// Run pending migrations (uses the migration files in migrations/)
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .wrap_err("Failed to run database migrations")?;
    Ok(())
}

/// Postgres-backed store
#[derive(Clone)]
pub struct PgBlockStore {
    pool: PgPool,
}

impl PgBlockStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BlockStore for PgBlockStore {
    async fn store_block(&self, chain_id: ChainId, role: Role, height: u64) -> Result<()> {
        let chain = i64::try_from(chain_id).wrap_err("chain id does not fit BIGINT")?;
        let block = i64::try_from(height).wrap_err("block number does not fit BIGINT")?;
        sqlx::query(
            r#"
            INSERT INTO block_cursors (chain_id, role, block_number)
            VALUES ($1, $2, $3)
            ON CONFLICT (chain_id, role) DO UPDATE SET block_number = $3, updated_at = NOW()
            "#,
        )
        .bind(chain)
        .bind(role.as_str())
        .bind(block)
        .execute(&self.pool)
        .await
        .wrap_err_with(|| format!("Failed to store {} block for chain {}", role, chain_id))?;

        Ok(())
    }

    async fn try_load_latest_block(&self, chain_id: ChainId, role: Role) -> Result<Option<u64>> {
        let chain = i64::try_from(chain_id).wrap_err("chain id does not fit BIGINT")?;
        let row: Option<(i64,)> = sqlx::query_as(
            r#"SELECT block_number FROM block_cursors WHERE chain_id = $1 AND role = $2"#,
        )
        .bind(chain)
        .bind(role.as_str())
        .fetch_optional(&self.pool)
        .await
        .wrap_err_with(|| format!("Failed to load {} block for chain {}", role, chain_id))?;

        row.map(|(block,)| u64::try_from(block).wrap_err("negative block number in store"))
            .transpose()
    }
}

/// Process-local store, used when no database is configured
#[derive(Debug, Default)]
pub struct MemoryBlockStore {
    blocks: Mutex<HashMap<(ChainId, Role), u64>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlockStore for MemoryBlockStore {
    async fn store_block(&self, chain_id: ChainId, role: Role, height: u64) -> Result<()> {
        self.blocks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((chain_id, role), height);
        Ok(())
    }

    async fn try_load_latest_block(&self, chain_id: ChainId, role: Role) -> Result<Option<u64>> {
        Ok(self
            .blocks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(chain_id, role))
            .copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_keys_by_role() {
        let store = MemoryBlockStore::new();
        assert_eq!(store.try_load_latest_block(1, Role::Maintainer).await.unwrap(), None);

        store.store_block(1, Role::Maintainer, 100).await.unwrap();
        store.store_block(1, Role::Messenger, 90).await.unwrap();
        store.store_block(1, Role::Maintainer, 101).await.unwrap();

        assert_eq!(store.try_load_latest_block(1, Role::Maintainer).await.unwrap(), Some(101));
        assert_eq!(store.try_load_latest_block(1, Role::Messenger).await.unwrap(), Some(90));
        assert_eq!(store.try_load_latest_block(2, Role::Messenger).await.unwrap(), None);
    }
}
