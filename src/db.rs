//! Relational store bootstrap and the retryable-transaction helper shared by
//! C5/C6/C7/C8.

use sqlx::postgres::PgPoolOptions;
use sqlx::{Error as SqlxError, PgPool};
use std::time::Duration;
use tracing::debug;

use crate::config::Settings;

/// Open the PostgreSQL connection pool per `Settings`'s pool-tuning fields.
pub async fn create_pool(settings: &Settings) -> Result<PgPool, SqlxError> {
    tracing::info!(
        max_connections = settings.db_pool_size + settings.db_pool_overflow,
        "connecting to relational store"
    );

    let pool = PgPoolOptions::new()
        .max_connections(settings.db_pool_size + settings.db_pool_overflow)
        .min_connections(settings.db_pool_size)
        .acquire_timeout(Duration::from_secs(settings.db_pool_timeout_seconds))
        .connect(&settings.database_url)
        .await?;

    tracing::info!("relational store pool ready");
    Ok(pool)
}

/// PostgreSQL SQLSTATE codes worth retrying a transaction for.
mod pg_error_codes {
    pub const SERIALIZATION_FAILURE: &str = "40001";
    pub const DEADLOCK_DETECTED: &str = "40P01";
}

/// Walks an error's source chain looking for a retryable SQLx database error.
pub fn is_retryable_db_error(error: &anyhow::Error) -> bool {
    let mut current: &dyn std::error::Error = error.as_ref();
    loop {
        if let Some(SqlxError::Database(db_error)) = current.downcast_ref::<SqlxError>() {
            if let Some(sqlstate) = db_error.code() {
                let retryable = matches!(
                    sqlstate.as_ref(),
                    pg_error_codes::SERIALIZATION_FAILURE | pg_error_codes::DEADLOCK_DETECTED
                );
                if retryable {
                    debug!(sqlstate = sqlstate.as_ref(), "detected retryable database error");
                }
                return retryable;
            }
            return false;
        }
        match current.source() {
            Some(source) => current = source,
            None => return false,
        }
    }
}

pub const MAX_TX_RETRY_ATTEMPTS: u32 = 3;
pub const BASE_TX_RETRY_DELAY_MS: u64 = 10;

/// Runs `$body` inside a READ COMMITTED transaction, retrying on a
/// serialization failure or deadlock with exponential backoff and jitter.
/// Mirrors the teacher's `with_optimistic_tx!` shape.
#[macro_export]
macro_rules! with_retrying_tx {
    ($pool:expr, $tx_var:ident, $body:block) => {{
        let mut attempt: u32 = 1;
        loop {
            let mut $tx_var = $pool.begin().await.map_err(|e| anyhow::anyhow!(e))?;

            let result: anyhow::Result<_> = async { $body }.await;

            match result {
                Ok(value) => {
                    $tx_var.commit().await.map_err(|e| anyhow::anyhow!(e))?;
                    break Ok(value);
                }
                Err(e) => {
                    $tx_var.rollback().await.ok();

                    if $crate::db::is_retryable_db_error(&e)
                        && attempt < $crate::db::MAX_TX_RETRY_ATTEMPTS
                    {
                        use rand::Rng;
                        let jitter = rand::thread_rng().gen_range(0..10);
                        let delay_ms =
                            $crate::db::BASE_TX_RETRY_DELAY_MS * (1 << (attempt - 1)) + jitter;
                        tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                        attempt += 1;
                        continue;
                    }
                    break Err(e);
                }
            }
        }
    }};
}

