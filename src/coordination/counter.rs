//! # Distributed Atomic Long
//!
//! Backend recipe for a cross-process atomic counter stored as one row of
//! `grid_counters`. Read-modify-write goes through an optimistic
//! compare-and-set first; contended writers fall back to
//! [`DistributedLong::add_with_lock`], which serializes them on the row lock.
//! Higher-level retry policy lives in [`crate::tools::AtomicCounter`].

use sqlx::{PgPool, Row};
use tracing::debug;

use crate::error::GridResult;

/// Outcome of one optimistic compare-and-set attempt
#[derive(Debug, Clone, Copy)]
pub struct AtomicValue {
    pub succeeded: bool,
    pub pre: i64,
    pub post: i64,
}

/// Handle to one counter row, addressed by namespace path
#[derive(Debug, Clone)]
pub struct DistributedLong {
    pool: PgPool,
    path: String,
}

impl DistributedLong {
    pub fn new(pool: PgPool, path: String) -> Self {
        Self { pool, path }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Create the counter row with an initial value; an existing row keeps
    /// its current value.
    pub async fn ensure(&self, initial: i64) -> GridResult<()> {
        sqlx::query(
            "INSERT INTO grid_counters (path, value) VALUES ($1, $2)
             ON CONFLICT (path) DO NOTHING",
        )
        .bind(&self.path)
        .bind(initial)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self) -> GridResult<i64> {
        let row = sqlx::query("SELECT value FROM grid_counters WHERE path = $1")
            .bind(&self.path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>("value")).unwrap_or(0))
    }

    /// One optimistic add attempt: read, then conditionally write. Fails
    /// (without error) when another writer got in between.
    pub async fn try_add(&self, delta: i64) -> GridResult<AtomicValue> {
        let pre = self.get().await?;
        let post = pre + delta;
        let result = sqlx::query("UPDATE grid_counters SET value = $1 WHERE path = $2 AND value = $3")
            .bind(post)
            .bind(&self.path)
            .bind(pre)
            .execute(&self.pool)
            .await?;
        let succeeded = result.rows_affected() == 1;
        if !succeeded {
            debug!("optimistic add on {} lost the race", self.path);
        }
        Ok(AtomicValue {
            succeeded,
            pre,
            post,
        })
    }

    /// Add under the row lock. Always succeeds; used after optimistic
    /// attempts are exhausted.
    pub async fn add_with_lock(&self, delta: i64) -> GridResult<(i64, i64)> {
        let mut tx = self.pool.begin().await?;
        let pre: i64 = sqlx::query("SELECT value FROM grid_counters WHERE path = $1 FOR UPDATE")
            .bind(&self.path)
            .fetch_one(&mut *tx)
            .await?
            .get("value");
        let post = pre + delta;
        sqlx::query("UPDATE grid_counters SET value = $1 WHERE path = $2")
            .bind(post)
            .bind(&self.path)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok((pre, post))
    }

    /// Single compare-and-set attempt
    pub async fn compare_and_set(&self, expected: i64, new: i64) -> GridResult<bool> {
        let result = sqlx::query("UPDATE grid_counters SET value = $1 WHERE path = $2 AND value = $3")
            .bind(new)
            .bind(&self.path)
            .bind(expected)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Unconditional set, creating the row if needed
    pub async fn force_set(&self, value: i64) -> GridResult<()> {
        sqlx::query(
            "INSERT INTO grid_counters (path, value) VALUES ($1, $2)
             ON CONFLICT (path) DO UPDATE SET value = $2",
        )
        .bind(&self.path)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::Coordination;
    use std::time::Duration;

    async fn test_backend() -> Option<Coordination> {
        let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
            println!("Skipping counter test - no TEST_DATABASE_URL provided");
            return None;
        };
        Some(
            Coordination::connect(&url, Duration::from_millis(10))
                .await
                .expect("failed to connect to test backend"),
        )
    }

    #[tokio::test]
    async fn test_ensure_keeps_existing_value() {
        let Some(backend) = test_backend().await else {
            return;
        };
        let counter = backend.counter(format!("/clients/unit-{}/c", uuid::Uuid::new_v4()));

        counter.ensure(7).await.unwrap();
        counter.ensure(99).await.unwrap();
        assert_eq!(counter.get().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_cas_and_lock_paths() {
        let Some(backend) = test_backend().await else {
            return;
        };
        let counter = backend.counter(format!("/clients/unit-{}/c", uuid::Uuid::new_v4()));
        counter.ensure(0).await.unwrap();

        let outcome = counter.try_add(5).await.unwrap();
        assert!(outcome.succeeded);
        assert_eq!((outcome.pre, outcome.post), (0, 5));

        assert!(counter.compare_and_set(5, 10).await.unwrap());
        assert!(!counter.compare_and_set(5, 20).await.unwrap());
        assert_eq!(counter.get().await.unwrap(), 10);

        let (pre, post) = counter.add_with_lock(-4).await.unwrap();
        assert_eq!((pre, post), (10, 6));

        counter.force_set(0).await.unwrap();
        assert_eq!(counter.get().await.unwrap(), 0);
    }
}
