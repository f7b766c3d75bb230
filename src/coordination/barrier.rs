//! # Distributed Double Barrier
//!
//! Backend recipe for an N-party double barrier stored as one row of
//! `grid_barriers`. A round proceeds in two phases: parties *enter* (claim a
//! slot, then wait until the round is full) and then *leave* (the last leaver
//! advances the round and zeroes the counts, and everyone blocks until that
//! happens). Because a round only recycles after it fully drains, a barrier
//! path is safely reusable for any number of rounds.
//!
//! A party that times out while entering un-claims its slot; if the
//! un-claiming update matches no row the round filled concurrently, which
//! counts as a successful entry.

use std::time::Duration;

use sqlx::{PgPool, Row};
use tokio::time::Instant;
use tracing::debug;

use crate::error::{GridError, GridResult};

/// Handle to one barrier row. One instance per round participation: `enter`
/// records the claimed round, `leave` consumes it.
#[derive(Debug)]
pub struct DoubleBarrier {
    pool: PgPool,
    path: String,
    parties: i64,
    poll_interval: Duration,
    round: Option<i64>,
}

impl DoubleBarrier {
    pub fn new(pool: PgPool, path: String, parties: i64, poll_interval: Duration) -> Self {
        Self {
            pool,
            path,
            parties,
            poll_interval,
            round: None,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Create the barrier row if it does not exist
    pub async fn ensure(&self) -> GridResult<()> {
        sqlx::query(
            "INSERT INTO grid_barriers (path, parties, round, entered, leaving)
             VALUES ($1, $2, 0, 0, 0)
             ON CONFLICT (path) DO NOTHING",
        )
        .bind(&self.path)
        .bind(self.parties)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn current(&self) -> GridResult<Option<(i64, i64, i64)>> {
        let row = sqlx::query("SELECT round, entered, leaving FROM grid_barriers WHERE path = $1")
            .bind(&self.path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| {
            (
                r.get::<i64, _>("round"),
                r.get::<i64, _>("entered"),
                r.get::<i64, _>("leaving"),
            )
        }))
    }

    fn gone(&self) -> GridError {
        GridError::barrier_broken(&self.path, "barrier row is gone")
    }

    /// Enter the barrier: claim a slot in the current round, then wait until
    /// all parties have entered. `timeout` bounds the whole enter phase.
    pub async fn enter(&mut self, timeout: Option<Duration>) -> GridResult<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let timeout_ms = timeout.map(|t| t.as_millis() as u64).unwrap_or(0);

        // Claim phase: take one slot in a round that is not full and not
        // draining.
        let my_round = loop {
            let (round, entered, leaving) = self.current().await?.ok_or_else(|| self.gone())?;
            if leaving == 0 && entered < self.parties {
                let claimed = sqlx::query(
                    "UPDATE grid_barriers SET entered = entered + 1
                     WHERE path = $1 AND round = $2 AND entered = $3",
                )
                .bind(&self.path)
                .bind(round)
                .bind(entered)
                .execute(&self.pool)
                .await?;
                if claimed.rows_affected() == 1 {
                    debug!("entered barrier {} round {round} as #{}", self.path, entered);
                    break round;
                }
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(GridError::timeout("barrier enter", timeout_ms));
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        };

        // Wait-full phase: block until the claimed round has all parties.
        loop {
            match self.current().await? {
                Some((round, entered, _)) if round > my_round || entered >= self.parties => {
                    self.round = Some(my_round);
                    return Ok(());
                }
                Some(_) => {}
                None => return Err(self.gone()),
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    // Give the slot back unless the round filled concurrently.
                    let unclaimed = sqlx::query(
                        "UPDATE grid_barriers SET entered = entered - 1
                         WHERE path = $1 AND round = $2 AND entered < $3",
                    )
                    .bind(&self.path)
                    .bind(my_round)
                    .bind(self.parties)
                    .execute(&self.pool)
                    .await?;
                    if unclaimed.rows_affected() == 0 {
                        self.round = Some(my_round);
                        return Ok(());
                    }
                    return Err(GridError::timeout("barrier enter", timeout_ms));
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Leave the barrier. The last leaver advances the round; everyone else
    /// blocks until it does, so the next round starts from a clean row.
    pub async fn leave(&mut self) -> GridResult<()> {
        let my_round = self.round.take().ok_or_else(|| {
            GridError::internal(format!("leave before enter on barrier {}", self.path))
        })?;

        let left: i64 = sqlx::query(
            "UPDATE grid_barriers SET leaving = leaving + 1
             WHERE path = $1 AND round = $2
             RETURNING leaving",
        )
        .bind(&self.path)
        .bind(my_round)
        .fetch_one(&self.pool)
        .await?
        .get("leaving");

        if left == self.parties {
            sqlx::query(
                "UPDATE grid_barriers SET round = round + 1, entered = 0, leaving = 0
                 WHERE path = $1 AND round = $2",
            )
            .bind(&self.path)
            .bind(my_round)
            .execute(&self.pool)
            .await?;
            debug!("barrier {} round {my_round} drained", self.path);
            return Ok(());
        }

        loop {
            match self.current().await? {
                Some((round, _, _)) if round > my_round => return Ok(()),
                Some(_) => {}
                None => return Err(self.gone()),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
