use std::sync::Arc;

use hitrank_core::competition_ranks;
use hitrank_storage::{RecordStore, RecordTx, StoreError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::locks::YearLocks;
use crate::{rollback_quietly, EngineError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankUpdate {
    pub year: i32,
    pub examined: usize,
    pub changed: usize,
}

/// Re-rank every stored record of `year` inside `tx`, writing only the rank
/// column of rows whose rank changed. Rows come back from the store by
/// descending hits; ties keep the store's order.
pub async fn rerank_in(tx: &mut dyn RecordTx, year: i32) -> Result<RankUpdate, StoreError> {
    let mut rows = tx.list_by_year(year).await?;
    let ranks = competition_ranks(&rows, |r| r.hits);

    let mut changed = 0usize;
    for (row, rank) in rows.iter_mut().zip(ranks) {
        if row.rank != rank {
            debug!(id = row.id, from = row.rank, to = rank, "rank changed");
            tx.set_rank(row.id, rank).await?;
            row.rank = rank;
            changed += 1;
        }
    }

    Ok(RankUpdate {
        year,
        examined: rows.len(),
        changed,
    })
}

/// Keeps stored ranks consistent with stored hits, one year at a time.
pub struct RankMaintainer {
    store: Arc<dyn RecordStore>,
    locks: Arc<YearLocks>,
}

impl RankMaintainer {
    pub fn new(store: Arc<dyn RecordStore>, locks: Arc<YearLocks>) -> Self {
        Self { store, locks }
    }

    pub async fn recalculate_ranks(&self, year: i32) -> Result<RankUpdate, EngineError> {
        let _guard = self.locks.acquire([year]).await;
        self.recalculate_held(year).await
    }

    /// Caller must already hold the lock for `year`.
    pub(crate) async fn recalculate_held(&self, year: i32) -> Result<RankUpdate, EngineError> {
        let mut tx = self.store.begin().await.map_err(EngineError::Write)?;
        let update = match rerank_in(tx.as_mut(), year).await {
            Ok(update) => update,
            Err(err) => {
                rollback_quietly(tx, "rank recalculation").await;
                return Err(EngineError::Write(err));
            }
        };
        tx.commit().await.map_err(EngineError::Write)?;

        info!(
            year,
            examined = update.examined,
            changed = update.changed,
            "ranks recalculated"
        );
        Ok(update)
    }
}
