use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use hitrank_adapters::{DescriptionGenerator, UpstreamProvider};
use hitrank_core::{competition_ranks, sort_by_metric_desc, RawRecord, Record, SeasonLine};
use hitrank_storage::{RecordStore, RecordTx, StoreError};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::locks::YearLocks;
use crate::ranks::rerank_in;
use crate::{rollback_quietly, EngineError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetched: usize,
    pub inserted: usize,
    pub skipped: usize,
    pub description_failures: usize,
    /// Years that received inserts and were re-ranked.
    pub years: Vec<i32>,
}

/// Group coerced lines by year and assign competition ranks within each group.
///
/// Each group is stable-sorted by descending hits, so tied lines keep their
/// batch order.
pub fn rank_batch(lines: Vec<SeasonLine>) -> BTreeMap<i32, Vec<(SeasonLine, i32)>> {
    let mut by_year: BTreeMap<i32, Vec<SeasonLine>> = BTreeMap::new();
    for line in lines {
        by_year.entry(line.year).or_default().push(line);
    }

    by_year
        .into_iter()
        .map(|(year, mut group)| {
            sort_by_metric_desc(&mut group, |l| l.hits);
            let ranks = competition_ranks(&group, |l| l.hits);
            (year, group.into_iter().zip(ranks).collect())
        })
        .collect()
}

/// Additive-only merge of upstream batches into the record store.
pub struct Reconciler {
    store: Arc<dyn RecordStore>,
    describer: Arc<dyn DescriptionGenerator>,
    locks: Arc<YearLocks>,
    gate: Mutex<()>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn RecordStore>,
        describer: Arc<dyn DescriptionGenerator>,
        locks: Arc<YearLocks>,
    ) -> Self {
        Self {
            store,
            describer,
            locks,
            gate: Mutex::new(()),
        }
    }

    /// Fetch the full batch from `upstream`, then reconcile it. A fetch
    /// failure returns before anything is written.
    pub async fn reconcile_from(
        &self,
        upstream: &dyn UpstreamProvider,
    ) -> Result<ReconcileSummary, EngineError> {
        let raw = upstream
            .fetch_all()
            .await
            .map_err(EngineError::UpstreamFetch)?;
        info!(source = upstream.source_id(), count = raw.len(), "upstream batch received");
        self.reconcile(&raw).await
    }

    async fn is_stored(&self, id: i64) -> Result<bool, EngineError> {
        let existing = self.store.get_by_id(id).await.map_err(EngineError::Read)?;
        Ok(existing.is_some())
    }

    pub async fn reconcile(&self, raw: &[RawRecord]) -> Result<ReconcileSummary, EngineError> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let lines = raw
            .iter()
            .map(RawRecord::coerce)
            .collect::<Result<Vec<_>, _>>()?;
        let ranked = rank_batch(lines);

        let mut seen = HashSet::new();
        let mut pending = Vec::new();
        let mut skipped = 0usize;
        for (line, rank) in ranked.into_values().flatten() {
            if !seen.insert(line.id) {
                debug!(id = line.id, "duplicate id within batch; skipping");
                skipped += 1;
                continue;
            }
            if self.is_stored(line.id).await? {
                info!(id = line.id, player = %line.player_name, "record already stored; leaving as is");
                skipped += 1;
                continue;
            }
            pending.push((line, rank));
        }

        // Descriptions are generated before any lock is taken.
        let mut described = Vec::with_capacity(pending.len());
        for (line, rank) in pending {
            let description = match self.describer.synthesize(&line.subject()).await {
                Ok(text) => Some(text),
                Err(err) => {
                    warn!(id = line.id, error = %err, "description generation failed; inserting without one");
                    None
                }
            };
            described.push(Record::from_line(line, rank, description));
        }

        let _gate = self.gate.lock().await;
        let _years = self
            .locks
            .acquire(described.iter().map(|r| r.year))
            .await;

        // Another run may have stored some of these while we were generating.
        let mut inserts = Vec::with_capacity(described.len());
        for record in described {
            if self.is_stored(record.id).await? {
                debug!(id = record.id, "stored concurrently; skipping");
                skipped += 1;
                continue;
            }
            info!(id = record.id, player = %record.player_name, rank = record.rank, "new record");
            inserts.push(record);
        }
        let description_failures = inserts.iter().filter(|r| r.description.is_none()).count();

        let years: BTreeSet<i32> = inserts.iter().map(|r| r.year).collect();
        if !inserts.is_empty() {
            let mut tx = self.store.begin().await.map_err(EngineError::Write)?;
            if let Err(err) = write_batch(tx.as_mut(), &inserts, &years).await {
                rollback_quietly(tx, "reconcile batch").await;
                return Err(EngineError::Write(err));
            }
            tx.commit().await.map_err(EngineError::Write)?;
        }

        let summary = ReconcileSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            fetched: raw.len(),
            inserted: inserts.len(),
            skipped,
            description_failures,
            years: years.into_iter().collect(),
        };
        info!(
            %run_id,
            fetched = summary.fetched,
            inserted = summary.inserted,
            skipped = summary.skipped,
            "reconciliation committed"
        );
        Ok(summary)
    }
}

async fn write_batch(
    tx: &mut dyn RecordTx,
    inserts: &[Record],
    years: &BTreeSet<i32>,
) -> Result<(), StoreError> {
    for record in inserts {
        tx.insert(record).await?;
    }
    for year in years {
        rerank_in(tx, *year).await?;
    }
    Ok(())
}
