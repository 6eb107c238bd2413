use std::collections::BTreeSet;
use std::sync::Arc;

use hitrank_adapters::DescriptionGenerator;
use hitrank_core::{DescriptionRequest, Record, RecordPatch};
use hitrank_storage::RecordStore;
use tracing::{debug, info, warn};

use crate::locks::YearLocks;
use crate::ranks::RankMaintainer;
use crate::{rollback_quietly, EngineError};

/// Read, edit and describe individual records.
pub struct RecordService {
    store: Arc<dyn RecordStore>,
    describer: Arc<dyn DescriptionGenerator>,
    locks: Arc<YearLocks>,
    ranks: Arc<RankMaintainer>,
}

impl RecordService {
    pub fn new(
        store: Arc<dyn RecordStore>,
        describer: Arc<dyn DescriptionGenerator>,
        locks: Arc<YearLocks>,
        ranks: Arc<RankMaintainer>,
    ) -> Self {
        Self {
            store,
            describer,
            locks,
            ranks,
        }
    }

    pub async fn list_records(&self) -> Result<Vec<Record>, EngineError> {
        let records = self.store.list_all().await.map_err(EngineError::Read)?;
        info!(count = records.len(), "listing records");
        Ok(records)
    }

    async fn load(&self, id: i64) -> Result<Record, EngineError> {
        self.store
            .get_by_id(id)
            .await
            .map_err(EngineError::Read)?
            .ok_or(EngineError::NotFound(id))
    }

    /// Fetch one record, filling in a missing description on the way out.
    ///
    /// Only the description column is written, and only while it is still
    /// empty; a description committed meanwhile by an edit wins. When
    /// generation fails the record is returned as stored.
    pub async fn get_record(&self, id: i64) -> Result<Record, EngineError> {
        let record = self.load(id).await?;
        if record.has_description() {
            return Ok(record);
        }

        info!(id, player = %record.player_name, "generating missing description");
        let text = match self.describer.synthesize(&record.subject()).await {
            Ok(text) => text,
            Err(err) => {
                warn!(id, error = %err, "description generation failed; returning record without one");
                return Ok(record);
            }
        };

        let mut tx = self.store.begin().await.map_err(EngineError::Write)?;
        match tx.fill_description(id, &text).await {
            Ok(true) => {
                tx.commit().await.map_err(EngineError::Write)?;
                self.load(id).await
            }
            Ok(false) => {
                debug!(id, "description written concurrently; keeping the stored one");
                rollback_quietly(tx, "description fill").await;
                self.load(id).await
            }
            Err(err) => {
                rollback_quietly(tx, "description fill").await;
                Err(EngineError::Write(err))
            }
        }
    }

    /// Partial update of an existing record.
    ///
    /// The description is always regenerated from the updated fields. Once the
    /// edit commits, the record's year is re-ranked, and so is its previous year
    /// when the edit moved it.
    pub async fn edit_record(&self, id: i64, patch: &RecordPatch) -> Result<Record, EngineError> {
        let (mut updated, previous_year, _guard) = loop {
            let seen = self.load(id).await?;
            let mut candidate = seen.clone();
            patch.apply_to(&mut candidate)?;

            let guard = self.locks.acquire([seen.year, candidate.year]).await;
            let current = self.load(id).await?;
            if current.year != seen.year {
                // moved to another year while we waited; lock that one instead
                continue;
            }
            let mut updated = current.clone();
            patch.apply_to(&mut updated)?;
            break (updated, current.year, guard);
        };

        info!(id, ?patch, "applying edit");
        updated.description = match self.describer.synthesize(&updated.subject()).await {
            Ok(text) => Some(text),
            Err(err) => {
                warn!(id, error = %err, "description regeneration failed; clearing description");
                None
            }
        };

        let mut tx = self.store.begin().await.map_err(EngineError::Write)?;
        if let Err(err) = tx.update(&updated).await {
            rollback_quietly(tx, "record edit").await;
            return Err(EngineError::Write(err));
        }
        tx.commit().await.map_err(EngineError::Write)?;
        info!(id, year = updated.year, hits = updated.hits, "edit committed");

        let years: BTreeSet<i32> = [previous_year, updated.year].into_iter().collect();
        for year in years {
            self.ranks.recalculate_held(year).await?;
        }

        self.load(id).await
    }

    /// Describe an arbitrary player without touching the store. Unlike the
    /// other paths, generation failure is returned to the caller.
    pub async fn generate_description(&self, request: DescriptionRequest) -> Result<String, EngineError> {
        let subject = request.into_subject()?;
        let description = self.describer.synthesize(&subject).await?;
        Ok(description)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use hitrank_adapters::{DisabledDescriber, GenerationError, TemplateDescriber};
    use hitrank_core::{DescriptionSubject, LooseInt, ValidationError};
    use hitrank_storage::{MemoryRecordStore, StoreError};
    use tokio::sync::Notify;

    use crate::ranks::rerank_in;

    #[derive(Default)]
    struct CountingDescriber {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DescriptionGenerator for CountingDescriber {
        async fn synthesize(&self, subject: &DescriptionSubject) -> Result<String, GenerationError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("{} #{n}", subject.player_name))
        }
    }

    /// Holds its first call open until released, so a read's description
    /// can still be in flight while an edit commits.
    #[derive(Default)]
    struct HeldFirstCall {
        calls: AtomicUsize,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl DescriptionGenerator for HeldFirstCall {
        async fn synthesize(&self, subject: &DescriptionSubject) -> Result<String, GenerationError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                self.entered.notify_one();
                self.release.notified().await;
            }
            Ok(format!("{} hits={}", subject.player_name, subject.hits))
        }
    }

    fn record(id: i64, hits: i32, year: i32, rank: i32) -> Record {
        Record {
            id,
            rank,
            player_name: format!("player-{id}"),
            age: 27,
            hits,
            year,
            bats: "R".into(),
            description: None,
        }
    }

    fn service(store: &MemoryRecordStore, describer: Arc<dyn DescriptionGenerator>) -> RecordService {
        let store: Arc<dyn RecordStore> = Arc::new(store.clone());
        let locks = Arc::new(YearLocks::new());
        let ranks = Arc::new(RankMaintainer::new(Arc::clone(&store), Arc::clone(&locks)));
        RecordService::new(store, describer, locks, ranks)
    }

    fn hits_patch(hits: i64) -> RecordPatch {
        RecordPatch {
            hits: Some(LooseInt::Int(hits)),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn lazy_fill_writes_once_and_then_reads_stable() {
        let store = MemoryRecordStore::with_records([record(1, 203, 2017, 1)]);
        let describer = Arc::new(CountingDescriber::default());
        let records = service(&store, describer.clone());

        let first = records.get_record(1).await.unwrap();
        let second = records.get_record(1).await.unwrap();

        assert_eq!(first.description.as_deref(), Some("player-1 #1"));
        assert_eq!(second.description, first.description);
        assert_eq!(describer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.get_by_id(1).await.unwrap().unwrap().description, first.description);
    }

    #[tokio::test]
    async fn lazy_fill_during_rerank_keeps_both_writes() {
        let store = MemoryRecordStore::with_records([record(1, 203, 2017, 2), record(2, 190, 2017, 1)]);
        let records = service(&store, Arc::new(TemplateDescriber));

        let mut rerank = store.begin().await.unwrap();
        let update = rerank_in(rerank.as_mut(), 2017).await.unwrap();
        assert_eq!(update.changed, 2);

        let filled = records.get_record(1).await.unwrap();
        assert!(filled.has_description());
        rerank.commit().await.unwrap();

        let stored = store.get_by_id(1).await.unwrap().unwrap();
        assert_eq!(stored.rank, 1);
        assert_eq!(stored.description, filled.description);
        assert_eq!(store.get_by_id(2).await.unwrap().unwrap().rank, 2);
    }

    #[tokio::test]
    async fn edit_during_lazy_fill_keeps_the_edited_description() {
        let store = MemoryRecordStore::with_records([record(1, 100, 2017, 1)]);
        let describer = Arc::new(HeldFirstCall::default());
        let records = Arc::new(service(&store, describer.clone()));

        let reader = tokio::spawn({
            let records = Arc::clone(&records);
            async move { records.get_record(1).await }
        });
        describer.entered.notified().await;

        let edited = records.edit_record(1, &hits_patch(250)).await.unwrap();
        assert_eq!(edited.description.as_deref(), Some("player-1 hits=250"));

        describer.release.notify_one();
        let read = reader.await.unwrap().unwrap();
        assert_eq!(read.description.as_deref(), Some("player-1 hits=250"));

        let stored = store.get_by_id(1).await.unwrap().unwrap();
        assert_eq!(stored.hits, 250);
        assert_eq!(stored.description.as_deref(), Some("player-1 hits=250"));
    }

    #[tokio::test]
    async fn lazy_fill_failure_returns_record_unchanged() {
        let store = MemoryRecordStore::with_records([record(1, 203, 2017, 1)]);
        let fetched = service(&store, Arc::new(DisabledDescriber)).get_record(1).await.unwrap();
        assert_eq!(fetched, record(1, 203, 2017, 1));
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let store = MemoryRecordStore::new();
        let records = service(&store, Arc::new(TemplateDescriber));
        assert!(matches!(records.get_record(42).await, Err(EngineError::NotFound(42))));
        assert!(matches!(
            records.edit_record(42, &hits_patch(1)).await,
            Err(EngineError::NotFound(42))
        ));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn edit_to_a_tie_shares_rank() {
        let store = MemoryRecordStore::with_records([
            record(1, 203, 2017, 1),
            record(2, 190, 2017, 2),
            record(3, 180, 2017, 3),
        ]);
        let records = service(&store, Arc::new(TemplateDescriber));

        let edited = records.edit_record(3, &hits_patch(203)).await.unwrap();
        assert_eq!(edited.rank, 1);
        assert_eq!(store.get_by_id(1).await.unwrap().unwrap().rank, 1);
        assert_eq!(store.get_by_id(2).await.unwrap().unwrap().rank, 3);
    }

    #[tokio::test]
    async fn edit_always_regenerates_description() {
        let mut original = record(1, 203, 2017, 1);
        original.description = Some("stale".into());
        let store = MemoryRecordStore::with_records([original]);
        let describer = Arc::new(CountingDescriber::default());
        let records = service(&store, describer.clone());

        let patch = RecordPatch {
            player_name: Some("Renamed".into()),
            ..Default::default()
        };
        let edited = records.edit_record(1, &patch).await.unwrap();
        assert_eq!(edited.player_name, "Renamed");
        assert_eq!(edited.description.as_deref(), Some("Renamed #1"));
        assert_eq!(edited.hits, 203);
    }

    #[tokio::test]
    async fn moving_years_reranks_both_years() {
        let store = MemoryRecordStore::with_records([
            record(1, 240, 1930, 1),
            record(2, 230, 1930, 2),
            record(3, 220, 1930, 3),
            record(4, 250, 1931, 1),
        ]);
        let records = service(&store, Arc::new(TemplateDescriber));

        let patch = RecordPatch {
            year: Some(LooseInt::Int(1931)),
            hits: Some(LooseInt::Int(260)),
            ..Default::default()
        };
        records.edit_record(1, &patch).await.unwrap();

        let ranks: Vec<_> = store
            .list_all()
            .await
            .unwrap()
            .into_iter()
            .map(|r| (r.id, r.year, r.rank))
            .collect();
        assert_eq!(ranks, vec![(1, 1931, 1), (2, 1930, 1), (3, 1930, 2), (4, 1931, 2)]);
    }

    #[tokio::test]
    async fn failed_edit_commit_rolls_back_all_fields() {
        let store = MemoryRecordStore::with_records([record(1, 203, 2017, 1), record(2, 190, 2017, 2)]);
        store.reject_next_commits(1);
        let records = service(&store, Arc::new(TemplateDescriber));

        let err = records.edit_record(2, &hits_patch(250)).await.unwrap_err();
        assert!(matches!(err, EngineError::Write(StoreError::CommitRejected(_))));
        assert_eq!(store.get_by_id(2).await.unwrap().unwrap(), record(2, 190, 2017, 2));
        assert_eq!(store.get_by_id(1).await.unwrap().unwrap().rank, 1);
    }

    #[tokio::test]
    async fn invalid_patch_is_a_validation_error() {
        let store = MemoryRecordStore::with_records([record(1, 203, 2017, 1)]);
        let records = service(&store, Arc::new(TemplateDescriber));
        let err = records.edit_record(1, &hits_patch(-5)).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::OutOfRange { field: "hits", .. })
        ));
    }

    #[tokio::test]
    async fn direct_generation_surfaces_failures() {
        let store = MemoryRecordStore::new();
        let request = DescriptionRequest {
            player_name: Some("Wade Boggs".into()),
            hits: Some("240".into()),
            year: Some(LooseInt::Int(1985)),
            age: Some(LooseInt::Int(27)),
            bats: Some("L".into()),
        };

        let ok = service(&store, Arc::new(TemplateDescriber))
            .generate_description(request.clone())
            .await
            .unwrap();
        assert!(ok.starts_with("Wade Boggs"));

        let err = service(&store, Arc::new(DisabledDescriber))
            .generate_description(request)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Generation(GenerationError::NotConfigured)));

        let err = service(&store, Arc::new(TemplateDescriber))
            .generate_description(DescriptionRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(ValidationError::MissingFields(_))));
    }
}
