use super::{FileObjectStore, ObjectHeader, ObjectId, ObjectStore, StorageKind, StoredObject};
use crate::config::StorePaths;
use crate::core::{Result, RunNumber, ShuttleError};
use std::sync::Arc;
use tracing::{Instrument, Level, event, info_span};

/// Where a commit ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Primary(ObjectId),
    /// Primary rejected the write; the object waits in the local store.
    LocalFallback(ObjectId),
}

impl CommitOutcome {
    pub fn used_fallback(&self) -> bool {
        matches!(self, Self::LocalFallback(_))
    }

    pub fn id(&self) -> &ObjectId {
        match self {
            Self::Primary(id) | Self::LocalFallback(id) => id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// An open-ended primary object exists and this run is not the oldest
    /// unresolved one.
    Stale,
    /// A primary object already covers part of the range: one starting later
    /// for a finite range, any overlapping one for an open-ended range.
    Superseded,
    /// Left behind by an earlier attempt of the same run.
    Abandoned,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub promoted: Vec<ObjectId>,
    pub discarded: Vec<(ObjectId, DiscardReason)>,
    /// Open-ended objects held back until the run becomes the oldest unresolved.
    pub deferred: Vec<ObjectId>,
    pub failed: Vec<(ObjectId, String)>,
}

impl ReconcileReport {
    /// Every local object was promoted or discarded.
    pub fn is_complete(&self) -> bool {
        self.deferred.is_empty() && self.failed.is_empty()
    }
}

enum Resolution {
    AlreadyPromoted,
    Discard(DiscardReason),
    Defer,
    Promote,
}

/// Dual-store commit path shared by plugins (commit) and the coordinator
/// (reconciliation).
#[derive(Clone)]
pub struct ObjectStoreGateway {
    primary: Arc<dyn ObjectStore>,
    reference: Arc<dyn ObjectStore>,
    local: Arc<dyn ObjectStore>,
}

impl ObjectStoreGateway {
    pub fn new(
        primary: Arc<dyn ObjectStore>,
        reference: Arc<dyn ObjectStore>,
        local: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            primary,
            reference,
            local,
        }
    }

    /// Directory-backed stores at the configured roots.
    pub fn open(paths: &StorePaths) -> Self {
        Self::new(
            Arc::new(FileObjectStore::new("primary", &paths.primary)),
            Arc::new(FileObjectStore::new("reference", &paths.reference)),
            Arc::new(FileObjectStore::new("local", &paths.local)),
        )
    }

    pub fn local(&self) -> &Arc<dyn ObjectStore> {
        &self.local
    }

    pub fn primary(&self) -> &Arc<dyn ObjectStore> {
        &self.primary
    }

    pub fn reference(&self) -> &Arc<dyn ObjectStore> {
        &self.reference
    }

    fn target_for(&self, kind: StorageKind) -> Result<&Arc<dyn ObjectStore>> {
        match kind {
            StorageKind::Conditions => Ok(&self.primary),
            StorageKind::Reference => Ok(&self.reference),
            StorageKind::Status => Err(ShuttleError::Store(
                "status records are kept in the local store only".to_string(),
            )),
        }
    }

    /// Put to the primary (or reference) store, falling back to the local store.
    ///
    /// Fails only when both stores reject the object.
    pub async fn commit(&self, object: &StoredObject) -> Result<CommitOutcome> {
        let target = self.target_for(object.metadata.kind)?;
        let primary_err = match target.put(object).await {
            Ok(id) => {
                event!(Level::DEBUG, store = target.name(), id = %id, "object committed");
                return Ok(CommitOutcome::Primary(id));
            }
            Err(err) => err,
        };

        event!(
            Level::WARN,
            store = target.name(),
            path = %object.id.path,
            error = %primary_err,
            "primary commit failed, using local fallback"
        );

        match self.local.put(object).await {
            Ok(id) => Ok(CommitOutcome::LocalFallback(id)),
            Err(local_err) => Err(ShuttleError::Store(format!(
                "{} rejected {} ({}); local fallback failed too: {}",
                target.name(),
                object.id.path,
                primary_err,
                local_err
            ))),
        }
    }

    /// Objects of `subsystem` produced by `run` that only exist locally.
    pub async fn local_objects(&self, run: RunNumber, subsystem: &str) -> Result<Vec<ObjectHeader>> {
        let headers = self.local.list(subsystem).await?;
        Ok(headers
            .into_iter()
            .filter(|header| {
                header.metadata.kind != StorageKind::Status
                    && header.metadata.subsystem == subsystem
                    && header.metadata.producer_run == run
            })
            .collect())
    }

    fn resolve(local: &ObjectHeader, primary: &[ObjectHeader], oldest_unresolved: bool) -> Resolution {
        let range = &local.id.validity;

        let already = primary.iter().any(|candidate| {
            candidate.id.validity == *range
                && candidate.metadata.producer_run == local.metadata.producer_run
                && candidate.metadata.created_at == local.metadata.created_at
        });
        if already {
            return Resolution::AlreadyPromoted;
        }

        if !oldest_unresolved && primary.iter().any(|candidate| candidate.id.validity.is_infinite()) {
            return Resolution::Discard(DiscardReason::Stale);
        }

        if range.is_infinite() && !oldest_unresolved {
            return Resolution::Defer;
        }

        let superseded = if range.is_infinite() {
            !primary.is_empty()
        } else {
            primary
                .iter()
                .any(|candidate| candidate.id.validity.first > range.first)
        };
        if superseded {
            return Resolution::Discard(DiscardReason::Superseded);
        }

        Resolution::Promote
    }

    /// Drop every local-only object of (`run`, `subsystem`).
    pub async fn discard_local(&self, run: RunNumber, subsystem: &str) -> Result<Vec<ObjectId>> {
        let mut discarded = Vec::new();
        for local in self.local_objects(run, subsystem).await? {
            self.local.remove(&local.id).await?;
            discarded.push(local.id);
        }
        if !discarded.is_empty() {
            event!(Level::INFO, run, subsystem, count = discarded.len(), "local output discarded");
        }
        Ok(discarded)
    }

    /// Promote, discard or defer every local-only object of (`run`, `subsystem`).
    ///
    /// Only objects produced by `attempt` are candidates; leftovers of other
    /// attempts are removed. `oldest_unresolved` tells whether `run` is the
    /// earliest run that still has `subsystem` unresolved. Failures are
    /// collected, not returned, so one bad object does not block the others.
    pub async fn reconcile(
        &self,
        run: RunNumber,
        subsystem: &str,
        attempt: u32,
        oldest_unresolved: bool,
    ) -> Result<ReconcileReport> {
        let span = info_span!("shuttle.reconcile", run, subsystem, attempt);
        async move {
            let mut report = ReconcileReport::default();

            for local in self.local_objects(run, subsystem).await? {
                let id = local.id.clone();
                if local.metadata.producer_attempt() != Some(attempt) {
                    event!(
                        Level::INFO,
                        id = %id,
                        producer_attempt = ?local.metadata.producer_attempt(),
                        "discarding output of an earlier attempt"
                    );
                    self.local.remove(&id).await?;
                    report.discarded.push((id, DiscardReason::Abandoned));
                    continue;
                }
                let target = self.target_for(local.metadata.kind)?;

                let primary = match target.list_valid(&id.path, &id.validity).await {
                    Ok(headers) => headers,
                    Err(err) => {
                        report.failed.push((id, err.to_string()));
                        continue;
                    }
                };

                match Self::resolve(&local, &primary, oldest_unresolved) {
                    Resolution::AlreadyPromoted => {
                        self.local.remove(&id).await?;
                        report.promoted.push(id);
                    }
                    Resolution::Discard(reason) => {
                        event!(Level::INFO, id = %id, ?reason, "discarding local object");
                        self.local.remove(&id).await?;
                        report.discarded.push((id, reason));
                    }
                    Resolution::Defer => {
                        event!(
                            Level::INFO,
                            id = %id,
                            "open-ended object waits for run to become oldest unresolved"
                        );
                        report.deferred.push(id);
                    }
                    Resolution::Promote => {
                        let object = self.local.load(&id).await?;
                        match target.put(&object).await {
                            Ok(promoted) => {
                                self.local.remove(&id).await?;
                                event!(Level::INFO, id = %promoted, "local object promoted");
                                report.promoted.push(promoted);
                            }
                            Err(err) => {
                                event!(Level::WARN, id = %id, error = %err, "promotion failed");
                                report.failed.push((id, err.to_string()));
                            }
                        }
                    }
                }
            }

            Ok(report)
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{RunBound, ValidityRange};
    use crate::store::{FileObjectStore, ObjectMetadata, ObjectPath};
    use async_trait::async_trait;
    use tempfile::{TempDir, tempdir};

    struct Unreachable;

    #[async_trait]
    impl ObjectStore for Unreachable {
        fn name(&self) -> &str {
            "unreachable"
        }
        async fn put(&self, _object: &StoredObject) -> Result<ObjectId> {
            Err(ShuttleError::Store("connection refused".into()))
        }
        async fn get(&self, _path: &ObjectPath, _run: RunNumber) -> Result<Option<StoredObject>> {
            Err(ShuttleError::Store("connection refused".into()))
        }
        async fn list(&self, _prefix: &str) -> Result<Vec<ObjectHeader>> {
            Err(ShuttleError::Store("connection refused".into()))
        }
        async fn load(&self, _id: &ObjectId) -> Result<StoredObject> {
            Err(ShuttleError::Store("connection refused".into()))
        }
        async fn remove(&self, _id: &ObjectId) -> Result<()> {
            Err(ShuttleError::Store("connection refused".into()))
        }
    }

    fn stores(dir: &TempDir) -> (Arc<FileObjectStore>, Arc<FileObjectStore>, Arc<FileObjectStore>) {
        (
            Arc::new(FileObjectStore::new("primary", dir.path().join("primary"))),
            Arc::new(FileObjectStore::new("reference", dir.path().join("reference"))),
            Arc::new(FileObjectStore::new("local", dir.path().join("local"))),
        )
    }

    fn gain(run: RunNumber, validity: ValidityRange) -> StoredObject {
        StoredObject::new(
            ObjectPath::parse("TPC/Calib/Gain").unwrap(),
            validity,
            ObjectMetadata::new("TPC", run, StorageKind::Conditions)
                .comment("gain map")
                .attempt(1),
            format!("gain-{}", run).into_bytes(),
        )
    }

    #[tokio::test]
    async fn test_commit_prefers_primary() {
        let dir = tempdir().unwrap();
        let (primary, reference, local) = stores(&dir);
        let gateway = ObjectStoreGateway::new(primary.clone(), reference, local.clone());

        let outcome = gateway.commit(&gain(10, ValidityRange::single(10))).await.unwrap();
        assert!(!outcome.used_fallback());
        assert_eq!(primary.list("").await.unwrap().len(), 1);
        assert!(local.list("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_commit_falls_back_then_reconciles() {
        let dir = tempdir().unwrap();
        let (primary, reference, local) = stores(&dir);

        let offline = ObjectStoreGateway::new(Arc::new(Unreachable), reference.clone(), local.clone());
        let object = gain(10, ValidityRange::single(10));
        let outcome = offline.commit(&object).await.unwrap();
        assert!(outcome.used_fallback());

        let online = ObjectStoreGateway::new(primary.clone(), reference, local.clone());
        let report = online.reconcile(10, "TPC", 1, true).await.unwrap();
        assert!(report.is_complete());
        assert_eq!(report.promoted.len(), 1);

        assert!(local.list("").await.unwrap().is_empty());
        let promoted = primary.get(&object.id.path, 10).await.unwrap().unwrap();
        assert_eq!(promoted.metadata, object.metadata);
        assert_eq!(promoted.payload, object.payload);
    }

    #[tokio::test]
    async fn test_failed_promotion_keeps_local_copy() {
        let dir = tempdir().unwrap();
        let (_, reference, local) = stores(&dir);
        let gateway = ObjectStoreGateway::new(Arc::new(Unreachable), reference, local.clone());

        gateway.commit(&gain(10, ValidityRange::single(10))).await.unwrap();
        let report = gateway.reconcile(10, "TPC", 1, true).await.unwrap();

        assert!(!report.is_complete());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(local.list("").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_open_ended_object_waits_for_oldest_run() {
        let dir = tempdir().unwrap();
        let (primary, reference, local) = stores(&dir);
        let gateway = ObjectStoreGateway::new(primary.clone(), reference, local.clone());
        local.put(&gain(20, ValidityRange::open_ended(20))).await.unwrap();

        let report = gateway.reconcile(20, "TPC", 1, false).await.unwrap();
        assert_eq!(report.deferred.len(), 1);
        assert!(primary.list("").await.unwrap().is_empty());

        let report = gateway.reconcile(20, "TPC", 1, true).await.unwrap();
        assert!(report.is_complete());
        assert_eq!(report.promoted.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_and_superseded_objects_are_discarded() {
        let dir = tempdir().unwrap();
        let (primary, reference, local) = stores(&dir);
        let gateway = ObjectStoreGateway::new(primary.clone(), reference, local.clone());

        primary.put(&gain(15, ValidityRange::open_ended(15))).await.unwrap();
        local.put(&gain(20, ValidityRange::single(20))).await.unwrap();
        let report = gateway.reconcile(20, "TPC", 1, false).await.unwrap();
        assert_eq!(report.discarded[0].1, DiscardReason::Stale);

        primary
            .put(&gain(32, ValidityRange::new(32, RunBound::Finite(40)).unwrap()))
            .await
            .unwrap();
        local
            .put(&gain(30, ValidityRange::new(30, RunBound::Finite(35)).unwrap()))
            .await
            .unwrap();
        let report = gateway.reconcile(30, "TPC", 1, true).await.unwrap();
        assert_eq!(report.discarded[0].1, DiscardReason::Superseded);
        assert!(local.list("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_ended_object_overlapping_earlier_primary_is_discarded() {
        let dir = tempdir().unwrap();
        let (primary, reference, local) = stores(&dir);
        let gateway = ObjectStoreGateway::new(primary.clone(), reference, local.clone());

        primary
            .put(&gain(5, ValidityRange::new(5, RunBound::Finite(15)).unwrap()))
            .await
            .unwrap();
        local.put(&gain(10, ValidityRange::open_ended(10))).await.unwrap();

        let report = gateway.reconcile(10, "TPC", 1, true).await.unwrap();
        assert!(report.promoted.is_empty());
        assert_eq!(report.discarded.len(), 1);
        assert_eq!(report.discarded[0].1, DiscardReason::Superseded);
        assert_eq!(primary.list("").await.unwrap().len(), 1);
        assert!(local.list("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_only_the_reconciled_attempt_is_promoted() {
        let dir = tempdir().unwrap();
        let (primary, reference, local) = stores(&dir);
        let offline = ObjectStoreGateway::new(Arc::new(Unreachable), reference.clone(), local.clone());

        let mut failed = gain(10, ValidityRange::single(10));
        failed.metadata = failed.metadata.attempt(1);
        offline.commit(&failed).await.unwrap();
        let mut retried = gain(10, ValidityRange::single(10));
        retried.metadata = retried.metadata.attempt(2);
        offline.commit(&retried).await.unwrap();

        let online = ObjectStoreGateway::new(primary.clone(), reference, local.clone());
        let report = online.reconcile(10, "TPC", 2, true).await.unwrap();
        assert!(report.is_complete());
        assert_eq!(report.promoted.len(), 1);
        assert_eq!(report.discarded.len(), 1);
        assert_eq!(report.discarded[0].1, DiscardReason::Abandoned);

        let promoted = primary.list("").await.unwrap();
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].metadata.producer_attempt(), Some(2));
        assert!(local.list("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_discard_local_leaves_other_runs_alone() {
        let dir = tempdir().unwrap();
        let (primary, reference, local) = stores(&dir);
        let gateway = ObjectStoreGateway::new(primary, reference, local.clone());

        local.put(&gain(10, ValidityRange::single(10))).await.unwrap();
        local.put(&gain(11, ValidityRange::single(11))).await.unwrap();

        let discarded = gateway.discard_local(10, "TPC").await.unwrap();
        assert_eq!(discarded.len(), 1);
        let remaining = local.list("").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].metadata.producer_run, 11);
    }

    #[tokio::test]
    async fn test_reference_objects_go_to_reference_store() {
        let dir = tempdir().unwrap();
        let (primary, reference, local) = stores(&dir);
        let gateway = ObjectStoreGateway::new(primary.clone(), reference.clone(), local);

        let mut object = gain(10, ValidityRange::single(10));
        object.metadata.kind = StorageKind::Reference;
        gateway.commit(&object).await.unwrap();

        assert!(primary.list("").await.unwrap().is_empty());
        assert_eq!(reference.list("").await.unwrap().len(), 1);
    }
}
