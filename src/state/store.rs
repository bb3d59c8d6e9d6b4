use super::SubsystemStatus;
use crate::core::{Result, RunNumber, ShuttleError, ValidityRange};
use crate::store::{ObjectMetadata, ObjectPath, ObjectStore, StorageKind, StoredObject};
use std::sync::Arc;

const STATUS_ROOT: &str = "SHUTTLE";

/// Status records in the local store.
///
/// Each transition is written as a new version valid for the single run, so
/// the history of a (run, subsystem) pair is never overwritten. Every pair
/// has its own path, so a write only scans that pair's history.
#[derive(Clone)]
pub struct StatusStore {
    store: Arc<dyn ObjectStore>,
}

impl StatusStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    fn path(run: RunNumber, subsystem: &str) -> Result<ObjectPath> {
        ObjectPath::parse(&format!("{}/{}/Run{}", STATUS_ROOT, subsystem, run))
    }

    pub async fn load(&self, run: RunNumber, subsystem: &str) -> Result<Option<SubsystemStatus>> {
        let path = Self::path(run, subsystem)?;
        match self.store.get(&path, run).await? {
            Some(object) => Ok(Some(decode(&object)?)),
            None => Ok(None),
        }
    }

    pub async fn save(&self, run: RunNumber, subsystem: &str, status: &SubsystemStatus) -> Result<()> {
        let object = StoredObject::new(
            Self::path(run, subsystem)?,
            ValidityRange::single(run),
            ObjectMetadata::new(subsystem, run, StorageKind::Status)
                .comment(status.state.ledger_label()),
            serde_json::to_vec(status)?,
        );
        self.store.put(&object).await?;
        Ok(())
    }

    /// Every recorded transition of (run, subsystem), oldest first.
    pub async fn history(&self, run: RunNumber, subsystem: &str) -> Result<Vec<SubsystemStatus>> {
        let path = Self::path(run, subsystem)?;
        let mut headers = self
            .store
            .list_valid(&path, &ValidityRange::single(run))
            .await?;
        headers.sort_by_key(|header| header.id.version);

        let mut history = Vec::with_capacity(headers.len());
        for header in headers {
            let object = self.store.load(&header.id).await?;
            history.push(decode(&object)?);
        }
        Ok(history)
    }
}

fn decode(object: &StoredObject) -> Result<SubsystemStatus> {
    serde_json::from_slice(&object.payload).map_err(|err| {
        ShuttleError::Store(format!("corrupt status record {}: {}", object.id, err))
    })
}
