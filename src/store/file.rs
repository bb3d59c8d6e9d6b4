//! Directory-backed object store.
//!
//! Layout: `<root>/<A>/<B>/<C>/Run<first>_<last>_v<version>.json` holds the
//! header, the sibling `.bin` file the payload. The payload is published
//! before the header, so a visible header always has its payload.

use super::{ObjectHeader, ObjectId, ObjectPath, ObjectStore, StoredObject};
use crate::core::{Result, RunNumber, ShuttleError};
use async_trait::async_trait;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::sync::Mutex;

const HEADER_EXTENSION: &str = "json";
const PAYLOAD_EXTENSION: &str = "bin";
const MAX_VERSION_CLAIMS: u32 = 16;

pub struct FileObjectStore {
    name: String,
    root: PathBuf,
    put_lock: Mutex<()>,
}

impl FileObjectStore {
    pub fn new<P: AsRef<Path>>(name: &str, root: P) -> Self {
        Self {
            name: name.to_string(),
            root: root.as_ref().to_path_buf(),
            put_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir_for(&self, path: &ObjectPath) -> PathBuf {
        path.segments().fold(self.root.clone(), |dir, segment| dir.join(segment))
    }

    fn file_stem(id: &ObjectId) -> String {
        format!("Run{}_{}_v{}", id.validity.first, id.validity.last, id.version)
    }

    fn header_file(&self, id: &ObjectId) -> PathBuf {
        self.dir_for(&id.path)
            .join(Self::file_stem(id))
            .with_extension(HEADER_EXTENSION)
    }

    fn payload_file(&self, id: &ObjectId) -> PathBuf {
        self.dir_for(&id.path)
            .join(Self::file_stem(id))
            .with_extension(PAYLOAD_EXTENSION)
    }

    fn prefix_dir(&self, prefix: &str) -> Result<PathBuf> {
        let mut dir = self.root.clone();
        for segment in prefix.split('/').filter(|s| !s.is_empty()) {
            if segment == "." || segment == ".." {
                return Err(ShuttleError::InvalidPath(prefix.to_string()));
            }
            dir = dir.join(segment);
        }
        Ok(dir)
    }
}

/// Persist `bytes` next to `target` and publish it only if `target` is free.
fn write_noclobber(target: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = target
        .parent()
        .ok_or_else(|| std::io::Error::other("target has no parent directory"))?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist_noclobber(target).map_err(|err| err.error)?;
    Ok(())
}

fn read_headers_under(dir: &Path) -> Result<Vec<ObjectHeader>> {
    let mut headers = Vec::new();
    if !dir.exists() {
        return Ok(headers);
    }

    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in fs::read_dir(&current)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                pending.push(path);
                continue;
            }
            if path.extension().and_then(|ext| ext.to_str()) != Some(HEADER_EXTENSION) {
                continue;
            }
            let bytes = fs::read(&path)?;
            let header = serde_json::from_slice::<ObjectHeader>(&bytes).map_err(|err| {
                ShuttleError::Store(format!("parse header '{}': {}", path.display(), err))
            })?;
            headers.push(header);
        }
    }

    headers.sort_by(|a, b| {
        a.id.path
            .cmp(&b.id.path)
            .then(a.id.validity.first.cmp(&b.id.validity.first))
            .then(a.id.version.cmp(&b.id.version))
    });
    Ok(headers)
}

#[async_trait]
impl ObjectStore for FileObjectStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, object: &StoredObject) -> Result<ObjectId> {
        let _guard = self.put_lock.lock().await;

        let dir = self.dir_for(&object.id.path);
        let existing = {
            let dir = dir.clone();
            tokio::task::spawn_blocking(move || read_headers_under(&dir))
                .await
                .map_err(|err| ShuttleError::Store(format!("list task: {}", err)))??
        };
        let mut version = existing
            .iter()
            .filter(|header| header.id.path == object.id.path)
            .map(|header| header.id.version)
            .max()
            .unwrap_or(0)
            + 1;

        let payload = object.payload.clone();
        let mut claims = 0;
        loop {
            let id = ObjectId {
                path: object.id.path.clone(),
                validity: object.id.validity,
                version,
            };
            let header = ObjectHeader {
                id: id.clone(),
                metadata: object.metadata.clone(),
            };
            let header_bytes = serde_json::to_vec_pretty(&header)?;
            let header_file = self.header_file(&id);
            let payload_file = self.payload_file(&id);
            let dir = dir.clone();
            let payload = payload.clone();

            let written = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
                fs::create_dir_all(&dir)?;
                write_noclobber(&payload_file, &payload)?;
                write_noclobber(&header_file, &header_bytes)
            })
            .await
            .map_err(|err| ShuttleError::Store(format!("write task: {}", err)))?;

            match written {
                Ok(()) => return Ok(id),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    claims += 1;
                    if claims >= MAX_VERSION_CLAIMS {
                        return Err(ShuttleError::Store(format!(
                            "{}: could not claim a version for {}",
                            self.name, object.id.path
                        )));
                    }
                    version += 1;
                }
                Err(err) => {
                    return Err(ShuttleError::Store(format!(
                        "{}: write {}: {}",
                        self.name, object.id.path, err
                    )));
                }
            }
        }
    }

    async fn get(&self, path: &ObjectPath, run: RunNumber) -> Result<Option<StoredObject>> {
        let dir = self.dir_for(path);
        let headers = tokio::task::spawn_blocking(move || read_headers_under(&dir))
            .await
            .map_err(|err| ShuttleError::Store(format!("list task: {}", err)))??;

        let newest = headers
            .into_iter()
            .filter(|header| header.id.path == *path && header.id.validity.contains(run))
            .max_by_key(|header| header.id.version);

        match newest {
            Some(header) => Ok(Some(self.load(&header.id).await?)),
            None => Ok(None),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectHeader>> {
        let dir = self.prefix_dir(prefix)?;
        let prefix = prefix.trim_end_matches('/').to_string();
        let headers = tokio::task::spawn_blocking(move || read_headers_under(&dir))
            .await
            .map_err(|err| ShuttleError::Store(format!("list task: {}", err)))??;
        Ok(headers
            .into_iter()
            .filter(|header| header.id.path.as_str().starts_with(&prefix))
            .collect())
    }

    async fn load(&self, id: &ObjectId) -> Result<StoredObject> {
        let header_file = self.header_file(id);
        let bytes = tokio::fs::read(&header_file).await.map_err(|err| {
            ShuttleError::Store(format!("{}: read {}: {}", self.name, id, err))
        })?;
        let header = serde_json::from_slice::<ObjectHeader>(&bytes)?;
        let payload = tokio::fs::read(self.payload_file(id)).await.map_err(|err| {
            ShuttleError::Store(format!("{}: read payload of {}: {}", self.name, id, err))
        })?;
        Ok(StoredObject {
            id: header.id,
            metadata: header.metadata,
            payload,
        })
    }

    async fn remove(&self, id: &ObjectId) -> Result<()> {
        let header_file = self.header_file(id);
        if header_file.exists() {
            tokio::fs::remove_file(&header_file).await?;
        }
        let payload_file = self.payload_file(id);
        if payload_file.exists() {
            tokio::fs::remove_file(&payload_file).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{RunBound, ValidityRange};
    use crate::store::{ObjectMetadata, StorageKind};
    use tempfile::tempdir;

    fn object(path: &str, validity: ValidityRange, payload: &[u8]) -> StoredObject {
        StoredObject::new(
            ObjectPath::parse(path).unwrap(),
            validity,
            ObjectMetadata::new("TPC", validity.first, StorageKind::Conditions),
            payload.to_vec(),
        )
    }

    #[tokio::test]
    async fn test_put_assigns_increasing_versions() {
        let dir = tempdir().unwrap();
        let store = FileObjectStore::new("primary", dir.path());

        let first = store
            .put(&object("TPC/Calib/Gain", ValidityRange::single(10), b"g1"))
            .await
            .unwrap();
        let second = store
            .put(&object("TPC/Calib/Gain", ValidityRange::open_ended(12), b"g2"))
            .await
            .unwrap();

        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
        assert_eq!(store.list("TPC").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_get_returns_newest_valid_version() {
        let dir = tempdir().unwrap();
        let store = FileObjectStore::new("primary", dir.path());
        let path = ObjectPath::parse("TPC/Calib/Gain").unwrap();

        store
            .put(&object("TPC/Calib/Gain", ValidityRange::open_ended(1), b"old"))
            .await
            .unwrap();
        store
            .put(&object(
                "TPC/Calib/Gain",
                ValidityRange::new(5, RunBound::Finite(9)).unwrap(),
                b"new",
            ))
            .await
            .unwrap();

        assert_eq!(store.get(&path, 3).await.unwrap().unwrap().payload, b"old");
        assert_eq!(store.get(&path, 7).await.unwrap().unwrap().payload, b"new");
        assert_eq!(store.get(&path, 10).await.unwrap().unwrap().payload, b"old");
        assert!(store.get(&path, 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_and_list_valid() {
        let dir = tempdir().unwrap();
        let store = FileObjectStore::new("local", dir.path());
        let id = store
            .put(&object("TPC/Calib/Gain", ValidityRange::single(10), b"g"))
            .await
            .unwrap();
        store
            .put(&object("TPC/Calib/Noise", ValidityRange::single(10), b"n"))
            .await
            .unwrap();

        let path = ObjectPath::parse("TPC/Calib/Gain").unwrap();
        let overlapping = store
            .list_valid(&path, &ValidityRange::open_ended(5))
            .await
            .unwrap();
        assert_eq!(overlapping.len(), 1);

        store.remove(&id).await.unwrap();
        assert!(store.list_valid(&path, &ValidityRange::open_ended(5)).await.unwrap().is_empty());
        assert_eq!(store.list("").await.unwrap().len(), 1);
    }
}
