//! Credential record store
//!
//! The store is the source of truth for tokens across restarts; the pool is a
//! cache over it. Writes are per-id idempotent upserts.
//!
//! `FileStore` keeps a JSON file mapping ids to records. All writes use an
//! atomic temp-file + rename so a crash mid-write never corrupts the file,
//! and a tokio Mutex serializes concurrent writers (request-time refresh and
//! background refresh).

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::credential::Credential;
use crate::error::{Error, Result};

/// Boxed future used by the dyn-compatible collaborator traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Durable key-value persistence of credential records.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn CredentialRecordStore>`).
pub trait CredentialRecordStore: Send + Sync {
    /// All records, ordered by id.
    fn load(&self) -> BoxFuture<'_, Result<Vec<Credential>>>;

    /// Insert or replace the record keyed by `credential.id`.
    fn save<'a>(&'a self, credential: &'a Credential) -> BoxFuture<'a, Result<()>>;

    /// Remove a record. Removing an unknown id is not an error.
    fn remove<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<()>>;
}

/// JSON file backed store.
pub struct FileStore {
    path: PathBuf,
    state: Mutex<BTreeMap<String, Credential>>,
}

impl FileStore {
    /// Open the store at `path`.
    ///
    /// If the file doesn't exist it is created as `{}` (cold start with zero
    /// accounts). Record ids are taken from the map keys.
    pub async fn open(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading credential file: {e}")))?;
            let mut records: BTreeMap<String, Credential> = serde_json::from_str(&contents)
                .map_err(|e| Error::CredentialParse(format!("parsing credential file: {e}")))?;
            for (id, record) in records.iter_mut() {
                record.id = id.clone();
            }
            info!(path = %path.display(), credentials = records.len(), "loaded credential store");
            records
        } else {
            info!(path = %path.display(), "credential file not found, starting with empty store");
            let records = BTreeMap::new();
            write_atomic(&path, &records).await?;
            records
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get a clone of a specific record.
    pub async fn get(&self, id: &str) -> Option<Credential> {
        self.state.lock().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl CredentialRecordStore for FileStore {
    fn load(&self) -> BoxFuture<'_, Result<Vec<Credential>>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state.values().cloned().collect())
        })
    }

    fn save<'a>(&'a self, credential: &'a Credential) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if credential.id.is_empty() {
                return Err(Error::CredentialParse("credential id must not be empty".into()));
            }
            let mut state = self.state.lock().await;
            state.insert(credential.id.clone(), credential.clone());
            debug!(credential_id = %credential.id, "saved credential");
            write_atomic(&self.path, &state).await
        })
    }

    fn remove<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if state.remove(id).is_some() {
                debug!(credential_id = id, "removed credential");
                write_atomic(&self.path, &state).await?;
            }
            Ok(())
        })
    }
}

/// In-memory store for tests and embedding.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<BTreeMap<String, Credential>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = Credential>) -> Self {
        let state = records.into_iter().map(|c| (c.id.clone(), c)).collect();
        Self {
            state: Mutex::new(state),
        }
    }

    pub async fn get(&self, id: &str) -> Option<Credential> {
        self.state.lock().await.get(id).cloned()
    }
}

impl CredentialRecordStore for MemoryStore {
    fn load(&self) -> BoxFuture<'_, Result<Vec<Credential>>> {
        Box::pin(async move { Ok(self.state.lock().await.values().cloned().collect()) })
    }

    fn save<'a>(&'a self, credential: &'a Credential) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.state
                .lock()
                .await
                .insert(credential.id.clone(), credential.clone());
            Ok(())
        })
    }

    fn remove<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.state.lock().await.remove(id);
            Ok(())
        })
    }
}

/// Write records to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. Permissions are 0600 since the file holds live tokens.
async fn write_atomic(path: &Path, data: &BTreeMap<String, Credential>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::CredentialParse(format!("serializing credentials: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("credential path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".credentials.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp credential file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting credential file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp credential file: {e}")))?;

    debug!(path = %path.display(), "persisted credentials");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn record(id: &str) -> Credential {
        Credential::new(id, format!("at_{id}"), format!("st_{id}"), 1_735_500_000_000)
    }

    #[tokio::test]
    async fn save_then_reopen_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");

        let store = FileStore::open(path.clone()).await.unwrap();
        let mut cred = record("flow-1");
        cred.project_id = Some("proj-9".into());
        cred.access_invalidated = true;
        store.save(&cred).await.unwrap();

        let reopened = FileStore::open(path).await.unwrap();
        let loaded = reopened.get("flow-1").await.unwrap();
        assert_eq!(loaded, cred);
    }

    #[tokio::test]
    async fn cold_start_creates_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");

        assert!(!path.exists());
        let store = FileStore::open(path.clone()).await.unwrap();
        assert!(store.is_empty().await);
        assert!(path.exists());

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents.trim(), "{}");
    }

    #[tokio::test]
    async fn ids_come_from_map_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        let json = r#"{"from-key":{"id":"stale","access_token":"a","session_token":"s","session_expires_at":1}}"#;
        tokio::fs::write(&path, json).await.unwrap();

        let store = FileStore::open(path).await.unwrap();
        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "from-key");
    }

    #[tokio::test]
    async fn load_is_ordered_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("c.json")).await.unwrap();
        for id in ["c", "a", "b"] {
            store.save(&record(id)).await.unwrap();
        }
        let ids: Vec<String> = store.load().await.unwrap().into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn save_is_an_idempotent_upsert() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("c.json")).await.unwrap();
        let mut cred = record("a");
        store.save(&cred).await.unwrap();
        store.save(&cred).await.unwrap();
        cred.session_token = "st_new".into();
        store.save(&cred).await.unwrap();

        assert_eq!(store.len().await, 1);
        assert_eq!(store.get("a").await.unwrap().session_token, "st_new");
    }

    #[tokio::test]
    async fn remove_unknown_id_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("c.json")).await.unwrap();
        store.save(&record("a")).await.unwrap();
        store.remove("a").await.unwrap();
        store.remove("a").await.unwrap();
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn empty_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("c.json")).await.unwrap();
        let result = store.save(&record("")).await;
        assert!(matches!(result, Err(Error::CredentialParse(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_permissions_are_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        let store = FileStore::open(path.clone()).await.unwrap();
        store.save(&record("a")).await.unwrap();

        let mode = tokio::fs::metadata(&path).await.unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "credential file must be 0600, got {mode:o}");
    }

    #[tokio::test]
    async fn concurrent_saves_dont_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        let store = Arc::new(FileStore::open(path.clone()).await.unwrap());

        let mut handles = vec![];
        for i in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.save(&record(&format!("acct-{i}"))).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(store.len().await, 10);
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: BTreeMap<String, Credential> = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed.len(), 10);
    }

    #[tokio::test]
    async fn memory_store_behaves_like_file_store() {
        let store = MemoryStore::with_records([record("b"), record("a")]);
        let ids: Vec<String> = store.load().await.unwrap().into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        store.remove("a").await.unwrap();
        assert!(store.get("a").await.is_none());
    }
}
