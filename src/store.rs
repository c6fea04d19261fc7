//! Credential persistence.
//!
//! The store holds two keys, `credentials` and `appID`. Account identifiers
//! are decimal strings at rest and `u128` in memory; the conversion lives here
//! and nowhere else. Identifiers routinely exceed 2^53, so they must never pass
//! through an f64.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

pub const CREDENTIALS_KEY: &str = "credentials";
pub const APP_ID_KEY: &str = "appID";

/// Account identifiers issued by the backend, integer-typed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acg {
    pub id: u128,
    pub security_token: u128,
}

/// A registration as used in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub acg: Acg,
}

/// A registration as written to disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedCredential {
    pub token: String,
    pub acg: PersistedAcg,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedAcg {
    pub id: String,
    #[serde(rename = "securityToken")]
    pub security_token: String,
}

impl From<&Credential> for PersistedCredential {
    fn from(credential: &Credential) -> Self {
        Self {
            token: credential.token.clone(),
            acg: PersistedAcg {
                id: credential.acg.id.to_string(),
                security_token: credential.acg.security_token.to_string(),
            },
        }
    }
}

impl TryFrom<PersistedCredential> for Credential {
    type Error = StoreError;

    fn try_from(persisted: PersistedCredential) -> Result<Self, Self::Error> {
        let parse = |field: &'static str, raw: &str| {
            raw.trim()
                .parse::<u128>()
                .map_err(|_| StoreError::InvalidIdentifier {
                    field,
                    value: raw.to_string(),
                })
        };
        Ok(Self {
            acg: Acg {
                id: parse("acg.id", &persisted.acg.id)?,
                security_token: parse("acg.securityToken", &persisted.acg.security_token)?,
            },
            token: persisted.token,
        })
    }
}

/// What a previous run left behind. Either half may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredRegistration {
    pub credentials: Option<PersistedCredential>,
    pub app_id: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to read credential store {0}: {1}")]
    Read(PathBuf, #[source] std::io::Error),
    #[error("failed to write credential store {0}: {1}")]
    Write(PathBuf, #[source] std::io::Error),
    #[error("credential store {0} is corrupt: {1}")]
    Corrupt(PathBuf, #[source] serde_json::Error),
    #[error("failed to encode credential store: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("stored {field} is not a decimal identifier: {value:?}")]
    InvalidIdentifier { field: &'static str, value: String },
}

/// Get/set access to the last issued registration.
pub trait CredentialStore: Send + Sync {
    fn load(&self) -> Result<StoredRegistration, StoreError>;
    /// Persist a credential together with the appID it was issued for.
    fn save(&self, credentials: &PersistedCredential, app_id: &str) -> Result<(), StoreError>;
    fn clear(&self) -> Result<(), StoreError>;
}

/// JSON object file. Keys other than ours are preserved.
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// `$CONFIG_DIR/push-receiver/credentials.json`, or a relative fallback.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("push-receiver")
            .join("credentials.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_map(&self) -> Result<serde_json::Map<String, serde_json::Value>, StoreError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(serde_json::Map::new())
            }
            Err(e) => return Err(StoreError::Read(self.path.clone(), e)),
        };
        if contents.trim().is_empty() {
            return Ok(serde_json::Map::new());
        }
        serde_json::from_str(&contents).map_err(|e| StoreError::Corrupt(self.path.clone(), e))
    }

    /// Like `read_map`, but a corrupt file is moved aside to
    /// `<name>.corrupt` and treated as empty so it can be overwritten.
    fn read_map_for_update(&self) -> Result<serde_json::Map<String, serde_json::Value>, StoreError> {
        match self.read_map() {
            Err(StoreError::Corrupt(path, e)) => {
                let aside = path.with_extension("json.corrupt");
                tracing::warn!(
                    path = %path.display(),
                    moved_to = %aside.display(),
                    error = %e,
                    "credential store is corrupt, starting from an empty store"
                );
                if let Err(e) = std::fs::rename(&path, &aside) {
                    tracing::warn!(path = %path.display(), error = %e, "could not move corrupt store aside");
                }
                Ok(serde_json::Map::new())
            }
            other => other,
        }
    }

    fn write_map(&self, map: &serde_json::Map<String, serde_json::Value>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Write(self.path.clone(), e))?;
            }
        }
        let contents = serde_json::to_string_pretty(map).map_err(StoreError::Encode)?;
        let tmp = self.path.with_extension("json.tmp");
        write_private(&tmp, contents.as_bytes()).map_err(|e| StoreError::Write(tmp.clone(), e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| StoreError::Write(self.path.clone(), e))?;
        Ok(())
    }
}

/// Writes `contents` to `path`, readable by the owner only on unix.
#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // `mode` only applies on creation; a leftover tmp file keeps its bits.
    file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    file.write_all(contents)
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, contents)
}

impl CredentialStore for FileStore {
    fn load(&self) -> Result<StoredRegistration, StoreError> {
        let _guard = self.lock.lock();
        let map = self.read_map()?;

        let credentials = match map.get(CREDENTIALS_KEY) {
            Some(value) => match serde_json::from_value::<PersistedCredential>(value.clone()) {
                Ok(c) => Some(c),
                Err(e) => {
                    tracing::warn!(path = %self.path.display(), error = %e, "ignoring malformed stored credentials");
                    None
                }
            },
            None => None,
        };
        let app_id = map
            .get(APP_ID_KEY)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        Ok(StoredRegistration {
            credentials,
            app_id,
        })
    }

    fn save(&self, credentials: &PersistedCredential, app_id: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock();
        let mut map = self.read_map_for_update()?;
        let value = serde_json::to_value(credentials).map_err(StoreError::Encode)?;
        map.insert(CREDENTIALS_KEY.to_string(), value);
        map.insert(
            APP_ID_KEY.to_string(),
            serde_json::Value::String(app_id.to_string()),
        );
        self.write_map(&map)?;
        tracing::debug!(path = %self.path.display(), app_id, "credentials persisted");
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        let _guard = self.lock.lock();
        let mut map = self.read_map_for_update()?;
        let had_credentials = map.remove(CREDENTIALS_KEY).is_some();
        let had_app_id = map.remove(APP_ID_KEY).is_some();
        if had_credentials || had_app_id {
            self.write_map(&map)?;
        }
        Ok(())
    }
}

/// Process-local store, for tests and throwaway runs.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<StoredRegistration>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that already holds a registration.
    pub fn with_registration(credentials: PersistedCredential, app_id: &str) -> Self {
        Self {
            inner: Mutex::new(StoredRegistration {
                credentials: Some(credentials),
                app_id: Some(app_id.to_string()),
            }),
        }
    }
}

impl CredentialStore for MemoryStore {
    fn load(&self) -> Result<StoredRegistration, StoreError> {
        Ok(self.inner.lock().clone())
    }

    fn save(&self, credentials: &PersistedCredential, app_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.credentials = Some(credentials.clone());
        inner.app_id = Some(app_id.to_string());
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        *self.inner.lock() = StoredRegistration::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential(id: u128, security_token: u128) -> Credential {
        Credential {
            token: "T1".into(),
            acg: Acg { id, security_token },
        }
    }

    #[test]
    fn persisted_form_uses_decimal_strings() {
        let persisted = PersistedCredential::from(&credential(123, 456));
        assert_eq!(persisted.acg.id, "123");
        assert_eq!(persisted.acg.security_token, "456");
        let json = serde_json::to_value(&persisted).unwrap();
        assert_eq!(json["acg"]["securityToken"], "456");
    }

    #[test]
    fn conversion_is_lossless_past_f64_precision() {
        // 2^53 + 1 is the first integer an f64 cannot represent.
        let id = (1u128 << 53) + 1;
        let security_token = u64::MAX as u128 + 7;
        let original = credential(id, security_token);
        let restored = Credential::try_from(PersistedCredential::from(&original)).unwrap();
        assert_eq!(restored, original);
        assert_ne!((id as f64) as u128, id);
    }

    #[test]
    fn non_decimal_identifier_is_rejected() {
        let mut persisted = PersistedCredential::from(&credential(1, 2));
        persisted.acg.security_token = "12ab".into();
        let err = Credential::try_from(persisted).unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidIdentifier { field: "acg.securityToken", .. }
        ));
    }

    #[test]
    fn file_store_missing_file_means_no_registration() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("credentials.json"));
        assert_eq!(store.load().unwrap(), StoredRegistration::default());
    }

    #[test]
    fn file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("credentials.json");
        let store = FileStore::new(&path);
        let original = credential((1u128 << 70) + 3, 9_007_199_254_740_993);

        store.save(&PersistedCredential::from(&original), "app1").unwrap();

        // A fresh handle sees what the previous one wrote.
        let reopened = FileStore::new(&path);
        let stored = reopened.load().unwrap();
        assert_eq!(stored.app_id.as_deref(), Some("app1"));
        let restored = Credential::try_from(stored.credentials.unwrap()).unwrap();
        assert_eq!(restored, original);

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["credentials"]["acg"]["securityToken"], "9007199254740993");
    }

    #[test]
    fn file_store_preserves_foreign_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        std::fs::write(&path, r#"{"windowBounds": {"w": 800}}"#).unwrap();
        let store = FileStore::new(&path);

        store.save(&PersistedCredential::from(&credential(1, 2)), "app1").unwrap();
        store.clear().unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["windowBounds"]["w"], 800);
        assert!(raw.get(CREDENTIALS_KEY).is_none());
        assert!(raw.get(APP_ID_KEY).is_none());
    }

    #[test]
    fn file_store_reports_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        std::fs::write(&path, "{not json").unwrap();
        let store = FileStore::new(&path);
        assert!(matches!(store.load(), Err(StoreError::Corrupt(..))));
    }

    #[test]
    fn save_over_corrupt_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        std::fs::write(&path, "{not json").unwrap();
        let store = FileStore::new(&path);

        store.save(&PersistedCredential::from(&credential(123, 456)), "app1").unwrap();

        let stored = store.load().unwrap();
        assert_eq!(stored.app_id.as_deref(), Some("app1"));
        assert_eq!(stored.credentials.unwrap().acg.id, "123");
        assert_eq!(
            std::fs::read_to_string(dir.path().join("credentials.json.corrupt")).unwrap(),
            "{not json"
        );
    }

    #[test]
    fn clear_over_corrupt_file_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        std::fs::write(&path, "{not json").unwrap();
        let store = FileStore::new(&path);

        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), StoredRegistration::default());
    }

    #[cfg(unix)]
    #[test]
    fn saved_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        let store = FileStore::new(&path);
        store.save(&PersistedCredential::from(&credential(1, 2)), "app1").unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn file_store_skips_malformed_credentials_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        std::fs::write(&path, r#"{"credentials": 42, "appID": "app1"}"#).unwrap();
        let stored = FileStore::new(&path).load().unwrap();
        assert!(stored.credentials.is_none());
        assert_eq!(stored.app_id.as_deref(), Some("app1"));
    }

    #[test]
    fn memory_store_save_and_clear() {
        let store = MemoryStore::new();
        store.save(&PersistedCredential::from(&credential(5, 6)), "app9").unwrap();
        assert_eq!(store.load().unwrap().app_id.as_deref(), Some("app9"));
        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), StoredRegistration::default());
    }
}
