use std::{
    collections::HashMap,
    fs,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use serde::{de::DeserializeOwned, Serialize};

use crate::error::StorageError;

/// Flat key/value persistence. `write` replaces the whole value or leaves
/// the previous one untouched.
pub trait Storage: Clone {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    fn write(&self, key: &str, payload: &[u8]) -> Result<(), StorageError>;
}

pub fn load_json<T, S>(storage: &S, key: &str) -> Result<Option<T>, StorageError>
where
    T: DeserializeOwned,
    S: Storage,
{
    match storage.read(key)? {
        Some(raw) => serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|source| StorageError::Decode {
                key: key.to_string(),
                source,
            }),
        None => Ok(None),
    }
}

pub fn save_json<T, S>(storage: &S, key: &str, value: &T) -> Result<(), StorageError>
where
    T: Serialize + ?Sized,
    S: Storage,
{
    let payload = serde_json::to_vec(value).map_err(|source| StorageError::Encode {
        key: key.to_string(),
        source,
    })?;
    storage.write(key, &payload)
}

pub fn ensure_fits(key: &str, len: usize, limit: usize) -> Result<(), StorageError> {
    if len > limit {
        return Err(StorageError::Backend {
            key: key.to_string(),
            message: format!("{len} bytes exceeds the {limit} byte limit"),
        });
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct FileStorage {
    root: Arc<PathBuf>,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Arc::new(root.into()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn io_error(key: &str, source: std::io::Error) -> StorageError {
        StorageError::Io {
            key: key.to_string(),
            source,
        }
    }
}

impl Storage for FileStorage {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match fs::read(self.root.join(key)) {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(Self::io_error(key, err)),
        }
    }

    fn write(&self, key: &str, payload: &[u8]) -> Result<(), StorageError> {
        fs::create_dir_all(self.root.as_ref()).map_err(|err| Self::io_error(key, err))?;

        let path = self.root.join(key);
        let tmp_path = self.root.join(format!("{key}.tmp"));

        let mut file = fs::File::create(&tmp_path).map_err(|err| Self::io_error(key, err))?;
        file.write_all(payload)
            .map_err(|err| Self::io_error(key, err))?;
        file.sync_all().map_err(|err| Self::io_error(key, err))?;
        drop(file);

        fs::rename(&tmp_path, &path).map_err(|err| {
            let _ = fs::remove_file(&tmp_path);
            Self::io_error(key, err)
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    entries: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(self, key: &str, payload: impl Into<Vec<u8>>) -> Self {
        self.lock().insert(key.to_string(), payload.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().get(key).cloned()
    }

    pub fn get_json(&self, key: &str) -> Option<serde_json::Value> {
        self.get(key)
            .and_then(|raw| serde_json::from_slice(&raw).ok())
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Storage for MemoryStorage {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.get(key))
    }

    fn write(&self, key: &str, payload: &[u8]) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(StorageError::Backend {
                key: key.to_string(),
                message: "write failure injected".to_string(),
            });
        }
        self.lock().insert(key.to_string(), payload.to_vec());
        Ok(())
    }
}
