//! File-backed result store.
//!
//! Each (task, command) pair persists one JSON document under the data
//! directory, named `<app>-task-<kind>-<command>.json`. Writes go to a temp
//! file in the same directory and are renamed into place, so readers never
//! observe a half-written document.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::task::kinds::{CommandKind, TaskKind};

/// Persists task result data as pretty-printed JSON files.
pub struct ResultStore {
    app_name: String,
    base_path: PathBuf,
    /// Serializes the temp-file + rename sequence. Reads take no lock.
    write_lock: Mutex<()>,
    temp_counter: AtomicU64,
}

impl ResultStore {
    pub fn new(app_name: impl Into<String>, base_path: PathBuf) -> Self {
        Self {
            app_name: app_name.into(),
            base_path,
            write_lock: Mutex::new(()),
            temp_counter: AtomicU64::new(0),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// File name for a (task, command) pair.
    pub fn file_name(&self, kind: &TaskKind, command: &CommandKind) -> String {
        format!(
            "{}-task-{}-{}.json",
            self.app_name,
            to_snake_case(kind.as_str()),
            to_snake_case(command.as_str())
        )
    }

    pub fn resolve_path(&self, kind: &TaskKind, command: &CommandKind) -> PathBuf {
        self.base_path.join(self.file_name(kind, command))
    }

    /// Decode stored data into `target`.
    ///
    /// Returns `Ok(false)` and leaves `target` untouched when nothing has
    /// been saved for this key yet.
    pub async fn load<T: DeserializeOwned>(
        &self,
        kind: &TaskKind,
        command: &CommandKind,
        target: &mut T,
    ) -> Result<bool, StoreError> {
        let path = self.resolve_path(kind, command);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(source) => return Err(StoreError::Read { path, source }),
        };

        *target =
            serde_json::from_slice(&bytes).map_err(|source| StoreError::Decode { path, source })?;
        Ok(true)
    }

    /// Atomically replace the stored data for this key.
    pub async fn save<T: Serialize + ?Sized>(
        &self,
        kind: &TaskKind,
        command: &CommandKind,
        value: &T,
    ) -> Result<(), StoreError> {
        let data = encode_pretty(value)?;
        let path = self.resolve_path(kind, command);

        let _guard = self.write_lock.lock().await;

        fs::create_dir_all(&self.base_path)
            .await
            .map_err(|source| StoreError::Write {
                path: self.base_path.clone(),
                source,
            })?;

        let temp_path = self.base_path.join(format!(
            ".{}.{}.tmp",
            self.file_name(kind, command),
            self.temp_counter.fetch_add(1, Ordering::Relaxed)
        ));

        if let Err(source) = write_synced(&temp_path, &data).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::Write {
                path: temp_path,
                source,
            });
        }

        // rename() cannot replace an existing file on Windows.
        if cfg!(windows) {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => {
                    let _ = fs::remove_file(&temp_path).await;
                    return Err(StoreError::Write { path, source });
                }
            }
        }

        if let Err(source) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::Write { path, source });
        }

        tracing::debug!(path = %path.display(), bytes = data.len(), "Saved task result");
        Ok(())
    }
}

/// A store handle scoped to one (task, command) pair, handed to task bodies.
#[derive(Clone)]
pub struct TaskStore {
    store: Arc<ResultStore>,
    kind: TaskKind,
    command: CommandKind,
    default_shape: Option<fn() -> serde_json::Value>,
}

impl TaskStore {
    pub fn new(
        store: Arc<ResultStore>,
        kind: TaskKind,
        command: CommandKind,
        default_shape: Option<fn() -> serde_json::Value>,
    ) -> Self {
        Self {
            store,
            kind,
            command,
            default_shape,
        }
    }

    pub async fn load<T: DeserializeOwned>(&self, target: &mut T) -> Result<bool, StoreError> {
        self.store.load(&self.kind, &self.command, target).await
    }

    pub async fn save<T: Serialize + ?Sized>(&self, value: &T) -> Result<(), StoreError> {
        self.store.save(&self.kind, &self.command, value).await
    }

    /// Load the stored document as raw JSON, pre-filled with the command's
    /// registered default shape when nothing has been saved yet.
    pub async fn load_value(&self) -> Result<serde_json::Value, StoreError> {
        let mut value = self
            .default_shape
            .map(|shape| shape())
            .unwrap_or(serde_json::Value::Null);
        self.load(&mut value).await?;
        Ok(value)
    }
}

/// Write `data` and flush it to disk before the caller renames the file.
async fn write_synced(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(data).await?;
    file.sync_all().await
}

fn encode_pretty<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, StoreError> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"\t");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value
        .serialize(&mut serializer)
        .map_err(StoreError::Encode)?;
    Ok(buf)
}

/// `fooBar-baz Qux` → `foo_bar_baz_qux`.
pub fn to_snake_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 4);
    let mut prev_lower_or_digit = false;
    for c in s.chars() {
        if c.is_alphanumeric() {
            if c.is_uppercase() {
                if prev_lower_or_digit {
                    out.push('_');
                }
                out.extend(c.to_lowercase());
                prev_lower_or_digit = false;
            } else {
                out.push(c);
                prev_lower_or_digit = true;
            }
        } else {
            if !out.is_empty() && !out.ends_with('_') {
                out.push('_');
            }
            prev_lower_or_digit = false;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}
