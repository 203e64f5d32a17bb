//! The configuration store.
//!
//! Owns the active config file and its temporary siblings. Reads go
//! through an in-memory cache under a shared read lock; every mutation
//! runs the same pipeline under the write lock:
//!
//! 1. read the current document (through the cache)
//! 2. compute the candidate document
//! 3. validate the candidate out-of-process
//! 4. snapshot the previous file bytes (when backups are enabled)
//! 5. serialize to `<path>.<uuid>.tmp` and rename over the active path
//! 6. ask the supervisor to SIGHUP a running child (when auto-reload is on)
//!
//! Backup and reload failures are logged and swallowed; validation and
//! lock failures abort the write with nothing mutated.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{info, warn};

use orbit_backup::BackupStore;
use orbit_lock::{LockError, LockSnapshot, TimedRwLock};
use orbit_types::{NodeError, NodeResult};

use crate::document::{
    self, IndexedSlot, SingletonSlot, TaggedSlot, default_document, deep_merge, lookup,
    lookup_array_mut, position_of_tag, shallow_merge, validate_tagged_item,
};
use crate::validate::ConfigValidator;

/// Seam through which a successful write reaches the supervisor.
#[async_trait]
pub trait ReloadHook: Send + Sync {
    /// SIGHUP the child if one is running; false when there is none.
    async fn reload_if_running(&self) -> anyhow::Result<bool>;
}

/// Outcome of a mutation closure: `Unchanged` short-circuits the
/// pipeline before validation, so no backup, write, or reload happens.
enum Mutation<R> {
    Changed(R),
    Unchanged(R),
}

#[derive(Debug, Clone, Copy)]
struct WriteOptions {
    validate: bool,
    backup: bool,
    allow_create: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            validate: true,
            backup: true,
            allow_create: false,
        }
    }
}

/// Read-through cached JSON document with atomic writes.
pub struct ConfigStore {
    path: PathBuf,
    lock: TimedRwLock,
    validator: Arc<dyn ConfigValidator>,
    backups: BackupStore,
    backup_enabled: bool,
    auto_reload: bool,
    reload: StdMutex<Option<Arc<dyn ReloadHook>>>,
    cache: StdMutex<Option<Value>>,
}

impl ConfigStore {
    /// Build a store over `path`.
    pub fn new(
        path: PathBuf,
        validator: Arc<dyn ConfigValidator>,
        backups: BackupStore,
        backup_enabled: bool,
        auto_reload: bool,
    ) -> Self {
        Self {
            path,
            lock: TimedRwLock::new(),
            validator,
            backups,
            backup_enabled,
            auto_reload,
            reload: StdMutex::new(None),
            cache: StdMutex::new(None),
        }
    }

    /// The active config file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The snapshot store behind this config.
    pub fn backups(&self) -> &BackupStore {
        &self.backups
    }

    /// Wire the supervisor in after construction (the supervisor is
    /// built later by the composition root).
    pub fn set_reload_hook(&self, hook: Arc<dyn ReloadHook>) {
        *self.lock_reload() = Some(hook);
    }

    /// Diagnostic view of the reader/writer lock.
    pub fn lock_snapshot(&self) -> LockSnapshot {
        self.lock.snapshot()
    }

    /// Drop the in-memory cache; the next read reloads from disk.
    pub fn invalidate_cache(&self) {
        *self.lock_cache() = None;
    }

    /// Write the bootstrap document if no config exists yet.
    ///
    /// The default document is a constant and the binary may not be
    /// installed at bootstrap time, so this write skips validation and
    /// backup. Returns true when a file was created.
    pub async fn ensure_config(&self) -> NodeResult<bool> {
        let _guard = self.write_guard().await?;
        if tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            return Ok(false);
        }
        let document = default_document();
        self.write_atomic(&document).await?;
        *self.lock_cache() = Some(document);
        info!(path = %self.path.display(), "created default configuration");
        Ok(true)
    }

    /// The exact bytes of the active config file, under the read lock.
    pub async fn current_bytes(&self) -> NodeResult<Vec<u8>> {
        let _guard = self.lock.read().await.map_err(map_lock_error)?;
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(NodeError::not_found(format!(
                    "configuration file not found at {}",
                    self.path.display()
                )))
            }
            Err(e) => Err(NodeError::Internal(anyhow::anyhow!(
                "failed to read configuration {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    /// The whole current document.
    pub async fn get(&self) -> NodeResult<Value> {
        let _guard = self
            .lock
            .read()
            .await
            .map_err(map_lock_error)?;
        self.load_current().await
    }

    /// Replace the whole document. Creates the file when absent.
    pub async fn set_document(&self, document: Value, reason: Option<&str>) -> NodeResult<Value> {
        document::validate_shape(&document)?;
        let options = WriteOptions {
            allow_create: true,
            ..WriteOptions::default()
        };
        self.mutate(reason.unwrap_or("api-update"), options, move |current| {
            *current = document;
            Ok(Mutation::Changed(()))
        })
        .await?;
        self.get().await
    }

    /// Deep-merge a partial document into the current one.
    pub async fn patch_document(&self, partial: Value, reason: Option<&str>) -> NodeResult<Value> {
        document::validate_shape(&partial)?;
        self.mutate(
            reason.unwrap_or("api-patch"),
            WriteOptions::default(),
            move |current| {
                deep_merge(current, &partial);
                Ok(Mutation::Changed(()))
            },
        )
        .await?;
        self.get().await
    }

    // ---- tagged collections ------------------------------------------------

    /// All elements of a tagged collection (empty when absent).
    pub async fn list_tagged(&self, slot: TaggedSlot) -> NodeResult<Vec<Value>> {
        let doc = self.get().await?;
        Ok(lookup(&doc, slot.path())
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    /// The element carrying `tag`, if any.
    pub async fn get_tagged(&self, slot: TaggedSlot, tag: &str) -> NodeResult<Option<Value>> {
        let items = self.list_tagged(slot).await?;
        Ok(position_of_tag(&items, tag).map(|i| items[i].clone()))
    }

    /// Append a new element; duplicate tags are rejected.
    pub async fn create_tagged(&self, slot: TaggedSlot, item: Value) -> NodeResult<Value> {
        let tag = validate_tagged_item(slot, &item)?;
        let reason = format!("before-create-{}", slot.entity());
        self.mutate(&reason, WriteOptions::default(), move |doc| {
            let items = lookup_array_mut(doc, slot.path())?;
            if position_of_tag(items, &tag).is_some() {
                return Err(NodeError::bad_request(format!(
                    "{} with tag '{}' already exists",
                    slot.entity(),
                    tag
                )));
            }
            items.push(item.clone());
            Ok(Mutation::Changed(item))
        })
        .await
    }

    /// Replace the element carrying `tag`; the replacement may rename it.
    pub async fn replace_tagged(
        &self,
        slot: TaggedSlot,
        tag: &str,
        item: Value,
    ) -> NodeResult<Value> {
        let new_tag = validate_tagged_item(slot, &item)?;
        let tag = tag.to_string();
        let reason = format!("before-update-{}", slot.entity());
        self.mutate(&reason, WriteOptions::default(), move |doc| {
            let items = lookup_array_mut(doc, slot.path())?;
            let Some(pos) = position_of_tag(items, &tag) else {
                return Err(NodeError::not_found(format!(
                    "{} '{}' not found",
                    slot.entity(),
                    tag
                )));
            };
            if new_tag != tag && position_of_tag(items, &new_tag).is_some() {
                return Err(NodeError::bad_request(format!(
                    "{} with tag '{}' already exists",
                    slot.entity(),
                    new_tag
                )));
            }
            items[pos] = item.clone();
            Ok(Mutation::Changed(item))
        })
        .await
    }

    /// Shallow-merge a partial element into the one carrying `tag`.
    pub async fn patch_tagged(
        &self,
        slot: TaggedSlot,
        tag: &str,
        partial: Value,
    ) -> NodeResult<Value> {
        let Some(partial_obj) = partial.as_object().cloned() else {
            return Err(NodeError::bad_request(format!(
                "{} patch must be an object",
                slot.entity()
            )));
        };
        let tag = tag.to_string();
        let reason = format!("before-patch-{}", slot.entity());
        self.mutate(&reason, WriteOptions::default(), move |doc| {
            let items = lookup_array_mut(doc, slot.path())?;
            let Some(pos) = position_of_tag(items, &tag) else {
                return Err(NodeError::not_found(format!(
                    "{} '{}' not found",
                    slot.entity(),
                    tag
                )));
            };
            let mut merged = items[pos]
                .as_object()
                .cloned()
                .unwrap_or_else(Map::new);
            shallow_merge(&mut merged, &partial_obj);
            let merged = Value::Object(merged);

            let new_tag = validate_tagged_item(slot, &merged)?;
            if new_tag != tag && position_of_tag(items, &new_tag).is_some() {
                return Err(NodeError::bad_request(format!(
                    "{} with tag '{}' already exists",
                    slot.entity(),
                    new_tag
                )));
            }
            items[pos] = merged.clone();
            Ok(Mutation::Changed(merged))
        })
        .await
    }

    /// Remove the element carrying `tag`; false when absent (no write
    /// happens in that case).
    pub async fn delete_tagged(&self, slot: TaggedSlot, tag: &str) -> NodeResult<bool> {
        let tag = tag.to_string();
        let reason = format!("before-delete-{}", slot.entity());
        self.mutate(&reason, WriteOptions::default(), move |doc| {
            let items = lookup_array_mut(doc, slot.path())?;
            match position_of_tag(items, &tag) {
                Some(pos) => {
                    items.remove(pos);
                    Ok(Mutation::Changed(true))
                }
                None => Ok(Mutation::Unchanged(false)),
            }
        })
        .await
    }

    // ---- indexed collections -----------------------------------------------

    /// All elements of an indexed collection (empty when absent).
    pub async fn list_indexed(&self, slot: IndexedSlot) -> NodeResult<Vec<Value>> {
        let doc = self.get().await?;
        Ok(lookup(&doc, slot.path())
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    /// The element at `index`, if in range.
    pub async fn get_indexed(&self, slot: IndexedSlot, index: usize) -> NodeResult<Option<Value>> {
        let items = self.list_indexed(slot).await?;
        Ok(items.get(index).cloned())
    }

    /// Append a rule; returns its new index.
    pub async fn create_indexed(&self, slot: IndexedSlot, item: Value) -> NodeResult<usize> {
        if !item.is_object() {
            return Err(NodeError::bad_request(format!(
                "{} must be an object",
                slot.entity()
            )));
        }
        let reason = format!("before-create-{}", slot.entity());
        self.mutate(&reason, WriteOptions::default(), move |doc| {
            let items = lookup_array_mut(doc, slot.path())?;
            items.push(item);
            Ok(Mutation::Changed(items.len() - 1))
        })
        .await
    }

    /// Replace the rule at `index`.
    pub async fn replace_indexed(
        &self,
        slot: IndexedSlot,
        index: usize,
        item: Value,
    ) -> NodeResult<Value> {
        if !item.is_object() {
            return Err(NodeError::bad_request(format!(
                "{} must be an object",
                slot.entity()
            )));
        }
        let reason = format!("before-update-{}", slot.entity());
        self.mutate(&reason, WriteOptions::default(), move |doc| {
            let items = lookup_array_mut(doc, slot.path())?;
            if index >= items.len() {
                return Err(NodeError::not_found(format!(
                    "{} at index {} not found",
                    slot.entity(),
                    index
                )));
            }
            items[index] = item.clone();
            Ok(Mutation::Changed(item))
        })
        .await
    }

    /// Remove the rule at `index`; false when out of range.
    pub async fn delete_indexed(&self, slot: IndexedSlot, index: usize) -> NodeResult<bool> {
        let reason = format!("before-delete-{}", slot.entity());
        self.mutate(&reason, WriteOptions::default(), move |doc| {
            let items = lookup_array_mut(doc, slot.path())?;
            if index >= items.len() {
                return Ok(Mutation::Unchanged(false));
            }
            items.remove(index);
            Ok(Mutation::Changed(true))
        })
        .await
    }

    /// Move the rule at `from` to position `to` (splice semantics: the
    /// element is removed first, then inserted). Returns the new order.
    pub async fn reorder_indexed(
        &self,
        slot: IndexedSlot,
        from: usize,
        to: usize,
    ) -> NodeResult<Vec<Value>> {
        let reason = format!("before-reorder-{}", slot.entity());
        self.mutate(&reason, WriteOptions::default(), move |doc| {
            let items = lookup_array_mut(doc, slot.path())?;
            if from >= items.len() || to >= items.len() {
                return Err(NodeError::bad_request(format!(
                    "reorder indices out of range for {} (len {})",
                    slot.dotted(),
                    items.len()
                )));
            }
            let item = items.remove(from);
            items.insert(to, item);
            Ok(Mutation::Changed(items.clone()))
        })
        .await
    }

    // ---- singleton sections ------------------------------------------------

    /// The singleton view of a section (nested sequences excluded).
    pub async fn get_singleton(&self, slot: SingletonSlot) -> NodeResult<Option<Value>> {
        let doc = self.get().await?;
        Ok(document::singleton_view(&doc, slot))
    }

    /// Replace a singleton section wholesale (nested sequences preserved).
    pub async fn set_singleton(&self, slot: SingletonSlot, value: Value) -> NodeResult<Value> {
        let reason = format!("api-update-{}", slot.key());
        self.mutate(&reason, WriteOptions::default(), move |doc| {
            document::set_singleton(doc, slot, &value)?;
            Ok(Mutation::Changed(()))
        })
        .await?;
        Ok(self
            .get_singleton(slot)
            .await?
            .unwrap_or_else(|| Value::Object(Map::new())))
    }

    /// Deep-merge a partial object into a singleton section.
    pub async fn patch_singleton(&self, slot: SingletonSlot, partial: Value) -> NodeResult<Value> {
        let reason = format!("api-patch-{}", slot.key());
        self.mutate(&reason, WriteOptions::default(), move |doc| {
            document::patch_singleton(doc, slot, &partial)?;
            Ok(Mutation::Changed(()))
        })
        .await?;
        Ok(self
            .get_singleton(slot)
            .await?
            .unwrap_or_else(|| Value::Object(Map::new())))
    }

    /// Remove a deletable singleton section; false when absent.
    pub async fn delete_singleton(&self, slot: SingletonSlot) -> NodeResult<bool> {
        let reason = format!("before-delete-{}", slot.key());
        self.mutate(&reason, WriteOptions::default(), move |doc| {
            match document::delete_singleton(doc, slot)? {
                true => Ok(Mutation::Changed(true)),
                false => Ok(Mutation::Unchanged(false)),
            }
        })
        .await
    }

    // ---- restore / import --------------------------------------------------

    /// Replace the document from a backup snapshot's content.
    pub async fn restore(&self, document: Value) -> NodeResult<Value> {
        document::validate_shape(&document)?;
        let options = WriteOptions {
            allow_create: true,
            ..WriteOptions::default()
        };
        self.mutate("before-restore", options, move |current| {
            *current = document;
            Ok(Mutation::Changed(()))
        })
        .await?;
        self.get().await
    }

    /// Write an imported document, honoring the import options.
    pub async fn apply_import(
        &self,
        document: Value,
        validate: bool,
        create_backup: bool,
    ) -> NodeResult<Value> {
        let options = WriteOptions {
            validate,
            backup: create_backup,
            allow_create: true,
        };
        self.mutate("before-import", options, move |current| {
            *current = document;
            Ok(Mutation::Changed(()))
        })
        .await?;
        self.get().await
    }

    // ---- pipeline ----------------------------------------------------------

    async fn mutate<R>(
        &self,
        reason: &str,
        options: WriteOptions,
        f: impl FnOnce(&mut Value) -> NodeResult<Mutation<R>>,
    ) -> NodeResult<R> {
        let _guard = self.write_guard().await?;

        let current = match self.load_current().await {
            Ok(doc) => doc,
            Err(NodeError::NotFound(_)) if options.allow_create => Value::Object(Map::new()),
            Err(e) => return Err(e),
        };

        let mut candidate = current;
        let result = match f(&mut candidate)? {
            Mutation::Unchanged(r) => return Ok(r),
            Mutation::Changed(r) => r,
        };

        if options.validate {
            let report = self.validator.validate(&candidate).await?;
            if !report.valid {
                return Err(NodeError::ConfigValidation(report));
            }
        }

        if options.backup && self.backup_enabled {
            match tokio::fs::read(&self.path).await {
                Ok(bytes) => {
                    if let Err(e) = self.backups.create(&bytes, reason) {
                        warn!(reason, error = %e, "backup failed; continuing with write");
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(error = %e, "could not read current config for backup");
                }
            }
        }

        self.write_atomic(&candidate).await?;
        *self.lock_cache() = Some(candidate);

        if self.auto_reload {
            let hook = self.lock_reload().clone();
            if let Some(hook) = hook {
                match hook.reload_if_running().await {
                    Ok(true) => {}
                    Ok(false) => {}
                    Err(e) => {
                        warn!(error = %e, "auto-reload after write failed");
                    }
                }
            }
        }

        Ok(result)
    }

    async fn load_current(&self) -> NodeResult<Value> {
        if let Some(cached) = self.lock_cache().clone() {
            return Ok(cached);
        }

        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(NodeError::not_found(format!(
                    "configuration file not found at {}",
                    self.path.display()
                )));
            }
            Err(e) => {
                return Err(NodeError::Internal(anyhow::anyhow!(
                    "failed to read configuration {}: {}",
                    self.path.display(),
                    e
                )));
            }
        };

        let document: Value = serde_json::from_slice(&bytes).map_err(|e| {
            NodeError::bad_request(format!("configuration file is not valid JSON: {}", e))
        })?;
        *self.lock_cache() = Some(document.clone());
        Ok(document)
    }

    /// Two-space-indented serialization to a uuid-suffixed temp file,
    /// renamed onto the active path.
    async fn write_atomic(&self, document: &Value) -> NodeResult<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                NodeError::Internal(anyhow::anyhow!(
                    "failed to create config dir {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let pretty = serde_json::to_string_pretty(document)
            .map_err(|e| NodeError::Internal(anyhow::Error::from(e)))?;
        let tmp = PathBuf::from(format!(
            "{}.{}.tmp",
            self.path.display(),
            uuid::Uuid::new_v4()
        ));

        tokio::fs::write(&tmp, pretty).await.map_err(|e| {
            NodeError::Internal(anyhow::anyhow!(
                "failed to write temp config {}: {}",
                tmp.display(),
                e
            ))
        })?;
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(NodeError::Internal(anyhow::anyhow!(
                "failed to move config into place at {}: {}",
                self.path.display(),
                e
            )));
        }
        Ok(())
    }

    async fn write_guard(&self) -> NodeResult<orbit_lock::WriteGuard> {
        self.lock.write().await.map_err(map_lock_error)
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, Option<Value>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_reload(&self) -> std::sync::MutexGuard<'_, Option<Arc<dyn ReloadHook>>> {
        self.reload.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn map_lock_error(e: LockError) -> NodeError {
    match e {
        LockError::Timeout { .. } => NodeError::LockTimeout(e.to_string()),
        LockError::Reset { .. } => NodeError::Internal(anyhow::anyhow!(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use orbit_types::{ValidationIssue, ValidationReport};

    struct StubValidator {
        valid: AtomicBool,
        message: StdMutex<String>,
        calls: AtomicUsize,
    }

    impl StubValidator {
        fn accepting() -> Arc<Self> {
            Arc::new(Self {
                valid: AtomicBool::new(true),
                message: StdMutex::new(String::new()),
                calls: AtomicUsize::new(0),
            })
        }

        fn reject_with(&self, message: &str) {
            self.valid.store(false, Ordering::SeqCst);
            *self.message.lock().expect("message") = message.to_string();
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ConfigValidator for StubValidator {
        async fn validate(&self, _document: &Value) -> NodeResult<ValidationReport> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.valid.load(Ordering::SeqCst) {
                Ok(ValidationReport::ok())
            } else {
                Ok(ValidationReport::rejected(ValidationIssue::singbox(
                    self.message.lock().expect("message").clone(),
                )))
            }
        }

        async fn validate_file(&self, _path: &Path) -> NodeResult<ValidationReport> {
            self.validate(&Value::Object(Map::new())).await
        }
    }

    fn store_in(dir: &Path, validator: Arc<StubValidator>) -> ConfigStore {
        ConfigStore::new(
            dir.join("config.json"),
            validator,
            BackupStore::new(dir.join("backups"), 10),
            true,
            false,
        )
    }

    async fn seeded_store(dir: &Path, validator: Arc<StubValidator>, doc: Value) -> ConfigStore {
        let store = store_in(dir, validator);
        std::fs::write(
            store.path(),
            serde_json::to_string_pretty(&doc).expect("serialize"),
        )
        .expect("seed");
        store
    }

    #[tokio::test]
    async fn ensure_config_creates_default_once() {
        let td = tempfile::tempdir().expect("tempdir");
        let store = store_in(td.path(), StubValidator::accepting());

        assert!(store.ensure_config().await.expect("first"));
        assert!(!store.ensure_config().await.expect("second"));

        let doc = store.get().await.expect("get");
        assert_eq!(doc["log"]["level"], "info");
        assert_eq!(doc["inbounds"], json!([]));
    }

    #[tokio::test]
    async fn get_missing_file_is_not_found() {
        let td = tempfile::tempdir().expect("tempdir");
        let store = store_in(td.path(), StubValidator::accepting());
        let err = store.get().await.expect_err("missing");
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn get_corrupt_file_is_bad_request() {
        let td = tempfile::tempdir().expect("tempdir");
        let store = store_in(td.path(), StubValidator::accepting());
        std::fs::write(store.path(), "{not json").expect("seed");
        let err = store.get().await.expect_err("corrupt");
        assert_eq!(err.code(), "BAD_REQUEST");
    }

    #[tokio::test]
    async fn set_document_writes_pretty_json_and_caches() {
        let td = tempfile::tempdir().expect("tempdir");
        let validator = StubValidator::accepting();
        let store = store_in(td.path(), Arc::clone(&validator));

        let doc = json!({"outbounds": [{"type": "direct", "tag": "d"}]});
        store.set_document(doc.clone(), None).await.expect("set");

        let on_disk = std::fs::read_to_string(store.path()).expect("read");
        assert!(on_disk.contains("  \"outbounds\""), "two-space indent");
        assert_eq!(
            serde_json::from_str::<Value>(&on_disk).expect("parse"),
            doc
        );
        assert_eq!(validator.calls(), 1);
        // No tmp residue after a successful write.
        let residue: Vec<_> = std::fs::read_dir(td.path())
            .expect("read dir")
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(residue.is_empty());
    }

    #[tokio::test]
    async fn set_document_rejects_unknown_section() {
        let td = tempfile::tempdir().expect("tempdir");
        let store = store_in(td.path(), StubValidator::accepting());
        let err = store
            .set_document(json!({"bogus": 1}), None)
            .await
            .expect_err("unknown section");
        assert_eq!(err.code(), "BAD_REQUEST");
    }

    #[tokio::test]
    async fn rejected_validation_leaves_file_untouched() {
        let td = tempfile::tempdir().expect("tempdir");
        let validator = StubValidator::accepting();
        let store = seeded_store(
            td.path(),
            Arc::clone(&validator),
            json!({"outbounds": [{"type": "direct", "tag": "d"}]}),
        )
        .await;
        let before = std::fs::read(store.path()).expect("before");

        validator.reject_with("unknown inbound type: bogus");
        let err = store
            .set_document(json!({"inbounds": [{"type": "bogus", "tag": "x"}]}), None)
            .await
            .expect_err("rejected");
        assert_eq!(err.code(), "CONFIG_VALIDATION_ERROR");
        assert!(err.to_string().contains("unknown inbound type: bogus"));

        // Pre-image intact, no backup created.
        assert_eq!(std::fs::read(store.path()).expect("after"), before);
        assert!(store.backups().list().is_empty());
    }

    #[tokio::test]
    async fn successful_write_backs_up_previous_content() {
        let td = tempfile::tempdir().expect("tempdir");
        let store = seeded_store(
            td.path(),
            StubValidator::accepting(),
            json!({"outbounds": [{"type": "direct", "tag": "d"}]}),
        )
        .await;
        let before = std::fs::read(store.path()).expect("before");

        store
            .create_tagged(
                TaggedSlot::Inbounds,
                json!({"type": "mixed", "tag": "m", "listen": "127.0.0.1"}),
            )
            .await
            .expect("create");

        let backups = store.backups().list();
        assert_eq!(backups.len(), 1);
        assert_eq!(backups[0].reason, "before-create-inbound");
        assert_eq!(
            store.backups().get_content(&backups[0].id).expect("bytes"),
            before
        );
    }

    #[tokio::test]
    async fn tagged_crud_lifecycle() {
        let td = tempfile::tempdir().expect("tempdir");
        let store = seeded_store(
            td.path(),
            StubValidator::accepting(),
            json!({"outbounds": [{"type": "direct", "tag": "d"}]}),
        )
        .await;

        // Create, duplicate rejected.
        store
            .create_tagged(TaggedSlot::Outbounds, json!({"type": "block", "tag": "b"}))
            .await
            .expect("create");
        let err = store
            .create_tagged(TaggedSlot::Outbounds, json!({"type": "block", "tag": "b"}))
            .await
            .expect_err("duplicate");
        assert_eq!(err.code(), "BAD_REQUEST");

        // Read.
        let fetched = store
            .get_tagged(TaggedSlot::Outbounds, "b")
            .await
            .expect("get")
            .expect("present");
        assert_eq!(fetched["type"], "block");

        // Replace with rename; collision rejected.
        store
            .replace_tagged(
                TaggedSlot::Outbounds,
                "b",
                json!({"type": "block", "tag": "b2"}),
            )
            .await
            .expect("rename");
        let err = store
            .replace_tagged(
                TaggedSlot::Outbounds,
                "b2",
                json!({"type": "block", "tag": "d"}),
            )
            .await
            .expect_err("rename collision");
        assert_eq!(err.code(), "BAD_REQUEST");

        // Patch is shallow.
        let patched = store
            .patch_tagged(
                TaggedSlot::Outbounds,
                "b2",
                json!({"detour": "d"}),
            )
            .await
            .expect("patch");
        assert_eq!(patched["detour"], "d");
        assert_eq!(patched["type"], "block");

        // Missing tags.
        let err = store
            .replace_tagged(TaggedSlot::Outbounds, "nope", json!({"type": "x", "tag": "n"}))
            .await
            .expect_err("missing");
        assert_eq!(err.code(), "NOT_FOUND");

        // Delete: true then false, and the false path writes nothing.
        assert!(store
            .delete_tagged(TaggedSlot::Outbounds, "b2")
            .await
            .expect("delete"));
        let backups_before = store.backups().list().len();
        assert!(!store
            .delete_tagged(TaggedSlot::Outbounds, "b2")
            .await
            .expect("absent delete"));
        assert_eq!(store.backups().list().len(), backups_before);
    }

    #[tokio::test]
    async fn nested_tagged_slots_reach_into_sections() {
        let td = tempfile::tempdir().expect("tempdir");
        let store = seeded_store(
            td.path(),
            StubValidator::accepting(),
            json!({"outbounds": [{"type": "direct", "tag": "d"}]}),
        )
        .await;

        store
            .create_tagged(TaggedSlot::DnsServers, json!({"tag": "local", "address": "local"}))
            .await
            .expect("create dns server");
        store
            .create_tagged(TaggedSlot::RuleSets, json!({"tag": "geo", "type": "remote"}))
            .await
            .expect("create rule set");

        let doc = store.get().await.expect("get");
        assert_eq!(doc["dns"]["servers"][0]["tag"], "local");
        assert_eq!(doc["route"]["rule_set"][0]["tag"], "geo");
    }

    #[tokio::test]
    async fn indexed_crud_and_reorder() {
        let td = tempfile::tempdir().expect("tempdir");
        let store = seeded_store(
            td.path(),
            StubValidator::accepting(),
            json!({"outbounds": [{"type": "direct", "tag": "d"}]}),
        )
        .await;

        assert_eq!(
            store
                .create_indexed(IndexedSlot::RouteRules, json!({"outbound": "a"}))
                .await
                .expect("create"),
            0
        );
        assert_eq!(
            store
                .create_indexed(IndexedSlot::RouteRules, json!({"outbound": "b"}))
                .await
                .expect("create"),
            1
        );
        store
            .create_indexed(IndexedSlot::RouteRules, json!({"outbound": "c"}))
            .await
            .expect("create");

        // Point reads.
        let rule = store
            .get_indexed(IndexedSlot::RouteRules, 1)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(rule["outbound"], "b");
        assert!(store
            .get_indexed(IndexedSlot::RouteRules, 9)
            .await
            .expect("get")
            .is_none());

        // Replace out of range.
        let err = store
            .replace_indexed(IndexedSlot::RouteRules, 9, json!({"outbound": "x"}))
            .await
            .expect_err("oor");
        assert_eq!(err.code(), "NOT_FOUND");

        // Reorder 0 -> 2: a,b,c becomes b,c,a.
        let order = store
            .reorder_indexed(IndexedSlot::RouteRules, 0, 2)
            .await
            .expect("reorder");
        let outbounds: Vec<&str> = order
            .iter()
            .map(|r| r["outbound"].as_str().expect("str"))
            .collect();
        assert_eq!(outbounds, vec!["b", "c", "a"]);

        let err = store
            .reorder_indexed(IndexedSlot::RouteRules, 0, 3)
            .await
            .expect_err("reorder oor");
        assert_eq!(err.code(), "BAD_REQUEST");

        // Delete: true then false.
        assert!(store
            .delete_indexed(IndexedSlot::RouteRules, 2)
            .await
            .expect("delete"));
        assert!(!store
            .delete_indexed(IndexedSlot::RouteRules, 9)
            .await
            .expect("oor delete"));
    }

    #[tokio::test]
    async fn singleton_roundtrip_preserves_collections() {
        let td = tempfile::tempdir().expect("tempdir");
        let store = seeded_store(
            td.path(),
            StubValidator::accepting(),
            json!({
                "outbounds": [{"type": "direct", "tag": "d"}],
                "dns": {"strategy": "prefer_ipv6", "servers": [{"tag": "local"}]},
            }),
        )
        .await;

        let view = store
            .get_singleton(SingletonSlot::Dns)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(view, json!({"strategy": "prefer_ipv6"}));

        store
            .set_singleton(SingletonSlot::Dns, json!({"strategy": "ipv4_only"}))
            .await
            .expect("set");
        let doc = store.get().await.expect("get");
        assert_eq!(doc["dns"]["strategy"], "ipv4_only");
        assert_eq!(doc["dns"]["servers"], json!([{"tag": "local"}]));

        store
            .patch_singleton(SingletonSlot::Log, json!({"level": "debug"}))
            .await
            .expect("patch");
        let doc = store.get().await.expect("get");
        assert_eq!(doc["log"]["level"], "debug");

        // Certificate deletion contract.
        assert!(!store
            .delete_singleton(SingletonSlot::Certificate)
            .await
            .expect("absent"));
        store
            .set_singleton(SingletonSlot::Certificate, json!({"store": "system"}))
            .await
            .expect("set certificate");
        assert!(store
            .delete_singleton(SingletonSlot::Certificate)
            .await
            .expect("delete"));
        let err = store
            .delete_singleton(SingletonSlot::Log)
            .await
            .expect_err("log not deletable");
        assert_eq!(err.code(), "BAD_REQUEST");
    }

    #[tokio::test]
    async fn patch_document_deep_merges() {
        let td = tempfile::tempdir().expect("tempdir");
        let store = seeded_store(
            td.path(),
            StubValidator::accepting(),
            json!({
                "log": {"level": "info", "output": "stderr"},
                "outbounds": [{"type": "direct", "tag": "d"}],
            }),
        )
        .await;

        let merged = store
            .patch_document(json!({"log": {"level": "warn"}}), None)
            .await
            .expect("patch");
        assert_eq!(merged["log"]["level"], "warn");
        assert_eq!(merged["log"]["output"], "stderr");
        assert_eq!(merged["outbounds"][0]["tag"], "d");
    }

    #[tokio::test]
    async fn caller_reason_overrides_default() {
        let td = tempfile::tempdir().expect("tempdir");
        let store = seeded_store(
            td.path(),
            StubValidator::accepting(),
            json!({"outbounds": [{"type": "direct", "tag": "d"}]}),
        )
        .await;

        store
            .set_document(json!({"outbounds": [{"type": "block", "tag": "b"}]}), Some("backend-apply"))
            .await
            .expect("set");
        let backups = store.backups().list();
        assert_eq!(backups[0].reason, "backend-apply");
    }

    #[tokio::test]
    async fn backups_disabled_skips_snapshots() {
        let td = tempfile::tempdir().expect("tempdir");
        let validator = StubValidator::accepting();
        let store = ConfigStore::new(
            td.path().join("config.json"),
            validator,
            BackupStore::new(td.path().join("backups"), 10),
            false,
            false,
        );
        std::fs::write(store.path(), "{}").expect("seed");

        store
            .set_document(json!({"log": {"level": "info"}}), None)
            .await
            .expect("set");
        assert!(store.backups().list().is_empty());
    }

    #[tokio::test]
    async fn reload_hook_fires_after_write() {
        struct CountingHook(AtomicUsize);

        #[async_trait]
        impl ReloadHook for CountingHook {
            async fn reload_if_running(&self) -> anyhow::Result<bool> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }
        }

        let td = tempfile::tempdir().expect("tempdir");
        let store = ConfigStore::new(
            td.path().join("config.json"),
            StubValidator::accepting(),
            BackupStore::new(td.path().join("backups"), 10),
            true,
            true,
        );
        std::fs::write(store.path(), "{}").expect("seed");

        let hook = Arc::new(CountingHook(AtomicUsize::new(0)));
        store.set_reload_hook(Arc::clone(&hook) as Arc<dyn ReloadHook>);

        store
            .set_document(json!({"log": {}}), None)
            .await
            .expect("set");
        assert_eq!(hook.0.load(Ordering::SeqCst), 1);

        // A failing hook does not fail the write.
        struct FailingHook;
        #[async_trait]
        impl ReloadHook for FailingHook {
            async fn reload_if_running(&self) -> anyhow::Result<bool> {
                anyhow::bail!("sighup failed")
            }
        }
        store.set_reload_hook(Arc::new(FailingHook));
        store
            .set_document(json!({"log": {"level": "debug"}}), None)
            .await
            .expect("write still succeeds");
    }

    #[tokio::test]
    async fn concurrent_reads_see_full_documents() {
        let td = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(seeded_store(
            td.path(),
            StubValidator::accepting(),
            json!({"outbounds": [{"type": "direct", "tag": "d"}]}),
        )
        .await);

        let writer = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                for i in 0..10 {
                    store
                        .set_document(
                            json!({"outbounds": [{"type": "direct", "tag": format!("d{}", i)}]}),
                            None,
                        )
                        .await
                        .expect("set");
                }
            })
        };

        for _ in 0..50 {
            let doc = store.get().await.expect("read");
            // Every observed document is a complete pre- or post-image.
            let tag = doc["outbounds"][0]["tag"].as_str().expect("tag");
            assert!(tag == "d" || tag.starts_with('d'));
        }
        writer.await.expect("writer");
    }

    #[tokio::test]
    async fn invalidate_cache_reloads_from_disk() {
        let td = tempfile::tempdir().expect("tempdir");
        let store = seeded_store(
            td.path(),
            StubValidator::accepting(),
            json!({"log": {"level": "info"}}),
        )
        .await;
        store.get().await.expect("prime cache");

        // Out-of-band edit invisible until invalidation.
        std::fs::write(
            store.path(),
            serde_json::to_string_pretty(&json!({"log": {"level": "out-of-band"}})).expect("json"),
        )
        .expect("seed");
        assert_eq!(store.get().await.expect("cached")["log"]["level"], "info");
        store.invalidate_cache();
        assert_eq!(
            store.get().await.expect("reloaded")["log"]["level"],
            "out-of-band"
        );
    }
}
