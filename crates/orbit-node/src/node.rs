//! The composition root.
//!
//! [`Node`] constructs and owns every component — validator, backup
//! store, log ring, config store, supervisor, prober — and wires the
//! supervisor into the store as the auto-reload hook. The HTTP layer
//! talks to a `Node`; nothing in here knows about routing or auth.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use orbit_backup::{Backup, BackupStore};
use orbit_logbuf::{LogRing, PersistSettings};
use orbit_types::{NodeError, NodeResult, NodeSettings};

use crate::diff::{DiffReport, diff_documents};
use crate::document::{self, deep_merge};
use crate::probe::OutboundProber;
use crate::store::ConfigStore;
use crate::supervisor::{Supervisor, SupervisorSettings, SupervisorStatus};
use crate::validate::{BinaryValidator, ConfigValidator, binary_version};

/// Version stamp carried by export bundles.
pub const EXPORT_FORMAT_VERSION: &str = "1.0";

/// Metadata attached to an exported configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportMetadata {
    pub exported_at: DateTime<Utc>,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub singbox_version: Option<String>,
}

/// The export payload: the document plus provenance metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportBundle {
    pub config: Value,
    pub metadata: ExportMetadata,
}

/// Metadata accepted on import; all fields optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ImportMetadata {
    pub version: Option<String>,
    pub singbox_version: Option<String>,
}

/// An import request: the document plus optional provenance.
#[derive(Debug, Clone, Deserialize)]
pub struct ImportRequest {
    pub config: Value,
    #[serde(default)]
    pub metadata: Option<ImportMetadata>,
}

/// Knobs for [`Node::import`].
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ImportOptions {
    /// Run the external validator against the final document.
    pub validate: bool,
    /// Deep-merge into the current document instead of replacing it.
    pub merge: bool,
    /// Snapshot the previous content with reason `before-import`.
    pub create_backup: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            validate: true,
            merge: false,
            create_backup: true,
        }
    }
}

/// Result of a successful import.
#[derive(Debug, Clone, Serialize)]
pub struct ImportOutcome {
    pub success: bool,
    pub config: Value,
    pub warnings: Vec<String>,
}

/// The assembled per-node control plane.
pub struct Node {
    settings: NodeSettings,
    store: Arc<ConfigStore>,
    supervisor: Supervisor,
    prober: OutboundProber,
    logs: LogRing,
}

impl Node {
    /// Build a node that validates through the real sing-box binary.
    ///
    /// A bare binary name is resolved via `PATH` once, up front; if the
    /// binary is not installed yet the configured value is kept and the
    /// supervisor surfaces the failure at start time.
    pub fn new(mut settings: NodeSettings) -> NodeResult<Self> {
        if let Ok(resolved) = orbit_process::resolve_binary(&settings.binary) {
            settings.binary = resolved;
        }
        let validator: Arc<dyn ConfigValidator> = Arc::new(BinaryValidator::new(
            settings.binary.clone(),
            settings.config_dir(),
        ));
        Self::with_validator(settings, validator)
    }

    /// Build a node with an injected validator (used by test suites).
    pub fn with_validator(
        settings: NodeSettings,
        validator: Arc<dyn ConfigValidator>,
    ) -> NodeResult<Self> {
        let logs = match (settings.logs.persist, &settings.logs.file_path) {
            (true, Some(path)) => LogRing::with_persistence(
                settings.logs.max_lines,
                PersistSettings {
                    path: path.clone(),
                    max_size: settings.logs.file_max_size,
                    max_files: settings.logs.file_max_files,
                },
            ),
            _ => LogRing::new(settings.logs.max_lines),
        };

        let backups = BackupStore::new(settings.effective_backup_dir(), settings.backup_max_count);
        let store = Arc::new(ConfigStore::new(
            settings.config_path.clone(),
            Arc::clone(&validator),
            backups,
            settings.backup_enabled,
            settings.auto_reload,
        ));

        let supervisor = Supervisor::new(
            SupervisorSettings::from(&settings),
            validator,
            logs.clone(),
        );
        store.set_reload_hook(Arc::new(supervisor.clone()));

        let prober = OutboundProber::new(Arc::clone(&store))?;

        Ok(Self {
            settings,
            store,
            supervisor,
            prober,
            logs,
        })
    }

    /// The node's settings.
    pub fn settings(&self) -> &NodeSettings {
        &self.settings
    }

    /// The configuration store.
    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    /// The process supervisor.
    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// The outbound prober.
    pub fn prober(&self) -> &OutboundProber {
        &self.prober
    }

    /// The captured child log ring.
    pub fn logs(&self) -> &LogRing {
        &self.logs
    }

    /// Write the bootstrap document if no config exists yet.
    pub async fn ensure_config(&self) -> NodeResult<bool> {
        self.store.ensure_config().await
    }

    /// Supervisor status snapshot.
    pub async fn status(&self) -> SupervisorStatus {
        self.supervisor.status().await
    }

    // ---- backups -----------------------------------------------------------

    /// All snapshot records, newest first.
    pub fn list_backups(&self) -> Vec<Backup> {
        self.store.backups().list()
    }

    /// One snapshot record.
    pub fn get_backup(&self, id: &str) -> Option<Backup> {
        self.store.backups().get(id)
    }

    /// Remove a snapshot; false when absent.
    pub fn delete_backup(&self, id: &str) -> bool {
        self.store.backups().delete(id)
    }

    /// Snapshot the current file content on demand.
    pub async fn create_backup(&self, reason: Option<&str>) -> NodeResult<Backup> {
        let bytes = self.store.current_bytes().await?;
        self.store
            .backups()
            .create(&bytes, reason.unwrap_or("manual"))
            .map_err(NodeError::Internal)
    }

    /// Replace the active document with a snapshot's content.
    pub async fn restore_backup(&self, id: &str) -> NodeResult<Value> {
        let bytes = self
            .store
            .backups()
            .get_content(id)
            .ok_or_else(|| NodeError::not_found(format!("backup '{}' not found", id)))?;
        let document: Value = serde_json::from_slice(&bytes).map_err(|e| {
            NodeError::bad_request(format!("backup content is not valid JSON: {}", e))
        })?;
        self.store.restore(document).await
    }

    /// Diff a snapshot against the current document.
    pub async fn diff_with_current(&self, id: &str) -> NodeResult<DiffReport> {
        let old = self.backup_document(id)?;
        let current = self.store.get().await?;
        Ok(diff_documents(&old, &current))
    }

    /// Diff two snapshots.
    pub fn diff_backups(&self, old_id: &str, new_id: &str) -> NodeResult<DiffReport> {
        let old = self.backup_document(old_id)?;
        let new = self.backup_document(new_id)?;
        Ok(diff_documents(&old, &new))
    }

    fn backup_document(&self, id: &str) -> NodeResult<Value> {
        let bytes = self
            .store
            .backups()
            .get_content(id)
            .ok_or_else(|| NodeError::not_found(format!("backup '{}' not found", id)))?;
        serde_json::from_slice(&bytes).map_err(|e| {
            NodeError::bad_request(format!("backup content is not valid JSON: {}", e))
        })
    }

    // ---- export / import ---------------------------------------------------

    /// Bundle the current document with provenance metadata.
    pub async fn export(&self) -> NodeResult<ExportBundle> {
        let config = self.store.get().await?;
        Ok(ExportBundle {
            config,
            metadata: ExportMetadata {
                exported_at: Utc::now(),
                version: EXPORT_FORMAT_VERSION.to_string(),
                singbox_version: binary_version(&self.settings.binary).await,
            },
        })
    }

    /// Import a bundle, optionally merging into the current document.
    pub async fn import(
        &self,
        request: ImportRequest,
        options: ImportOptions,
    ) -> NodeResult<ImportOutcome> {
        if !request.config.is_object() {
            return Err(NodeError::InvalidType(
                "imported config must be a JSON object".to_string(),
            ));
        }

        let mut warnings = Vec::new();
        if let Some(metadata) = &request.metadata {
            if let Some(version) = &metadata.version
                && version != EXPORT_FORMAT_VERSION
            {
                warnings.push(format!(
                    "export format version {} differs from {}",
                    version, EXPORT_FORMAT_VERSION
                ));
            }
            if let Some(exported_from) = &metadata.singbox_version
                && let Some(local) = binary_version(&self.settings.binary).await
                && *exported_from != local
            {
                warnings.push(format!(
                    "config was exported from sing-box {}, local binary is {}",
                    exported_from, local
                ));
            }
        }

        let final_document = if options.merge {
            let mut current = self.store.get().await?;
            deep_merge(&mut current, &request.config);
            current
        } else {
            request.config
        };
        document::validate_shape(&final_document)?;

        let config = self
            .store
            .apply_import(final_document, options.validate, options.create_backup)
            .await?;

        Ok(ImportOutcome {
            success: true,
            config,
            warnings,
        })
    }

    /// Stop the child and flush pending log lines.
    pub async fn shutdown(&self) -> NodeResult<()> {
        self.supervisor.stop().await?;
        self.logs.flush().await;
        Ok(())
    }
}
