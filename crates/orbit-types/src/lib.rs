//! Domain types for the orbit-node control plane.
//!
//! This crate defines the shared vocabulary of the node: the error
//! taxonomy with its stable wire codes, the settings consumed by every
//! component, and serde helpers for duration knobs.
//!
//! # Example
//!
//! ```
//! use orbit_types::{NodeError, NodeSettings};
//!
//! let settings: NodeSettings = serde_json::from_str(
//!     r#"{"configPath": "/etc/sing-box/config.json", "restartDelay": "2s"}"#,
//! ).expect("parse");
//! assert_eq!(settings.max_restarts, 5);
//!
//! let err = NodeError::not_found("inbound 'socks-in' not found");
//! assert_eq!(err.code(), "NOT_FOUND");
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Deserialize a Duration from either a string (human-readable) or u64 (milliseconds)
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationHelper {
        String(String),
        U64(u64),
    }

    match DurationHelper::deserialize(deserializer)? {
        DurationHelper::String(s) => humantime::parse_duration(&s)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration: {}", e))),
        DurationHelper::U64(ms) => Ok(Duration::from_millis(ms)),
    }
}

/// Serialize a Duration as milliseconds (u64) so it roundtrips with deserialize_duration
pub fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// A single validation finding produced by the external binary (or the
/// shape pre-check that runs before it).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Stable machine code, e.g. `SINGBOX_VALIDATION_ERROR`.
    pub code: String,
    /// Human-readable message, trimmed from the binary's stderr.
    pub message: String,
}

impl ValidationIssue {
    /// Issue emitted when the external binary rejects a candidate document.
    pub fn singbox(message: impl Into<String>) -> Self {
        Self {
            code: "SINGBOX_VALIDATION_ERROR".to_string(),
            message: message.into(),
        }
    }

    /// Issue emitted by the shape pre-check for non-object inputs.
    pub fn invalid_type(message: impl Into<String>) -> Self {
        Self {
            code: "INVALID_TYPE".to_string(),
            message: message.into(),
        }
    }
}

/// Outcome of validating a candidate configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Whether the document was accepted.
    pub valid: bool,
    /// Findings; empty when `valid` is true.
    #[serde(default)]
    pub errors: Vec<ValidationIssue>,
}

impl ValidationReport {
    /// A report accepting the document.
    pub fn ok() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
        }
    }

    /// A report rejecting the document with a single issue.
    pub fn rejected(issue: ValidationIssue) -> Self {
        Self {
            valid: false,
            errors: vec![issue],
        }
    }

    /// All messages joined for error display.
    pub fn joined_messages(&self) -> String {
        self.errors
            .iter()
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Error taxonomy of the node core.
///
/// Every variant maps to one of the stable code strings the HTTP layer
/// surfaces in its error envelope; see [`NodeError::code`].
#[derive(Debug, Error)]
pub enum NodeError {
    /// Input had the wrong JSON type (e.g. a non-object document).
    #[error("{0}")]
    InvalidType(String),

    /// Input was structurally unacceptable (unknown section, duplicate
    /// tag, out-of-range reorder, malformed JSON on disk).
    #[error("{0}")]
    BadRequest(String),

    /// A tag, index, backup, or the config file itself was absent.
    #[error("{0}")]
    NotFound(String),

    /// The external binary rejected a candidate document.
    #[error("configuration validation failed: {}", .0.joined_messages())]
    ConfigValidation(ValidationReport),

    /// Spawn failure, missing binary/config, premature child exit, or a
    /// lifecycle operation against a child in the wrong state.
    #[error("{0}")]
    Process(String),

    /// A lock acquisition timed out; no state was mutated.
    #[error("{0}")]
    LockTimeout(String),

    /// Anything else; carries the underlying cause chain.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl NodeError {
    /// The stable code string for this error.
    pub fn code(&self) -> &'static str {
        match self {
            NodeError::InvalidType(_) => "INVALID_TYPE",
            NodeError::BadRequest(_) => "BAD_REQUEST",
            NodeError::NotFound(_) => "NOT_FOUND",
            NodeError::ConfigValidation(_) => "CONFIG_VALIDATION_ERROR",
            NodeError::Process(_) => "PROCESS_ERROR",
            NodeError::LockTimeout(_) | NodeError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Shorthand constructor for [`NodeError::BadRequest`].
    pub fn bad_request(msg: impl Into<String>) -> Self {
        NodeError::BadRequest(msg.into())
    }

    /// Shorthand constructor for [`NodeError::NotFound`].
    pub fn not_found(msg: impl Into<String>) -> Self {
        NodeError::NotFound(msg.into())
    }

    /// Shorthand constructor for [`NodeError::Process`].
    pub fn process(msg: impl Into<String>) -> Self {
        NodeError::Process(msg.into())
    }
}

/// Result alias used across the node crates.
pub type NodeResult<T> = Result<T, NodeError>;

fn default_binary() -> PathBuf {
    PathBuf::from("sing-box")
}

fn default_true() -> bool {
    true
}

fn default_restart_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_restarts() -> u32 {
    5
}

fn default_restart_window() -> Duration {
    Duration::from_secs(60)
}

fn default_backup_max_count() -> usize {
    10
}

fn default_max_lines() -> usize {
    1000
}

fn default_file_max_size() -> u64 {
    5 * 1024 * 1024
}

fn default_file_max_files() -> usize {
    3
}

/// Log ring and persistence knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LogSettings {
    /// Capacity of the in-memory ring (oldest lines are evicted).
    pub max_lines: usize,
    /// Whether captured lines are also appended to a file.
    pub persist: bool,
    /// Target file for persisted lines; required when `persist` is true.
    pub file_path: Option<PathBuf>,
    /// Size threshold that triggers rotation to `<filePath>.1`.
    pub file_max_size: u64,
    /// Total number of files kept (active plus rotated siblings).
    pub file_max_files: usize,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            max_lines: default_max_lines(),
            persist: false,
            file_path: None,
            file_max_size: default_file_max_size(),
            file_max_files: default_file_max_files(),
        }
    }
}

/// All runtime knobs consumed by the node core.
///
/// Durations accept either an integer (milliseconds) or a human-readable
/// string such as `"30s"`; they serialize back as milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NodeSettings {
    /// Path of the active configuration document.
    pub config_path: PathBuf,
    /// The sing-box binary: an absolute path or a bare name resolved via PATH.
    pub binary: PathBuf,
    /// Working directory for the child; defaults to the config directory.
    pub working_dir: Option<PathBuf>,

    /// Whether unexpected child exits schedule an automatic restart.
    pub auto_restart: bool,
    /// Base delay of the exponential restart backoff.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub restart_delay: Duration,
    /// Maximum auto-restart attempts inside one sliding window.
    pub max_restarts: u32,
    /// Width of the restart sliding window.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub restart_window: Duration,

    /// Whether mutating writes snapshot the previous content first.
    pub backup_enabled: bool,
    /// Retention bound enforced by rotation after every create.
    pub backup_max_count: usize,
    /// Snapshot directory; defaults to `backups` next to the config file.
    pub backup_dir: Option<PathBuf>,

    /// Whether a successful mutation SIGHUPs a running child.
    pub auto_reload: bool,

    /// Log capture and persistence knobs.
    pub logs: LogSettings,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("config.json"),
            binary: default_binary(),
            working_dir: None,
            auto_restart: true,
            restart_delay: default_restart_delay(),
            max_restarts: default_max_restarts(),
            restart_window: default_restart_window(),
            backup_enabled: true,
            backup_max_count: default_backup_max_count(),
            backup_dir: None,
            auto_reload: true,
            logs: LogSettings::default(),
        }
    }
}

impl NodeSettings {
    /// The directory holding the active config file.
    pub fn config_dir(&self) -> PathBuf {
        self.config_path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// The child's working directory, defaulting to the config directory.
    pub fn effective_working_dir(&self) -> PathBuf {
        self.working_dir
            .clone()
            .unwrap_or_else(|| self.config_dir())
    }

    /// The snapshot directory, defaulting to `backups` next to the config.
    pub fn effective_backup_dir(&self) -> PathBuf {
        self.backup_dir
            .clone()
            .unwrap_or_else(|| self.config_dir().join("backups"))
    }
}
