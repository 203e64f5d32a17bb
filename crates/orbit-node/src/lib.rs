//! # orbit-node
//!
//! A per-node control plane for a long-running sing-box daemon.
//!
//! orbit-node owns the on-disk configuration document, supervises the
//! sing-box child process, and backs every mutation with out-of-process
//! validation, content-addressed snapshots, and atomic writes. An HTTP
//! layer (out of scope here) maps REST routes onto the operations this
//! crate exposes.
//!
//! ## Pipeline
//!
//! Every mutating request runs the same write pipeline:
//!
//! 1. acquire the writer-preference lock ([`orbit_lock::TimedRwLock`])
//! 2. read the current document through the cache
//! 3. compute and validate the candidate (`sing-box check`)
//! 4. snapshot the previous bytes ([`orbit_backup::BackupStore`])
//! 5. atomically rename a temp file over the active path
//! 6. SIGHUP a running child when auto-reload is enabled
//!
//! Reads take only the shared lock and are served from cache.
//!
//! ## Example
//!
//! ```ignore
//! use orbit_node::Node;
//! use orbit_types::NodeSettings;
//!
//! let settings: NodeSettings = serde_json::from_str(
//!     r#"{"configPath": "/etc/sing-box/config.json"}"#,
//! )?;
//! let node = Node::new(settings)?;
//! node.ensure_config().await?;
//! node.supervisor().start().await?;
//! ```
//!
//! ## Modules
//!
//! - [`document`] — the ten-section document model, merges, shape checks
//! - [`store`] — cached config store with the atomic write pipeline
//! - [`validate`] — `sing-box check` invocation and version probing
//! - [`supervisor`] — child lifecycle state machine with auto-restart
//! - [`diff`] — structural diff between documents
//! - [`probe`] — outbound HEAD probing and latency sampling
//! - [`node`] — the composition root wiring everything together

/// The ten-section document model, merges, and shape checks.
pub mod document;

/// Structural diff between two configuration documents.
pub mod diff;

/// The composition root.
pub mod node;

/// Outbound HEAD probing and latency sampling.
pub mod probe;

/// Cached config store with the atomic write pipeline.
pub mod store;

/// Child lifecycle state machine with bounded auto-restart.
pub mod supervisor;

/// Out-of-process validation via `sing-box check`.
pub mod validate;


pub use diff::{ChangeKind, ConfigChange, DiffReport, diff_documents, render_changes};
pub use document::{IndexedSlot, SingletonSlot, TaggedSlot};
pub use node::{
    ExportBundle, ExportMetadata, ImportOptions, ImportOutcome, ImportRequest, Node,
};
pub use probe::{LatencyReport, OutboundProber, ProbeOutcome};
pub use store::{ConfigStore, ReloadHook};
pub use supervisor::{
    ReloadOutcome, RestartStats, Supervisor, SupervisorState, SupervisorStatus,
};
pub use validate::{BinaryValidator, ConfigValidator, binary_version};
