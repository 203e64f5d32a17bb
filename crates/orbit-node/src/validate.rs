//! Out-of-process configuration validation.
//!
//! The node never interprets sing-box semantics itself: a candidate
//! document is serialized to a temp file and handed to
//! `<binary> check -c <path>`. Exit 0 accepts; anything else rejects
//! with whatever the binary wrote to stderr.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use orbit_process::run_capture;
use orbit_types::{NodeError, NodeResult, ValidationIssue, ValidationReport};

static DECODE_ERROR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"decode config.*?: (.+)").unwrap_or_else(|e| {
        // The pattern is a compile-time constant; this cannot fail.
        unreachable!("invalid decode-error pattern: {}", e)
    })
});

static VERSION_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"sing-box version (\S+)")
        .unwrap_or_else(|e| unreachable!("invalid version pattern: {}", e))
});

/// Seam for semantic validation, stubbable in tests.
#[async_trait]
pub trait ConfigValidator: Send + Sync {
    /// Validate a candidate document.
    async fn validate(&self, document: &Value) -> NodeResult<ValidationReport>;

    /// Validate bytes already on disk, exactly as the child would read them.
    async fn validate_file(&self, path: &Path) -> NodeResult<ValidationReport>;
}

/// Validator that shells out to the sing-box binary.
#[derive(Debug, Clone)]
pub struct BinaryValidator {
    binary: PathBuf,
    config_dir: PathBuf,
}

impl BinaryValidator {
    /// `config_dir` hosts the transient `.config-validate-<uuid>.json`
    /// files so validation sees the same directory context as the child.
    pub fn new(binary: PathBuf, config_dir: PathBuf) -> Self {
        Self { binary, config_dir }
    }
}

#[async_trait]
impl ConfigValidator for BinaryValidator {
    async fn validate(&self, document: &Value) -> NodeResult<ValidationReport> {
        if !document.is_object() {
            return Ok(ValidationReport::rejected(ValidationIssue::invalid_type(
                "configuration must be a JSON object",
            )));
        }

        tokio::fs::create_dir_all(&self.config_dir).await.map_err(|e| {
            NodeError::Internal(anyhow::anyhow!(
                "failed to create config dir {}: {}",
                self.config_dir.display(),
                e
            ))
        })?;
        let temp_path = self
            .config_dir
            .join(format!(".config-validate-{}.json", uuid::Uuid::new_v4()));
        let pretty = serde_json::to_string_pretty(document)
            .map_err(|e| NodeError::Internal(anyhow::Error::from(e)))?;
        tokio::fs::write(&temp_path, pretty).await.map_err(|e| {
            NodeError::Internal(anyhow::anyhow!(
                "failed to write validation temp file {}: {}",
                temp_path.display(),
                e
            ))
        })?;

        let report = self.validate_file(&temp_path).await;
        if let Err(e) = tokio::fs::remove_file(&temp_path).await {
            debug!(path = %temp_path.display(), error = %e, "failed to remove validation temp file");
        }
        report
    }

    async fn validate_file(&self, path: &Path) -> NodeResult<ValidationReport> {
        let path_arg = path.to_string_lossy().to_string();
        let capture = run_capture(&self.binary, &["check", "-c", path_arg.as_str()], None, None)
            .await
            .map_err(|e| NodeError::process(format!("failed to invoke validator: {:#}", e)))?;

        if capture.exit_code == 0 {
            return Ok(ValidationReport::ok());
        }
        Ok(ValidationReport::rejected(ValidationIssue::singbox(
            extract_error(&capture.stderr),
        )))
    }
}

/// Pull the useful part out of the binary's stderr.
fn extract_error(stderr: &str) -> String {
    if let Some(captures) = DECODE_ERROR.captures(stderr)
        && let Some(detail) = captures.get(1)
    {
        return detail.as_str().trim().to_string();
    }
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        "Invalid configuration".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Lazily probed binary version, e.g. `1.10.3`. None on any failure.
pub async fn binary_version(binary: &Path) -> Option<String> {
    let capture = run_capture(binary, &["version"], None, None).await.ok()?;
    if !capture.success() {
        return None;
    }
    VERSION_LINE
        .captures(&capture.stdout)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use serde_json::json;

    fn fake_binary(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("sing-box");
        let mut f = std::fs::File::create(&path).expect("create");
        writeln!(f, "#!/bin/sh\n{}", body).expect("write");
        let mut perms = f.metadata().expect("meta").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).expect("chmod");
        path
    }

    #[test]
    fn extract_prefers_decode_detail() {
        let stderr = "FATAL[0000] decode config at inbounds[0]: unknown inbound type: bogus\n";
        assert_eq!(extract_error(stderr), "unknown inbound type: bogus");
    }

    #[test]
    fn extract_falls_back_to_trimmed_stderr() {
        assert_eq!(extract_error("  something broke  \n"), "something broke");
    }

    #[test]
    fn extract_defaults_when_stderr_empty() {
        assert_eq!(extract_error("   \n"), "Invalid configuration");
    }

    #[tokio::test]
    async fn non_object_rejected_without_binary() {
        // A binary path that does not exist: the pre-check must short-circuit.
        let validator = BinaryValidator::new(
            PathBuf::from("/nonexistent/sing-box"),
            std::env::temp_dir(),
        );
        let report = validator.validate(&json!([1, 2])).await.expect("report");
        assert!(!report.valid);
        assert_eq!(report.errors[0].code, "INVALID_TYPE");
    }

    #[tokio::test]
    async fn accepting_binary_yields_valid() {
        let td = tempfile::tempdir().expect("tempdir");
        let binary = fake_binary(td.path(), "exit 0");
        let validator = BinaryValidator::new(binary, td.path().to_path_buf());

        let report = validator
            .validate(&json!({"log": {}}))
            .await
            .expect("report");
        assert!(report.valid);

        // Temp file cleaned up.
        let leftovers: Vec<_> = std::fs::read_dir(td.path())
            .expect("read dir")
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with(".config-validate-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn rejecting_binary_yields_extracted_message() {
        let td = tempfile::tempdir().expect("tempdir");
        let binary = fake_binary(
            td.path(),
            "echo 'decode config at inbounds[0]: unknown inbound type: bogus' >&2; exit 1",
        );
        let validator = BinaryValidator::new(binary, td.path().to_path_buf());

        let report = validator
            .validate(&json!({"inbounds": []}))
            .await
            .expect("report");
        assert!(!report.valid);
        assert_eq!(report.errors[0].code, "SINGBOX_VALIDATION_ERROR");
        assert_eq!(report.errors[0].message, "unknown inbound type: bogus");
    }

    #[tokio::test]
    async fn missing_binary_is_a_process_error() {
        let td = tempfile::tempdir().expect("tempdir");
        let validator = BinaryValidator::new(
            PathBuf::from("/nonexistent/sing-box"),
            td.path().to_path_buf(),
        );
        let err = validator
            .validate(&json!({"log": {}}))
            .await
            .expect_err("must fail");
        assert_eq!(err.code(), "PROCESS_ERROR");
    }

    #[tokio::test]
    async fn version_probe_extracts_semver() {
        let td = tempfile::tempdir().expect("tempdir");
        let binary = fake_binary(
            td.path(),
            "echo 'sing-box version 1.10.3'\necho 'Tags: with_quic'\necho 'CGO: disabled'",
        );
        assert_eq!(
            binary_version(&binary).await.as_deref(),
            Some("1.10.3")
        );
    }

    #[tokio::test]
    async fn version_probe_absorbs_failure() {
        assert!(binary_version(Path::new("/nonexistent/sing-box")).await.is_none());
    }
}
