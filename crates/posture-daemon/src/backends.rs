//! Production backends for the core seams.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use posture_core::ingestion::{
    ExecutionHandle, OrchestratorError, RemediationOrchestrator, RemediationRequest,
};
use posture_core::sweep::{FindingPage, FindingQuery, FindingSource, SourceError, paginate};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Environment variable carrying the execution id to the remediation command.
pub const EXECUTION_ID_ENV: &str = "POSTURE_EXECUTION_ID";

/// Reads a newline-delimited JSON file.
///
/// Blank lines are ignored. Lines that are not JSON are logged and skipped.
///
/// # Errors
///
/// Returns the I/O error if the file cannot be read.
pub async fn read_ndjson(path: &Path) -> std::io::Result<Vec<Value>> {
    let content = tokio::fs::read_to_string(path).await?;
    let mut values = Vec::new();
    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(value) => values.push(value),
            Err(e) => warn!(
                path = %path.display(),
                line = index + 1,
                error = %e,
                "skipping unparseable line"
            ),
        }
    }
    Ok(values)
}

// =============================================================================
// Finding source
// =============================================================================

/// Finding source over an exported NDJSON file of canonical findings.
///
/// The file is re-read on every query, so an export refreshed between
/// sweeps is picked up without a restart.
#[derive(Debug, Clone)]
pub struct NdjsonFindingSource {
    path: PathBuf,
}

impl NdjsonFindingSource {
    /// Creates a source over `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl FindingSource for NdjsonFindingSource {
    async fn get_findings(&self, query: &FindingQuery) -> Result<FindingPage, SourceError> {
        let findings = read_ndjson(&self.path).await?;
        let page = paginate(&findings, query)?;
        debug!(
            path = %self.path.display(),
            returned = page.findings.len(),
            has_more = page.next_token.is_some(),
            "finding page served"
        );
        Ok(page)
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Starts each remediation as an external process.
///
/// The request is written to the child's standard input as JSON and the
/// execution id is passed in [`EXECUTION_ID_ENV`]. The call returns once the
/// request is handed over; the child is reaped in the background.
#[derive(Debug, Clone)]
pub struct CommandOrchestrator {
    program: String,
    args: Vec<String>,
}

impl CommandOrchestrator {
    /// Creates an orchestrator running `program` with `args`.
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl RemediationOrchestrator for CommandOrchestrator {
    async fn start_execution(
        &self,
        request: &RemediationRequest,
    ) -> Result<ExecutionHandle, OrchestratorError> {
        let payload = serde_json::to_vec(request)
            .map_err(|e| OrchestratorError::Rejected(format!("request not serializable: {e}")))?;
        let execution_id = Uuid::new_v4().to_string();

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env(EXECUTION_ID_ENV, &execution_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                OrchestratorError::Unavailable(format!("failed to spawn {}: {e}", self.program))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(&payload).await {
                let _ = child.start_kill();
                return Err(OrchestratorError::Unavailable(format!(
                    "failed to hand request to {}: {e}",
                    self.program
                )));
            }
            // Dropping stdin closes the pipe so the child sees EOF.
        }

        info!(
            execution_id = %execution_id,
            finding_id = %request.finding.id,
            program = %self.program,
            "remediation process started"
        );

        let reaped_id = execution_id.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => {
                    debug!(execution_id = %reaped_id, "remediation process exited");
                },
                Ok(status) => {
                    warn!(
                        execution_id = %reaped_id,
                        status = %status,
                        "remediation process failed"
                    );
                },
                Err(e) => {
                    warn!(execution_id = %reaped_id, error = %e, "remediation process lost");
                },
            }
        });

        Ok(ExecutionHandle { execution_id })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use posture_core::sweep::QueryField;
    use serde_json::json;

    use super::*;

    fn asff(id: &str, control: &str) -> Value {
        json!({
            "SchemaVersion": "2018-10-08",
            "Id": id,
            "ProductArn": "arn:aws:securityhub:us-east-1::product/aws/securityhub",
            "GeneratorId": format!("security-control/{control}"),
            "AwsAccountId": "111111111111",
            "CreatedAt": "2024-05-01T12:00:00Z",
            "UpdatedAt": "2024-05-01T12:00:00Z",
            "Severity": { "Label": "HIGH" },
            "Compliance": { "Status": "FAILED", "SecurityControlId": control },
            "Resources": [{ "Type": "AwsS3Bucket", "Id": "arn:aws:s3:::bucket" }],
            "RecordState": "ACTIVE"
        })
    }

    fn write_export(lines: &[String]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        file
    }

    #[tokio::test]
    async fn ndjson_skips_blank_and_bad_lines() {
        let file = write_export(&[
            asff("a", "S3.1").to_string(),
            String::new(),
            "{ truncated".to_string(),
            asff("b", "S3.1").to_string(),
        ]);
        let values = read_ndjson(file.path()).await.unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values[1]["Id"], "b");
    }

    #[tokio::test]
    async fn source_pages_through_export() {
        let lines: Vec<String> = (0..5)
            .map(|i| asff(&format!("f-{i}"), "S3.1").to_string())
            .chain(std::iter::once(asff("other", "EC2.2").to_string()))
            .collect();
        let file = write_export(&lines);
        let source = NdjsonFindingSource::new(file.path());

        let query = FindingQuery::reconciliation(
            &["S3.1".to_string()],
            &["security-control/".to_string()],
            2,
        );
        assert!(query.filters.contains_key(&QueryField::ComplianceSecurityControlId));

        let mut token = None;
        let mut seen = 0;
        let mut pages = 0;
        loop {
            let page = source.get_findings(&query.at_page(token.take())).await.unwrap();
            seen += page.findings.len();
            pages += 1;
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        assert_eq!(seen, 5);
        assert_eq!(pages, 3);
    }

    #[tokio::test]
    async fn missing_export_is_a_source_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = NdjsonFindingSource::new(dir.path().join("absent.ndjson"));
        let query = FindingQuery::reconciliation(&["S3.1".to_string()], &[], 10);
        assert!(matches!(
            source.get_findings(&query).await,
            Err(SourceError::Io(_))
        ));
    }

    #[tokio::test]
    async fn missing_program_is_unavailable() {
        use chrono::Utc;
        use posture_core::CanonicalFinding;
        use posture_core::ingestion::EventOrigin;
        use posture_core::state_store::{FindingRecord, RemediationStatus};

        let finding = CanonicalFinding::from_canonical(&asff("f-1", "S3.1")).unwrap();
        let request = RemediationRequest {
            record: FindingRecord::from_finding(
                &finding,
                RemediationStatus::InProgress,
                Utc::now(),
                chrono::Duration::days(90),
            ),
            finding,
            origin: EventOrigin::Imported,
            event_type: "Security Hub Findings - Imported".into(),
            action_name: None,
            requested_at: Utc::now(),
        };
        let orchestrator =
            CommandOrchestrator::new("/nonexistent/posture-remediate", Vec::new());
        let err = orchestrator.start_execution(&request).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Unavailable(_)));
    }
}
