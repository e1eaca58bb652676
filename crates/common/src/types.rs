//! Core data model: pipeline records, rendered artifacts and CI bindings

use serde::{Deserialize, Serialize};

/// Verbatim copy of the request body a pipeline was created from.
///
/// Kept untouched so updates can be diffed structurally and artifacts can be
/// re-rendered at any time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineRequest {
    /// Pipeline name; must match `[A-Za-z0-9_.-]+`
    pub name: String,
    /// Ordered build-configuration JSON documents
    pub config_data: Vec<serde_json::Value>,
    /// Container-composition JSON document
    pub composer_data: serde_json::Value,
    /// Job-script JSON document (declarative knobs for the Jenkinsfile)
    #[serde(default)]
    pub jenkinsfile_data: serde_json::Value,
}

/// One rendered build-configuration document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigFile {
    pub data_json: serde_json::Value,
    pub data_yml: String,
    /// Branch-filter predicate; `None` for the shared (unguarded) document
    pub data_when: Option<serde_json::Value>,
    pub file_name: String,
}

/// Rendered container-composition document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComposerFile {
    pub data_json: serde_json::Value,
    pub data_yml: String,
    pub file_name: String,
}

/// Auxiliary shell script generated from a criterion's raw commands
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandsScript {
    pub data: String,
    pub file_name: String,
}

/// Full set of artifacts rendered from a request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Artifacts {
    pub config: Vec<ConfigFile>,
    pub composer: ComposerFile,
    pub jenkinsfile: String,
    #[serde(default)]
    pub commands_scripts: Vec<CommandsScript>,
}

/// Build state as tracked per pipeline.
///
/// `NotExecuted -> Queued | WaitingScanOrg -> Executing ->
/// {Success, Unstable, Failure, Aborted}`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildStatus {
    NotExecuted,
    Queued,
    WaitingScanOrg,
    Executing,
    Success,
    Unstable,
    Failure,
    Aborted,
}

impl BuildStatus {
    /// Whether the engine has reached a final verdict.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildStatus::Success | BuildStatus::Unstable | BuildStatus::Failure | BuildStatus::Aborted
        )
    }

    /// Terminal states that gate badge issuance.
    pub fn is_terminal_success(&self) -> bool {
        matches!(self, BuildStatus::Success | BuildStatus::Unstable)
    }

    /// Parse the result string reported by the CI engine.
    pub fn from_ci_result(result: &str) -> Self {
        match result {
            "SUCCESS" => BuildStatus::Success,
            "UNSTABLE" => BuildStatus::Unstable,
            "FAILURE" => BuildStatus::Failure,
            "ABORTED" => BuildStatus::Aborted,
            _ => BuildStatus::Executing,
        }
    }
}

impl Default for BuildStatus {
    fn default() -> Self {
        BuildStatus::NotExecuted
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BuildStatus::NotExecuted => "NOT_EXECUTED",
            BuildStatus::Queued => "QUEUED",
            BuildStatus::WaitingScanOrg => "WAITING_SCAN_ORG",
            BuildStatus::Executing => "EXECUTING",
            BuildStatus::Success => "SUCCESS",
            BuildStatus::Unstable => "UNSTABLE",
            BuildStatus::Failure => "FAILURE",
            BuildStatus::Aborted => "ABORTED",
        };
        f.write_str(s)
    }
}

/// Last observed build state of the bound CI job
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct BuildInfo {
    /// Queue item number returned when the build was triggered
    pub item_number: Option<i64>,
    /// Build number, known once the queue item is scheduled
    pub number: Option<i64>,
    /// Build URL in the CI system
    pub url: Option<String>,
    #[serde(default)]
    pub status: BuildStatus,
    /// Representative commit the build runs against
    pub commit_id: Option<String>,
    pub commit_url: Option<String>,
    /// Issued assertion; non-empty only after a terminal success
    pub badge: Option<serde_json::Value>,
}

/// Binding between a pipeline and its CI job; present once a run was attempted
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CiBinding {
    /// Full job name: `org/repo/branch_segment`
    pub job_name: String,
    /// Issue a badge automatically once the build reaches a terminal success
    pub issue_badge: bool,
    /// Waiting for an organization scan to instantiate the job
    pub scan_org_wait: bool,
    pub build_info: BuildInfo,
}

/// Durable per-pipeline record, keyed by a version-4 identifier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRecord {
    /// Canonical `<org>/<name>` of the controlled repository
    pub pipeline_repo: String,
    /// Absolute URL form of `pipeline_repo`
    pub pipeline_repo_url: String,
    pub raw_request: PipelineRequest,
    pub artifacts: Artifacts,
    pub ci: Option<CiBinding>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_names() {
        let s = serde_json::to_string(&BuildStatus::WaitingScanOrg).unwrap();
        assert_eq!(s, "\"WAITING_SCAN_ORG\"");
        let s = serde_json::to_string(&BuildStatus::NotExecuted).unwrap();
        assert_eq!(s, "\"NOT_EXECUTED\"");
        let back: BuildStatus = serde_json::from_str("\"UNSTABLE\"").unwrap();
        assert_eq!(back, BuildStatus::Unstable);
    }

    #[test]
    fn test_terminal_classification() {
        assert!(BuildStatus::Success.is_terminal_success());
        assert!(BuildStatus::Unstable.is_terminal_success());
        assert!(!BuildStatus::Failure.is_terminal_success());
        assert!(BuildStatus::Failure.is_terminal());
        assert!(BuildStatus::Aborted.is_terminal());
        assert!(!BuildStatus::Executing.is_terminal());
        assert!(!BuildStatus::Queued.is_terminal());
    }

    #[test]
    fn test_ci_result_mapping() {
        assert_eq!(BuildStatus::from_ci_result("SUCCESS"), BuildStatus::Success);
        assert_eq!(BuildStatus::from_ci_result("UNSTABLE"), BuildStatus::Unstable);
        assert_eq!(BuildStatus::from_ci_result("FAILURE"), BuildStatus::Failure);
        assert_eq!(BuildStatus::from_ci_result("ABORTED"), BuildStatus::Aborted);
        // A null/in-progress result keeps the build in EXECUTING
        assert_eq!(BuildStatus::from_ci_result(""), BuildStatus::Executing);
    }

    #[test]
    fn test_build_info_defaults() {
        let info = BuildInfo::default();
        assert_eq!(info.status, BuildStatus::NotExecuted);
        assert!(info.item_number.is_none());
        assert!(info.badge.is_none());
    }
}
