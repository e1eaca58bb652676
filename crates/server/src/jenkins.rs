//! Jenkins CI gateway
//!
//! Token-based access to the CI engine. Jobs are addressed by their full
//! name `org/repo/branch_segment`; the branch segment double-encodes any
//! slash because of the engine's path nesting.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use sqaaas_common::error::{Error, Result};
use sqaaas_common::types::BuildStatus;

/// A scheduled build, adopted from the queue or from the job's last build
#[derive(Debug, Clone, Deserialize)]
pub struct BuildRef {
    pub number: i64,
    pub url: String,
}

/// Capabilities the orchestrator needs from the CI engine
#[async_trait]
pub trait CiGateway: Send + Sync {
    /// Trigger an organization scan; asynchronous, no completion signal.
    async fn scan_organization(&self, org: &str) -> Result<()>;

    async fn job_exists(&self, full_job_name: &str) -> Result<bool>;

    /// Trigger a build; returns the queue item number.
    async fn trigger_build(&self, full_job_name: &str) -> Result<i64>;

    /// Poll a queue item. `None` means the build is not yet scheduled.
    async fn queue_item(&self, item_number: i64) -> Result<Option<BuildRef>>;

    /// Last build of a job, if any has run.
    async fn last_build(&self, full_job_name: &str) -> Result<Option<BuildRef>>;

    async fn build_status(&self, full_job_name: &str, build_number: i64) -> Result<BuildStatus>;

    async fn delete_job(&self, full_job_name: &str) -> Result<()>;
}

/// Encode a branch name as a job path segment.
///
/// The slash is double-encoded (`%252F`, not `%2F`) as the engine expects.
pub fn format_branch(branch: &str) -> String {
    urlencoding::encode(&branch.replace('/', "%2F")).into_owned()
}

/// `org/repo/branch` -> `/job/org/job/repo/job/branch`
fn job_path(full_job_name: &str) -> String {
    let nested = full_job_name.split('/').collect::<Vec<_>>().join("/job/");
    format!("/job/{}", nested)
}

/// Jenkins REST implementation
pub struct JenkinsGateway {
    client: reqwest::Client,
    endpoint: String,
    user: String,
    token: String,
}

impl JenkinsGateway {
    pub fn new(endpoint: &str, user: &str, token: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("sqaaas-api")
            .timeout(timeout)
            .build()
            .map_err(|e| Error::InvalidConfig(format!("cannot build Jenkins client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            user: user.to_string(),
            token: token.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .get(self.url(path))
            .basic_auth(&self.user, Some(&self.token))
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .post(self.url(path))
            .basic_auth(&self.user, Some(&self.token))
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() || status.is_redirection() {
            return Ok(response);
        }
        let reason = response.text().await.unwrap_or_default();
        Err(Error::upstream_status(status.as_u16(), reason))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = request
            .send()
            .await
            .map_err(|e| Error::upstream(e.to_string()))?;
        Self::check(response).await
    }
}

#[async_trait]
impl CiGateway for JenkinsGateway {
    async fn scan_organization(&self, org: &str) -> Result<()> {
        self.send(self.post(&format!("/job/{}/build?delay=0", org)))
            .await?;
        debug!("Triggered organization scan for <{}>", org);
        Ok(())
    }

    async fn job_exists(&self, full_job_name: &str) -> Result<bool> {
        let response = self
            .get(&format!("{}/api/json", job_path(full_job_name)))
            .send()
            .await
            .map_err(|e| Error::upstream(e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        Self::check(response).await?;
        Ok(true)
    }

    async fn trigger_build(&self, full_job_name: &str) -> Result<i64> {
        let response = self
            .send(self.post(&format!("{}/build?delay=0", job_path(full_job_name))))
            .await?;

        // The queue item number only appears in the Location header
        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Error::upstream("build trigger returned no queue location"))?;
        let item_number = parse_queue_item_number(location)
            .ok_or_else(|| Error::upstream(format!("unparsable queue location: {}", location)))?;
        debug!("Triggered job build (queue item number: {})", item_number);
        Ok(item_number)
    }

    async fn queue_item(&self, item_number: i64) -> Result<Option<BuildRef>> {
        #[derive(Deserialize)]
        struct QueueItem {
            executable: Option<BuildRef>,
            url: Option<String>,
        }
        let item: QueueItem = self
            .send(self.get(&format!("/queue/item/{}/api/json", item_number)))
            .await?
            .json()
            .await
            .map_err(|e| Error::upstream(e.to_string()))?;
        match &item.executable {
            Some(build) => debug!(
                "Job started the execution (url: {}, number: {})",
                build.url, build.number
            ),
            None => debug!(
                "Waiting for job to start. Queue item: {}",
                item.url.unwrap_or_default()
            ),
        }
        Ok(item.executable)
    }

    async fn last_build(&self, full_job_name: &str) -> Result<Option<BuildRef>> {
        #[derive(Deserialize)]
        struct JobInfo {
            #[serde(rename = "lastBuild")]
            last_build: Option<BuildRef>,
        }
        let response = self
            .get(&format!("{}/api/json", job_path(full_job_name)))
            .send()
            .await
            .map_err(|e| Error::upstream(e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let info: JobInfo = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| Error::upstream(e.to_string()))?;
        Ok(info.last_build)
    }

    async fn build_status(&self, full_job_name: &str, build_number: i64) -> Result<BuildStatus> {
        #[derive(Deserialize)]
        struct BuildInfo {
            result: Option<String>,
        }
        debug!(
            "Getting status for job <{}> (build number: {})",
            full_job_name, build_number
        );
        let info: BuildInfo = self
            .send(self.get(&format!("{}/{}/api/json", job_path(full_job_name), build_number)))
            .await?
            .json()
            .await
            .map_err(|e| Error::upstream(e.to_string()))?;
        Ok(info
            .result
            .as_deref()
            .map(BuildStatus::from_ci_result)
            .unwrap_or(BuildStatus::Executing))
    }

    async fn delete_job(&self, full_job_name: &str) -> Result<()> {
        debug!("Deleting CI job: {}", full_job_name);
        self.send(self.post(&format!("{}/doDelete", job_path(full_job_name))))
            .await?;
        Ok(())
    }
}

/// Extract the item number from a queue location like
/// `https://jenkins.example.org/queue/item/123/`.
fn parse_queue_item_number(location: &str) -> Option<i64> {
    location
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .and_then(|n| n.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_branch_double_encodes_slash() {
        assert_eq!(format_branch("release/1.0"), "release%252F1.0");
        assert_eq!(format_branch("main"), "main");
    }

    #[test]
    fn test_job_path_nesting() {
        assert_eq!(
            job_path("eosc-synergy-org/demo.sqaaas/main"),
            "/job/eosc-synergy-org/job/demo.sqaaas/job/main"
        );
    }

    #[test]
    fn test_parse_queue_item_number() {
        assert_eq!(
            parse_queue_item_number("https://jenkins.example.org/queue/item/123/"),
            Some(123)
        );
        assert_eq!(parse_queue_item_number("https://x/queue/item/7"), Some(7));
        assert_eq!(parse_queue_item_number("https://x/queue/"), None);
    }

    #[test]
    fn test_build_ref_from_queue_payload() {
        let raw = r#"{"executable": {"number": 4, "url": "https://jenkins/job/x/4/"}}"#;
        #[derive(Deserialize)]
        struct QueueItem {
            executable: Option<BuildRef>,
        }
        let item: QueueItem = serde_json::from_str(raw).unwrap();
        let build = item.executable.unwrap();
        assert_eq!(build.number, 4);
        assert_eq!(build.url, "https://jenkins/job/x/4/");
    }
}
