//! GitHub repository gateway
//!
//! Token-based access to the code host where controlled repositories live.
//! Every operation either succeeds or surfaces a typed upstream failure
//! carrying the status code returned by the API.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use sqaaas_common::error::{Error, Result};

use crate::git::{GitMirror, MirrorOutcome};

const API_ROOT: &str = "https://api.github.com";
const WEB_ROOT: &str = "https://github.com";

/// Repository metadata returned by the host
#[derive(Debug, Clone, Deserialize)]
pub struct RepoInfo {
    pub full_name: String,
    pub default_branch: String,
    pub clone_url: String,
    pub html_url: String,
}

/// An open change proposal against a base repository
#[derive(Debug, Clone)]
pub struct ChangeProposal {
    pub html_url: String,
    pub head_repo: String,
    pub head_branch: String,
}

/// Capabilities the orchestrator needs from the code host
#[async_trait]
pub trait RepoGateway: Send + Sync {
    async fn exists(&self, repo: &str) -> Result<bool>;

    async fn get_repo(&self, repo: &str) -> Result<Option<RepoInfo>>;

    async fn create_in_org(&self, org: &str, name: &str) -> Result<RepoInfo>;

    async fn delete(&self, repo: &str) -> Result<()>;

    async fn get_file(&self, repo: &str, path: &str, branch: Option<&str>) -> Result<Option<String>>;

    /// Create or update a file; returns the SHA of the resulting commit.
    async fn put_file(
        &self,
        repo: &str,
        path: &str,
        content: &str,
        message: &str,
        branch: Option<&str>,
    ) -> Result<String>;

    async fn delete_file(&self, repo: &str, path: &str, branch: Option<&str>) -> Result<()>;

    async fn create_branch(&self, repo: &str, new_branch: &str, from_branch: &str) -> Result<()>;

    /// Fork `upstream_repo` into `target_org`. Returns `None` when the
    /// upstream already lives in the target organization.
    async fn create_fork(&self, upstream_repo: &str, target_org: &str) -> Result<Option<RepoInfo>>;

    async fn create_change_proposal(
        &self,
        head_repo: &str,
        head_branch: &str,
        base_repo: &str,
        base_branch: &str,
        title: &str,
        body: &str,
    ) -> Result<String>;

    async fn list_open_change_proposals(&self, base_repo: &str) -> Result<Vec<ChangeProposal>>;

    /// Mirror an external repository into a controlled one.
    async fn mirror(
        &self,
        source_url: &str,
        target_url: &str,
        source_branch: Option<&str>,
    ) -> Result<MirrorOutcome>;

    fn commit_html_url(&self, repo: &str, commit_id: &str) -> String;

    fn repo_html_url(&self, repo: &str) -> String;
}

/// GitHub REST v3 implementation
pub struct GithubGateway {
    client: reqwest::Client,
    api_root: String,
    mirror: GitMirror,
}

impl GithubGateway {
    pub fn new(access_token: &str, timeout: Duration, mirror_timeout: Duration) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        let mut auth = reqwest::header::HeaderValue::from_str(&format!("token {}", access_token))
            .map_err(|e| Error::InvalidConfig(format!("invalid repository token: {}", e)))?;
        auth.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, auth);
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/vnd.github.v3+json"),
        );

        let client = reqwest::Client::builder()
            .user_agent("sqaaas-api")
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|e| Error::InvalidConfig(format!("cannot build GitHub client: {}", e)))?;

        Ok(Self {
            client,
            api_root: API_ROOT.to_string(),
            mirror: GitMirror::new(access_token, mirror_timeout),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_root, path)
    }

    /// Map a non-success response into a typed upstream failure.
    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let reason = response
            .text()
            .await
            .ok()
            .and_then(|body| {
                serde_json::from_str::<serde_json::Value>(&body)
                    .ok()
                    .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
                    .or(Some(body))
            })
            .unwrap_or_default();
        Err(Error::upstream_status(status.as_u16(), reason))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = request
            .send()
            .await
            .map_err(|e| Error::upstream(e.to_string()))?;
        Self::check(response).await
    }

    /// Fetch a file's decoded content and blob SHA, `None` when absent.
    async fn get_contents(
        &self,
        repo: &str,
        path: &str,
        branch: Option<&str>,
    ) -> Result<Option<(String, String)>> {
        let mut request = self
            .client
            .get(self.url(&format!("/repos/{}/contents/{}", repo, path)));
        if let Some(branch) = branch {
            request = request.query(&[("ref", branch)]);
        }
        let response = request
            .send()
            .await
            .map_err(|e| Error::upstream(e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        #[derive(Deserialize)]
        struct Contents {
            content: Option<String>,
            sha: String,
        }
        let contents: Contents = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| Error::upstream(e.to_string()))?;
        let decoded = match contents.content {
            Some(encoded) => {
                let raw = base64::engine::general_purpose::STANDARD
                    .decode(encoded.replace('\n', ""))
                    .map_err(|e| Error::upstream(format!("undecodable file content: {}", e)))?;
                String::from_utf8_lossy(&raw).into_owned()
            }
            None => String::new(),
        };
        Ok(Some((decoded, contents.sha)))
    }
}

#[async_trait]
impl RepoGateway for GithubGateway {
    async fn exists(&self, repo: &str) -> Result<bool> {
        Ok(self.get_repo(repo).await?.is_some())
    }

    async fn get_repo(&self, repo: &str) -> Result<Option<RepoInfo>> {
        let response = self
            .client
            .get(self.url(&format!("/repos/{}", repo)))
            .send()
            .await
            .map_err(|e| Error::upstream(e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let info = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| Error::upstream(e.to_string()))?;
        Ok(Some(info))
    }

    async fn create_in_org(&self, org: &str, name: &str) -> Result<RepoInfo> {
        debug!("Creating repository <{}/{}>", org, name);
        let response = self
            .send(
                self.client
                    .post(self.url(&format!("/orgs/{}/repos", org)))
                    .json(&json!({ "name": name })),
            )
            .await?;
        response
            .json()
            .await
            .map_err(|e| Error::upstream(e.to_string()))
    }

    async fn delete(&self, repo: &str) -> Result<()> {
        debug!("Deleting repository <{}>", repo);
        self.send(self.client.delete(self.url(&format!("/repos/{}", repo))))
            .await?;
        Ok(())
    }

    async fn get_file(&self, repo: &str, path: &str, branch: Option<&str>) -> Result<Option<String>> {
        Ok(self
            .get_contents(repo, path, branch)
            .await?
            .map(|(content, _)| content))
    }

    async fn put_file(
        &self,
        repo: &str,
        path: &str,
        content: &str,
        message: &str,
        branch: Option<&str>,
    ) -> Result<String> {
        // Updating requires the current blob SHA; creating must omit it
        let existing = self.get_contents(repo, path, branch).await?;

        let mut body = json!({
            "message": message,
            "content": base64::engine::general_purpose::STANDARD.encode(content),
        });
        if let Some(branch) = branch {
            body["branch"] = json!(branch);
        }
        if let Some((_, sha)) = existing {
            body["sha"] = json!(sha);
        }

        debug!("Pushing file to repository <{}>: {}", repo, path);
        let response = self
            .send(
                self.client
                    .put(self.url(&format!("/repos/{}/contents/{}", repo, path)))
                    .json(&body),
            )
            .await?;

        #[derive(Deserialize)]
        struct PutResponse {
            commit: CommitRef,
        }
        #[derive(Deserialize)]
        struct CommitRef {
            sha: String,
        }
        let put: PutResponse = response
            .json()
            .await
            .map_err(|e| Error::upstream(e.to_string()))?;
        Ok(put.commit.sha)
    }

    async fn delete_file(&self, repo: &str, path: &str, branch: Option<&str>) -> Result<()> {
        let Some((_, sha)) = self.get_contents(repo, path, branch).await? else {
            return Ok(());
        };
        let mut body = json!({
            "message": format!("Delete {}", path),
            "sha": sha,
        });
        if let Some(branch) = branch {
            body["branch"] = json!(branch);
        }
        self.send(
            self.client
                .delete(self.url(&format!("/repos/{}/contents/{}", repo, path)))
                .json(&body),
        )
        .await?;
        Ok(())
    }

    async fn create_branch(&self, repo: &str, new_branch: &str, from_branch: &str) -> Result<()> {
        #[derive(Deserialize)]
        struct GitRef {
            object: GitObject,
        }
        #[derive(Deserialize)]
        struct GitObject {
            sha: String,
        }
        let base: GitRef = self
            .send(
                self.client
                    .get(self.url(&format!("/repos/{}/git/ref/heads/{}", repo, from_branch))),
            )
            .await?
            .json()
            .await
            .map_err(|e| Error::upstream(e.to_string()))?;

        debug!("Creating branch <{}> in repository <{}>", new_branch, repo);
        self.send(
            self.client
                .post(self.url(&format!("/repos/{}/git/refs", repo)))
                .json(&json!({
                    "ref": format!("refs/heads/{}", new_branch),
                    "sha": base.object.sha,
                })),
        )
        .await?;
        Ok(())
    }

    async fn create_fork(&self, upstream_repo: &str, target_org: &str) -> Result<Option<RepoInfo>> {
        let upstream_org = upstream_repo.split('/').next().unwrap_or_default();
        if upstream_org == target_org {
            debug!(
                "Repository <{}> already belongs to organization <{}>, no fork needed",
                upstream_repo, target_org
            );
            return Ok(None);
        }

        debug!("Forking repository <{}> into <{}>", upstream_repo, target_org);
        let response = self
            .client
            .post(self.url(&format!("/repos/{}/forks", upstream_repo)))
            .json(&json!({ "organization": target_org }))
            .send()
            .await
            .map_err(|e| Error::upstream(e.to_string()))?;
        // The host reports an existing fork as an unprocessable reference
        if response.status() == reqwest::StatusCode::UNPROCESSABLE_ENTITY {
            let reason = response.text().await.unwrap_or_default();
            return Err(Error::upstream_status(422, reason));
        }
        let info = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| Error::upstream(e.to_string()))?;
        Ok(Some(info))
    }

    async fn create_change_proposal(
        &self,
        head_repo: &str,
        head_branch: &str,
        base_repo: &str,
        base_branch: &str,
        title: &str,
        body: &str,
    ) -> Result<String> {
        let head_org = head_repo.split('/').next().unwrap_or_default();
        let base_org = base_repo.split('/').next().unwrap_or_default();
        let head = if head_org == base_org {
            head_branch.to_string()
        } else {
            format!("{}:{}", head_org, head_branch)
        };

        debug!(
            "Creating change proposal: {} (head) -> {}/{} (base)",
            head, base_repo, base_branch
        );
        let response = self
            .send(
                self.client
                    .post(self.url(&format!("/repos/{}/pulls", base_repo)))
                    .json(&json!({
                        "title": title,
                        "body": body,
                        "head": head,
                        "base": base_branch,
                    })),
            )
            .await?;

        #[derive(Deserialize)]
        struct Pull {
            html_url: String,
        }
        let pull: Pull = response
            .json()
            .await
            .map_err(|e| Error::upstream(e.to_string()))?;
        Ok(pull.html_url)
    }

    async fn list_open_change_proposals(&self, base_repo: &str) -> Result<Vec<ChangeProposal>> {
        #[derive(Deserialize)]
        struct Pull {
            html_url: String,
            head: Head,
        }
        #[derive(Deserialize)]
        struct Head {
            #[serde(rename = "ref")]
            branch: String,
            repo: Option<HeadRepo>,
        }
        #[derive(Deserialize)]
        struct HeadRepo {
            full_name: String,
        }

        let pulls: Vec<Pull> = self
            .send(
                self.client
                    .get(self.url(&format!("/repos/{}/pulls", base_repo)))
                    .query(&[("state", "open")]),
            )
            .await?
            .json()
            .await
            .map_err(|e| Error::upstream(e.to_string()))?;

        Ok(pulls
            .into_iter()
            .map(|p| ChangeProposal {
                html_url: p.html_url,
                head_repo: p.head.repo.map(|r| r.full_name).unwrap_or_default(),
                head_branch: p.head.branch,
            })
            .collect())
    }

    async fn mirror(
        &self,
        source_url: &str,
        target_url: &str,
        source_branch: Option<&str>,
    ) -> Result<MirrorOutcome> {
        self.mirror.mirror(source_url, target_url, source_branch).await
    }

    fn commit_html_url(&self, repo: &str, commit_id: &str) -> String {
        format!("{}/{}/commit/{}", WEB_ROOT, repo, commit_id)
    }

    fn repo_html_url(&self, repo: &str) -> String {
        format!("{}/{}", WEB_ROOT, repo)
    }
}
