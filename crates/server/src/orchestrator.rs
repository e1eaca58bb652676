//! Pipeline orchestrator
//!
//! Implements the pipeline lifecycle by composing the gateways and the
//! store. Owns the build state machine and the badge-issuance gating. Every
//! operation that writes `ci` or the raw request takes a per-identifier
//! try-lock; contention fails fast instead of queueing.

use std::collections::BTreeSet;
use std::io::Write;
use std::sync::Arc;

use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use sqaaas_common::config::ApiConfig;
use sqaaas_common::error::{Error, Result};
use sqaaas_common::store::PipelineStore;
use sqaaas_common::types::{
    Artifacts, BuildInfo, BuildStatus, CiBinding, PipelineRecord, PipelineRequest,
};

use crate::badgr::BadgeGateway;
use crate::github::RepoGateway;
use crate::jenkins::{format_branch, CiGateway};
use crate::jepl;

/// Suffix appended to every controlled repository name
const REPO_SUFFIX: &str = ".sqaaas";

/// Summary entry of the pipeline listing
#[derive(Debug, Clone, Serialize)]
pub struct PipelineSummary {
    pub id: String,
    pub pipeline_repo: String,
}

/// Reconciled build state returned by the status operation
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub build_url: Option<String>,
    pub build_status: BuildStatus,
    pub openbadge_id: Option<String>,
}

pub struct Orchestrator {
    config: ApiConfig,
    store: Arc<PipelineStore>,
    repo: Arc<dyn RepoGateway>,
    ci: Arc<dyn CiGateway>,
    badge: Arc<dyn BadgeGateway>,
    rng: parking_lot::Mutex<StdRng>,
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl Orchestrator {
    pub fn new(
        config: ApiConfig,
        store: Arc<PipelineStore>,
        repo: Arc<dyn RepoGateway>,
        ci: Arc<dyn CiGateway>,
        badge: Arc<dyn BadgeGateway>,
    ) -> Self {
        Self::with_rng(config, store, repo, ci, badge, StdRng::from_entropy())
    }

    /// Constructor with a seeded rng so tests get deterministic tokens.
    pub fn with_rng(
        config: ApiConfig,
        store: Arc<PipelineStore>,
        repo: Arc<dyn RepoGateway>,
        ci: Arc<dyn CiGateway>,
        badge: Arc<dyn BadgeGateway>,
        rng: StdRng,
    ) -> Self {
        Self {
            config,
            store,
            repo,
            ci,
            badge,
            rng: parking_lot::Mutex::new(rng),
            locks: DashMap::new(),
        }
    }

    /// Fail-fast per-identifier guard around `ci`/`raw_request` writers.
    fn lock_pipeline(&self, pipeline_id: &str) -> Result<tokio::sync::OwnedMutexGuard<()>> {
        let lock = self
            .locks
            .entry(pipeline_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        lock.try_lock_owned()
            .map_err(|_| Error::Conflict(pipeline_id.to_string()))
    }

    fn render(&self, request: &PipelineRequest) -> Result<Artifacts> {
        let mut rng = self.rng.lock();
        jepl::render(request, &mut *rng)
    }

    fn random_branch_name(&self) -> String {
        const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
        let mut rng = self.rng.lock();
        let token: String = (0..8).map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char).collect();
        format!("sqaaas-{}", token)
    }

    fn get_record(&self, pipeline_id: &str) -> Result<PipelineRecord> {
        self.store
            .get(pipeline_id)?
            .ok_or_else(|| Error::NotFound(pipeline_id.to_string()))
    }

    // ------------------------------------------------------------------
    // Lifecycle operations
    // ------------------------------------------------------------------

    /// Create a pipeline: render artifacts and persist the record.
    pub fn create(&self, request: PipelineRequest) -> Result<String> {
        validate_pipeline_name(&request.name)?;

        let pipeline_id = Uuid::new_v4().to_string();
        let pipeline_repo = format!(
            "{}/{}{}",
            self.config.repository.org, request.name, REPO_SUFFIX
        );
        let artifacts = self.render(&request)?;

        let record = PipelineRecord {
            pipeline_repo_url: self.repo.repo_html_url(&pipeline_repo),
            pipeline_repo,
            raw_request: request,
            artifacts,
            ci: None,
        };
        self.store.put(&pipeline_id, record)?;
        info!("Pipeline <{}> created", pipeline_id);
        Ok(pipeline_id)
    }

    pub fn list(&self) -> Result<Vec<PipelineSummary>> {
        Ok(self
            .store
            .load_all()?
            .into_iter()
            .map(|(id, record)| PipelineSummary {
                id,
                pipeline_repo: record.pipeline_repo,
            })
            .collect())
    }

    pub fn read(&self, pipeline_id: &str) -> Result<PipelineRecord> {
        self.get_record(pipeline_id)
    }

    /// Re-render from the new body; persist only when the structural diff on
    /// (config list, composer, job-script data) is non-empty.
    pub fn update(&self, pipeline_id: &str, request: PipelineRequest) -> Result<bool> {
        let _guard = self.lock_pipeline(pipeline_id)?;
        let mut record = self.get_record(pipeline_id)?;

        let old = &record.raw_request;
        if old.config_data == request.config_data
            && old.composer_data == request.composer_data
            && old.jenkinsfile_data == request.jenkinsfile_data
        {
            debug!("Pipeline <{}> update is a no-op", pipeline_id);
            return Ok(false);
        }

        record.artifacts = self.render(&request)?;
        record.raw_request = request;
        self.store.put(pipeline_id, record)?;
        info!("Pipeline <{}> updated", pipeline_id);
        Ok(true)
    }

    /// Delete the record, best-effort cleaning up the controlled repository
    /// and rescanning the CI organization. Cleanup failures never keep the
    /// record alive.
    pub async fn delete(&self, pipeline_id: &str) -> Result<()> {
        let _guard = self.lock_pipeline(pipeline_id)?;
        let record = self.get_record(pipeline_id)?;

        match self.repo.exists(&record.pipeline_repo).await {
            Ok(true) => {
                if let Err(e) = self.repo.delete(&record.pipeline_repo).await {
                    warn!(
                        "Cannot delete repository <{}>: {}",
                        record.pipeline_repo, e
                    );
                }
            }
            Ok(false) => {}
            Err(e) => warn!("Cannot check repository <{}>: {}", record.pipeline_repo, e),
        }

        if let Some(ci) = &record.ci {
            match self.ci.job_exists(&ci.job_name).await {
                Ok(true) => {
                    if let Err(e) = self.ci.scan_organization(&self.config.ci.org).await {
                        warn!("Cannot trigger organization scan: {}", e);
                    }
                }
                Ok(false) => {}
                Err(e) => warn!("Cannot check CI job <{}>: {}", ci.job_name, e),
            }
        }

        self.store.delete(pipeline_id)?;
        info!("Pipeline <{}> deleted", pipeline_id);
        Ok(())
    }

    /// Zip archive of every rendered YAML under its file name, plus the job
    /// script.
    pub fn compress(&self, pipeline_id: &str) -> Result<Vec<u8>> {
        let record = self.get_record(pipeline_id)?;
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default();

        let mut entries: Vec<(&str, &str)> = record
            .artifacts
            .config
            .iter()
            .map(|c| (c.file_name.as_str(), c.data_yml.as_str()))
            .collect();
        entries.push((
            record.artifacts.composer.file_name.as_str(),
            record.artifacts.composer.data_yml.as_str(),
        ));
        entries.push((jepl::JENKINSFILE, record.artifacts.jenkinsfile.as_str()));

        for (name, content) in entries {
            writer
                .start_file(name, options)
                .map_err(|e| Error::Internal(format!("zip entry <{}>: {}", name, e)))?;
            writer.write_all(content.as_bytes())?;
        }
        let cursor = writer
            .finish()
            .map_err(|e| Error::Internal(format!("zip finish: {}", e)))?;
        Ok(cursor.into_inner())
    }

    // ------------------------------------------------------------------
    // Run / status state machine
    // ------------------------------------------------------------------

    /// Run the pipeline: materialize artifacts in the controlled repository
    /// and drive the CI engine. Returns a human-readable reason.
    pub async fn run(
        &self,
        pipeline_id: &str,
        source_repo_url: Option<&str>,
        source_repo_branch: Option<&str>,
        issue_badge: bool,
    ) -> Result<String> {
        let _guard = self.lock_pipeline(pipeline_id)?;
        let record = self.get_record(pipeline_id)?;

        // An alternate source only makes sense when some criterion targets it
        if source_repo_url.is_some() && !has_this_repo_criterion(&record.artifacts) {
            return Err(Error::Unprocessable(
                "an alternate source repository was given but no criterion targets this_repo"
                    .to_string(),
            ));
        }

        let repo_info = match self.repo.get_repo(&record.pipeline_repo).await? {
            Some(info) => info,
            None => {
                let (org, name) = split_repo(&record.pipeline_repo)?;
                self.repo.create_in_org(org, name).await?
            }
        };

        let branch = match source_repo_url {
            Some(source) => {
                let outcome = self
                    .repo
                    .mirror(source, &repo_info.clone_url, source_repo_branch)
                    .await?;
                outcome.active_branch
            }
            None => repo_info.default_branch.clone(),
        };

        let commit_id = self
            .push_artifacts(&record.artifacts, &record.pipeline_repo, &branch)
            .await?;
        let commit_url = self.repo.commit_html_url(&record.pipeline_repo, &commit_id);

        let (_, repo_name) = split_repo(&record.pipeline_repo)?;
        let job_name = format!(
            "{}/{}/{}",
            self.config.ci.org,
            repo_name,
            format_branch(&branch)
        );

        let (binding, reason) = if self.ci.job_exists(&job_name).await? {
            let item_number = self.ci.trigger_build(&job_name).await?;
            (
                CiBinding {
                    job_name,
                    issue_badge,
                    scan_org_wait: false,
                    build_info: BuildInfo {
                        item_number: Some(item_number),
                        status: BuildStatus::Queued,
                        commit_id: Some(commit_id),
                        commit_url: Some(commit_url),
                        ..Default::default()
                    },
                },
                "Triggered the existing Jenkins job".to_string(),
            )
        } else {
            self.ci.scan_organization(&self.config.ci.org).await?;
            (
                CiBinding {
                    job_name,
                    issue_badge,
                    scan_org_wait: true,
                    build_info: BuildInfo {
                        status: BuildStatus::WaitingScanOrg,
                        commit_id: Some(commit_id),
                        commit_url: Some(commit_url),
                        ..Default::default()
                    },
                },
                "Triggered scan organization".to_string(),
            )
        };

        self.store.update_ci(pipeline_id, |ci| *ci = Some(binding))?;
        info!("Pipeline <{}> run: {}", pipeline_id, reason);
        Ok(reason)
    }

    /// Push every artifact to the given branch; the SHA of the job-script
    /// push is the representative commit of the run.
    async fn push_artifacts(
        &self,
        artifacts: &Artifacts,
        repo: &str,
        branch: &str,
    ) -> Result<String> {
        let branch = Some(branch);
        for config in &artifacts.config {
            self.repo
                .put_file(
                    repo,
                    &config.file_name,
                    &config.data_yml,
                    &update_message(&config.file_name),
                    branch,
                )
                .await?;
        }
        self.repo
            .put_file(
                repo,
                &artifacts.composer.file_name,
                &artifacts.composer.data_yml,
                &update_message(&artifacts.composer.file_name),
                branch,
            )
            .await?;
        for script in &artifacts.commands_scripts {
            self.repo
                .put_file(
                    repo,
                    &script.file_name,
                    &script.data,
                    &update_message(&script.file_name),
                    branch,
                )
                .await?;
        }
        self.repo
            .put_file(
                repo,
                jepl::JENKINSFILE,
                &artifacts.jenkinsfile,
                &update_message(jepl::JENKINSFILE),
                branch,
            )
            .await
    }

    /// Reconcile the build state against the CI engine and return it.
    pub async fn status(&self, pipeline_id: &str) -> Result<StatusReport> {
        let _guard = self.lock_pipeline(pipeline_id)?;
        let record = self.get_record(pipeline_id)?;
        let mut binding = record.ci.clone().ok_or_else(|| {
            Error::Unprocessable("pipeline has not been run".to_string())
        })?;

        if binding.scan_org_wait {
            // The scan may have instantiated the job in the meantime
            if self.ci.job_exists(&binding.job_name).await? {
                if let Some(build) = self.ci.last_build(&binding.job_name).await? {
                    binding.build_info.number = Some(build.number);
                    binding.build_info.url = Some(build.url);
                    binding.build_info.status = BuildStatus::Executing;
                    binding.scan_org_wait = false;
                }
            }
        } else if binding.build_info.number.is_none() {
            if let Some(item_number) = binding.build_info.item_number {
                if let Some(build) = self.ci.queue_item(item_number).await? {
                    binding.build_info.number = Some(build.number);
                    binding.build_info.url = Some(build.url);
                    binding.build_info.status = BuildStatus::Executing;
                }
            }
        }

        if let Some(number) = binding.build_info.number {
            binding.build_info.status =
                self.ci.build_status(&binding.job_name, number).await?;
        }

        if binding.issue_badge
            && binding.build_info.badge.is_none()
            && binding.build_info.status.is_terminal_success()
        {
            match self.issue_badge_for(&record, &binding.build_info).await {
                Ok(assertion) => binding.build_info.badge = Some(assertion),
                Err(e) if e.http_status() == 422 => {
                    warn!("Badge not issued for pipeline <{}>: {}", pipeline_id, e)
                }
                Err(e) => return Err(e),
            }
            binding.issue_badge = false;
        }

        let report = StatusReport {
            build_url: binding.build_info.url.clone(),
            build_status: binding.build_info.status,
            openbadge_id: openbadge_id(&binding.build_info),
        };
        self.store.update_ci(pipeline_id, |ci| *ci = Some(binding))?;
        Ok(report)
    }

    // ------------------------------------------------------------------
    // Badge issuance
    // ------------------------------------------------------------------

    /// Gated badge issuance: requires a terminal successful build.
    pub async fn issue_badge(&self, pipeline_id: &str) -> Result<Value> {
        let _guard = self.lock_pipeline(pipeline_id)?;
        let record = self.get_record(pipeline_id)?;
        let binding = record.ci.clone().ok_or_else(|| {
            Error::Unprocessable("pipeline has not been run".to_string())
        })?;

        let assertion = self.issue_badge_for(&record, &binding.build_info).await?;
        self.store.update_ci(pipeline_id, |ci| {
            if let Some(ci) = ci.as_mut() {
                ci.build_info.badge = Some(assertion.clone());
            }
        })?;
        Ok(assertion)
    }

    async fn issue_badge_for(&self, record: &PipelineRecord, build: &BuildInfo) -> Result<Value> {
        if !build.status.is_terminal_success() {
            return Err(Error::Unprocessable(format!(
                "badge issuance requires a successful build, current status is {}",
                build.status
            )));
        }

        let (sw_criteria, srv_criteria) = classify_criteria(&record.artifacts);
        self.badge
            .issue(
                build.commit_id.as_deref().unwrap_or_default(),
                build.commit_url.as_deref().unwrap_or_default(),
                build.url.as_deref().unwrap_or_default(),
                &sw_criteria,
                &srv_criteria,
            )
            .await
    }

    /// Stored assertion, optionally rendered as an embeddable HTML fragment.
    pub fn get_badge(&self, pipeline_id: &str, share_html: bool) -> Result<BadgeOutput> {
        let record = self.get_record(pipeline_id)?;
        let binding = record
            .ci
            .as_ref()
            .ok_or_else(|| Error::Unprocessable("pipeline has not been run".to_string()))?;
        let badge = binding
            .build_info
            .badge
            .clone()
            .ok_or_else(|| Error::Unprocessable("no badge has been issued".to_string()))?;

        if share_html {
            let html = render_badge_html(&badge, binding.build_info.commit_url.as_deref());
            Ok(BadgeOutput::Html(html))
        } else {
            Ok(BadgeOutput::Assertion(badge))
        }
    }

    // ------------------------------------------------------------------
    // Change proposals
    // ------------------------------------------------------------------

    /// Push the artifacts to a head (fork or fresh branch) and open a change
    /// proposal against the upstream, reusing an already-open one.
    pub async fn propose_change(
        &self,
        pipeline_id: &str,
        upstream_repo_url: &str,
        upstream_branch: Option<&str>,
    ) -> Result<String> {
        let record = self.get_record(pipeline_id)?;
        let upstream_repo = parse_platform_repo(upstream_repo_url)?;

        let upstream = self
            .repo
            .get_repo(&upstream_repo)
            .await?
            .ok_or_else(|| Error::upstream(format!("upstream repository <{}> not found", upstream_repo)))?;
        let base_branch = upstream_branch
            .map(str::to_string)
            .unwrap_or(upstream.default_branch);

        let controlled_org = &self.config.repository.org;
        let (head_repo, head_branch) = match self
            .repo
            .create_fork(&upstream_repo, controlled_org)
            .await?
        {
            Some(fork) => (fork.full_name, base_branch.clone()),
            None => {
                // Upstream already lives in the controlled organization:
                // work on a randomly named branch instead
                let branch = self.random_branch_name();
                self.repo
                    .create_branch(&upstream_repo, &branch, &base_branch)
                    .await?;
                (upstream_repo.clone(), branch)
            }
        };

        self.push_artifacts(&record.artifacts, &head_repo, &head_branch)
            .await?;

        for proposal in self.repo.list_open_change_proposals(&upstream_repo).await? {
            if proposal.head_repo == head_repo && proposal.head_branch == head_branch {
                debug!("Reusing open change proposal: {}", proposal.html_url);
                return Ok(proposal.html_url);
            }
        }

        let title = format!("Set up SQAaaS pipeline in project <{}>", upstream_repo);
        let body = proposal_body(&record.artifacts);
        self.repo
            .create_change_proposal(&head_repo, &head_branch, &upstream_repo, &base_branch, &title, &body)
            .await
    }
}

/// Badge output shape for the read operation
#[derive(Debug, Clone)]
pub enum BadgeOutput {
    Assertion(Value),
    Html(String),
}

// ----------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------

fn validate_pipeline_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if valid {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "pipeline name <{}> must match [A-Za-z0-9_.-]+",
            name
        )))
    }
}

fn split_repo(repo: &str) -> Result<(&str, &str)> {
    repo.split_once('/')
        .ok_or_else(|| Error::Internal(format!("malformed repository name: {}", repo)))
}

fn update_message(file_name: &str) -> String {
    let basename = file_name.rsplit('/').next().unwrap_or(file_name);
    format!("Update {}", basename)
}

/// Whether any criterion across the rendered documents targets `this_repo`.
fn has_this_repo_criterion(artifacts: &Artifacts) -> bool {
    artifacts.config.iter().any(|config| {
        config
            .data_json
            .get("sqa_criteria")
            .and_then(Value::as_object)
            .map(|criteria| {
                criteria.values().any(|criterion| {
                    criterion
                        .get("repos")
                        .and_then(Value::as_object)
                        .map(|repos| repos.contains_key("this_repo"))
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false)
    })
}

/// Bucket every criterion key by baseline prefix: `QC.` is the software
/// baseline, `SvcQC` the service baseline; anything else is ignored.
fn classify_criteria(artifacts: &Artifacts) -> (Vec<String>, Vec<String>) {
    let mut sw = BTreeSet::new();
    let mut srv = BTreeSet::new();
    for config in &artifacts.config {
        let Some(criteria) = config.data_json.get("sqa_criteria").and_then(Value::as_object) else {
            continue;
        };
        for key in criteria.keys() {
            if key.starts_with("QC.") {
                sw.insert(key.clone());
            } else if key.starts_with("SvcQC") {
                srv.insert(key.clone());
            }
        }
    }
    (sw.into_iter().collect(), srv.into_iter().collect())
}

fn openbadge_id(build: &BuildInfo) -> Option<String> {
    build
        .badge
        .as_ref()
        .and_then(|badge| badge.get("openBadgeId"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// `https://github.com/org/name` -> `org/name`; anything not on the
/// supported platform is rejected.
fn parse_platform_repo(repo_url: &str) -> Result<String> {
    let parsed = Url::parse(repo_url)
        .map_err(|e| Error::Unprocessable(format!("invalid repository URL: {}", e)))?;
    if parsed.host_str() != Some("github.com") {
        return Err(Error::Unprocessable(format!(
            "unsupported platform for change proposals: {}",
            parsed.host_str().unwrap_or_default()
        )));
    }
    let path = parsed.path().trim_matches('/');
    let path = path.strip_suffix(".git").unwrap_or(path);
    if path.split('/').count() != 2 {
        return Err(Error::Unprocessable(format!(
            "cannot derive <org>/<name> from {}",
            repo_url
        )));
    }
    Ok(path.to_string())
}

fn proposal_body(artifacts: &Artifacts) -> String {
    let mut files: Vec<&str> = artifacts
        .config
        .iter()
        .map(|c| c.file_name.as_str())
        .collect();
    files.push(artifacts.composer.file_name.as_str());
    for script in &artifacts.commands_scripts {
        files.push(script.file_name.as_str());
    }
    files.push(jepl::JENKINSFILE);

    let listing = files
        .iter()
        .map(|f| format!("  - [x] {}", f))
        .collect::<Vec<_>>()
        .join("\n");
    format!("Add SQAaaS pipeline via the SQAaaS API.\n\nFILES\n{}\n", listing)
}

/// Embeddable HTML fragment for a stored assertion.
fn render_badge_html(badge: &Value, commit_url: Option<&str>) -> String {
    let openbadge_id = badge.get("openBadgeId").and_then(Value::as_str).unwrap_or_default();
    let image = badge.get("image").and_then(Value::as_str).unwrap_or_default();
    let created_at = badge.get("createdAt").and_then(Value::as_str).unwrap_or_default();
    let commit_url = commit_url.unwrap_or_default();
    format!(
        r#"<blockquote class="badgr-badge">
  <a href="{openbadge_id}" target="_blank" rel="noopener">
    <img width="120px" height="120px" src="{image}" alt="SQAaaS badge">
  </a>
  <p class="badgr-badge-date"><strong>Awarded: </strong><span>{created_at}</span></p>
  <p class="badgr-badge-evidence"><a href="{commit_url}" target="_blank" rel="noopener">Validated commit</a></p>
</blockquote>
"#
    )
}

// ----------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------
