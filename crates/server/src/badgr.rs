//! Badgr credential gateway
//!
//! Issues OpenBadge assertions for pipelines whose build reached a terminal
//! success. Holds a bearer token refreshed before expiry; issuer and badge
//! class are resolved by display name on every issuance.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use sqaaas_common::error::{Error, Result};

/// Remaining token lifetime below which a refresh is forced
const TOKEN_EXPIRY_MARGIN_SECS: i64 = 100;

/// Software quality baseline, linked from the assertion narrative
const SW_BASELINE_URL: &str = "https://indigo-dc.github.io/sqa-baseline/";
/// Service quality baseline
const SRV_BASELINE_URL: &str = "https://eosc-synergy.github.io/service-qa-baseline/";

/// Capability the orchestrator needs from the credential issuer
#[async_trait]
pub trait BadgeGateway: Send + Sync {
    /// Issue an assertion tied to a commit and CI build. Returns the raw
    /// assertion document.
    async fn issue(
        &self,
        commit_id: &str,
        commit_url: &str,
        ci_build_url: &str,
        sw_criteria: &[String],
        srv_criteria: &[String],
    ) -> Result<Value>;
}

#[derive(Debug, Clone)]
struct TokenState {
    access_token: String,
    expires_at: DateTime<Utc>,
}

impl TokenState {
    fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        (self.expires_at - now).num_seconds() < TOKEN_EXPIRY_MARGIN_SECS
    }
}

/// Badgr API implementation
pub struct BadgrGateway {
    client: reqwest::Client,
    endpoint: String,
    user: String,
    password: String,
    issuer_name: String,
    badgeclass_name: String,
    token: Mutex<Option<TokenState>>,
}

impl BadgrGateway {
    pub fn new(
        endpoint: &str,
        user: &str,
        password: &str,
        issuer_name: &str,
        badgeclass_name: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("sqaaas-api")
            .timeout(timeout)
            .build()
            .map_err(|e| Error::InvalidConfig(format!("cannot build Badgr client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            user: user.to_string(),
            password: password.to_string(),
            issuer_name: issuer_name.to_string(),
            badgeclass_name: badgeclass_name.to_string(),
            token: Mutex::new(None),
        })
    }

    /// Bearer token, refreshed atomically when close to expiry.
    async fn bearer_token(&self) -> Result<String> {
        let mut slot = self.token.lock().await;
        let now = Utc::now();
        if let Some(state) = slot.as_ref() {
            if !state.needs_refresh(now) {
                return Ok(state.access_token.clone());
            }
            debug!("Bearer token close to expiry, refreshing");
        }

        let response = self
            .client
            .post(format!("{}/o/token", self.endpoint))
            .form(&[("username", self.user.as_str()), ("password", self.password.as_str())])
            .send()
            .await
            .map_err(|e| Error::upstream(e.to_string()))?;
        let response = check(response).await?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| Error::upstream(e.to_string()))?;

        let access_token = body
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::upstream("token response carries no access_token"))?
            .to_string();
        let expires_in = body.get("expires_in").and_then(Value::as_i64).unwrap_or(0);
        let state = TokenState {
            access_token: access_token.clone(),
            expires_at: now + chrono::Duration::seconds(expires_in),
        };
        *slot = Some(state);
        Ok(access_token)
    }

    async fn get_json(&self, path: &str) -> Result<Value> {
        let token = self.bearer_token().await?;
        let response = self
            .client
            .get(format!("{}/{}", self.endpoint, path))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| Error::upstream(e.to_string()))?;
        check(response)
            .await?
            .json()
            .await
            .map_err(|e| Error::upstream(e.to_string()))
    }

    /// Resolve the badge-class entity id from the configured display names.
    async fn resolve_badge_class(&self) -> Result<String> {
        let issuers = self.get_json("v2/issuers").await?;
        let issuer_id = match_entity_by_name(&issuers, &self.issuer_name, "issuer")?;

        let classes = self
            .get_json(&format!("v2/issuers/{}/badgeclasses", issuer_id))
            .await?;
        match_entity_by_name(&classes, &self.badgeclass_name, "badge class")
    }
}

/// Exact-name match over a `{result: [...]}` listing, erroring on zero or
/// multiple matches.
fn match_entity_by_name(listing: &Value, name: &str, kind: &str) -> Result<String> {
    let results = listing
        .get("result")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::upstream(format!("{} listing carries no result", kind)))?;

    let matches: Vec<&Value> = results
        .iter()
        .filter(|entity| entity.get("name").and_then(Value::as_str) == Some(name))
        .collect();
    match matches.len() {
        0 => Err(Error::upstream(format!("no {} named <{}>", kind, name))),
        1 => matches[0]
            .get("entityId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::upstream(format!("{} <{}> carries no entityId", kind, name))),
        n => Err(Error::upstream(format!(
            "{} matches for {} named <{}>, expected exactly one",
            n, kind, name
        ))),
    }
}

/// Markdown narrative listing the fulfilled criteria per baseline.
fn compose_narrative(sw_criteria: &[String], srv_criteria: &[String]) -> String {
    let sections = [
        ("Software", sw_criteria, SW_BASELINE_URL),
        ("Service", srv_criteria, SRV_BASELINE_URL),
    ];
    sections
        .iter()
        .filter(|(_, criteria, _)| !criteria.is_empty())
        .map(|(baseline, criteria, baseline_url)| {
            let listing = criteria
                .iter()
                .map(|criterion| format!("- [{}]({})", criterion, baseline_url))
                .collect::<Vec<_>>()
                .join("\n");
            format!(
                "Successful validation of {} QA criteria:\n{}",
                baseline, listing
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body: Value = response.json().await.unwrap_or(Value::Null);
    // Field- and validation-error arrays carry the useful diagnostics
    let mut reasons = Vec::new();
    for key in ["fieldErrors", "validationErrors"] {
        if let Some(errors) = body.get("status").and_then(|s| s.get(key)).or_else(|| body.get(key)) {
            if !errors.is_null() {
                reasons.push(format!("{}: {}", key, errors));
            }
        }
    }
    if reasons.is_empty() {
        reasons.push(body.to_string());
    }
    Err(Error::upstream_status(status.as_u16(), reasons.join("; ")))
}

#[async_trait]
impl BadgeGateway for BadgrGateway {
    async fn issue(
        &self,
        commit_id: &str,
        commit_url: &str,
        ci_build_url: &str,
        sw_criteria: &[String],
        srv_criteria: &[String],
    ) -> Result<Value> {
        let badgeclass_id = self.resolve_badge_class().await?;

        let assertion = json!({
            "recipient": {
                "identity": commit_url,
                "hashed": true,
                "type": "url",
            },
            "narrative": compose_narrative(sw_criteria, srv_criteria),
            "evidence": [{
                "url": ci_build_url,
                "narrative": format!(
                    "- Version validated (commit): {}\n- Build URL in the CI system: {}",
                    commit_id, ci_build_url
                ),
            }],
        });

        debug!("Issuing assertion for commit <{}>", commit_id);
        let token = self.bearer_token().await?;
        let response = self
            .client
            .post(format!(
                "{}/v2/badgeclasses/{}/assertions",
                self.endpoint, badgeclass_id
            ))
            .bearer_auth(token)
            .json(&assertion)
            .send()
            .await
            .map_err(|e| Error::upstream(e.to_string()))?;
        let body: Value = check(response)
            .await?
            .json()
            .await
            .map_err(|e| Error::upstream(e.to_string()))?;

        let results = body
            .get("result")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if results.len() > 1 {
            warn!(
                "Assertion response carries {} results, returning the first",
                results.len()
            );
        }
        results
            .into_iter()
            .next()
            .ok_or_else(|| Error::upstream("assertion response carries no result"))
    }
}
