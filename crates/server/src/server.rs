//! HTTP surface
//!
//! All routes live under `/v1`. Handlers validate the identifier, delegate
//! to the orchestrator and map the error taxonomy onto HTTP statuses.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    routing::post,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use sqaaas_common::error::Error;
use sqaaas_common::types::PipelineRequest;

use crate::jepl;
use crate::orchestrator::{BadgeOutput, Orchestrator};

/// Reason phrase of asynchronous operations, surfaced as a header because a
/// 204 carries no body
const REASON_HEADER: &str = "x-sqaaas-reason";

/// Shared handler state
pub struct AppState {
    pub orchestrator: Orchestrator,
}

/// Error wrapper rendering the taxonomy as HTTP responses
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = match &self.0 {
            Error::Upstream {
                status: upstream_status,
                reason,
            } => json!({
                "upstream_status": upstream_status,
                "upstream_reason": reason,
            }),
            e => json!({
                "code": status.as_u16(),
                "message": e.to_string(),
            }),
        };
        (status, Json(body)).into_response()
    }
}

type HandlerResult<T> = std::result::Result<T, ApiError>;

/// `{id}` must be a valid version-4 identifier.
fn validate_id(pipeline_id: &str) -> HandlerResult<()> {
    let parsed = Uuid::parse_str(pipeline_id)
        .map_err(|_| Error::Validation(format!("malformed pipeline identifier: {}", pipeline_id)))?;
    if parsed.get_version_num() != 4 {
        return Err(ApiError(Error::Validation(format!(
            "pipeline identifier is not a version-4 identifier: {}",
            pipeline_id
        ))));
    }
    Ok(())
}

/// Build the /v1 router.
pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/pipeline", post(create_handler).get(list_handler))
        .route(
            "/pipeline/:id",
            get(read_handler).put(update_handler).delete(delete_handler),
        )
        .route("/pipeline/:id/config", get(config_handler))
        .route("/pipeline/:id/composer", get(composer_handler))
        .route("/pipeline/:id/jenkinsfile", get(jenkinsfile_handler))
        .route("/pipeline/:id/config_jepl", get(config_jepl_handler))
        .route("/pipeline/:id/composer_jepl", get(composer_jepl_handler))
        .route("/pipeline/:id/jenkinsfile_jepl", get(jenkinsfile_jepl_handler))
        .route("/pipeline/:id/commands_scripts", get(commands_scripts_handler))
        .route("/pipeline/:id/compressed_files", get(compressed_files_handler))
        .route("/pipeline/:id/run", post(run_handler))
        .route("/pipeline/:id/status", get(status_handler))
        .route("/pipeline/:id/pull_request", post(pull_request_handler))
        .route("/pipeline/:id/badge", post(issue_badge_handler).get(get_badge_handler))
        .with_state(state);

    Router::new()
        .nest("/v1", api)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
}

/// Serve the API until the process is stopped.
pub async fn serve(addr: SocketAddr, state: Arc<AppState>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("SQAaaS API listening on http://{}", addr);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

// ----------------------------------------------------------------------
// Handlers
// ----------------------------------------------------------------------

async fn create_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PipelineRequest>,
) -> HandlerResult<impl IntoResponse> {
    let id = state.orchestrator.create(body)?;
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

async fn list_handler(State(state): State<Arc<AppState>>) -> HandlerResult<impl IntoResponse> {
    Ok(Json(state.orchestrator.list()?))
}

async fn read_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> HandlerResult<impl IntoResponse> {
    validate_id(&id)?;
    let record = state.orchestrator.read(&id)?;
    Ok(Json(json!({
        "id": id,
        "name": record.raw_request.name,
        "pipeline_repo": record.pipeline_repo,
        "pipeline_repo_url": record.pipeline_repo_url,
        "config_data": record.raw_request.config_data,
        "composer_data": record.raw_request.composer_data,
        "jenkinsfile_data": record.raw_request.jenkinsfile_data,
    })))
}

async fn update_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<PipelineRequest>,
) -> HandlerResult<impl IntoResponse> {
    validate_id(&id)?;
    state.orchestrator.update(&id, body)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> HandlerResult<impl IntoResponse> {
    validate_id(&id)?;
    state.orchestrator.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn config_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> HandlerResult<impl IntoResponse> {
    validate_id(&id)?;
    let record = state.orchestrator.read(&id)?;
    Ok(Json(record.raw_request.config_data))
}

async fn composer_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> HandlerResult<impl IntoResponse> {
    validate_id(&id)?;
    let record = state.orchestrator.read(&id)?;
    Ok(Json(record.raw_request.composer_data))
}

async fn jenkinsfile_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> HandlerResult<impl IntoResponse> {
    validate_id(&id)?;
    let record = state.orchestrator.read(&id)?;
    Ok(Json(record.raw_request.jenkinsfile_data))
}

async fn config_jepl_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> HandlerResult<impl IntoResponse> {
    validate_id(&id)?;
    let record = state.orchestrator.read(&id)?;
    let rendered: Vec<_> = record
        .artifacts
        .config
        .iter()
        .map(|c| {
            json!({
                "file_name": c.file_name,
                "content": c.data_yml,
                "data_when": c.data_when,
            })
        })
        .collect();
    Ok(Json(rendered))
}

async fn composer_jepl_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> HandlerResult<impl IntoResponse> {
    validate_id(&id)?;
    let record = state.orchestrator.read(&id)?;
    Ok(Json(json!({
        "file_name": record.artifacts.composer.file_name,
        "content": record.artifacts.composer.data_yml,
    })))
}

async fn jenkinsfile_jepl_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> HandlerResult<impl IntoResponse> {
    validate_id(&id)?;
    let record = state.orchestrator.read(&id)?;
    Ok(Json(json!({
        "file_name": jepl::JENKINSFILE,
        "content": record.artifacts.jenkinsfile,
    })))
}

async fn commands_scripts_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> HandlerResult<impl IntoResponse> {
    validate_id(&id)?;
    let record = state.orchestrator.read(&id)?;
    Ok(Json(record.artifacts.commands_scripts))
}

async fn compressed_files_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> HandlerResult<impl IntoResponse> {
    validate_id(&id)?;
    let bytes = state.orchestrator.compress(&id)?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/zip"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"sqaaas.zip\"",
            ),
        ],
        bytes,
    ))
}

#[derive(Debug, Deserialize)]
struct RunParams {
    issue_badge: Option<String>,
    repo_url: Option<String>,
    repo_branch: Option<String>,
}

/// A bare `?issue_badge` counts as true, as does any true-ish value.
fn flag_set(value: &Option<String>) -> bool {
    match value.as_deref() {
        None => false,
        Some("") => true,
        Some(v) => v.eq_ignore_ascii_case("true"),
    }
}

async fn run_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<RunParams>,
) -> HandlerResult<impl IntoResponse> {
    validate_id(&id)?;
    let reason = state
        .orchestrator
        .run(
            &id,
            params.repo_url.as_deref(),
            params.repo_branch.as_deref(),
            flag_set(&params.issue_badge),
        )
        .await?;
    Ok((StatusCode::NO_CONTENT, [(REASON_HEADER, reason)]))
}

async fn status_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> HandlerResult<impl IntoResponse> {
    validate_id(&id)?;
    let report = state.orchestrator.status(&id).await?;
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
struct PullRequestBody {
    repo: String,
    branch: Option<String>,
}

async fn pull_request_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<PullRequestBody>,
) -> HandlerResult<impl IntoResponse> {
    validate_id(&id)?;
    let url = state
        .orchestrator
        .propose_change(&id, &body.repo, body.branch.as_deref())
        .await?;
    Ok(Json(json!({ "pull_request_url": url })))
}

async fn issue_badge_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> HandlerResult<impl IntoResponse> {
    validate_id(&id)?;
    let assertion = state.orchestrator.issue_badge(&id).await?;
    Ok(Json(assertion))
}

#[derive(Debug, Deserialize)]
struct BadgeParams {
    share: Option<String>,
}

async fn get_badge_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<BadgeParams>,
) -> HandlerResult<Response> {
    validate_id(&id)?;
    let share_html = params.share.as_deref() == Some("html");
    match state.orchestrator.get_badge(&id, share_html)? {
        BadgeOutput::Assertion(assertion) => Ok(Json(assertion).into_response()),
        BadgeOutput::Html(html) => Ok(Html(html).into_response()),
    }
}

// ----------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::badgr::BadgrGateway;
    use crate::github::GithubGateway;
    use crate::jenkins::JenkinsGateway;
    use axum::body::Body;
    use axum::http::Request;
    use sqaaas_common::config::ApiConfig;
    use sqaaas_common::store::PipelineStore;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_router() -> (tempfile::TempDir, Router) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(PipelineStore::new(dir.path().join("sqaaas.json")));
        let timeout = Duration::from_secs(5);
        let orchestrator = Orchestrator::new(
            ApiConfig::default(),
            store,
            Arc::new(GithubGateway::new("t0ken", timeout, timeout).unwrap()),
            Arc::new(JenkinsGateway::new("https://jenkins.invalid", "u", "t", timeout).unwrap()),
            Arc::new(
                BadgrGateway::new("https://badgr.invalid", "u", "p", "Issuer", "Class", timeout)
                    .unwrap(),
            ),
        );
        let router = router(Arc::new(AppState { orchestrator }));
        (dir, router)
    }

    fn s1_body() -> serde_json::Value {
        json!({
            "name": "demo",
            "config_data": [{
                "sqa_criteria": {
                    "QC.Sty": {
                        "repos": [
                            {"repo_url": "https://git.example/x/y", "commands": ["make lint"]}
                        ]
                    }
                }
            }],
            "composer_data": {"services": {"checker": {"image": {"name": "foo:1"}}}},
            "jenkinsfile_data": {}
        })
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn post_json(router: &Router, path: &str, body: serde_json::Value) -> Response {
        router
            .clone()
            .oneshot(
                Request::post(path)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    async fn get_path(router: &Router, path: &str) -> Response {
        router
            .clone()
            .oneshot(Request::get(path).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_and_fetch_commands_scripts() {
        let (_dir, router) = test_router();

        let response = post_json(&router, "/v1/pipeline", s1_body()).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = body_json(response).await;
        let id = created["id"].as_str().unwrap().to_string();

        let response = get_path(&router, &format!("/v1/pipeline/{}/commands_scripts", id)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let scripts = body_json(response).await;
        let scripts = scripts.as_array().unwrap();
        assert_eq!(scripts.len(), 1);
        assert!(scripts[0]["data"]
            .as_str()
            .unwrap()
            .contains("cd git.example/x/y && make lint"));
    }

    #[tokio::test]
    async fn test_create_rejects_name_with_space() {
        let (_dir, router) = test_router();
        let mut body = s1_body();
        body["name"] = json!("my pipeline");

        let response = post_json(&router, "/v1/pipeline", body).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let error = body_json(response).await;
        assert!(error["message"].as_str().unwrap().contains("[A-Za-z0-9_.-]+"));
    }

    #[tokio::test]
    async fn test_malformed_id_is_rejected() {
        let (_dir, router) = test_router();
        let response = get_path(&router, "/v1/pipeline/not-a-uuid").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_id_is_not_found() {
        let (_dir, router) = test_router();
        let id = Uuid::new_v4();
        let response = get_path(&router, &format!("/v1/pipeline/{}", id)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_read_returns_raw_request() {
        let (_dir, router) = test_router();
        let created = body_json(post_json(&router, "/v1/pipeline", s1_body()).await).await;
        let id = created["id"].as_str().unwrap().to_string();

        let body = body_json(get_path(&router, &format!("/v1/pipeline/{}", id)).await).await;
        assert_eq!(body["name"], json!("demo"));
        assert_eq!(body["config_data"], s1_body()["config_data"]);
        assert_eq!(body["composer_data"], s1_body()["composer_data"]);
    }

    #[tokio::test]
    async fn test_compressed_files_headers() {
        let (_dir, router) = test_router();
        let created = body_json(post_json(&router, "/v1/pipeline", s1_body()).await).await;
        let id = created["id"].as_str().unwrap().to_string();

        let response = get_path(&router, &format!("/v1/pipeline/{}/compressed_files", id)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/zip"
        );
        assert_eq!(
            response.headers().get(header::CONTENT_DISPOSITION).unwrap(),
            "attachment; filename=\"sqaaas.zip\""
        );
    }

    #[tokio::test]
    async fn test_status_before_run_is_unprocessable() {
        let (_dir, router) = test_router();
        let created = body_json(post_json(&router, "/v1/pipeline", s1_body()).await).await;
        let id = created["id"].as_str().unwrap().to_string();

        let response = get_path(&router, &format!("/v1/pipeline/{}/status", id)).await;
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_update_is_no_content() {
        let (_dir, router) = test_router();
        let created = body_json(post_json(&router, "/v1/pipeline", s1_body()).await).await;
        let id = created["id"].as_str().unwrap().to_string();

        let response = router
            .clone()
            .oneshot(
                Request::put(format!("/v1/pipeline/{}", id))
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(s1_body().to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_rendered_sections_carry_file_names() {
        let (_dir, router) = test_router();
        let created = body_json(post_json(&router, "/v1/pipeline", s1_body()).await).await;
        let id = created["id"].as_str().unwrap().to_string();

        let configs = body_json(get_path(&router, &format!("/v1/pipeline/{}/config_jepl", id)).await).await;
        assert_eq!(configs[0]["file_name"], json!(".sqa/config.yml"));
        assert!(configs[0]["content"].as_str().unwrap().contains("sqa_criteria"));

        let composer =
            body_json(get_path(&router, &format!("/v1/pipeline/{}/composer_jepl", id)).await).await;
        assert_eq!(composer["file_name"], json!(".sqa/docker-compose.yml"));

        let jenkinsfile =
            body_json(get_path(&router, &format!("/v1/pipeline/{}/jenkinsfile_jepl", id)).await).await;
        assert_eq!(jenkinsfile["file_name"], json!("Jenkinsfile"));
        assert!(jenkinsfile["content"].as_str().unwrap().contains("@Library"));
    }
}
