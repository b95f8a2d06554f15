//! The HTTP surface: deployment CRUD, log streaming and the VCS webhook
//! receiver. Thin by design; everything of substance happens in the
//! deployment manager.

mod error;

use axum::body::Bytes;
use axum::extract::ws::{self, WebSocket};
use axum::extract::{Extension, Path, Query};
use axum::http::HeaderMap;
use axum::routing::{get, post, Router};
use axum::Json;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use zyphron_common::{Deployment, Environment, LogEntry};

use crate::deployment::{DeployRequest, DeploymentManager};
use crate::persistence::Page;
use crate::webhook::{self, WebhookCommand, EVENT_HEADER, SIGNATURE_HEADER};

pub use error::{Error, Result};

#[derive(Clone)]
pub struct RouterBuilder {
    router: Router,
}

impl RouterBuilder {
    pub fn new(deployment_manager: DeploymentManager) -> Self {
        let router = Router::new()
            .route(
                "/projects/:project_id/deployments",
                get(get_deployments).post(create_deployment),
            )
            .route("/deployments/:deployment_id", get(get_deployment))
            .route("/deployments/:deployment_id/cancel", post(cancel_deployment))
            .route(
                "/deployments/:deployment_id/redeploy",
                post(redeploy_deployment),
            )
            .route("/deployments/:deployment_id/logs", get(get_logs))
            .route(
                "/ws/deployments/:deployment_id/logs",
                get(get_logs_subscribe),
            )
            .route("/webhooks/:project_id", post(receive_webhook))
            .layer(Extension(deployment_manager));

        Self { router }
    }

    pub fn into_router(self) -> Router {
        self.router
            .route("/status", get(|| async { "Ok" }))
            .layer(TraceLayer::new_for_http())
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PaginationDetails {
    /// Page to fetch, starting from 0.
    pub page: Option<u32>,
    /// Number of results per page.
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct CreateDeploymentRequest {
    branch: Option<String>,
    commit_sha: Option<String>,
    #[serde(default)]
    environment: Environment,
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Default, Deserialize)]
struct CancelRequest {
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    tail: Option<usize>,
}

#[instrument(skip_all, fields(project_id = %project_id))]
async fn create_deployment(
    Extension(deployment_manager): Extension<DeploymentManager>,
    Path(project_id): Path<Uuid>,
    Json(request): Json<CreateDeploymentRequest>,
) -> Result<Json<Value>> {
    let id = deployment_manager
        .submit(DeployRequest {
            project_id,
            branch: request.branch,
            commit_sha: request.commit_sha,
            environment: request.environment,
            force: request.force,
            pr_number: None,
        })
        .await?;

    Ok(Json(json!({ "deployment_id": id })))
}

#[instrument(skip_all, fields(project_id = %project_id))]
async fn get_deployments(
    Extension(deployment_manager): Extension<DeploymentManager>,
    Path(project_id): Path<Uuid>,
    Query(pagination): Query<PaginationDetails>,
) -> Result<Json<Vec<Deployment>>> {
    let mut page = Page::default();
    if let Some(requested) = pagination.page {
        page.page = requested;
    }
    if let Some(limit) = pagination.limit {
        page.limit = limit.min(100);
    }

    Ok(Json(deployment_manager.list(project_id, page).await?))
}

#[instrument(skip_all, fields(deployment_id = %deployment_id))]
async fn get_deployment(
    Extension(deployment_manager): Extension<DeploymentManager>,
    Path(deployment_id): Path<Uuid>,
) -> Result<Json<Deployment>> {
    Ok(Json(deployment_manager.status(deployment_id).await?))
}

#[instrument(skip_all, fields(deployment_id = %deployment_id))]
async fn cancel_deployment(
    Extension(deployment_manager): Extension<DeploymentManager>,
    Path(deployment_id): Path<Uuid>,
    request: Option<Json<CancelRequest>>,
) -> Result<Json<Value>> {
    let reason = request
        .and_then(|Json(body)| body.reason)
        .unwrap_or_else(|| "cancelled by caller".to_string());

    deployment_manager.cancel(deployment_id, &reason).await?;
    Ok(Json(json!({ "cancelled": deployment_id })))
}

#[instrument(skip_all, fields(deployment_id = %deployment_id))]
async fn redeploy_deployment(
    Extension(deployment_manager): Extension<DeploymentManager>,
    Path(deployment_id): Path<Uuid>,
) -> Result<Json<Value>> {
    let id = deployment_manager.redeploy(deployment_id).await?;
    Ok(Json(json!({ "deployment_id": id })))
}

#[instrument(skip_all, fields(deployment_id = %deployment_id))]
async fn get_logs(
    Extension(deployment_manager): Extension<DeploymentManager>,
    Path(deployment_id): Path<Uuid>,
    Query(LogsQuery { tail }): Query<LogsQuery>,
) -> Result<Json<Vec<LogEntry>>> {
    // Fetching status first gives a 404 for unknown ids instead of an
    // empty list.
    deployment_manager.status(deployment_id).await?;

    let mut history = deployment_manager
        .subscribe_logs(deployment_id)
        .await?
        .history;

    if let Some(tail) = tail {
        let skip = history.len().saturating_sub(tail);
        history.drain(..skip);
    }

    Ok(Json(history))
}

async fn get_logs_subscribe(
    Extension(deployment_manager): Extension<DeploymentManager>,
    Path(deployment_id): Path<Uuid>,
    ws_upgrade: ws::WebSocketUpgrade,
) -> axum::response::Response {
    ws_upgrade
        .on_upgrade(move |socket| logs_websocket_handler(socket, deployment_manager, deployment_id))
}

async fn logs_websocket_handler(
    mut socket: WebSocket,
    deployment_manager: DeploymentManager,
    deployment_id: Uuid,
) {
    let subscription = match deployment_manager.subscribe_logs(deployment_id).await {
        Ok(subscription) => subscription,
        Err(error) => {
            warn!(
                error = &error as &dyn std::error::Error,
                "failed to open log subscription"
            );
            let _ = socket
                .send(ws::Message::Text(
                    json!({ "error": "failed to open log subscription" }).to_string(),
                ))
                .await;
            return;
        }
    };

    // History first, then the live tail: the subscription guarantees the
    // split is exact, so clients never see a line twice.
    for entry in subscription.history {
        if send_entry(&mut socket, &entry).await.is_err() {
            return;
        }
    }

    let mut live = subscription.live;
    while let Some(item) = live.next().await {
        match item {
            Ok(entry) => {
                if send_entry(&mut socket, &entry).await.is_err() {
                    return;
                }
            }
            Err(overflow) => {
                debug!(%overflow, "log subscriber overflowed, closing");
                let _ = socket
                    .send(ws::Message::Text(
                        json!({ "error": "SUBSCRIBER_OVERFLOW", "skipped": overflow.skipped })
                            .to_string(),
                    ))
                    .await;
                break;
            }
        }
    }

    let _ = socket.send(ws::Message::Close(None)).await;
}

async fn send_entry(socket: &mut WebSocket, entry: &LogEntry) -> std::result::Result<(), axum::Error> {
    let payload = serde_json::to_string(entry).expect("log entries always serialize");
    socket.send(ws::Message::Text(payload)).await
}

#[instrument(skip_all, fields(project_id = %project_id))]
async fn receive_webhook(
    Extension(deployment_manager): Extension<DeploymentManager>,
    Path(project_id): Path<Uuid>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>> {
    let project = deployment_manager.find_project(project_id).await?;
    let secret = project
        .webhook_secret
        .as_deref()
        .ok_or(Error::NoWebhookSecret)?;

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or(Error::MissingHeader(SIGNATURE_HEADER))?;
    if !webhook::verify_signature(secret, &body, signature) {
        return Err(Error::InvalidSignature);
    }

    let event = headers
        .get(EVENT_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or(Error::MissingHeader(EVENT_HEADER))?;

    match webhook::interpret(&project, event, &body) {
        WebhookCommand::Deploy(request) => {
            let id = deployment_manager.submit(request).await?;
            Ok(Json(json!({ "deployment_id": id })))
        }
        WebhookCommand::Ignored(reason) => {
            debug!(reason, "ignoring webhook delivery");
            Ok(Json(json!({ "ignored": reason })))
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use zyphron_common::DeploymentState;

    use crate::test_support::{
        harness, seed_project, wait_for_state, wait_until_terminal, BuildBehavior,
    };
    use crate::webhook::sign;

    use super::*;

    async fn body_json<B>(body: B) -> Value
    where
        B: axum::body::HttpBody,
        B::Error: std::fmt::Debug,
    {
        let bytes = hyper::body::to_bytes(body).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn push_delivery(project_id: Uuid, secret: &str) -> Request<Body> {
        let body = br#"{"ref":"refs/heads/main","after":"abc123"}"#.to_vec();
        Request::builder()
            .method("POST")
            .uri(format!("/webhooks/{project_id}"))
            .header(SIGNATURE_HEADER, sign(secret, &body))
            .header(EVENT_HEADER, "push")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn webhook_push_deploys_to_production() {
        let h = harness(vec![BuildBehavior::Succeed { delay_ms: 10 }], 2).await;
        let project = seed_project(&h.store, "blog").await;
        let router = RouterBuilder::new(h.manager.clone()).into_router();

        let response = router
            .oneshot(push_delivery(project.id, "wh-secret"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response.into_body()).await;
        let id: Uuid = json["deployment_id"].as_str().unwrap().parse().unwrap();

        let live = wait_for_state(&h.store, id, DeploymentState::Live).await;
        assert_eq!(live.environment, zyphron_common::Environment::Production);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn webhook_with_a_bad_signature_is_rejected() {
        let h = harness(vec![], 2).await;
        let project = seed_project(&h.store, "blog").await;
        let router = RouterBuilder::new(h.manager.clone()).into_router();

        let response = router
            .oneshot(push_delivery(project.id, "wrong-secret"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let json = body_json(response.into_body()).await;
        assert_eq!(json["error_kind"], "INVALID_SIGNATURE");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn webhook_pull_request_deploys_a_preview() {
        let h = harness(vec![BuildBehavior::Succeed { delay_ms: 10 }], 2).await;
        let project = seed_project(&h.store, "blog").await;
        let router = RouterBuilder::new(h.manager.clone()).into_router();

        let body = br#"{
            "action": "opened",
            "number": 7,
            "pull_request": { "head": { "ref": "feature-x", "sha": "abc123" } }
        }"#
        .to_vec();
        let request = Request::builder()
            .method("POST")
            .uri(format!("/webhooks/{}", project.id))
            .header(SIGNATURE_HEADER, sign("wh-secret", &body))
            .header(EVENT_HEADER, "pull_request")
            .body(Body::from(body))
            .unwrap();

        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response.into_body()).await;
        let id: Uuid = json["deployment_id"].as_str().unwrap().parse().unwrap();

        let live = wait_for_state(&h.store, id, DeploymentState::Live).await;
        assert_eq!(
            live.external_url.as_deref(),
            Some("http://blog-pr-7.apps.test")
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_deployment_status_is_404() {
        let h = harness(vec![], 2).await;
        let router = RouterBuilder::new(h.manager.clone()).into_router();

        let response = router
            .oneshot(
                Request::builder()
                    .uri(format!("/deployments/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = body_json(response.into_body()).await;
        assert_eq!(json["error_kind"], "DEPLOYMENT_NOT_FOUND");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn conflicting_submit_is_a_409_and_cancel_resolves_it() {
        let h = harness(vec![BuildBehavior::BlockUntilCancelled], 2).await;
        let project = seed_project(&h.store, "blog").await;
        let router = RouterBuilder::new(h.manager.clone()).into_router();

        let submit = |body: &'static str| {
            Request::builder()
                .method("POST")
                .uri(format!("/projects/{}/deployments", project.id))
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap()
        };

        let response = router.clone().oneshot(submit("{}")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response.into_body()).await;
        let first: Uuid = json["deployment_id"].as_str().unwrap().parse().unwrap();
        wait_for_state(&h.store, first, DeploymentState::Building).await;

        let conflict = router.clone().oneshot(submit("{}")).await.unwrap();
        assert_eq!(conflict.status(), StatusCode::CONFLICT);
        let json = body_json(conflict.into_body()).await;
        assert_eq!(json["error_kind"], "DEPLOYMENT_IN_PROGRESS");

        let cancel = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/deployments/{first}/cancel"))
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"reason":"test"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(cancel.status(), StatusCode::OK);

        let done = wait_until_terminal(&h.store, first).await;
        assert_eq!(done.state, DeploymentState::Cancelled);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn log_history_is_served_with_tail() {
        let h = harness(vec![BuildBehavior::Succeed { delay_ms: 10 }], 2).await;
        let project = seed_project(&h.store, "blog").await;
        let router = RouterBuilder::new(h.manager.clone()).into_router();

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/projects/{}/deployments", project.id))
                    .header("content-type", "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = body_json(response.into_body()).await;
        let id: Uuid = json["deployment_id"].as_str().unwrap().parse().unwrap();
        wait_for_state(&h.store, id, DeploymentState::Live).await;

        let all = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/deployments/{id}/logs"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(all.status(), StatusCode::OK);
        let entries = body_json(all.into_body()).await;
        let total = entries.as_array().unwrap().len();
        assert!(total >= 4, "expected a full pipeline log, got {total} lines");

        let tailed = router
            .oneshot(
                Request::builder()
                    .uri(format!("/deployments/{id}/logs?tail=2"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let entries = body_json(tailed.into_body()).await;
        assert_eq!(entries.as_array().unwrap().len(), 2);
    }
}
