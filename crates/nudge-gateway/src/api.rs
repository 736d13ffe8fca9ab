//! Admin API, response webhook, and ack links.
//!
//! Thin axum adapter over the service: extract, authorize, call, map the
//! error taxonomy onto status codes. Admin mutations carry the caller's
//! id in `X-Actor-Id`, checked against the configured allow-list; real
//! authentication happens in the fronting layer, as does webhook
//! signature verification.

use crate::ack_link::AckTokenSigner;
use crate::config::SharedConfig;
use crate::ingest;
use crate::service::{ReminderService, ResponseAction};
use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::Json;
use nudge_core::{Conflict, CreateReminder, Error, Status, TestType, UpdateReminder};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

const DEFAULT_PAGE_SIZE: usize = 50;
const MAX_PAGE_SIZE: usize = 500;

#[derive(Clone)]
pub(crate) struct AppState {
    pub service: Arc<ReminderService>,
    pub config: SharedConfig,
    pub signer: Arc<AckTokenSigner>,
}

pub(crate) fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/reminders", get(list_reminders).post(create_reminder))
        .route("/api/reminders/flush", delete(flush_reminders))
        .route(
            "/api/reminders/{id}",
            get(get_reminder).put(update_reminder).delete(delete_reminder),
        )
        .route("/api/reminders/{id}/test", post(test_reminder))
        .route("/api/reminders/{id}/reset", post(reset_reminder))
        .route("/api/reminders/{id}/responses", get(reminder_responses))
        .route("/webhook/interactions", post(webhook_interaction))
        .route("/ack/{id}", get(ack_link))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

pub(crate) enum ApiError {
    Core(Error),
    Unauthorized(&'static str),
    Forbidden,
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self::Core(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::Unauthorized(message) => (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": message })),
            )
                .into_response(),
            Self::Forbidden => (
                StatusCode::FORBIDDEN,
                Json(json!({ "error": "actor is not on the admin allow-list" })),
            )
                .into_response(),
            Self::Core(err) => {
                let (status, body) = core_error_response(&err);
                (status, Json(body)).into_response()
            }
        }
    }
}

fn core_error_response(err: &Error) -> (StatusCode, serde_json::Value) {
    match err {
        Error::Validation { field, message } => {
            debug!(field = %field, message = %message, "request rejected");
            (
                StatusCode::BAD_REQUEST,
                json!({ "error": format!("invalid {field}: {message}"), "field": field }),
            )
        }
        Error::Conflict(conflict) => {
            let (status, code) = match conflict {
                Conflict::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
                Conflict::Duplicate(_) => (StatusCode::BAD_REQUEST, "DUPLICATE"),
                Conflict::ImmutableState(_) => (StatusCode::BAD_REQUEST, "IMMUTABLE_STATE"),
                Conflict::IllegalTransition { .. } => {
                    (StatusCode::BAD_REQUEST, "ILLEGAL_TRANSITION")
                }
                Conflict::Version => (StatusCode::CONFLICT, "CONFLICT"),
            };
            debug!(code, error = %conflict, "request conflicted");
            (status, json!({ "error": conflict.to_string(), "code": code }))
        }
        Error::TransportTransient { .. } => (
            StatusCode::SERVICE_UNAVAILABLE,
            json!({ "error": err.to_string() }),
        ),
        Error::TransportPermanent { .. } => (
            StatusCode::BAD_GATEWAY,
            json!({ "error": err.to_string() }),
        ),
        Error::Store(_) | Error::Internal(_) => {
            error!(error = %err, "internal error serving request");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": "internal error" }),
            )
        }
    }
}

/// Admin gate for mutating endpoints. Returns the actor id.
fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<String, ApiError> {
    let actor = headers
        .get("x-actor-id")
        .and_then(|value| value.to_str().ok())
        .ok_or(ApiError::Unauthorized("missing X-Actor-Id header"))?;
    if state.config.load().is_admin(actor) {
        Ok(actor.to_owned())
    } else {
        Err(ApiError::Forbidden)
    }
}

// ---------------------------------------------------------------------------
// Admin endpoints
// ---------------------------------------------------------------------------

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct ListParams {
    status: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

async fn list_reminders(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = params
        .status
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(|s| {
            Status::parse(s)
                .ok_or_else(|| Error::validation("status", format!("unknown status '{s}'")))
        })
        .transpose()?;
    let limit = params.limit.unwrap_or(DEFAULT_PAGE_SIZE).min(MAX_PAGE_SIZE);
    let offset = params.offset.unwrap_or(0);

    let (reminders, total) = state.service.list(status, limit, offset)?;
    Ok(Json(json!({
        "reminders": reminders,
        "total": total,
        "limit": limit,
        "offset": offset,
    })))
}

async fn create_reminder(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<CreateReminder>,
) -> Result<impl IntoResponse, ApiError> {
    let actor = require_admin(&state, &headers)?;
    let reminder = state.service.create(input, &actor)?;
    Ok((StatusCode::CREATED, Json(reminder)))
}

async fn get_reminder(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.get(&id)?))
}

async fn update_reminder(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(delta): Json<UpdateReminder>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    Ok(Json(state.service.update(&id, &delta)?))
}

async fn delete_reminder(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    state.service.delete(&id)?;
    Ok(Json(json!({ "deleted": true })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TestRequest {
    test_type: TestType,
    #[serde(default)]
    preserve_schedule: bool,
}

async fn test_reminder(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<TestRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let actor = require_admin(&state, &headers)?;
    let entry = state
        .service
        .execute_test(&id, request.test_type, request.preserve_schedule, &actor)
        .await?;
    Ok(Json(entry))
}

async fn reset_reminder(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    Ok(Json(state.service.reset(&id)?))
}

async fn reminder_responses(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let responses = state.service.responses(&id)?;
    Ok(Json(json!({ "responses": responses })))
}

async fn flush_reminders(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    let removed = state.service.flush_all()?;
    Ok(Json(json!({ "removed": removed })))
}

// ---------------------------------------------------------------------------
// Response ingestion
// ---------------------------------------------------------------------------

const INTERACTION_PING: u64 = 1;
const INTERACTION_REPLY: u64 = 4;
const MESSAGE_FLAG_EPHEMERAL: u64 = 64;

async fn webhook_interaction(
    State(state): State<AppState>,
    Json(payload): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if payload["type"].as_u64() == Some(INTERACTION_PING) {
        return Ok(Json(json!({ "type": INTERACTION_PING })));
    }

    let event = ingest::parse_interaction(&payload)?;
    let outcome = ingest::process_interaction(&state.service, &event).await?;
    Ok(Json(json!({
        "type": INTERACTION_REPLY,
        "data": {
            "content": ingest::reply_text(&outcome),
            "flags": MESSAGE_FLAG_EPHEMERAL,
        },
    })))
}

#[derive(Debug, Deserialize)]
struct AckQuery {
    action: ResponseAction,
    token: String,
}

async fn ack_link(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<AckQuery>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.signer.verify(&id, query.action, &query.token) {
        return Err(ApiError::Unauthorized("invalid or expired token"));
    }
    // The link reaches only the reminder's recipient; answer as them.
    let target = state.service.get(&id)?.target_user_id;
    let reminder = state
        .service
        .record_response(&id, &target, query.action)
        .await?;
    let text = match query.action {
        ResponseAction::Acknowledge => "Reminder acknowledged.",
        ResponseAction::Decline => {
            if reminder.status == Status::Escalated {
                "Reminder declined; the secondary contact has been notified."
            } else {
                "Reminder declined."
            }
        }
    };
    Ok(text)
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, shared_config};
    use crate::testutil::{ADMIN, TARGET, basic_create, escalating_create, harness};
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Duration as ChronoDuration;
    use tower::ServiceExt;

    fn app() -> (Router, crate::testutil::Harness) {
        let h = harness();
        let config: Config = toml::from_str(&format!(
            "[auth]\nadmins = [\"{ADMIN}\"]\n"
        ))
        .unwrap();
        let state = AppState {
            service: Arc::clone(&h.service),
            config: shared_config(config),
            signer: Arc::new(AckTokenSigner::new(b"test-secret".to_vec())),
        };
        (router(state), h)
    }

    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        actor: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(actor) = actor {
            builder = builder.header("x-actor-id", actor);
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| json!(String::from_utf8_lossy(&bytes)))
        };
        (status, value)
    }

    fn create_body() -> serde_json::Value {
        json!({
            "content": "water the plants",
            "targetUserId": TARGET,
            "scheduledTime": "2026-03-01T13:00:00Z",
        })
    }

    #[tokio::test]
    async fn healthz_is_open() {
        let (app, _h) = app();
        let (status, body) = send(&app, "GET", "/healthz", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn create_requires_actor_header() {
        let (app, _h) = app();
        let (status, _) = send(&app, "POST", "/api/reminders", None, Some(create_body())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn create_rejects_non_admin_actor() {
        let (app, _h) = app();
        let (status, _) = send(
            &app,
            "POST",
            "/api/reminders",
            Some("00000000000000000"),
            Some(create_body()),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn create_returns_201_with_reminder() {
        let (app, _h) = app();
        let (status, body) = send(
            &app,
            "POST",
            "/api/reminders",
            Some(ADMIN),
            Some(create_body()),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["status"], "pending");
        assert_eq!(body["targetUserId"], TARGET);
        assert!(body["id"].as_str().unwrap().starts_with("rem_"));
    }

    #[tokio::test]
    async fn create_maps_validation_to_400_with_field() {
        let (app, _h) = app();
        let mut body = create_body();
        body["targetUserId"] = json!("not-a-snowflake");
        let (status, body) = send(&app, "POST", "/api/reminders", Some(ADMIN), Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["field"], "targetUserId");
    }

    #[tokio::test]
    async fn get_unknown_reminder_is_404() {
        let (app, _h) = app();
        let (status, body) = send(&app, "GET", "/api/reminders/rem_ghost", None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn list_returns_paging_envelope() {
        let (app, h) = app();
        basic_create(&h);
        basic_create(&h);
        let (status, body) =
            send(&app, "GET", "/api/reminders?limit=1&offset=0", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 2);
        assert_eq!(body["limit"], 1);
        assert_eq!(body["reminders"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn list_rejects_unknown_status_filter() {
        let (app, _h) = app();
        let (status, _) = send(&app, "GET", "/api/reminders?status=bogus", None, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn update_of_sent_reminder_is_immutable_state() {
        let (app, h) = app();
        let created = basic_create(&h);
        h.service.mark_as_delivered(&created.id, "msg_1").unwrap();
        let (status, body) = send(
            &app,
            "PUT",
            &format!("/api/reminders/{}", created.id),
            Some(ADMIN),
            Some(json!({ "content": "new text" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "IMMUTABLE_STATE");
    }

    #[tokio::test]
    async fn delete_then_get_is_404() {
        let (app, h) = app();
        let created = basic_create(&h);
        let (status, _) = send(
            &app,
            "DELETE",
            &format!("/api/reminders/{}", created.id),
            Some(ADMIN),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(
            &app,
            "GET",
            &format!("/api/reminders/{}", created.id),
            None,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_endpoint_runs_and_returns_entry() {
        let (app, h) = app();
        let created = basic_create(&h);
        let (status, body) = send(
            &app,
            "POST",
            &format!("/api/reminders/{}/test", created.id),
            Some(ADMIN),
            Some(json!({ "testType": "immediate_delivery", "preserveSchedule": true })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"], "success");
        assert_eq!(body["preservedSchedule"], true);
        assert_eq!(h.transport.sent_count(), 1);
    }

    #[tokio::test]
    async fn reset_endpoint_restores_pending() {
        let (app, h) = app();
        let created = basic_create(&h);
        h.service.mark_as_delivered(&created.id, "msg_1").unwrap();
        let (status, body) = send(
            &app,
            "POST",
            &format!("/api/reminders/{}/reset", created.id),
            Some(ADMIN),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "pending");
    }

    #[tokio::test]
    async fn responses_endpoint_lists_audit_log() {
        let (app, h) = app();
        let created = basic_create(&h);
        h.service.mark_as_delivered(&created.id, "msg_1").unwrap();
        let (status, body) = send(
            &app,
            "GET",
            &format!("/api/reminders/{}/responses", created.id),
            None,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let responses = body["responses"].as_array().unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["responseType"], "delivered");
    }

    #[tokio::test]
    async fn flush_requires_admin_and_wipes() {
        let (app, h) = app();
        basic_create(&h);
        let (status, _) = send(&app, "DELETE", "/api/reminders/flush", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) =
            send(&app, "DELETE", "/api/reminders/flush", Some(ADMIN), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["removed"], 1);
    }

    // -- Webhook --

    #[tokio::test]
    async fn webhook_answers_ping_with_pong() {
        let (app, _h) = app();
        let (status, body) = send(
            &app,
            "POST",
            "/webhook/interactions",
            None,
            Some(json!({ "type": 1 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["type"], 1);
    }

    #[tokio::test]
    async fn webhook_button_press_acknowledges_reminder() {
        let (app, h) = app();
        let created = basic_create(&h);
        h.service.mark_as_delivered(&created.id, "msg_1").unwrap();

        let (status, body) = send(
            &app,
            "POST",
            "/webhook/interactions",
            None,
            Some(json!({
                "type": 3,
                "data": { "custom_id": format!("acknowledge_reminder_{}", created.id) },
                "member": { "user": { "id": TARGET } },
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["type"], 4);
        assert!(body["data"]["content"].as_str().unwrap().contains("acknowledged"));
        assert_eq!(
            h.service.get(&created.id).unwrap().status,
            Status::Acknowledged
        );
    }

    #[tokio::test]
    async fn webhook_malformed_interaction_is_400() {
        let (app, _h) = app();
        let (status, _) = send(
            &app,
            "POST",
            "/webhook/interactions",
            None,
            Some(json!({ "type": 3, "data": {} })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    // -- Ack links --

    #[tokio::test]
    async fn ack_link_with_valid_token_acknowledges() {
        let (app, h) = app();
        let created = basic_create(&h);
        h.service.mark_as_delivered(&created.id, "msg_1").unwrap();
        h.clock.advance(ChronoDuration::minutes(1));

        let signer = AckTokenSigner::new(b"test-secret".to_vec());
        let token = signer.mint(&created.id, ResponseAction::Acknowledge);
        let (status, _) = send(
            &app,
            "GET",
            &format!("/ack/{}?action=acknowledge&token={token}", created.id),
            None,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            h.service.get(&created.id).unwrap().status,
            Status::Acknowledged
        );
        // Actor on the audit entry is the reminder's recipient.
        let last = h.service.get(&created.id).unwrap().responses.last().cloned().unwrap();
        assert_eq!(last.user_id, TARGET);
    }

    #[tokio::test]
    async fn ack_link_with_bad_token_is_401() {
        let (app, h) = app();
        let created = basic_create(&h);
        h.service.mark_as_delivered(&created.id, "msg_1").unwrap();

        let (status, _) = send(
            &app,
            "GET",
            &format!("/ack/{}?action=acknowledge&token=deadbeef", created.id),
            None,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(h.service.get(&created.id).unwrap().status, Status::Sent);
    }

    #[tokio::test]
    async fn ack_token_for_other_action_is_rejected() {
        let (app, h) = app();
        let created = escalating_create(&h, 5);
        h.service.mark_as_delivered(&created.id, "msg_1").unwrap();

        let signer = AckTokenSigner::new(b"test-secret".to_vec());
        let token = signer.mint(&created.id, ResponseAction::Acknowledge);
        let (status, _) = send(
            &app,
            "GET",
            &format!("/ack/{}?action=decline&token={token}", created.id),
            None,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}
