use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use crate::app::AppState;
use crate::http::types::{
    ApiError, AuthContext, HealthResponse, ListMessagesQuery, MessageResponse, ModemHealthStatus,
    QueueStatus, SendMessageRequest
};
use crate::queue::QUEUE_SMS_SEND;
use crate::sms::types::{Direction, MessageFilter, MessageStatus, OutgoingRequest};
use crate::sms::SubmitError;

pub async fn send_message(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    payload: Result<Json<SendMessageRequest>, JsonRejection>
) -> Result<impl IntoResponse, ApiError> {
    // Missing or malformed fields are the caller's problem, not a 422.
    let Json(payload) = payload.map_err(|e| ApiError::Validation(e.body_text()))?;

    // Accepting a message the modem cannot take right now only builds up a
    // stale backlog; tell the caller instead.
    if state.modem.breaker().is_open() || !state.health.is_healthy() {
        return Err(ApiError::ModemUnavailable);
    }

    let request = OutgoingRequest {
        phone_number: payload.phone,
        content: payload.content,
        api_key_id: auth.api_key_id
    };

    let message = state.sms_manager.create_outgoing(request).await
        .map_err(|e| match e {
            SubmitError::Validation(validation) => ApiError::Validation(validation.to_string()),
            SubmitError::Store(store) => ApiError::Internal(store)
        })?;

    Ok((StatusCode::CREATED, Json(MessageResponse::from(message))))
}

pub async fn list_messages(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<ListMessagesQuery>
) -> Result<Json<Vec<MessageResponse>>, ApiError> {
    let direction = query.direction.as_deref()
        .map(Direction::try_from)
        .transpose()
        .map_err(|e| ApiError::Validation(e.to_string()))?;

    let status = query.status.as_deref()
        .map(MessageStatus::try_from)
        .transpose()
        .map_err(|e| ApiError::Validation(e.to_string()))?;

    let filter = MessageFilter {
        direction,
        status,
        phone_number: query.phone,
        limit: query.limit.unwrap_or(0),
        offset: query.offset.unwrap_or(0)
    };

    let messages = state.sms_manager.list_messages(&auth.api_key_id, filter).await?;
    Ok(Json(messages.into_iter().map(MessageResponse::from).collect()))
}

pub async fn get_message(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(message_id): Path<String>
) -> Result<Json<MessageResponse>, ApiError> {
    let message = state.sms_manager
        .get_message_for_key(&message_id, &auth.api_key_id)
        .await?
        .ok_or(ApiError::NotFound)?;

    Ok(Json(MessageResponse::from(message)))
}

/// Public liveness surface; no key required.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let database_ok = state.sms_manager.borrow_database().ping().await.is_ok();
    let modem_healthy = state.health.is_healthy() && !state.modem.breaker().is_open();

    let pending = state.queue.pending_count(QUEUE_SMS_SEND).await.unwrap_or(-1);
    let response = HealthResponse {
        status: if database_ok && modem_healthy { "healthy" } else { "degraded" },
        database: if database_ok { "ok" } else { "error" },
        modem: ModemHealthStatus {
            healthy: modem_healthy,
            last_known: state.health.snapshot()
        },
        queue: QueueStatus {
            paused: state.queue.is_paused(),
            pending
        }
    };

    let status = if database_ok && modem_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(response))
}
