//! Axum Handlers for the REST API
//!
//! This module contains the logic for handling HTTP requests from the caller
//! that opens live sessions. It uses `utoipa` doc comments to generate OpenAPI
//! documentation.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use rmcp::{
    model::{CallToolRequestParam, ErrorCode},
    service::ServiceError,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info, warn};
use tutor_core::{models::UserData, session::LiveConnectConfig, store::check_document_id};

use crate::{
    models::{CallToolPayload, ErrorResponse, ToolCallResponse, ToolsResponse},
    state::AppState,
};

pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Unprocessable(String),
    InternalServerError(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(ErrorResponse { message })).into_response()
            }
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, Json(ErrorResponse { message })).into_response()
            }
            ApiError::Unprocessable(message) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(ErrorResponse { message }),
            )
                .into_response(),
            ApiError::InternalServerError(err) => {
                error!("Internal Server Error: {:?}", err);
                let message = "An internal server error occurred.".to_string();
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse { message }),
                )
                    .into_response()
            }
        }
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::InternalServerError(err.into())
    }
}

fn validate_user_id(user_id: &str) -> Result<(), ApiError> {
    check_document_id(user_id).map_err(|reason| {
        ApiError::BadRequest(format!("'{}' is not a valid user id: {}", user_id, reason))
    })
}

/// Build the live session configuration for a learner.
#[utoipa::path(
    get,
    path = "/users/{user_id}/live-config",
    responses(
        (status = 200, description = "Session configuration for the external live API", body = LiveConnectConfig),
        (status = 400, description = "Invalid user id", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("user_id" = String, Path, description = "The learner's id")
    )
)]
pub async fn get_live_config(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<LiveConnectConfig>, ApiError> {
    validate_user_id(&user_id)?;
    let instruction = state.assembler.assemble(&user_id).await?;
    info!(%user_id, parts = instruction.parts.len(), "Live config assembled");
    Ok(Json(state.sessions.build(instruction)))
}

/// Get a learner's profile and recent practice questions.
#[utoipa::path(
    get,
    path = "/users/{user_id}",
    responses(
        (status = 200, description = "Learner found", body = UserData),
        (status = 400, description = "Invalid user id", body = ErrorResponse),
        (status = 404, description = "Learner not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("user_id" = String, Path, description = "The learner's id")
    )
)]
pub async fn get_user(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<UserData>, ApiError> {
    validate_user_id(&user_id)?;
    state
        .repository
        .get_user_data(&user_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("User {} not found", user_id)))
}

/// List the tools declared to the live session.
#[utoipa::path(
    get,
    path = "/tools",
    responses(
        (status = 200, description = "Function declarations", body = ToolsResponse)
    )
)]
pub async fn list_tools(State(state): State<Arc<AppState>>) -> Json<ToolsResponse> {
    Json(ToolsResponse {
        tools: state.sessions.declarations().to_vec(),
    })
}

/// Execute a tool call forwarded from the live session.
#[utoipa::path(
    post,
    path = "/tools/{name}",
    request_body = CallToolPayload,
    responses(
        (status = 200, description = "Tool executed", body = ToolCallResponse),
        (status = 400, description = "Arguments do not match the tool's parameters", body = ErrorResponse),
        (status = 404, description = "Unknown tool", body = ErrorResponse),
        (status = 422, description = "Tool rejected the call", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("name" = String, Path, description = "Tool name")
    )
)]
pub async fn call_tool(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(payload): Json<CallToolPayload>,
) -> Result<Json<ToolCallResponse>, ApiError> {
    if !state.sessions.declarations().iter().any(|d| d.name == name) {
        return Err(ApiError::NotFound(format!("Tool '{}' not found", name)));
    }

    let result = state
        .tools
        .peer()
        .call_tool(CallToolRequestParam {
            name: name.clone().into(),
            arguments: payload.arguments,
        })
        .await
        .map_err(|e| match e {
            ServiceError::McpError(data) if data.code == ErrorCode::INVALID_PARAMS => {
                warn!(tool = %name, message = %data.message, "Invalid tool arguments");
                ApiError::BadRequest(data.message.to_string())
            }
            other => ApiError::InternalServerError(anyhow::anyhow!("Tool '{}' failed: {}", name, other)),
        })?;

    let is_error = result.is_error == Some(true);
    // Only text blocks carry tool output.
    let wire = serde_json::to_value(&result)?;
    let text = wire
        .get("content")
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|block| block.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default();

    if is_error {
        return Err(ApiError::Unprocessable(text));
    }

    let result = serde_json::from_str(&text).unwrap_or(Value::String(text));
    Ok(Json(ToolCallResponse { name, result }))
}
