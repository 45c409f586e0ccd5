//! Axum Router Configuration
//!
//! This module defines the complete HTTP routing for the application,
//! including the REST API and OpenAPI documentation.

use crate::{
    handlers,
    models::{CallToolPayload, ErrorResponse, ToolCallResponse, ToolsResponse},
    state::AppState,
};

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tutor_core::{
    models::{MathQuestion, UserData, UserProfile},
    prompt::{Part, SystemInstruction},
    session::{
        LiveConnectConfig, Modality, PrebuiltVoiceConfig, SpeechConfig, Tool, VoiceConfig,
    },
    tools::FunctionDeclaration,
};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::get_live_config,
        handlers::get_user,
        handlers::list_tools,
        handlers::call_tool,
    ),
    components(
        schemas(
            LiveConnectConfig, Modality, SpeechConfig, VoiceConfig, PrebuiltVoiceConfig, Tool,
            SystemInstruction, Part, FunctionDeclaration, UserData, UserProfile, MathQuestion,
            CallToolPayload, ToolCallResponse, ToolsResponse, ErrorResponse
        )
    ),
    tags(
        (name = "Tutor API", description = "Live session configuration and tool execution for the math tutor")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    // Group all routes that require AppState into their own router.
    let api_router = Router::new()
        .route("/users/{user_id}", get(handlers::get_user))
        .route("/users/{user_id}/live-config", get(handlers::get_live_config))
        .route("/tools", get(handlers::list_tools))
        .route("/tools/{name}", post(handlers::call_tool))
        // Apply the state ONLY to this group of routes.
        .with_state(app_state);

    // Create the final router that merges the stateful routes
    // with the stateless routes (like Swagger UI).
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_router)
}
