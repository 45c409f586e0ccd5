//! API Models
//!
//! Request and response bodies of the HTTP surface that are not already core
//! types. All of them derive `utoipa::ToSchema` for the OpenAPI document.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tutor_core::tools::FunctionDeclaration;
use utoipa::ToSchema;

#[derive(Deserialize, ToSchema, Debug, Default)]
pub struct CallToolPayload {
    /// Tool arguments by parameter name.
    #[serde(default)]
    #[schema(value_type = Object, example = json!({ "user_id": "u1", "name": "Taro" }))]
    pub arguments: Option<Map<String, Value>>,
}

#[derive(Serialize, Deserialize, ToSchema, Debug)]
pub struct ToolCallResponse {
    pub name: String,
    /// The tool's JSON result, or its raw text if it is not JSON.
    #[schema(value_type = Object)]
    pub result: Value,
}

#[derive(Serialize, Deserialize, ToSchema, Debug)]
pub struct ToolsResponse {
    pub tools: Vec<FunctionDeclaration>,
}

#[derive(Serialize, Deserialize, ToSchema, Debug)]
pub struct ErrorResponse {
    pub message: String,
}
