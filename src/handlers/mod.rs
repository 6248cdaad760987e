pub mod alerts;
pub mod analytics;
pub mod devices;
pub mod health;
pub mod readings;
pub mod reports;
pub mod ws;

use axum::Json;
use serde::Serialize;
use serde_json::{Value, json};

use crate::models::Pagination;

/// Success envelope: `{success, data}`.
pub fn ok<T: Serialize>(data: T) -> Json<Value> {
    Json(json!({ "success": true, "data": data }))
}

/// Success envelope for list endpoints: `{success, data, pagination}`.
pub fn ok_page<T: Serialize>(data: T, pagination: Pagination) -> Json<Value> {
    Json(json!({ "success": true, "data": data, "pagination": pagination }))
}

/// Success envelope with a human-readable message instead of a payload.
pub fn ok_message(message: impl Into<String>) -> Json<Value> {
    Json(json!({ "success": true, "message": message.into() }))
}
