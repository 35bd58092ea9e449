//! JSON API for saved connection profiles and settings.
//!
//! | Route                 | Method | Result                                   |
//! |-----------------------|--------|------------------------------------------|
//! | `/api/sessions`       | GET    | all profiles                             |
//! | `/api/sessions`       | POST   | `201` with the saved profile (new id)    |
//! | `/api/sessions/{id}`  | GET    | one profile, `404` if unknown            |
//! | `/api/sessions/{id}`  | PUT    | replaced profile, `404` if unknown       |
//! | `/api/sessions/{id}`  | DELETE | `204`, `404` if unknown                  |
//! | `/api/settings`       | GET    | current settings                         |
//! | `/api/settings`       | PUT    | saved settings, `400` if out of range    |
//!
//! Errors are `{"error": "..."}` bodies. Unsupported methods answer `405`.
//! Store access is file I/O and runs on the blocking pool.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::config::{Settings, SettingsStore};
use crate::constants::{SESSIONS_API_PATH, SETTINGS_API_PATH};
use crate::profiles::{Profile, ProfileNotFound, ProfileStore};

/// Stores backing the API.
#[derive(Debug, Clone)]
pub struct ApiState {
    /// Saved connection profiles.
    pub profiles: Arc<ProfileStore>,
    /// Settings file, also read by the bridge on each connect.
    pub settings: Arc<SettingsStore>,
}

/// Routes for `/api/sessions` and `/api/settings`.
pub fn router(state: ApiState) -> Router {
    let item_path = format!("{SESSIONS_API_PATH}/{{id}}");
    let empty_id_path = format!("{SESSIONS_API_PATH}/");

    Router::new()
        .route(
            SESSIONS_API_PATH,
            get(list_profiles)
                .post(create_profile)
                .put(missing_id)
                .delete(missing_id)
                .fallback(method_not_allowed),
        )
        .route(
            &empty_id_path,
            get(list_profiles)
                .put(missing_id)
                .delete(missing_id)
                .fallback(method_not_allowed),
        )
        .route(
            &item_path,
            get(get_profile)
                .put(update_profile)
                .delete(delete_profile)
                .fallback(method_not_allowed),
        )
        .route(
            SETTINGS_API_PATH,
            get(get_settings)
                .put(put_settings)
                .fallback(method_not_allowed),
        )
        .with_state(state)
}

#[derive(Serialize)]
struct ApiError {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ApiError {
            error: message.into(),
        }),
    )
        .into_response()
}

/// Run a store call on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .context("store task failed")?
}

fn is_not_found(e: &anyhow::Error) -> bool {
    e.downcast_ref::<ProfileNotFound>().is_some()
}

async fn method_not_allowed() -> Response {
    error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
}

async fn missing_id() -> Response {
    error_response(StatusCode::BAD_REQUEST, "session id required")
}

// ============================================================================
// Profiles
// ============================================================================

async fn list_profiles(State(api): State<ApiState>) -> Response {
    let store = Arc::clone(&api.profiles);
    match blocking(move || store.list()).await {
        Ok(profiles) => Json(profiles).into_response(),
        Err(e) => {
            log::error!("[Api] Failed to load sessions: {e:#}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to load sessions")
        }
    }
}

async fn get_profile(State(api): State<ApiState>, Path(id): Path<String>) -> Response {
    let store = Arc::clone(&api.profiles);
    match blocking(move || store.get(&id)).await {
        Ok(profile) => Json(profile).into_response(),
        Err(e) if is_not_found(&e) => error_response(StatusCode::NOT_FOUND, "session not found"),
        Err(e) => {
            log::error!("[Api] Failed to load session: {e:#}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to load sessions")
        }
    }
}

async fn create_profile(State(api): State<ApiState>, body: Bytes) -> Response {
    let Ok(profile) = serde_json::from_slice::<Profile>(&body) else {
        return error_response(StatusCode::BAD_REQUEST, "invalid request body");
    };

    let store = Arc::clone(&api.profiles);
    match blocking(move || store.add(profile)).await {
        Ok(saved) => {
            log::info!("[Api] Saved session {} ({})", saved.id, saved.name);
            (StatusCode::CREATED, Json(saved)).into_response()
        }
        Err(e) => {
            log::error!("[Api] Failed to save session: {e:#}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to save session")
        }
    }
}

async fn update_profile(
    State(api): State<ApiState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    let Ok(profile) = serde_json::from_slice::<Profile>(&body) else {
        return error_response(StatusCode::BAD_REQUEST, "invalid request body");
    };

    let store = Arc::clone(&api.profiles);
    match blocking(move || store.update(&id, profile)).await {
        Ok(saved) => Json(saved).into_response(),
        Err(e) if is_not_found(&e) => error_response(StatusCode::NOT_FOUND, "session not found"),
        Err(e) => {
            log::error!("[Api] Failed to update session: {e:#}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to save session")
        }
    }
}

async fn delete_profile(State(api): State<ApiState>, Path(id): Path<String>) -> Response {
    let store = Arc::clone(&api.profiles);
    match blocking(move || store.remove(&id)).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) if is_not_found(&e) => error_response(StatusCode::NOT_FOUND, "session not found"),
        Err(e) => {
            log::error!("[Api] Failed to delete session: {e:#}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to save session")
        }
    }
}

// ============================================================================
// Settings
// ============================================================================

async fn get_settings(State(api): State<ApiState>) -> Response {
    let store = Arc::clone(&api.settings);
    match blocking(move || store.load()).await {
        Ok(settings) => Json(settings).into_response(),
        Err(e) => {
            log::error!("[Api] Failed to load settings: {e:#}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to load settings")
        }
    }
}

async fn put_settings(State(api): State<ApiState>, body: Bytes) -> Response {
    let Ok(settings) = serde_json::from_slice::<Settings>(&body) else {
        return error_response(StatusCode::BAD_REQUEST, "invalid request body");
    };
    if let Err(e) = settings.validate() {
        return error_response(StatusCode::BAD_REQUEST, e.to_string());
    }

    let store = Arc::clone(&api.settings);
    let to_save = settings.clone();
    match blocking(move || store.save(&to_save)).await {
        Ok(()) => {
            log::info!("[Api] Settings updated");
            Json(settings).into_response()
        }
        Err(e) => {
            log::error!("[Api] Failed to save settings: {e:#}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to save settings")
        }
    }
}
