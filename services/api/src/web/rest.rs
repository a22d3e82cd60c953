//! services/api/src/web/rest.rs
//!
//! Contains the Axum handlers for the REST API endpoints and the master
//! definition for the OpenAPI specification.

use crate::web::auth::{AuthResponse, LoginRequest, SignupRequest};
use crate::web::protocol::{BookmarkPayload, CreateBookmarkRequest};
use crate::web::state::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    Extension,
};
use bookmark_sync_core::{NewBookmark, PortError, User};
use std::sync::Arc;
use tracing::{error, info};
use utoipa::OpenApi;
use uuid::Uuid;

//=========================================================================================
// OpenAPI Master Definition
//=========================================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        list_bookmarks_handler,
        create_bookmark_handler,
        delete_bookmark_handler,
        crate::web::auth::signup_handler,
        crate::web::auth::login_handler,
        crate::web::auth::logout_handler,
        crate::web::auth::me_handler,
    ),
    components(
        schemas(BookmarkPayload, CreateBookmarkRequest, SignupRequest, LoginRequest, AuthResponse)
    ),
    tags(
        (name = "Bookmarks API", description = "Personal bookmarks with live sync over /ws.")
    )
)]
pub struct ApiDoc;

fn store_error(action: &str, e: PortError) -> (StatusCode, String) {
    match e {
        PortError::Rejected(msg) => (StatusCode::BAD_REQUEST, msg),
        PortError::Unauthorized => (StatusCode::FORBIDDEN, "Forbidden".to_string()),
        PortError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
        PortError::Unexpected(_) => {
            error!("Failed to {}: {:?}", action, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to {}", action),
            )
        }
    }
}

//=========================================================================================
// REST API Handlers
//=========================================================================================

/// List the signed-in user's bookmarks, newest first.
#[utoipa::path(
    get,
    path = "/bookmarks",
    responses(
        (status = 200, description = "The user's bookmarks", body = [BookmarkPayload]),
        (status = 401, description = "Not signed in"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn list_bookmarks_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
) -> Result<Json<Vec<BookmarkPayload>>, (StatusCode, String)> {
    let snapshot = app_state
        .store
        .list_bookmarks(user.user_id)
        .await
        .map_err(|e| store_error("list bookmarks", e))?;
    Ok(Json(snapshot.bookmarks.iter().map(BookmarkPayload::from).collect()))
}

/// Create a bookmark for the signed-in user.
#[utoipa::path(
    post,
    path = "/bookmarks",
    request_body = CreateBookmarkRequest,
    responses(
        (status = 201, description = "Bookmark created", body = BookmarkPayload),
        (status = 400, description = "Invalid url or title"),
        (status = 401, description = "Not signed in"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn create_bookmark_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    Json(req): Json<CreateBookmarkRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let new = NewBookmark::new(&req.url, &req.title, user.user_id)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    let bookmark = app_state
        .store
        .insert_bookmark(new)
        .await
        .map_err(|e| store_error("add bookmark", e))?;
    info!("User {} added bookmark {}", user.user_id, bookmark.id);

    Ok((StatusCode::CREATED, Json(BookmarkPayload::from(&bookmark))))
}

/// Delete one of the signed-in user's bookmarks.
#[utoipa::path(
    delete,
    path = "/bookmarks/{id}",
    params(
        ("id" = Uuid, Path, description = "The bookmark to delete.")
    ),
    responses(
        (status = 204, description = "Deleted (or already gone)"),
        (status = 401, description = "Not signed in"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn delete_bookmark_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, (StatusCode, String)> {
    app_state
        .store
        .delete_bookmark(user.user_id, id)
        .await
        .map_err(|e| store_error("delete bookmark", e))?;
    Ok(StatusCode::NO_CONTENT)
}
