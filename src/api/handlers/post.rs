//! Post handlers
//!
//! Every successful write is announced on the hub after it is stored. The
//! broadcast is fire-and-forget and never changes the HTTP response.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::middleware::AuthenticatedUser;
use crate::api::server::AppState;
use crate::api::websocket::CONNECTION_ID_HEADER;
use crate::error::{AppError, Result};
use crate::hub::{ConnectionId, EventKind, Message};
use crate::models::{
    DeletedPost, PostListParams, PostResponse, PostUpdateResponse, UpsertPostRequest,
};
use crate::repository::PostRepository;

/// Connection of the client that made the request, if it sent one
fn origin_connection(headers: &HeaderMap) -> Option<ConnectionId> {
    let value = headers.get(CONNECTION_ID_HEADER)?.to_str().ok()?;

    match value.trim().parse() {
        Ok(id) => Some(id),
        Err(_) => {
            debug!("Ignoring malformed {} header", CONNECTION_ID_HEADER);
            None
        }
    }
}

fn post_content(req: &UpsertPostRequest) -> Result<&str> {
    let content = req.post_content.trim();
    if content.is_empty() {
        return Err(AppError::InvalidRequest(
            "post_content is required".to_string(),
        ));
    }
    Ok(content)
}

async fn announce<T: Serialize>(
    state: &AppState,
    kind: EventKind,
    payload: &T,
    exclude: Option<ConnectionId>,
) {
    match Message::from_payload(kind, payload) {
        Ok(message) => state.hub.broadcast(message, exclude).await,
        Err(e) => warn!(kind = %kind, "Failed to encode hub message: {}", e),
    }
}

/// List a page of posts, newest first
pub async fn list_posts(
    _user: AuthenticatedUser,
    State(state): State<AppState>,
    Query(params): Query<PostListParams>,
) -> Result<impl IntoResponse> {
    let repo = PostRepository::new(state.db.pool().clone());

    let posts = repo
        .list(params.page.unwrap_or(0), state.config.posts.page_size)
        .await?;

    Ok(Json(posts))
}

/// Get a single post
pub async fn get_post(
    _user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let repo = PostRepository::new(state.db.pool().clone());

    match repo.get_by_id(id).await? {
        Some(post) => Ok(Json(post)),
        None => Err(AppError::NotFound(format!("Post with id {} not found", id))),
    }
}

/// Create a post for the caller
pub async fn create_post(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<UpsertPostRequest>,
) -> Result<impl IntoResponse> {
    let content = post_content(&req)?;
    let repo = PostRepository::new(state.db.pool().clone());

    let post = repo.create(user.user_id, content).await?;

    announce(
        &state,
        EventKind::PostCreated,
        &post,
        origin_connection(&headers),
    )
    .await;

    Ok((StatusCode::CREATED, Json(PostResponse::from(&post))))
}

/// Update one of the caller's posts
pub async fn update_post(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(req): Json<UpsertPostRequest>,
) -> Result<impl IntoResponse> {
    let content = post_content(&req)?;
    let repo = PostRepository::new(state.db.pool().clone());

    let post = repo
        .update(id, user.user_id, content)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Post with id {} not found", id)))?;

    info!(id = %post.id, user_id = %user.user_id, "Updated post");

    announce(
        &state,
        EventKind::PostUpdated,
        &post,
        origin_connection(&headers),
    )
    .await;

    Ok(Json(PostUpdateResponse {
        message: "Post updated".to_string(),
    }))
}

/// Delete one of the caller's posts
pub async fn delete_post(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    let repo = PostRepository::new(state.db.pool().clone());

    if !repo.delete(id, user.user_id).await? {
        return Err(AppError::NotFound(format!("Post with id {} not found", id)));
    }

    announce(
        &state,
        EventKind::PostDeleted,
        &DeletedPost {
            id,
            user_id: user.user_id,
        },
        origin_connection(&headers),
    )
    .await;

    Ok(Json(PostUpdateResponse {
        message: "Post deleted".to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_origin_connection_header() {
        let id = ConnectionId::generate();
        let mut headers = HeaderMap::new();
        assert!(origin_connection(&headers).is_none());

        headers.insert(
            CONNECTION_ID_HEADER,
            HeaderValue::from_str(&id.to_string()).unwrap(),
        );
        assert_eq!(origin_connection(&headers), Some(id));

        headers.insert(CONNECTION_ID_HEADER, HeaderValue::from_static("not-a-uuid"));
        assert!(origin_connection(&headers).is_none());
    }

    #[test]
    fn test_post_content_is_trimmed_and_required() {
        let ok = UpsertPostRequest {
            post_content: "  hello  ".to_string(),
        };
        assert_eq!(post_content(&ok).unwrap(), "hello");

        let blank = UpsertPostRequest {
            post_content: " \n".to_string(),
        };
        assert!(matches!(
            post_content(&blank),
            Err(AppError::InvalidRequest(_))
        ));
    }
}
