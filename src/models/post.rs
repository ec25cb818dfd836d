use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A stored post
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Post {
    pub id: Uuid,
    pub post_content: String,
    pub user_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Create/update body
#[derive(Debug, Clone, Deserialize)]
pub struct UpsertPostRequest {
    pub post_content: String,
}

/// Returned after creating a post
#[derive(Debug, Clone, Serialize)]
pub struct PostResponse {
    pub id: Uuid,
    pub post_content: String,
}

impl From<&Post> for PostResponse {
    fn from(post: &Post) -> Self {
        Self {
            id: post.id,
            post_content: post.post_content.clone(),
        }
    }
}

/// Plain acknowledgement for update/delete
#[derive(Debug, Clone, Serialize)]
pub struct PostUpdateResponse {
    pub message: String,
}

/// Payload broadcast when a post is deleted
#[derive(Debug, Clone, Serialize)]
pub struct DeletedPost {
    pub id: Uuid,
    pub user_id: Uuid,
}

/// Query parameters for listing posts
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PostListParams {
    /// Zero-based page number
    pub page: Option<u64>,
}
