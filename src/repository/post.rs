use crate::error::Result;
use crate::models::Post;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

/// Repository for post database operations
#[derive(Clone)]
pub struct PostRepository {
    pool: PgPool,
}

impl PostRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a post owned by `user_id`
    pub async fn create(&self, user_id: Uuid, content: &str) -> Result<Post> {
        let post = sqlx::query_as::<_, Post>(
            r#"
            INSERT INTO posts (id, post_content, user_id)
            VALUES ($1, $2, $3)
            RETURNING id, post_content, user_id, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(content)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        info!(id = %post.id, user_id = %user_id, "Created post");
        Ok(post)
    }

    /// Get a post by ID
    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<Post>> {
        let post = sqlx::query_as::<_, Post>(
            "SELECT id, post_content, user_id, created_at FROM posts WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(post)
    }

    /// Update a post's content. `None` if it does not exist or is not owned by `user_id`.
    pub async fn update(&self, id: Uuid, user_id: Uuid, content: &str) -> Result<Option<Post>> {
        let post = sqlx::query_as::<_, Post>(
            r#"
            UPDATE posts SET post_content = $3
            WHERE id = $1 AND user_id = $2
            RETURNING id, post_content, user_id, created_at
            "#,
        )
        .bind(id)
        .bind(user_id)
        .bind(content)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(ref p) = post {
            info!(id = %p.id, "Updated post");
        }

        Ok(post)
    }

    /// Delete a post owned by `user_id`. Returns false if nothing was deleted.
    pub async fn delete(&self, id: Uuid, user_id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM posts WHERE id = $1 AND user_id = $2")
            .bind(id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        let deleted = result.rows_affected() > 0;
        if deleted {
            info!(id = %id, "Deleted post");
        }

        Ok(deleted)
    }

    /// One page of posts, newest first
    pub async fn list(&self, page: u64, page_size: i64) -> Result<Vec<Post>> {
        let offset = page_offset(page, page_size);

        let posts = sqlx::query_as::<_, Post>(
            r#"
            SELECT id, post_content, user_id, created_at
            FROM posts
            ORDER BY created_at DESC, id
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(page_size)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(posts)
    }
}

/// Row offset of a zero-based page, saturating instead of overflowing
fn page_offset(page: u64, page_size: i64) -> i64 {
    i64::try_from(page)
        .unwrap_or(i64::MAX)
        .saturating_mul(page_size.max(0))
}
