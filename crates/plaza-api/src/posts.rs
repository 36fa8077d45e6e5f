use std::collections::HashMap;

use anyhow::anyhow;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use serde::Deserialize;
use uuid::Uuid;

use plaza_types::api::{
    Claims, CommentResponse, CreateCommentRequest, CreatePostRequest, PostResponse,
};

use crate::auth::AppState;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct PostQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Cursor-based pagination — pass the `created_at` and id of the oldest
    /// post from the previous page to fetch older posts. Both fields travel
    /// together; the id breaks ties between posts created in the same second.
    pub before: Option<String>,
    pub before_id: Option<String>,
}

fn default_limit() -> u32 {
    50
}

pub async fn create_post(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreatePostRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let content = req.content.trim().to_string();
    if content.is_empty() {
        return Err(ApiError::Validation("post content must not be empty"));
    }

    let post_id = Uuid::new_v4();

    // Run blocking DB insert off the async runtime
    let db = state.clone();
    let pid = post_id.to_string();
    let aid = claims.sub.to_string();
    let body = content.clone();
    tokio::task::spawn_blocking(move || db.db.insert_post(&pid, &aid, &body))
        .await
        .map_err(|e| ApiError::Dependency(anyhow!("spawn_blocking join error: {}", e)))??;

    Ok((
        StatusCode::CREATED,
        Json(PostResponse {
            id: post_id,
            author_id: claims.sub,
            author_name: claims.name.clone(),
            content,
            created_at: chrono::Utc::now(),
            like_count: 0,
            liked_by_me: false,
            comments: vec![],
        }),
    ))
}

pub async fn get_posts(
    State(state): State<AppState>,
    Query(query): Query<PostQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.clone();
    let limit = query.limit.min(200);
    let cursor = match (query.before, query.before_id) {
        (Some(ts), Some(id)) => Some((ts, id)),
        (None, None) => None,
        _ => {
            return Err(ApiError::Validation(
                "before and before_id must be passed together",
            ))
        }
    };

    // One page plus batch-fetched likes and comments (no N+1)
    let (rows, like_rows, comment_rows) = tokio::task::spawn_blocking(move || {
        let rows = db
            .db
            .get_posts(limit, cursor.as_ref().map(|(ts, id)| (ts.as_str(), id.as_str())))?;
        let post_ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
        let like_rows = db.db.get_likes_for_posts(&post_ids)?;
        let comment_rows = db.db.get_comments_for_posts(&post_ids)?;
        Ok::<_, anyhow::Error>((rows, like_rows, comment_rows))
    })
    .await
    .map_err(|e| ApiError::Dependency(anyhow!("spawn_blocking join error: {}", e)))?
    .map_err(ApiError::Dependency)?;

    // Group likes and comments by post id (cheap in-memory work)
    let caller = claims.sub.to_string();
    let mut likes_by_post: HashMap<String, Vec<String>> = HashMap::new();
    for like in &like_rows {
        likes_by_post
            .entry(like.post_id.clone())
            .or_default()
            .push(like.user_id.clone());
    }

    let mut comments_by_post: HashMap<String, Vec<CommentResponse>> = HashMap::new();
    for c in comment_rows {
        let comment = CommentResponse {
            id: parse_uuid(&c.id, "comment id")?,
            post_id: parse_uuid(&c.post_id, "comment post_id")?,
            author_id: parse_uuid(&c.author_id, "comment author_id")?,
            author_name: c.author_name,
            content: c.content,
            created_at: parse_sqlite_timestamp(&c.created_at, "comment")?,
        };
        comments_by_post
            .entry(c.post_id.clone())
            .or_default()
            .push(comment);
    }

    let mut posts = Vec::with_capacity(rows.len());
    for row in rows {
        let likers = likes_by_post.remove(&row.id).unwrap_or_default();
        posts.push(PostResponse {
            id: parse_uuid(&row.id, "post id")?,
            author_id: parse_uuid(&row.author_id, "post author_id")?,
            author_name: row.author_name,
            content: row.content,
            created_at: parse_sqlite_timestamp(&row.created_at, "post")?,
            like_count: likers.len(),
            liked_by_me: likers.iter().any(|u| u == &caller),
            comments: comments_by_post.remove(&row.id).unwrap_or_default(),
        });
    }

    Ok(Json(posts))
}

pub async fn toggle_like(
    State(state): State<AppState>,
    Path(post_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.clone();
    let like_id = Uuid::new_v4().to_string();
    let pid = post_id.to_string();
    let uid = claims.sub.to_string();

    let liked = tokio::task::spawn_blocking(move || {
        if !db.db.post_exists(&pid)? {
            return Err(ApiError::PostNotFound);
        }
        Ok(db.db.toggle_like(&like_id, &pid, &uid)?)
    })
    .await
    .map_err(|e| ApiError::Dependency(anyhow!("spawn_blocking join error: {}", e)))??;

    Ok(Json(serde_json::json!({ "liked": liked })))
}

pub async fn create_comment(
    State(state): State<AppState>,
    Path(post_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateCommentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let content = req.content.trim().to_string();
    if content.is_empty() {
        return Err(ApiError::Validation("comment content must not be empty"));
    }

    let comment_id = Uuid::new_v4();

    let db = state.clone();
    let cid = comment_id.to_string();
    let pid = post_id.to_string();
    let aid = claims.sub.to_string();
    let body = content.clone();
    tokio::task::spawn_blocking(move || {
        if !db.db.post_exists(&pid)? {
            return Err(ApiError::PostNotFound);
        }
        db.db.insert_comment(&cid, &pid, &aid, &body)?;
        Ok(())
    })
    .await
    .map_err(|e| ApiError::Dependency(anyhow!("spawn_blocking join error: {}", e)))??;

    Ok((
        StatusCode::CREATED,
        Json(CommentResponse {
            id: comment_id,
            post_id,
            author_id: claims.sub,
            author_name: claims.name.clone(),
            content,
            created_at: chrono::Utc::now(),
        }),
    ))
}

// Corrupt ids or timestamps in the store are store damage, not user error:
// they surface as a dependency failure rather than leaking nil values to
// clients.

fn parse_uuid(raw: &str, context: &str) -> Result<Uuid, ApiError> {
    raw.parse()
        .map_err(|e| ApiError::Dependency(anyhow!("corrupt {} '{}': {}", context, raw, e)))
}

fn parse_sqlite_timestamp(raw: &str, context: &str) -> Result<chrono::DateTime<chrono::Utc>, ApiError> {
    raw.parse::<chrono::DateTime<chrono::Utc>>()
        .or_else(|_| {
            // SQLite stores timestamps as "YYYY-MM-DD HH:MM:SS" without
            // timezone. Parse as naive UTC and convert.
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .map_err(|e| {
            ApiError::Dependency(anyhow!("corrupt {} created_at '{}': {}", context, raw, e))
        })
}

#[cfg(test)]
mod tests {
    use super::{parse_sqlite_timestamp, parse_uuid};
    use crate::error::ApiError;
    use chrono::{Datelike, Timelike};
    use uuid::Uuid;

    #[test]
    fn parses_sqlite_datetime_format() {
        let ts = parse_sqlite_timestamp("2026-08-28 12:30:45", "test").unwrap();
        assert_eq!(ts.year(), 2026);
        assert_eq!(ts.hour(), 12);
    }

    #[test]
    fn parses_rfc3339() {
        let ts = parse_sqlite_timestamp("2026-08-28T12:30:45Z", "test").unwrap();
        assert_eq!(ts.minute(), 30);
    }

    #[test]
    fn corrupt_timestamp_is_a_dependency_failure() {
        assert!(matches!(
            parse_sqlite_timestamp("yesterday-ish", "test"),
            Err(ApiError::Dependency(_))
        ));
    }

    #[test]
    fn corrupt_id_is_a_dependency_failure() {
        parse_uuid(&Uuid::new_v4().to_string(), "test").unwrap();
        assert!(matches!(
            parse_uuid("not-a-uuid", "test"),
            Err(ApiError::Dependency(_))
        ));
    }

    #[test]
    fn like_toggle_body_shape() {
        let body = serde_json::json!({ "liked": true });
        assert_eq!(body.to_string(), r#"{"liked":true}"#);
    }
}
