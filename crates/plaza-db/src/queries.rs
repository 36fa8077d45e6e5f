use crate::models::{CommentRow, LikeRow, PostRow, UserRow};
use crate::Database;
use anyhow::Result;
use rusqlite::Connection;

impl Database {
    // -- Users --

    /// Insert a new unverified account. Returns `Ok(false)` when the email is
    /// already taken (UNIQUE violation) so concurrent duplicate registrations
    /// surface as a conflict instead of a 500.
    pub fn create_user(
        &self,
        id: &str,
        name: &str,
        email: &str,
        password_hash: &str,
        verify_token: &str,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let res = conn.execute(
                "INSERT INTO users (id, name, email, password, verify_token, verified)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0)",
                rusqlite::params![id, name, email, password_hash, verify_token],
            );
            match res {
                Ok(_) => Ok(true),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Ok(false)
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "email", email))
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id", id))
    }

    /// Consume a verification token. This is a single conditional UPDATE so
    /// that two concurrent calls with the same token yield exactly one
    /// success — the affected-row count decides, never a read-then-write.
    pub fn mark_verified(&self, token: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let affected = conn.execute(
                "UPDATE users SET verified = 1, verify_token = NULL WHERE verify_token = ?1",
                [token],
            )?;
            Ok(affected == 1)
        })
    }

    // -- Posts --

    pub fn insert_post(&self, id: &str, author_id: &str, content: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO posts (id, author_id, content) VALUES (?1, ?2, ?3)",
                rusqlite::params![id, author_id, content],
            )?;
            Ok(())
        })
    }

    pub fn post_exists(&self, id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM posts WHERE id = ?1",
                [id],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    pub fn get_posts(&self, limit: u32, before: Option<(&str, &str)>) -> Result<Vec<PostRow>> {
        self.with_conn(|conn| query_posts(conn, limit, before))
    }

    // -- Likes --

    /// Toggle a like: removes if present, inserts if not.
    /// Returns true when the post is liked after the call.
    pub fn toggle_like(&self, id: &str, post_id: &str, user_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let existing: Option<String> = conn
                .query_row(
                    "SELECT id FROM likes WHERE post_id = ?1 AND user_id = ?2",
                    rusqlite::params![post_id, user_id],
                    |row| row.get(0),
                )
                .optional()?;

            if let Some(existing_id) = existing {
                conn.execute("DELETE FROM likes WHERE id = ?1", [&existing_id])?;
                Ok(false)
            } else {
                conn.execute(
                    "INSERT INTO likes (id, post_id, user_id) VALUES (?1, ?2, ?3)",
                    rusqlite::params![id, post_id, user_id],
                )?;
                Ok(true)
            }
        })
    }

    /// Batch-fetch likes for a set of post IDs.
    pub fn get_likes_for_posts(&self, post_ids: &[String]) -> Result<Vec<LikeRow>> {
        if post_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let placeholders: Vec<String> =
                (1..=post_ids.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT post_id, user_id FROM likes WHERE post_id IN ({})",
                placeholders.join(", ")
            );

            let mut stmt = conn.prepare(&sql)?;
            let params: Vec<&dyn rusqlite::types::ToSql> = post_ids
                .iter()
                .map(|id| id as &dyn rusqlite::types::ToSql)
                .collect();

            let rows = stmt
                .query_map(params.as_slice(), |row| {
                    Ok(LikeRow {
                        post_id: row.get(0)?,
                        user_id: row.get(1)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    // -- Comments --

    pub fn insert_comment(
        &self,
        id: &str,
        post_id: &str,
        author_id: &str,
        content: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO comments (id, post_id, author_id, content) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![id, post_id, author_id, content],
            )?;
            Ok(())
        })
    }

    /// Batch-fetch comments for a set of post IDs, author name joined in.
    pub fn get_comments_for_posts(&self, post_ids: &[String]) -> Result<Vec<CommentRow>> {
        if post_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let placeholders: Vec<String> =
                (1..=post_ids.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT c.id, c.post_id, c.author_id, u.name, c.content, c.created_at
                 FROM comments c
                 LEFT JOIN users u ON c.author_id = u.id
                 WHERE c.post_id IN ({})
                 ORDER BY c.created_at ASC",
                placeholders.join(", ")
            );

            let mut stmt = conn.prepare(&sql)?;
            let params: Vec<&dyn rusqlite::types::ToSql> = post_ids
                .iter()
                .map(|id| id as &dyn rusqlite::types::ToSql)
                .collect();

            let rows = stmt
                .query_map(params.as_slice(), |row| {
                    Ok(CommentRow {
                        id: row.get(0)?,
                        post_id: row.get(1)?,
                        author_id: row.get(2)?,
                        author_name: row
                            .get::<_, Option<String>>(3)?
                            .unwrap_or_else(|| "unknown".to_string()),
                        content: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }
}

fn query_user(conn: &Connection, column: &str, value: &str) -> Result<Option<UserRow>> {
    // column is a compile-time constant ("email" or "id"), never user input
    let sql = format!(
        "SELECT id, name, email, password, verify_token, verified, created_at
         FROM users WHERE {} = ?1",
        column
    );
    let mut stmt = conn.prepare(&sql)?;

    let row = stmt
        .query_row([value], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                name: row.get(1)?,
                email: row.get(2)?,
                password: row.get(3)?,
                verify_token: row.get(4)?,
                verified: row.get(5)?,
                created_at: row.get(6)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn query_posts(
    conn: &Connection,
    limit: u32,
    before: Option<(&str, &str)>,
) -> Result<Vec<PostRow>> {
    // JOIN users to fetch author_name in a single query (eliminates N+1).
    // Cursor pagination: `before` is the (created_at, id) of the oldest post
    // from the previous page. created_at has second resolution, so the id
    // breaks ties — posts sharing the cursor's second are not skipped.
    let map_row = |row: &rusqlite::Row<'_>| {
        Ok(PostRow {
            id: row.get(0)?,
            author_id: row.get(1)?,
            author_name: row
                .get::<_, Option<String>>(2)?
                .unwrap_or_else(|| "unknown".to_string()),
            content: row.get(3)?,
            created_at: row.get(4)?,
        })
    };

    let rows = match before {
        Some((cursor_ts, cursor_id)) => {
            let mut stmt = conn.prepare(
                "SELECT p.id, p.author_id, u.name, p.content, p.created_at
                 FROM posts p
                 LEFT JOIN users u ON p.author_id = u.id
                 WHERE p.created_at < ?1
                    OR (p.created_at = ?1 AND p.id < ?2)
                 ORDER BY p.created_at DESC, p.id DESC
                 LIMIT ?3",
            )?;
            stmt.query_map(rusqlite::params![cursor_ts, cursor_id, limit], map_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?
        }
        None => {
            let mut stmt = conn.prepare(
                "SELECT p.id, p.author_id, u.name, p.content, p.created_at
                 FROM posts p
                 LEFT JOIN users u ON p.author_id = u.id
                 ORDER BY p.created_at DESC, p.id DESC
                 LIMIT ?1",
            )?;
            stmt.query_map(rusqlite::params![limit], map_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?
        }
    };

    Ok(rows)
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
