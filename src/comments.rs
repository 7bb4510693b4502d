//! Comments and flag-based moderation.
use anyhow::Context as _;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    db::{new_id, Db},
    metrics::{COMMENTS_CREATED, COMMENTS_FLAGGED},
    status::CommentStatus,
    Error, Result,
};

/// Longest accepted comment body, in characters.
pub const MAX_BODY_CHARS: usize = 2000;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Comment {
    pub id: String,
    pub story_id: String,
    pub user_id: String,
    pub author_name: String,
    pub body: String,
    pub status: CommentStatus,
    pub flags_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const COMMENT_SELECT: &str = r#"
    SELECT c.id, c.story_id, c.user_id, p.display_name AS author_name, c.body, c.status,
           c.flags_count, c.created_at, c.updated_at
    FROM comments c
    JOIN profiles p ON p.id = c.user_id
"#;

/// Outcome of a flag.
#[derive(Debug, Clone, Serialize)]
pub struct FlagOutcome {
    pub flags_count: i64,
    pub status: CommentStatus,
    /// Whether this flag moved the comment into the flagged queue.
    pub escalated: bool,
}

/// Explicit moderator actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModerationAction {
    Approve,
    Hide,
    BanUser,
}

pub async fn find(db: &Db, id: &str) -> anyhow::Result<Option<Comment>> {
    sqlx::query_as::<_, Comment>(&format!("{COMMENT_SELECT} WHERE c.id = ?"))
        .bind(id)
        .fetch_optional(db)
        .await
        .context("failed to fetch comment")
}

pub async fn get(db: &Db, id: &str) -> Result<Comment> {
    find(db, id)
        .await?
        .ok_or_else(|| Error::not_found("comment not found"))
}

/// Submit a comment on a published story. New comments wait in the `pending` queue.
pub async fn create(db: &Db, story_id: &str, user_id: &str, body: &str) -> Result<Comment> {
    let body = body.trim();
    if body.is_empty() {
        return Err(Error::bad_request("comment body is required"));
    }
    if body.chars().count() > MAX_BODY_CHARS {
        return Err(Error::bad_request(format!(
            "comment body exceeds {MAX_BODY_CHARS} characters"
        )));
    }

    let published: Option<bool> =
        sqlx::query_scalar("SELECT is_published FROM stories WHERE id = ?")
            .bind(story_id)
            .fetch_optional(db)
            .await
            .context("failed to check story")?;
    if published != Some(true) {
        return Err(Error::not_found("story not found"));
    }

    let id = new_id();
    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO comments (id, story_id, user_id, body, status, flags_count, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, 0, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(story_id)
    .bind(user_id)
    .bind(body)
    .bind(CommentStatus::Pending)
    .bind(now)
    .bind(now)
    .execute(db)
    .await
    .context("failed to create comment")?;

    counter!(COMMENTS_CREATED).increment(1);
    get(db, &id).await
}

/// Approved comments on a story, oldest first.
pub async fn list_visible(db: &Db, story_id: &str) -> anyhow::Result<Vec<Comment>> {
    sqlx::query_as::<_, Comment>(&format!(
        "{COMMENT_SELECT} WHERE c.story_id = ? AND c.status = ? ORDER BY c.created_at ASC"
    ))
    .bind(story_id)
    .bind(CommentStatus::Approved)
    .fetch_all(db)
    .await
    .context("failed to list comments")
}

/// The moderation queue. Without explicit statuses, pending and flagged comments are listed.
pub async fn queue(db: &Db, status: Option<CommentStatus>) -> anyhow::Result<Vec<Comment>> {
    let statuses = match status {
        Some(s) => vec![s],
        None => vec![CommentStatus::Flagged, CommentStatus::Pending],
    };

    let mut out = Vec::new();
    for status in statuses {
        let mut rows = sqlx::query_as::<_, Comment>(&format!(
            "{COMMENT_SELECT} WHERE c.status = ? ORDER BY c.flags_count DESC, c.created_at ASC"
        ))
        .bind(status)
        .fetch_all(db)
        .await
        .context("failed to list moderation queue")?;
        out.append(&mut rows);
    }
    Ok(out)
}

/// Record a flag from `flagger_id` against a comment.
///
/// Repeat flags from the same user are ignored. `flags_count` is recomputed from the flag rows,
/// and once it reaches `threshold` the comment moves to `flagged` unless it is already flagged
/// or hidden.
pub async fn flag(
    db: &Db,
    comment_id: &str,
    flagger_id: &str,
    reason: Option<&str>,
    threshold: i64,
) -> Result<FlagOutcome> {
    let comment = get(db, comment_id).await?;
    if comment.user_id == flagger_id {
        return Err(Error::bad_request("cannot flag your own comment"));
    }

    sqlx::query(
        r#"
        INSERT OR IGNORE INTO comment_flags (comment_id, user_id, reason, created_at)
            VALUES (?, ?, ?, ?)
        "#,
    )
    .bind(comment_id)
    .bind(flagger_id)
    .bind(reason)
    .bind(Utc::now())
    .execute(db)
    .await
    .context("failed to record flag")?;

    let flags_count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM comment_flags WHERE comment_id = ?")
            .bind(comment_id)
            .fetch_one(db)
            .await
            .context("failed to count flags")?;

    sqlx::query("UPDATE comments SET flags_count = ? WHERE id = ?")
        .bind(flags_count)
        .bind(comment_id)
        .execute(db)
        .await
        .context("failed to update flag count")?;

    let mut status = comment.status;
    let mut escalated = false;
    if flags_count >= threshold && status.flaggable() {
        // Conditional on the status so a concurrent moderator decision is not overwritten.
        let res = sqlx::query(
            "UPDATE comments SET status = ?, updated_at = ? WHERE id = ? AND status NOT IN (?, ?)",
        )
        .bind(CommentStatus::Flagged)
        .bind(Utc::now())
        .bind(comment_id)
        .bind(CommentStatus::Flagged)
        .bind(CommentStatus::Hidden)
        .execute(db)
        .await
        .context("failed to flag comment")?;

        if res.rows_affected() > 0 {
            status = CommentStatus::Flagged;
            escalated = true;
            counter!(COMMENTS_FLAGGED).increment(1);
            info!("comment {comment_id} reached {flags_count} flags and was queued for review");
        }
    }

    Ok(FlagOutcome {
        flags_count,
        status,
        escalated,
    })
}

pub async fn set_status(db: &Db, id: &str, status: CommentStatus) -> Result<Comment> {
    let res = sqlx::query("UPDATE comments SET status = ?, updated_at = ? WHERE id = ?")
        .bind(status)
        .bind(Utc::now())
        .bind(id)
        .execute(db)
        .await
        .context("failed to update comment status")?;

    if res.rows_affected() == 0 {
        return Err(Error::not_found("comment not found"));
    }
    get(db, id).await
}

/// Ban a comment's author and hide everything they have written. Returns the number of hidden comments.
pub async fn ban_author(db: &Db, comment_id: &str) -> Result<u64> {
    let comment = get(db, comment_id).await?;
    let mut tx = db.begin().await.context("failed to begin transaction")?;

    sqlx::query("UPDATE profiles SET is_banned = 1 WHERE id = ?")
        .bind(&comment.user_id)
        .execute(&mut *tx)
        .await
        .context("failed to ban user")?;

    let hidden = sqlx::query("UPDATE comments SET status = ?, updated_at = ? WHERE user_id = ?")
        .bind(CommentStatus::Hidden)
        .bind(Utc::now())
        .bind(&comment.user_id)
        .execute(&mut *tx)
        .await
        .context("failed to hide comments")?
        .rows_affected();

    tx.commit().await.context("failed to commit transaction")?;

    info!("banned user {} and hid {hidden} comments", comment.user_id);
    Ok(hidden)
}

pub async fn delete(db: &Db, id: &str) -> Result<()> {
    let res = sqlx::query("DELETE FROM comments WHERE id = ?")
        .bind(id)
        .execute(db)
        .await
        .context("failed to delete comment")?;

    if res.rows_affected() == 0 {
        return Err(Error::not_found("comment not found"));
    }
    Ok(())
}
