//! Reader-submitted story leads and the admin queue that turns them into drafts.
use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Sqlite;
use tracing::info;

use crate::{
    db::{new_id, Db},
    status::SubmissionStatus,
    stories::{self, Story, StoryInput},
    Error, Result,
};

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Submission {
    pub id: String,
    pub user_id: Option<String>,
    pub name: String,
    pub email: String,
    pub title: String,
    pub summary: String,
    pub link: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub status: SubmissionStatus,
    pub story_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewSubmission {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    pub title: String,
    pub summary: String,
    pub link: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
}

pub async fn create(db: &Db, user_id: Option<&str>, input: NewSubmission) -> Result<Submission> {
    let title = input.title.trim();
    let summary = input.summary.trim();
    if title.is_empty() || summary.is_empty() {
        return Err(Error::bad_request("title and summary are required"));
    }
    if let Some(link) = &input.link {
        url::Url::parse(link).map_err(|e| Error::bad_request(format!("invalid link: {e}")))?;
    }

    let submission = sqlx::query_as::<_, Submission>(
        r#"
        INSERT INTO story_submissions (id, user_id, name, email, title, summary, link, city, state, country, status, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
        "#,
    )
    .bind(new_id())
    .bind(user_id)
    .bind(input.name.trim())
    .bind(input.email.trim())
    .bind(title)
    .bind(summary)
    .bind(&input.link)
    .bind(&input.city)
    .bind(&input.state)
    .bind(&input.country)
    .bind(SubmissionStatus::Pending)
    .bind(Utc::now())
    .fetch_one(db)
    .await
    .context("failed to store submission")?;

    info!("received submission {}", submission.id);
    Ok(submission)
}

pub async fn get(db: &Db, id: &str) -> Result<Submission> {
    sqlx::query_as::<_, Submission>("SELECT * FROM story_submissions WHERE id = ?")
        .bind(id)
        .fetch_optional(db)
        .await
        .context("failed to fetch submission")?
        .ok_or_else(|| Error::not_found("submission not found"))
}

pub async fn list(db: &Db, status: Option<SubmissionStatus>) -> anyhow::Result<Vec<Submission>> {
    sqlx::query_as::<_, Submission>(
        "SELECT * FROM story_submissions WHERE status = ? ORDER BY created_at ASC",
    )
    .bind(status.unwrap_or(SubmissionStatus::Pending))
    .fetch_all(db)
    .await
    .context("failed to list submissions")
}

/// Move a pending submission to `to`, on `conn`. Fails with 409 when it was resolved already.
async fn resolve<'c, E>(
    conn: E,
    submission: &Submission,
    to: SubmissionStatus,
    story_id: Option<&str>,
) -> Result<()>
where
    E: sqlx::Executor<'c, Database = Sqlite>,
{
    submission.status.resolve(to)?;

    let res = sqlx::query(
        "UPDATE story_submissions SET status = ?, story_id = ? WHERE id = ? AND status = ?",
    )
    .bind(to)
    .bind(story_id)
    .bind(&submission.id)
    .bind(SubmissionStatus::Pending)
    .execute(conn)
    .await
    .context("failed to update submission")?;

    if res.rows_affected() == 0 {
        return Err(Error::conflict("submission was already resolved"));
    }
    Ok(())
}

/// Turn a pending submission into a draft story credited to the submitter.
///
/// The draft and the status change commit together, so a lost race leaves no story behind.
pub async fn accept(db: &Db, id: &str) -> Result<(Submission, Story)> {
    let submission = get(db, id).await?;
    let story = accept_snapshot(db, &submission).await?;
    Ok((get(db, id).await?, story))
}

/// Accept from a previously read `submission`, which may be stale by now.
async fn accept_snapshot(db: &Db, submission: &Submission) -> Result<Story> {
    submission.status.resolve(SubmissionStatus::Accepted)?;

    let mut tx = db.begin().await.context("failed to begin transaction")?;
    let story = stories::create_in(
        &mut tx,
        StoryInput {
            title: Some(submission.title.clone()),
            dek: Some(submission.summary.clone()),
            what: Some(submission.summary.clone()),
            source_url: submission.link.clone(),
            source_name: Some(submission.name.clone()),
            city: submission.city.clone(),
            state: submission.state.clone(),
            country: submission.country.clone(),
            ..StoryInput::default()
        },
        submission.user_id.as_deref(),
    )
    .await?;

    resolve(&mut *tx, submission, SubmissionStatus::Accepted, Some(&story.id)).await?;
    tx.commit().await.context("failed to commit transaction")?;

    info!("accepted submission {} as story {}", submission.id, story.id);
    Ok(story)
}

pub async fn reject(db: &Db, id: &str) -> Result<Submission> {
    let submission = get(db, id).await?;
    resolve(db, &submission, SubmissionStatus::Rejected, None).await?;
    get(db, id).await
}
