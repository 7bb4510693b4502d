//! Stories: storage, slugs, publication and retrieval.
use anyhow::Context as _;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use sqlx::{types::Json, QueryBuilder, Sqlite, SqliteConnection};
use tracing::{info, warn};

use crate::{
    db::{new_id, pagination::Cursor, Db},
    embeddings::{cosine_similarity, Embedder},
    metrics::{EMBEDDINGS_COMPUTED, STORIES_PUBLISHED},
    Error, Result,
};

const STORY_COLUMNS: &str = "id, slug, title, dek, what, how, why, life_lesson, category, \
    image_url, source_url, source_name, city, state, country, is_published, published_at, \
    author_id, created_at, updated_at";

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Story {
    pub id: String,
    pub slug: String,
    pub title: String,
    pub dek: String,
    pub what: String,
    pub how: String,
    pub why: String,
    pub life_lesson: String,
    pub category: Option<String>,
    pub image_url: Option<String>,
    pub source_url: Option<String>,
    pub source_name: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub is_published: bool,
    pub published_at: Option<DateTime<Utc>>,
    pub author_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct EmbeddedStory {
    #[sqlx(flatten)]
    story: Story,
    embedding: Json<Vec<f32>>,
}

/// Fields accepted when creating or editing a story. Absent fields are left unchanged on edit.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoryInput {
    pub title: Option<String>,
    pub slug: Option<String>,
    pub dek: Option<String>,
    pub what: Option<String>,
    pub how: Option<String>,
    pub why: Option<String>,
    pub life_lesson: Option<String>,
    pub category: Option<String>,
    pub image_url: Option<String>,
    pub source_url: Option<String>,
    pub source_name: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
}

/// Optional filters for the public feed.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeedFilter {
    pub city: Option<String>,
    pub state: Option<String>,
    pub category: Option<String>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Region {
    pub state: String,
    pub city: Option<String>,
    pub stories: i64,
}

/// Turn a title into a URL slug: lowercase ASCII words joined by single hyphens.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }

    let slug = slug.trim_end_matches('-');
    let slug = if slug.len() > 80 {
        slug[..80].trim_end_matches('-')
    } else {
        slug
    };

    if slug.is_empty() {
        "story".to_owned()
    } else {
        slug.to_owned()
    }
}

pub fn is_valid_slug(slug: &str) -> bool {
    !slug.is_empty()
        && slug.len() <= 100
        && !slug.starts_with('-')
        && !slug.ends_with('-')
        && slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Find a free slug starting from `base`, appending `-2`, `-3`, ... as needed.
async fn unique_slug(
    conn: &mut SqliteConnection,
    base: &str,
    exclude_id: Option<&str>,
) -> anyhow::Result<String> {
    let mut candidate = base.to_owned();
    let mut n = 1;

    loop {
        let taken: Option<String> = sqlx::query_scalar("SELECT id FROM stories WHERE slug = ?")
            .bind(&candidate)
            .fetch_optional(&mut *conn)
            .await
            .context("failed to check slug")?;

        match taken {
            Some(id) if Some(id.as_str()) != exclude_id => {
                n += 1;
                candidate = format!("{base}-{n}");
            }
            _ => return Ok(candidate),
        }
    }
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|s| s.trim().to_owned()).filter(|s| !s.is_empty())
}

/// Create a draft story.
pub async fn create(db: &Db, input: StoryInput, author_id: Option<&str>) -> Result<Story> {
    let mut tx = db.begin().await.context("failed to begin transaction")?;
    let story = create_in(&mut tx, input, author_id).await?;
    tx.commit().await.context("failed to commit transaction")?;
    Ok(story)
}

/// Create a draft story on `conn`, so callers can make it part of a larger transaction.
pub async fn create_in(
    conn: &mut SqliteConnection,
    input: StoryInput,
    author_id: Option<&str>,
) -> Result<Story> {
    let title = non_empty(input.title.clone()).ok_or_else(|| Error::bad_request("title is required"))?;

    let slug = match non_empty(input.slug.clone()) {
        Some(slug) if !is_valid_slug(&slug) => {
            return Err(Error::bad_request(format!("invalid slug `{slug}`")));
        }
        Some(slug) => {
            if unique_slug(conn, &slug, None).await? != slug {
                return Err(Error::conflict(format!("slug `{slug}` is already in use")));
            }
            slug
        }
        None => unique_slug(conn, &slugify(&title), None).await?,
    };

    let id = new_id();
    let now = Utc::now();

    sqlx::query(
        r#"
        INSERT INTO stories (
            id, slug, title, dek, what, how, why, life_lesson, category, image_url,
            source_url, source_name, city, state, country, is_published, published_at,
            author_id, created_at, updated_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, NULL, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(&slug)
    .bind(&title)
    .bind(input.dek.unwrap_or_default())
    .bind(input.what.unwrap_or_default())
    .bind(input.how.unwrap_or_default())
    .bind(input.why.unwrap_or_default())
    .bind(input.life_lesson.unwrap_or_default())
    .bind(non_empty(input.category))
    .bind(non_empty(input.image_url))
    .bind(non_empty(input.source_url))
    .bind(non_empty(input.source_name))
    .bind(non_empty(input.city))
    .bind(non_empty(input.state))
    .bind(non_empty(input.country))
    .bind(author_id)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await
    .context("failed to create story")?;

    let story = sqlx::query_as::<_, Story>(&format!("SELECT {STORY_COLUMNS} FROM stories WHERE id = ?"))
        .bind(&id)
        .fetch_one(&mut *conn)
        .await
        .context("failed to fetch created story")?;

    info!("created story {id} ({slug})");
    Ok(story)
}

pub async fn find(db: &Db, id: &str) -> anyhow::Result<Option<Story>> {
    sqlx::query_as::<_, Story>(&format!("SELECT {STORY_COLUMNS} FROM stories WHERE id = ?"))
        .bind(id)
        .fetch_optional(db)
        .await
        .context("failed to fetch story")
}

/// Fetch a story by id, or 404.
pub async fn get(db: &Db, id: &str) -> Result<Story> {
    find(db, id)
        .await?
        .ok_or_else(|| Error::not_found("story not found"))
}

pub async fn find_by_slug(db: &Db, slug: &str) -> anyhow::Result<Option<Story>> {
    sqlx::query_as::<_, Story>(&format!("SELECT {STORY_COLUMNS} FROM stories WHERE slug = ?"))
        .bind(slug)
        .fetch_optional(db)
        .await
        .context("failed to fetch story")
}

/// Apply the present fields of `input` to an existing story.
pub async fn update(db: &Db, id: &str, input: StoryInput) -> Result<Story> {
    let mut story = get(db, id).await?;

    if let Some(title) = input.title {
        let title = title.trim().to_owned();
        if title.is_empty() {
            return Err(Error::bad_request("title cannot be empty"));
        }
        story.title = title;
    }
    if let Some(slug) = non_empty(input.slug) {
        if !is_valid_slug(&slug) {
            return Err(Error::bad_request(format!("invalid slug `{slug}`")));
        }
        let free = {
            let mut conn = db.acquire().await.context("failed to acquire connection")?;
            unique_slug(&mut conn, &slug, Some(id)).await?
        };
        if free != slug {
            return Err(Error::conflict(format!("slug `{slug}` is already in use")));
        }
        story.slug = slug;
    }

    macro_rules! apply {
        ($($field:ident),+) => { $(if let Some(v) = input.$field { story.$field = v; })+ };
    }
    macro_rules! apply_opt {
        ($($field:ident),+) => { $(if input.$field.is_some() { story.$field = non_empty(input.$field); })+ };
    }
    apply!(dek, what, how, why, life_lesson);
    apply_opt!(category, image_url, source_url, source_name, city, state, country);

    sqlx::query(
        r#"
        UPDATE stories SET
            slug = ?, title = ?, dek = ?, what = ?, how = ?, why = ?, life_lesson = ?,
            category = ?, image_url = ?, source_url = ?, source_name = ?, city = ?, state = ?,
            country = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&story.slug)
    .bind(&story.title)
    .bind(&story.dek)
    .bind(&story.what)
    .bind(&story.how)
    .bind(&story.why)
    .bind(&story.life_lesson)
    .bind(&story.category)
    .bind(&story.image_url)
    .bind(&story.source_url)
    .bind(&story.source_name)
    .bind(&story.city)
    .bind(&story.state)
    .bind(&story.country)
    .bind(Utc::now())
    .bind(id)
    .execute(db)
    .await
    .context("failed to update story")?;

    get(db, id).await
}

pub async fn delete(db: &Db, id: &str) -> Result<()> {
    let res = sqlx::query("DELETE FROM stories WHERE id = ?")
        .bind(id)
        .execute(db)
        .await
        .context("failed to delete story")?;

    if res.rows_affected() == 0 {
        return Err(Error::not_found("story not found"));
    }
    Ok(())
}

/// Set the published flag.
///
/// Moving from draft to published stamps `published_at`. Unpublishing keeps the historical
/// timestamp, and republishing an already published story leaves it untouched.
pub async fn set_published(db: &Db, id: &str, published: bool) -> Result<Story> {
    let before = get(db, id).await?;
    let now = Utc::now();

    sqlx::query(
        r#"
        UPDATE stories SET
            published_at = CASE WHEN ? AND is_published = 0 THEN ? ELSE published_at END,
            is_published = ?,
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(published)
    .bind(now)
    .bind(published)
    .bind(now)
    .bind(id)
    .execute(db)
    .await
    .context("failed to update publication state")?;

    if published && !before.is_published {
        counter!(STORIES_PUBLISHED).increment(1);
        info!("published story {id}");
    }

    get(db, id).await
}

/// Published stories, newest first, resuming after `cursor`.
pub async fn feed(
    db: &Db,
    filter: &FeedFilter,
    cursor: Option<&Cursor>,
    limit: i64,
) -> anyhow::Result<Vec<Story>> {
    let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new(format!(
        "SELECT {STORY_COLUMNS} FROM stories WHERE is_published = 1"
    ));

    if let Some(city) = &filter.city {
        qb.push(" AND lower(city) = lower(").push_bind(city.clone()).push(")");
    }
    if let Some(state) = &filter.state {
        qb.push(" AND lower(state) = lower(").push_bind(state.clone()).push(")");
    }
    if let Some(category) = &filter.category {
        qb.push(" AND category = ").push_bind(category.clone());
    }
    if let Some(cursor) = cursor {
        qb.push(" AND (published_at < ")
            .push_bind(cursor.primary)
            .push(" OR (published_at = ")
            .push_bind(cursor.primary)
            .push(" AND id < ")
            .push_bind(cursor.secondary.clone())
            .push("))");
    }
    qb.push(" ORDER BY published_at DESC, id DESC LIMIT ")
        .push_bind(limit);

    qb.build_query_as::<Story>()
        .fetch_all(db)
        .await
        .context("failed to fetch feed")
}

/// Cursor pointing after the last story of a full page.
pub fn next_cursor(page: &[Story], limit: i64) -> Option<String> {
    if i64::try_from(page.len()).ok()? < limit {
        return None;
    }
    let last = page.last()?;
    Some(Cursor::new(last.published_at?, &last.id).pack())
}

/// Every story, drafts included, most recently edited first.
pub async fn list_all(db: &Db, limit: i64, offset: i64) -> anyhow::Result<Vec<Story>> {
    sqlx::query_as::<_, Story>(&format!(
        "SELECT {STORY_COLUMNS} FROM stories ORDER BY updated_at DESC LIMIT ? OFFSET ?"
    ))
    .bind(limit)
    .bind(offset)
    .fetch_all(db)
    .await
    .context("failed to list stories")
}

pub async fn regions(db: &Db) -> anyhow::Result<Vec<Region>> {
    sqlx::query_as::<_, Region>(
        r#"
        SELECT state, city, COUNT(*) AS stories
        FROM stories
        WHERE is_published = 1 AND state IS NOT NULL
        GROUP BY state, city
        ORDER BY state, city
        "#,
    )
    .fetch_all(db)
    .await
    .context("failed to list regions")
}

/// Case-insensitive substring search across the story text.
pub async fn search_keyword(db: &Db, q: &str, limit: i64) -> anyhow::Result<Vec<Story>> {
    sqlx::query_as::<_, Story>(&format!(
        r#"
        SELECT {STORY_COLUMNS} FROM stories
        WHERE is_published = 1 AND instr(
            lower(title || ' ' || dek || ' ' || what || ' ' || how || ' ' || why || ' ' ||
                  life_lesson || ' ' || coalesce(city, '') || ' ' || coalesce(state, '')),
            lower(?)
        ) > 0
        ORDER BY published_at DESC
        LIMIT ?
        "#
    ))
    .bind(q)
    .bind(limit)
    .fetch_all(db)
    .await
    .context("failed to search stories")
}

/// Published stories ranked by similarity to `query`.
pub async fn search_vector(db: &Db, query: &[f32], limit: i64) -> anyhow::Result<Vec<Story>> {
    let rows = sqlx::query_as::<_, EmbeddedStory>(&format!(
        "SELECT {STORY_COLUMNS}, embedding FROM stories \
         WHERE is_published = 1 AND embedding IS NOT NULL"
    ))
    .fetch_all(db)
    .await
    .context("failed to load story embeddings")?;

    let mut scored: Vec<(f32, Story)> = rows
        .into_iter()
        .map(|row| (cosine_similarity(query, &row.embedding.0), row.story))
        .collect();
    scored.sort_by(|a, b| b.0.total_cmp(&a.0));

    Ok(scored
        .into_iter()
        .take(usize::try_from(limit).unwrap_or(0))
        .map(|(_, story)| story)
        .collect())
}

/// The text that represents a story for embedding purposes.
pub fn embedding_text(story: &Story) -> String {
    [
        story.title.as_str(),
        &story.dek,
        &story.what,
        &story.how,
        &story.why,
        &story.life_lesson,
    ]
    .iter()
    .filter(|s| !s.is_empty())
    .copied()
    .collect::<Vec<_>>()
    .join("\n")
}

pub async fn store_embedding(db: &Db, id: &str, embedding: Vec<f32>) -> anyhow::Result<()> {
    sqlx::query("UPDATE stories SET embedding = ? WHERE id = ?")
        .bind(Json(embedding))
        .bind(id)
        .execute(db)
        .await
        .context("failed to store embedding")?;
    counter!(EMBEDDINGS_COMPUTED).increment(1);
    Ok(())
}

/// Recompute a story's embedding. Failures are logged and never surface to the caller.
pub async fn refresh_embedding(db: &Db, embedder: Option<&Embedder>, story: &Story) {
    let Some(embedder) = embedder else {
        return;
    };

    let result = async {
        let embedding = embedder.embed(&embedding_text(story)).await?;
        store_embedding(db, &story.id, embedding).await
    }
    .await;

    if let Err(e) = result {
        warn!("failed to refresh embedding for story {}: {e:#}", story.id);
    }
}

pub async fn missing_embeddings(db: &Db, limit: i64) -> anyhow::Result<Vec<Story>> {
    sqlx::query_as::<_, Story>(&format!(
        "SELECT {STORY_COLUMNS} FROM stories WHERE embedding IS NULL ORDER BY created_at LIMIT ?"
    ))
    .bind(limit)
    .fetch_all(db)
    .await
    .context("failed to list stories without embeddings")
}

/// Latest published stories, for syndication feeds.
pub async fn recent(db: &Db, limit: i64) -> anyhow::Result<Vec<Story>> {
    feed(db, &FeedFilter::default(), None, limit).await
}

/// Stories published since `since`, most liked first.
pub async fn top_since(db: &Db, since: DateTime<Utc>, limit: i64) -> anyhow::Result<Vec<Story>> {
    sqlx::query_as::<_, Story>(&format!(
        r#"
        SELECT {STORY_COLUMNS} FROM stories s
        WHERE is_published = 1 AND published_at >= ?
        ORDER BY (SELECT COUNT(*) FROM story_likes l WHERE l.story_id = s.id) DESC,
                 published_at DESC
        LIMIT ?
        "#
    ))
    .bind(since)
    .bind(limit)
    .fetch_all(db)
    .await
    .context("failed to list top stories")
}

/// A toggleable per-user reaction on a story.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaction {
    Like,
    Save,
}

impl Reaction {
    const fn table(self) -> &'static str {
        match self {
            Self::Like => "story_likes",
            Self::Save => "story_saves",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReactionState {
    pub active: bool,
    pub count: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Reactions {
    pub likes: i64,
    pub saves: i64,
    pub liked: bool,
    pub saved: bool,
}

async fn reaction_count(db: &Db, reaction: Reaction, story_id: &str) -> anyhow::Result<i64> {
    sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM {} WHERE story_id = ?",
        reaction.table()
    ))
    .bind(story_id)
    .fetch_one(db)
    .await
    .context("failed to count reactions")
}

async fn has_reacted(
    db: &Db,
    reaction: Reaction,
    story_id: &str,
    user_id: &str,
) -> anyhow::Result<bool> {
    let n: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM {} WHERE story_id = ? AND user_id = ?",
        reaction.table()
    ))
    .bind(story_id)
    .bind(user_id)
    .fetch_one(db)
    .await
    .context("failed to check reaction")?;
    Ok(n > 0)
}

/// Flip the caller's reaction on a published story: remove it if present, add it otherwise.
pub async fn toggle(
    db: &Db,
    reaction: Reaction,
    story_id: &str,
    user_id: &str,
) -> Result<ReactionState> {
    let story = find(db, story_id).await?;
    if !story.is_some_and(|s| s.is_published) {
        return Err(Error::not_found("story not found"));
    }

    let removed = sqlx::query(&format!(
        "DELETE FROM {} WHERE story_id = ? AND user_id = ?",
        reaction.table()
    ))
    .bind(story_id)
    .bind(user_id)
    .execute(db)
    .await
    .context("failed to remove reaction")?
    .rows_affected()
        > 0;

    if !removed {
        sqlx::query(&format!(
            "INSERT OR IGNORE INTO {} (story_id, user_id, created_at) VALUES (?, ?, ?)",
            reaction.table()
        ))
        .bind(story_id)
        .bind(user_id)
        .bind(Utc::now())
        .execute(db)
        .await
        .context("failed to add reaction")?;
    }

    Ok(ReactionState {
        active: !removed,
        count: reaction_count(db, reaction, story_id).await?,
    })
}

pub async fn reactions(db: &Db, story_id: &str, user_id: Option<&str>) -> anyhow::Result<Reactions> {
    let mut out = Reactions {
        likes: reaction_count(db, Reaction::Like, story_id).await?,
        saves: reaction_count(db, Reaction::Save, story_id).await?,
        ..Reactions::default()
    };

    if let Some(user_id) = user_id {
        out.liked = has_reacted(db, Reaction::Like, story_id, user_id).await?;
        out.saved = has_reacted(db, Reaction::Save, story_id, user_id).await?;
    }
    Ok(out)
}

/// Stories the user has saved, most recently saved first.
pub async fn saved_by(db: &Db, user_id: &str) -> anyhow::Result<Vec<Story>> {
    let columns = STORY_COLUMNS
        .split(", ")
        .map(|c| format!("s.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ");

    sqlx::query_as::<_, Story>(&format!(
        r#"
        SELECT {columns} FROM story_saves v
        JOIN stories s ON s.id = v.story_id
        WHERE v.user_id = ? AND s.is_published = 1
        ORDER BY v.created_at DESC
        "#
    ))
    .bind(user_id)
    .fetch_all(db)
    .await
    .context("failed to list saved stories")
}
