//! Partner organisations shown on the public site.
use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    db::{new_id, Db},
    Error, Result,
};

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Partner {
    pub id: String,
    pub name: String,
    pub website_url: Option<String>,
    pub logo_url: Option<String>,
    pub description: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for creating or editing a partner. Absent fields are left unchanged on edit.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PartnerInput {
    pub name: Option<String>,
    pub website_url: Option<String>,
    pub logo_url: Option<String>,
    pub description: Option<String>,
    pub is_active: Option<bool>,
}

fn check_url(url: Option<&str>) -> Result<()> {
    if let Some(url) = url {
        url::Url::parse(url).map_err(|e| Error::bad_request(format!("invalid url `{url}`: {e}")))?;
    }
    Ok(())
}

pub async fn list(db: &Db, active_only: bool) -> anyhow::Result<Vec<Partner>> {
    let sql = if active_only {
        "SELECT * FROM partners WHERE is_active = 1 ORDER BY name ASC"
    } else {
        "SELECT * FROM partners ORDER BY name ASC"
    };
    sqlx::query_as::<_, Partner>(sql)
        .fetch_all(db)
        .await
        .context("failed to list partners")
}

pub async fn get(db: &Db, id: &str) -> Result<Partner> {
    sqlx::query_as::<_, Partner>("SELECT * FROM partners WHERE id = ?")
        .bind(id)
        .fetch_optional(db)
        .await
        .context("failed to fetch partner")?
        .ok_or_else(|| Error::not_found("partner not found"))
}

pub async fn create(db: &Db, input: PartnerInput) -> Result<Partner> {
    let name = input
        .name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| Error::bad_request("name is required"))?;
    check_url(input.website_url.as_deref())?;
    check_url(input.logo_url.as_deref())?;

    let now = Utc::now();
    let partner = sqlx::query_as::<_, Partner>(
        r#"
        INSERT INTO partners (id, name, website_url, logo_url, description, is_active, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
        "#,
    )
    .bind(new_id())
    .bind(name)
    .bind(&input.website_url)
    .bind(&input.logo_url)
    .bind(input.description.as_deref().unwrap_or_default())
    .bind(input.is_active.unwrap_or(true))
    .bind(now)
    .bind(now)
    .fetch_one(db)
    .await
    .context("failed to create partner")?;

    Ok(partner)
}

pub async fn update(db: &Db, id: &str, input: PartnerInput) -> Result<Partner> {
    let current = get(db, id).await?;
    check_url(input.website_url.as_deref())?;
    check_url(input.logo_url.as_deref())?;

    let name = match input.name.as_deref().map(str::trim) {
        Some("") => return Err(Error::bad_request("name cannot be empty")),
        Some(name) => name.to_owned(),
        None => current.name,
    };

    let partner = sqlx::query_as::<_, Partner>(
        r#"
        UPDATE partners
            SET name = ?, website_url = ?, logo_url = ?, description = ?, is_active = ?, updated_at = ?
            WHERE id = ?
            RETURNING *
        "#,
    )
    .bind(name)
    .bind(input.website_url.or(current.website_url))
    .bind(input.logo_url.or(current.logo_url))
    .bind(input.description.unwrap_or(current.description))
    .bind(input.is_active.unwrap_or(current.is_active))
    .bind(Utc::now())
    .bind(id)
    .fetch_one(db)
    .await
    .context("failed to update partner")?;

    Ok(partner)
}

pub async fn delete(db: &Db, id: &str) -> Result<()> {
    let res = sqlx::query("DELETE FROM partners WHERE id = ?")
        .bind(id)
        .execute(db)
        .await
        .context("failed to delete partner")?;

    if res.rows_affected() == 0 {
        return Err(Error::not_found("partner not found"));
    }
    Ok(())
}
