//! Proof-of-Good: act submissions, evidence, verification and certificates.
use anyhow::Context as _;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    certificate::{self, CertificateData},
    db::{new_id, Db},
    karma,
    metrics::CERTIFICATES_ISSUED,
    status::{GoodActStatus, Verdict},
    storage::ObjectStore,
    Error, Result,
};

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct GoodAct {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub description: String,
    pub level: i64,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub status: GoodActStatus,
    pub certificate_url: Option<String>,
    pub certificate_issued_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct GoodProof {
    pub id: String,
    pub act_id: String,
    pub kind: String,
    pub url: Option<String>,
    pub note: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct GoodVerification {
    pub id: String,
    pub act_id: String,
    pub verifier_id: String,
    pub verdict: Verdict,
    pub note: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewGoodAct {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub level: i64,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewProof {
    pub kind: String,
    pub url: Option<String>,
    #[serde(default)]
    pub note: String,
}

/// An act together with its evidence and review trail.
#[derive(Debug, Clone, Serialize)]
pub struct GoodActDetail {
    #[serde(flatten)]
    pub act: GoodAct,
    pub proofs: Vec<GoodProof>,
    pub verifications: Vec<GoodVerification>,
}

const PROOF_KINDS: &[&str] = &["photo", "link", "witness", "note"];

pub async fn create(db: &Db, user_id: &str, input: NewGoodAct) -> Result<GoodAct> {
    let title = input.title.trim();
    if title.is_empty() {
        return Err(Error::bad_request("title is required"));
    }
    if !(1..=5).contains(&input.level) {
        return Err(Error::bad_request("level must be between 1 and 5"));
    }

    let now = Utc::now();
    let act = sqlx::query_as::<_, GoodAct>(
        r#"
        INSERT INTO good_acts (id, user_id, title, description, level, city, state, country, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
        "#,
    )
    .bind(new_id())
    .bind(user_id)
    .bind(title)
    .bind(input.description.trim())
    .bind(input.level)
    .bind(input.city)
    .bind(input.state)
    .bind(input.country)
    .bind(GoodActStatus::UnderReview)
    .bind(now)
    .bind(now)
    .fetch_one(db)
    .await
    .context("failed to create good act")?;

    Ok(act)
}

pub async fn get(db: &Db, id: &str) -> Result<GoodAct> {
    sqlx::query_as::<_, GoodAct>("SELECT * FROM good_acts WHERE id = ?")
        .bind(id)
        .fetch_optional(db)
        .await
        .context("failed to fetch good act")?
        .ok_or_else(|| Error::not_found("good act not found"))
}

pub async fn detail(db: &Db, id: &str) -> Result<GoodActDetail> {
    let act = get(db, id).await?;

    let proofs = sqlx::query_as::<_, GoodProof>(
        "SELECT * FROM good_proofs WHERE act_id = ? ORDER BY created_at ASC",
    )
    .bind(id)
    .fetch_all(db)
    .await
    .context("failed to fetch proofs")?;

    let verifications = sqlx::query_as::<_, GoodVerification>(
        "SELECT * FROM good_verifications WHERE act_id = ? ORDER BY created_at ASC",
    )
    .bind(id)
    .fetch_all(db)
    .await
    .context("failed to fetch verifications")?;

    Ok(GoodActDetail {
        act,
        proofs,
        verifications,
    })
}

pub async fn list_for_user(db: &Db, user_id: &str) -> anyhow::Result<Vec<GoodAct>> {
    sqlx::query_as::<_, GoodAct>(
        "SELECT * FROM good_acts WHERE user_id = ? ORDER BY created_at DESC",
    )
    .bind(user_id)
    .fetch_all(db)
    .await
    .context("failed to list good acts")
}

pub async fn list_by_status(
    db: &Db,
    status: Option<GoodActStatus>,
) -> anyhow::Result<Vec<GoodAct>> {
    let status = status.unwrap_or(GoodActStatus::UnderReview);
    sqlx::query_as::<_, GoodAct>(
        "SELECT * FROM good_acts WHERE status = ? ORDER BY created_at ASC",
    )
    .bind(status)
    .fetch_all(db)
    .await
    .context("failed to list good acts")
}

pub async fn add_proof(db: &Db, act_id: &str, user_id: &str, input: NewProof) -> Result<GoodProof> {
    let act = get(db, act_id).await?;
    if act.user_id != user_id {
        return Err(Error::forbidden("only the submitter can add proof"));
    }
    if !PROOF_KINDS.contains(&input.kind.as_str()) {
        return Err(Error::bad_request(format!(
            "proof kind must be one of {}",
            PROOF_KINDS.join(", ")
        )));
    }
    if let Some(url) = &input.url {
        url::Url::parse(url).map_err(|e| Error::bad_request(format!("invalid proof url: {e}")))?;
    }
    if input.url.is_none() && input.note.trim().is_empty() {
        return Err(Error::bad_request("proof needs a url or a note"));
    }

    let proof = sqlx::query_as::<_, GoodProof>(
        "INSERT INTO good_proofs (id, act_id, kind, url, note, created_at) VALUES (?, ?, ?, ?, ?, ?) RETURNING *",
    )
    .bind(new_id())
    .bind(act_id)
    .bind(&input.kind)
    .bind(&input.url)
    .bind(input.note.trim())
    .bind(Utc::now())
    .fetch_one(db)
    .await
    .context("failed to add proof")?;

    Ok(proof)
}

/// Record a reviewer's verdict and apply the status it maps to.
///
/// `confirm` verifies the act, `deny` rejects it, and `inconclusive` only leaves an audit row.
/// The act's author earns karma the first time it becomes verified.
pub async fn verify(
    db: &Db,
    act_id: &str,
    verifier_id: &str,
    verdict: Verdict,
    note: &str,
) -> Result<GoodAct> {
    let before = get(db, act_id).await?;

    sqlx::query(
        "INSERT INTO good_verifications (id, act_id, verifier_id, verdict, note, created_at) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(new_id())
    .bind(act_id)
    .bind(verifier_id)
    .bind(verdict)
    .bind(note.trim())
    .bind(Utc::now())
    .execute(db)
    .await
    .context("failed to record verification")?;

    let Some(status) = verdict.resolves_to() else {
        return Ok(before);
    };

    sqlx::query("UPDATE good_acts SET status = ?, updated_at = ? WHERE id = ?")
        .bind(status)
        .bind(Utc::now())
        .bind(act_id)
        .execute(db)
        .await
        .context("failed to update good act status")?;

    if status == GoodActStatus::Verified && before.status != GoodActStatus::Verified {
        karma::award_best_effort(
            db,
            &before.user_id,
            karma::points::GOOD_ACT_VERIFIED,
            "good_act_verified",
            Some(act_id),
        )
        .await;
    }

    info!("good act {act_id}: {verdict} by {verifier_id}");
    get(db, act_id).await
}

/// Render and upload the certificate for a verified act, replacing any earlier one.
pub async fn issue_certificate(
    db: &Db,
    storage: &ObjectStore,
    site_url: &str,
    act_id: &str,
) -> Result<GoodAct> {
    let act = get(db, act_id).await?;
    if act.status != GoodActStatus::Verified {
        return Err(Error::bad_request(format!(
            "certificates can only be issued for verified acts (status is {})",
            act.status
        )));
    }

    let recipient: String = sqlx::query_scalar(
        "SELECT CASE WHEN display_name = '' THEN email ELSE display_name END FROM profiles WHERE id = ?",
    )
    .bind(&act.user_id)
    .fetch_one(db)
    .await
    .context("failed to fetch recipient")?;

    let place = [act.city.as_deref(), act.state.as_deref(), act.country.as_deref()]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(", ");
    let issued_at = Utc::now();
    let verify_url = format!("{site_url}/api/good-acts/{act_id}");

    let svg = certificate::render_svg(&CertificateData {
        act_id,
        recipient: &recipient,
        title: &act.title,
        level: act.level,
        place: (!place.is_empty()).then_some(place),
        issued_at,
        verify_url: &verify_url,
    });

    let url = storage
        .put(&format!("certificates/{act_id}.svg"), svg.as_bytes())
        .await
        .context("failed to upload certificate")?;

    sqlx::query(
        "UPDATE good_acts SET certificate_url = ?, certificate_issued_at = ?, updated_at = ? WHERE id = ?",
    )
    .bind(&url)
    .bind(issued_at)
    .bind(issued_at)
    .bind(act_id)
    .execute(db)
    .await
    .context("failed to record certificate")?;

    counter!(CERTIFICATES_ISSUED).increment(1);
    info!("issued certificate for good act {act_id}");
    get(db, act_id).await
}
