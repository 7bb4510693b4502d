//! End-to-end tests that drive a live server over HTTP.

use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use anyhow::{Context as _, Result};
use axum::{routing::post, Json, Router};
use figment::{providers::Serialized, Figment};
use reqwest::{header, StatusCode};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use uuid::Uuid;

use crate::{config::AppConfig, db::Db, serve, AppState};

const ADMIN_EMAIL: &str = "admin@aikya.test";
const CRON_SECRET: &str = "test-cron-secret";
const PASSWORD: &str = "correct horse battery";

/// A temporary test directory that will be cleaned up when the struct is dropped.
struct TempDir {
    path: PathBuf,
}

impl TempDir {
    fn new() -> Result<Self> {
        let path = std::env::temp_dir().join(format!("aikya-test-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&path)?;
        Ok(Self { path })
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

#[derive(Serialize)]
struct StorageInput {
    path: PathBuf,
}

#[derive(Serialize)]
struct EmbeddingsInput {
    api_key: String,
    base_url: String,
}

#[derive(Serialize)]
struct TestConfigInput {
    host_name: String,
    db: String,
    test: bool,
    admin_emails: Vec<String>,
    cron_secret: String,
    storage: StorageInput,
    #[serde(skip_serializing_if = "Option::is_none")]
    embeddings: Option<EmbeddingsInput>,
}

/// Toy embedding: one dimension per topic word, plus a constant so no vector is zero.
fn stub_embedding(text: &str) -> Vec<f32> {
    let text = text.to_lowercase();
    ["tree", "food", "water"]
        .iter()
        .map(|w| if text.contains(w) { 1.0 } else { 0.0 })
        .chain(std::iter::once(0.01))
        .collect()
}

/// Serve an OpenAI-shaped embeddings endpoint on a random port and return its base URL.
async fn spawn_embeddings_stub() -> Result<String> {
    async fn embeddings(Json(body): Json<Value>) -> Json<Value> {
        let input = body["input"].as_str().unwrap_or_default();
        Json(json!({ "data": [{ "embedding": stub_embedding(input) }] }))
    }

    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    let address = listener.local_addr()?;
    let app = Router::new().route("/embeddings", post(embeddings));
    tokio::spawn(async move { axum::serve(listener, app).await });

    Ok(format!("http://{address}"))
}

/// One running server over a private database and storage directory.
struct TestApp {
    _temp_dir: TempDir,
    address: SocketAddr,
    db: Db,
    client: reqwest::Client,
}

impl TestApp {
    async fn spawn() -> Result<Self> {
        Self::spawn_with(false).await
    }

    async fn spawn_with(embeddings: bool) -> Result<Self> {
        let temp_dir = TempDir::new()?;
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let address = listener.local_addr()?;

        let embeddings = if embeddings {
            Some(EmbeddingsInput {
                api_key: "test".to_owned(),
                base_url: spawn_embeddings_stub().await?,
            })
        } else {
            None
        };

        let config: AppConfig = Figment::new()
            .merge(Serialized::defaults(TestConfigInput {
                host_name: address.to_string(),
                db: format!("sqlite://{}/test.db", temp_dir.path.display()),
                test: true,
                admin_emails: vec![ADMIN_EMAIL.to_owned()],
                cron_secret: CRON_SECRET.to_owned(),
                storage: StorageInput {
                    path: temp_dir.path.join("storage"),
                },
                embeddings,
            }))
            .extract()
            .context("failed to build test config")?;

        let state = AppState::new(config).await?;
        let db = state.db.clone();
        let app = serve::app(state);
        tokio::spawn(async move { axum::serve(listener, app.into_make_service()).await });

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            _temp_dir: temp_dir,
            address,
            db,
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.address)
    }

    fn get(&self, token: Option<&str>, path: &str) -> reqwest::RequestBuilder {
        let req = self.client.get(self.url(path));
        match token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    fn post(&self, token: Option<&str>, path: &str) -> reqwest::RequestBuilder {
        let req = self.client.post(self.url(path));
        match token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn post_json(&self, token: &str, path: &str, body: Value) -> Result<Value> {
        let res = self.post(Some(token), path).json(&body).send().await?;
        let status = res.status();
        let body: Value = res.json().await?;
        anyhow::ensure!(status.is_success(), "POST {path} failed with {status}: {body}");
        Ok(body)
    }

    async fn get_json(&self, token: Option<&str>, path: &str) -> Result<Value> {
        let res = self.get(token, path).send().await?;
        let status = res.status();
        let body: Value = res.json().await?;
        anyhow::ensure!(status.is_success(), "GET {path} failed with {status}: {body}");
        Ok(body)
    }

    /// Create an account and return `(user id, session token)`.
    async fn sign_up(&self, email: &str) -> Result<(String, String)> {
        let res = self
            .post(None, "/api/auth/sign-up")
            .json(&json!({ "email": email, "password": PASSWORD, "display_name": email }))
            .send()
            .await?;
        anyhow::ensure!(res.status().is_success(), "sign-up failed: {}", res.status());

        let body: Value = res.json().await?;
        let id = body["profile"]["id"].as_str().context("no id")?.to_owned();
        let token = body["token"].as_str().context("no token")?.to_owned();
        Ok((id, token))
    }

    async fn admin(&self) -> Result<String> {
        Ok(self.sign_up(ADMIN_EMAIL).await?.1)
    }

    /// Create and publish a story, returning its JSON.
    async fn published_story(&self, admin: &str, story: Value) -> Result<Value> {
        let created = self.post_json(admin, "/api/admin/stories", story).await?;
        let id = created["id"].as_str().context("no story id")?;
        self.post_json(
            admin,
            &format!("/api/admin/stories/{id}/publish"),
            json!({ "published": true }),
        )
        .await
    }
}

fn str_field<'a>(value: &'a Value, field: &str) -> &'a str {
    value[field].as_str().unwrap_or_default()
}

#[tokio::test]
async fn health_and_index() -> Result<()> {
    let app = TestApp::spawn().await?;

    let res = app.get(None, "/_health").send().await?;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await?, "ok");

    let res = app.get(None, "/").send().await?;
    assert!(res.text().await?.contains("Aikya"));
    Ok(())
}

#[tokio::test]
async fn admin_routes_require_admin() -> Result<()> {
    let app = TestApp::spawn().await?;
    let (_, member) = app.sign_up("member@aikya.test").await?;
    let admin = app.admin().await?;

    for path in ["/api/admin/stories", "/api/admin/comments", "/api/admin/analytics"] {
        let res = app.get(None, path).send().await?;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED, "{path}");

        let res = app.get(Some(&member), path).send().await?;
        assert_eq!(res.status(), StatusCode::FORBIDDEN, "{path}");

        let res = app.get(Some(&admin), path).send().await?;
        assert_eq!(res.status(), StatusCode::OK, "{path}");
    }

    let res = app
        .post(Some(&member), "/api/admin/stories")
        .json(&json!({ "title": "Sneaky" }))
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::FORBIDDEN);

    let session = app.get_json(Some(&admin), "/api/auth/session").await?;
    assert_eq!(session["is_admin"], json!(true));
    Ok(())
}

#[tokio::test]
async fn sign_in_and_sign_out() -> Result<()> {
    let app = TestApp::spawn().await?;
    app.sign_up("reader@aikya.test").await?;

    let res = app
        .post(None, "/api/auth/sign-in")
        .json(&json!({ "email": "reader@aikya.test", "password": "wrong password" }))
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = app
        .post(None, "/api/auth/sign-in")
        .json(&json!({ "email": "Reader@Aikya.test", "password": PASSWORD }))
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await?;
    let token = str_field(&body, "token").to_owned();

    assert_eq!(app.get(Some(&token), "/api/profile").send().await?.status(), StatusCode::OK);

    let res = app.post(Some(&token), "/api/auth/sign-out").send().await?;
    assert_eq!(res.status(), StatusCode::OK);
    let res = app.get(Some(&token), "/api/profile").send().await?;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = app
        .post(None, "/api/auth/sign-up")
        .json(&json!({ "email": "reader@aikya.test", "password": PASSWORD }))
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::CONFLICT);
    Ok(())
}

#[tokio::test]
async fn magic_link_signs_in_once() -> Result<()> {
    let app = TestApp::spawn().await?;

    let res = app
        .post(None, "/api/auth/magic-link")
        .json(&json!({ "email": "linked@aikya.test" }))
        .send()
        .await?;
    let body: Value = res.json().await?;
    assert_eq!(body["sent"], json!(false));
    let token = str_field(&body, "token").to_owned();
    assert!(!token.is_empty());

    let res = app
        .get(None, &format!("/auth/callback?token={token}"))
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::SEE_OTHER);
    assert_eq!(res.headers()[header::LOCATION], "/");
    let cookie = res.headers()[header::SET_COOKIE].to_str()?.to_owned();
    let session = cookie
        .split(';')
        .next()
        .context("empty cookie")?
        .to_owned();
    assert!(session.starts_with("aikya_session="));

    let res = app
        .client
        .get(app.url("/api/auth/session"))
        .header(header::COOKIE, &session)
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await?;
    assert_eq!(body["profile"]["email"], json!("linked@aikya.test"));

    let res = app
        .get(None, &format!("/auth/callback?token={token}"))
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn publish_toggle_keeps_published_at() -> Result<()> {
    let app = TestApp::spawn().await?;
    let admin = app.admin().await?;

    let draft = app
        .post_json(&admin, "/api/admin/stories", json!({ "title": "A Kind Stranger" }))
        .await?;
    assert_eq!(draft["is_published"], json!(false));
    assert!(draft["published_at"].is_null());
    assert_eq!(draft["slug"], json!("a-kind-stranger"));
    let id = str_field(&draft, "id").to_owned();

    // Drafts are hidden from the public.
    let res = app.get(None, "/api/stories/a-kind-stranger").send().await?;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let publish = format!("/api/admin/stories/{id}/publish");
    let published = app.post_json(&admin, &publish, json!({ "published": true })).await?;
    assert_eq!(published["is_published"], json!(true));
    let stamp = published["published_at"].clone();
    assert!(stamp.is_string());

    let again = app.post_json(&admin, &publish, json!({ "published": true })).await?;
    assert_eq!(again["published_at"], stamp);

    let unpublished = app.post_json(&admin, &publish, json!({ "published": false })).await?;
    assert_eq!(unpublished["is_published"], json!(false));
    assert_eq!(unpublished["published_at"], stamp);

    // A second story with the same title gets a distinct slug.
    let twin = app
        .post_json(&admin, "/api/admin/stories", json!({ "title": "A Kind Stranger" }))
        .await?;
    assert_eq!(twin["slug"], json!("a-kind-stranger-2"));
    Ok(())
}

#[tokio::test]
async fn feed_paginates_and_filters() -> Result<()> {
    let app = TestApp::spawn().await?;
    let admin = app.admin().await?;

    for (title, city) in [("One", "Pune"), ("Two", "Pune"), ("Three", "Delhi")] {
        app.published_story(&admin, json!({ "title": title, "city": city, "state": "IN" }))
            .await?;
    }
    app.post_json(&admin, "/api/admin/stories", json!({ "title": "Draft" }))
        .await?;

    let first = app.get_json(None, "/api/stories?limit=2").await?;
    assert_eq!(first["stories"].as_array().map(Vec::len), Some(2));
    let cursor = str_field(&first, "cursor").to_owned();
    assert!(!cursor.is_empty());

    let second = app
        .client
        .get(app.url("/api/stories"))
        .query(&[("limit", "2"), ("cursor", cursor.as_str())])
        .send()
        .await?
        .json::<Value>()
        .await?;
    assert_eq!(second["stories"].as_array().map(Vec::len), Some(1));
    assert!(second["cursor"].is_null());

    let pune = app.get_json(None, "/api/stories?city=pune").await?;
    assert_eq!(pune["stories"].as_array().map(Vec::len), Some(2));

    let regions = app.get_json(None, "/api/regions").await?;
    assert_eq!(regions.as_array().map(Vec::len), Some(2));
    Ok(())
}

#[tokio::test]
async fn like_toggle_restores_count() -> Result<()> {
    let app = TestApp::spawn().await?;
    let admin = app.admin().await?;
    let (_, reader) = app.sign_up("reader@aikya.test").await?;
    let story = app.published_story(&admin, json!({ "title": "Liked" })).await?;
    let id = str_field(&story, "id");

    let like = format!("/api/stories/{id}/like");
    let on = app.post_json(&reader, &like, json!({})).await?;
    assert_eq!(on, json!({ "active": true, "count": 1 }));

    let detail = app.get_json(Some(&reader), "/api/stories/liked").await?;
    assert_eq!(detail["likes"], json!(1));
    assert_eq!(detail["liked"], json!(true));

    let off = app.post_json(&reader, &like, json!({})).await?;
    assert_eq!(off, json!({ "active": false, "count": 0 }));

    let save = format!("/api/stories/{id}/save");
    app.post_json(&reader, &save, json!({})).await?;
    let saves = app.get_json(Some(&reader), "/api/me/saves").await?;
    assert_eq!(saves[0]["id"], json!(id));
    Ok(())
}

#[tokio::test]
async fn flags_escalate_once_at_threshold() -> Result<()> {
    let app = TestApp::spawn().await?;
    let admin = app.admin().await?;
    let (_, author) = app.sign_up("author@aikya.test").await?;
    let story = app.published_story(&admin, json!({ "title": "Discussed" })).await?;
    let story_id = str_field(&story, "id");

    let comment = app
        .post_json(
            &author,
            &format!("/api/stories/{story_id}/comments"),
            json!({ "body": "What a lovely story" }),
        )
        .await?;
    assert_eq!(comment["status"], json!("pending"));
    let flag = format!("/api/comments/{}/flag", str_field(&comment, "id"));

    // Authors cannot flag themselves.
    let res = app.post(Some(&author), &flag).send().await?;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let mut flaggers = Vec::new();
    for i in 0..4 {
        flaggers.push(app.sign_up(&format!("flagger{i}@aikya.test")).await?.1);
    }

    let first = app.post_json(&flaggers[0], &flag, json!({ "reason": "spam" })).await?;
    assert_eq!(first["flags_count"], json!(1));
    let repeat = app.post_json(&flaggers[0], &flag, json!({ "reason": "spam" })).await?;
    assert_eq!(repeat["flags_count"], json!(1));

    let second = app.post_json(&flaggers[1], &flag, json!({})).await?;
    assert_eq!(second["status"], json!("pending"));
    assert_eq!(second["escalated"], json!(false));

    let third = app.post_json(&flaggers[2], &flag, json!({})).await?;
    assert_eq!(third["flags_count"], json!(3));
    assert_eq!(third["status"], json!("flagged"));
    assert_eq!(third["escalated"], json!(true));

    let queue = app.get_json(Some(&admin), "/api/admin/comments?status=flagged").await?;
    assert_eq!(queue.as_array().map(Vec::len), Some(1));

    // Once hidden, further flags only add to the count.
    let moderate = format!("/api/admin/comments/{}/moderate", str_field(&comment, "id"));
    app.post_json(&admin, &moderate, json!({ "action": "hide" })).await?;
    let fourth = app.post_json(&flaggers[3], &flag, json!({})).await?;
    assert_eq!(fourth["flags_count"], json!(4));
    assert_eq!(fourth["status"], json!("hidden"));
    assert_eq!(fourth["escalated"], json!(false));
    Ok(())
}

#[tokio::test]
async fn moderation_approves_and_bans() -> Result<()> {
    let app = TestApp::spawn().await?;
    let admin = app.admin().await?;
    let (_, author) = app.sign_up("author@aikya.test").await?;
    let story = app.published_story(&admin, json!({ "title": "Moderated" })).await?;
    let comments = format!("/api/stories/{}/comments", str_field(&story, "id"));

    let first = app.post_json(&author, &comments, json!({ "body": "First!" })).await?;
    let second = app.post_json(&author, &comments, json!({ "body": "Second" })).await?;
    assert_eq!(app.get_json(None, &comments).await?, json!([]));

    let approve = format!("/api/admin/comments/{}/moderate", str_field(&first, "id"));
    let approved = app.post_json(&admin, &approve, json!({ "action": "approve" })).await?;
    assert_eq!(approved["comment"]["status"], json!("approved"));

    let visible = app.get_json(None, &comments).await?;
    assert_eq!(visible.as_array().map(Vec::len), Some(1));

    let karma = app.get_json(Some(&author), "/api/karma").await?;
    assert_eq!(karma["profile"]["total_points"], json!(2));

    let ban = format!("/api/admin/comments/{}/moderate", str_field(&second, "id"));
    let banned = app.post_json(&admin, &ban, json!({ "action": "ban_user" })).await?;
    assert_eq!(banned["hidden_comments"], json!(2));
    assert_eq!(app.get_json(None, &comments).await?, json!([]));

    // Banned users keep read access but cannot post.
    assert_eq!(app.get(Some(&author), "/api/profile").send().await?.status(), StatusCode::OK);
    let res = app
        .post(Some(&author), &comments)
        .json(&json!({ "body": "Let me back in" }))
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::FORBIDDEN);

    let res = app
        .post(Some(&admin), &comments)
        .json(&json!({ "body": "   " }))
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn certificate_requires_verified_act() -> Result<()> {
    let app = TestApp::spawn().await?;
    let admin = app.admin().await?;
    let (_, doer) = app.sign_up("doer@aikya.test").await?;
    let (_, stranger) = app.sign_up("stranger@aikya.test").await?;

    let res = app
        .post(Some(&doer), "/api/good-acts")
        .json(&json!({ "title": "Too good", "level": 6 }))
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let act = app
        .post_json(
            &doer,
            "/api/good-acts",
            json!({ "title": "Cleaned the lake shore", "level": 3, "city": "Pune" }),
        )
        .await?;
    assert_eq!(act["status"], json!("under_review"));
    let id = str_field(&act, "id").to_owned();

    app.post_json(
        &doer,
        &format!("/api/good-acts/{id}/proofs"),
        json!({ "kind": "link", "url": "https://example.com/lake" }),
    )
    .await?;

    // Unverified acts are private to their owner and admins.
    let res = app.get(Some(&stranger), &format!("/api/good-acts/{id}")).send().await?;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let certificate = format!("/api/admin/good-acts/{id}/certificate");
    let res = app.post(Some(&admin), &certificate).send().await?;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let verify = format!("/api/admin/good-acts/{id}/verify");
    let unchanged = app
        .post_json(&admin, &verify, json!({ "verdict": "inconclusive" }))
        .await?;
    assert_eq!(unchanged["status"], json!("under_review"));

    let verified = app
        .post_json(&admin, &verify, json!({ "verdict": "confirm", "note": "photos check out" }))
        .await?;
    assert_eq!(verified["status"], json!("verified"));

    let issued = app.post_json(&admin, &certificate, json!({})).await?;
    let url = str_field(&issued, "certificate_url").to_owned();
    assert!(url.ends_with(&format!("/storage/certificates/{id}.svg")));
    assert!(issued["certificate_issued_at"].is_string());

    let svg = app.client.get(&url).send().await?.text().await?;
    assert!(svg.contains("Cleaned the lake shore"));

    let public = app.get_json(Some(&stranger), &format!("/api/good-acts/{id}")).await?;
    assert_eq!(public["proofs"].as_array().map(Vec::len), Some(1));
    assert_eq!(public["verifications"].as_array().map(Vec::len), Some(2));

    let karma = app.get_json(Some(&doer), "/api/karma").await?;
    assert_eq!(karma["profile"]["total_points"], json!(25));
    Ok(())
}

#[tokio::test]
async fn support_match_lifecycle() -> Result<()> {
    let app = TestApp::spawn().await?;
    let (_, requester) = app.sign_up("requester@aikya.test").await?;
    let (_, helper) = app.sign_up("helper@aikya.test").await?;

    let request = app
        .post_json(
            &requester,
            "/api/support/requests",
            json!({ "title": "Need groceries", "city": "Pune", "category": "food" }),
        )
        .await?;
    let request_id = str_field(&request, "id").to_owned();

    let open = app.get_json(None, "/api/support/requests?city=Pune").await?;
    assert_eq!(open.as_array().map(Vec::len), Some(1));

    let res = app
        .post(Some(&requester), "/api/support/matches")
        .json(&json!({ "request_id": request_id }))
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let proposal = app
        .post_json(
            &helper,
            "/api/support/matches",
            json!({ "request_id": request_id, "message": "I can shop on Sunday" }),
        )
        .await?;
    assert_eq!(proposal["status"], json!("pending"));
    let match_id = str_field(&proposal, "id").to_owned();

    // Completing a pending match is not allowed.
    let complete = format!("/api/support/matches/{match_id}/complete");
    let res = app.post(Some(&helper), &complete).send().await?;
    assert_eq!(res.status(), StatusCode::CONFLICT);

    let accept = format!("/api/support/matches/{match_id}/accept");
    let res = app.post(Some(&helper), &accept).send().await?;
    assert_eq!(res.status(), StatusCode::FORBIDDEN);

    let accepted = app.post_json(&requester, &accept, json!({})).await?;
    assert_eq!(accepted["status"], json!("accepted"));
    let request = app
        .get_json(None, &format!("/api/support/requests/{request_id}"))
        .await?;
    assert_eq!(request["status"], json!("matched"));

    let res = app
        .post(Some(&requester), &format!("/api/support/matches/{match_id}/decline"))
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::CONFLICT);

    let completed = app.post_json(&helper, &complete, json!({})).await?;
    assert_eq!(completed["status"], json!("completed"));

    let request = app
        .get_json(None, &format!("/api/support/requests/{request_id}"))
        .await?;
    assert_eq!(request["status"], json!("closed"));

    let mine = app.get_json(Some(&requester), "/api/support/matches").await?;
    assert_eq!(mine.as_array().map(Vec::len), Some(1));

    let karma = app.get_json(Some(&helper), "/api/karma").await?;
    assert_eq!(karma["profile"]["total_points"], json!(15));
    Ok(())
}

#[tokio::test]
async fn karma_check_in_is_daily() -> Result<()> {
    let app = TestApp::spawn().await?;
    let (_, user) = app.sign_up("streaker@aikya.test").await?;

    let first = app.post_json(&user, "/api/karma/check-in", json!({})).await?;
    assert_eq!(first["awarded"], json!(5));
    assert_eq!(first["profile"]["streak_days"], json!(1));

    let second = app.post_json(&user, "/api/karma/check-in", json!({})).await?;
    assert_eq!(second["awarded"], json!(0));
    assert_eq!(second["already_checked_in"], json!(true));

    let ledger = app.get_json(Some(&user), "/api/karma/ledger").await?;
    assert_eq!(ledger.as_array().map(Vec::len), Some(1));

    let goal = app
        .post_json(&user, "/api/karma/goals", json!({ "title": "Call a friend", "target_count": 1 }))
        .await?;
    let progress = format!("/api/karma/goals/{}/progress", str_field(&goal, "id"));
    let done = app.post_json(&user, &progress, json!({})).await?;
    assert!(done["completed_at"].is_string());

    let summary = app.get_json(Some(&user), "/api/karma").await?;
    assert_eq!(summary["profile"]["total_points"], json!(15));
    assert_eq!(summary["level_name"], json!("Seedling"));
    assert!(!str_field(&summary, "tip").is_empty());

    let board = app.get_json(None, "/api/karma/leaderboard").await?;
    assert_eq!(board[0]["total_points"], json!(15));
    Ok(())
}

#[tokio::test]
async fn feeds_escape_and_skip_drafts() -> Result<()> {
    let app = TestApp::spawn().await?;
    let admin = app.admin().await?;
    app.published_story(&admin, json!({ "title": "Tom & Jerry <3", "dek": "Friends \"forever\"" }))
        .await?;
    app.post_json(&admin, "/api/admin/stories", json!({ "title": "Unreleased draft" }))
        .await?;

    let res = app.get(None, "/rss.xml").send().await?;
    assert_eq!(res.status(), StatusCode::OK);
    assert!(res.headers()[header::CONTENT_TYPE]
        .to_str()?
        .starts_with("application/rss+xml"));
    let rss = res.text().await?;
    assert!(rss.contains("Tom &amp; Jerry &lt;3"));
    assert!(rss.contains("Friends &quot;forever&quot;"));
    assert!(!rss.contains("Unreleased draft"));

    let atom = app.get(None, "/atom.xml").send().await?.text().await?;
    assert_eq!(atom.matches("<entry>").count(), 1);

    let sitemap = app.get(None, "/sitemap.xml").send().await?.text().await?;
    assert!(sitemap.contains("/stories/tom-jerry-3</loc>"));
    Ok(())
}

#[tokio::test]
async fn submissions_become_drafts() -> Result<()> {
    let app = TestApp::spawn().await?;
    let admin = app.admin().await?;

    let submission = app
        .post(None, "/api/submissions")
        .json(&json!({
            "name": "Meera",
            "email": "meera@example.com",
            "title": "Neighbours rebuilt a school",
            "summary": "After the floods the whole street helped.",
            "link": "https://example.com/school",
        }))
        .send()
        .await?
        .json::<Value>()
        .await?;
    assert_eq!(submission["status"], json!("pending"));
    let id = str_field(&submission, "id").to_owned();

    let queue = app.get_json(Some(&admin), "/api/admin/submissions").await?;
    assert_eq!(queue.as_array().map(Vec::len), Some(1));

    let accepted = app
        .post_json(&admin, &format!("/api/admin/submissions/{id}/accept"), json!({}))
        .await?;
    assert_eq!(accepted["submission"]["status"], json!("accepted"));
    assert_eq!(accepted["story"]["is_published"], json!(false));
    assert_eq!(accepted["story"]["title"], json!("Neighbours rebuilt a school"));

    let res = app
        .post(Some(&admin), &format!("/api/admin/submissions/{id}/reject"))
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::CONFLICT);
    Ok(())
}

#[tokio::test]
async fn import_reports_per_item_errors() -> Result<()> {
    let app = TestApp::spawn().await?;
    let admin = app.admin().await?;

    let out = app
        .post_json(
            &admin,
            "/api/admin/stories/import",
            json!([{ "title": "Imported" }, { "dek": "no title" }, { "title": "Bad", "slug": "Not A Slug" }]),
        )
        .await?;
    assert_eq!(out["created"].as_array().map(Vec::len), Some(1));
    assert_eq!(out["errors"][0]["index"], json!(1));
    assert_eq!(out["errors"][1]["index"], json!(2));
    Ok(())
}

#[tokio::test]
async fn search_by_keyword_and_vector() -> Result<()> {
    let app = TestApp::spawn_with(true).await?;
    let admin = app.admin().await?;

    let trees = app
        .published_story(&admin, json!({ "title": "Planting trees in Pune", "what": "A tree for every child" }))
        .await?;
    app.published_story(&admin, json!({ "title": "Community food drive", "what": "Free food" }))
        .await?;

    let keyword = app.get_json(None, "/api/search?q=drive").await?;
    assert_eq!(keyword["mode"], json!("keyword"));
    assert_eq!(keyword["stories"][0]["title"], json!("Community food drive"));

    let vector = app.get_json(None, "/api/search?q=tree&mode=vector").await?;
    assert_eq!(vector["mode"], json!("vector"));
    assert_eq!(vector["stories"][0]["id"], trees["id"]);

    // The backfill recomputes anything missing.
    sqlx::query("UPDATE stories SET embedding = NULL")
        .execute(&app.db)
        .await?;
    let res = app.post(None, "/api/cron/embeddings").send().await?;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let report = app
        .post(Some(CRON_SECRET), "/api/cron/embeddings")
        .send()
        .await?
        .json::<Value>()
        .await?;
    assert_eq!(report["processed"], json!(2));
    assert_eq!(report["failed"], json!(0));
    assert_eq!(report["remaining"], json!(0));
    Ok(())
}

#[tokio::test]
async fn vector_search_falls_back_without_embeddings() -> Result<()> {
    let app = TestApp::spawn().await?;
    let admin = app.admin().await?;
    app.published_story(&admin, json!({ "title": "Planting trees" })).await?;

    let out = app.get_json(None, "/api/search?q=trees&mode=vector").await?;
    assert_eq!(out["mode"], json!("keyword"));
    assert_eq!(out["stories"].as_array().map(Vec::len), Some(1));

    let res = app.post(Some(CRON_SECRET), "/api/cron/embeddings").send().await?;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn digest_reaches_subscribers() -> Result<()> {
    let app = TestApp::spawn().await?;
    let admin = app.admin().await?;
    app.published_story(&admin, json!({ "title": "Weekly highlight" })).await?;

    let res = app
        .post(None, "/api/digest/subscribe")
        .json(&json!({ "email": "fan@example.com" }))
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::OK);
    app.post(None, "/api/digest/subscribe")
        .json(&json!({ "email": "gone@example.com" }))
        .send()
        .await?;
    app.post(None, "/api/digest/unsubscribe")
        .json(&json!({ "email": "gone@example.com" }))
        .send()
        .await?;

    let res = app.post(Some("wrong"), "/api/cron/digest").send().await?;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let report = app
        .post(Some(CRON_SECRET), "/api/cron/digest")
        .send()
        .await?
        .json::<Value>()
        .await?;
    assert_eq!(report["stories"], json!(1));
    assert_eq!(report["recipients"], json!(1));
    // Email delivery is disabled in test mode.
    assert_eq!(report["sent"], json!(0));
    Ok(())
}

#[tokio::test]
async fn analytics_dashboard_counts_views() -> Result<()> {
    let app = TestApp::spawn().await?;
    let admin = app.admin().await?;
    let story = app.published_story(&admin, json!({ "title": "Popular" })).await?;

    app.get_json(None, "/api/stories/popular").await?;
    app.get_json(None, "/api/stories/popular").await?;
    let res = app
        .post(None, "/api/analytics/events")
        .json(&json!({ "kind": "page_view", "path": "/about" }))
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::NO_CONTENT);

    let dashboard = app.get_json(Some(&admin), "/api/admin/analytics").await?;
    assert_eq!(dashboard["totals"]["published_stories"], json!(1));
    assert_eq!(dashboard["totals"]["users"], json!(1));
    assert_eq!(dashboard["top_stories"][0]["story_id"], story["id"]);
    assert_eq!(dashboard["top_stories"][0]["views"], json!(2));
    assert_eq!(dashboard["events_per_day"][0]["events"], json!(3));
    Ok(())
}

#[tokio::test]
async fn partners_are_public_when_active() -> Result<()> {
    let app = TestApp::spawn().await?;
    let admin = app.admin().await?;

    let partner = app
        .post_json(
            &admin,
            "/api/admin/partners",
            json!({ "name": "Helping Hands", "website_url": "https://helpinghands.example" }),
        )
        .await?;
    app.post_json(&admin, "/api/admin/partners", json!({ "name": "Dormant", "is_active": false }))
        .await?;

    let public = app.get_json(None, "/api/partners").await?;
    assert_eq!(public.as_array().map(Vec::len), Some(1));
    assert_eq!(public[0]["name"], json!("Helping Hands"));

    let res = app
        .client
        .put(app.url(&format!("/api/admin/partners/{}", str_field(&partner, "id"))))
        .bearer_auth(&admin)
        .json(&json!({ "is_active": false }))
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(app.get_json(None, "/api/partners").await?, json!([]));
    Ok(())
}

#[tokio::test]
async fn feed_rejects_malformed_cursor() -> Result<()> {
    let app = TestApp::spawn().await?;
    let admin = app.admin().await?;
    for title in ["One", "Two", "Three"] {
        app.published_story(&admin, json!({ "title": title })).await?;
    }

    // A cursor pasted into the URL without escaping.
    let res = app
        .get(None, "/api/stories?cursor=2026-10-18T00:00:00+00:00::x")
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = app.get(None, "/api/stories?cursor=not-a-cursor").send().await?;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    // Cursors handed out by the feed work verbatim in a query string.
    let mut seen = Vec::new();
    let mut path = "/api/stories?limit=1".to_owned();
    loop {
        let page = app.get_json(None, &path).await?;
        for story in page["stories"].as_array().context("no stories")? {
            seen.push(str_field(story, "title").to_owned());
        }
        match page["cursor"].as_str() {
            Some(cursor) => path = format!("/api/stories?limit=1&cursor={cursor}"),
            None => break,
        }
    }
    seen.sort();
    assert_eq!(seen, ["One", "Three", "Two"]);
    Ok(())
}

#[tokio::test]
async fn karma_is_not_repaid_for_repeated_decisions() -> Result<()> {
    let app = TestApp::spawn().await?;
    let admin = app.admin().await?;
    let (_, author) = app.sign_up("author@aikya.test").await?;
    let story = app.published_story(&admin, json!({ "title": "Revisited" })).await?;

    let comment = app
        .post_json(
            &author,
            &format!("/api/stories/{}/comments", str_field(&story, "id")),
            json!({ "body": "Thank you for sharing" }),
        )
        .await?;
    let moderate = format!("/api/admin/comments/{}/moderate", str_field(&comment, "id"));
    for action in ["approve", "hide", "approve", "hide", "approve"] {
        app.post_json(&admin, &moderate, json!({ "action": action })).await?;
    }
    let karma = app.get_json(Some(&author), "/api/karma").await?;
    assert_eq!(karma["profile"]["total_points"], json!(2));

    let act = app
        .post_json(&author, "/api/good-acts", json!({ "title": "Planted trees", "level": 2 }))
        .await?;
    let verify = format!("/api/admin/good-acts/{}/verify", str_field(&act, "id"));
    for verdict in ["confirm", "deny", "confirm"] {
        app.post_json(&admin, &verify, json!({ "verdict": verdict })).await?;
    }
    let karma = app.get_json(Some(&author), "/api/karma").await?;
    assert_eq!(karma["profile"]["total_points"], json!(27));

    let ledger = app.get_json(Some(&author), "/api/karma/ledger").await?;
    assert_eq!(ledger.as_array().map(Vec::len), Some(2));
    Ok(())
}

#[tokio::test]
async fn accepting_one_offer_closes_the_others() -> Result<()> {
    let app = TestApp::spawn().await?;
    let (_, requester) = app.sign_up("requester@aikya.test").await?;
    let (_, first) = app.sign_up("first@aikya.test").await?;
    let (_, second) = app.sign_up("second@aikya.test").await?;

    let request = app
        .post_json(&requester, "/api/support/requests", json!({ "title": "Need a ride" }))
        .await?;
    let request_id = str_field(&request, "id").to_owned();

    let mut offers = Vec::new();
    for helper in [&first, &second] {
        let offer = app
            .post_json(helper, "/api/support/matches", json!({ "request_id": request_id }))
            .await?;
        offers.push(str_field(&offer, "id").to_owned());
    }

    let accepted = app
        .post_json(&requester, &format!("/api/support/matches/{}/accept", offers[0]), json!({}))
        .await?;
    assert_eq!(accepted["status"], json!("accepted"));

    let res = app
        .post(Some(&requester), &format!("/api/support/matches/{}/accept", offers[1]))
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::CONFLICT);

    let theirs = app.get_json(Some(&second), "/api/support/matches").await?;
    assert_eq!(theirs[0]["status"], json!("declined"));

    let request = app
        .get_json(None, &format!("/api/support/requests/{request_id}"))
        .await?;
    assert_eq!(request["status"], json!("matched"));

    app.post_json(&first, &format!("/api/support/matches/{}/complete", offers[0]), json!({}))
        .await?;
    let karma = app.get_json(Some(&first), "/api/karma").await?;
    assert_eq!(karma["profile"]["total_points"], json!(15));
    let karma = app.get_json(Some(&second), "/api/karma").await?;
    assert_eq!(karma["profile"]["total_points"], json!(0));
    Ok(())
}

#[tokio::test]
async fn drafts_cannot_be_liked_or_saved() -> Result<()> {
    let app = TestApp::spawn().await?;
    let admin = app.admin().await?;
    let (_, reader) = app.sign_up("reader@aikya.test").await?;
    let draft = app
        .post_json(&admin, "/api/admin/stories", json!({ "title": "Not yet" }))
        .await?;
    let id = str_field(&draft, "id");

    for action in ["like", "save"] {
        let res = app
            .post(Some(&reader), &format!("/api/stories/{id}/{action}"))
            .send()
            .await?;
        assert_eq!(res.status(), StatusCode::NOT_FOUND, "{action}");
    }

    let saves = app.get_json(Some(&reader), "/api/me/saves").await?;
    assert_eq!(saves, json!([]));
    Ok(())
}

#[tokio::test]
async fn unknown_enum_values_are_bad_requests() -> Result<()> {
    let app = TestApp::spawn().await?;
    let admin = app.admin().await?;
    let (_, author) = app.sign_up("author@aikya.test").await?;
    let story = app.published_story(&admin, json!({ "title": "Strict" })).await?;
    let comment = app
        .post_json(
            &author,
            &format!("/api/stories/{}/comments", str_field(&story, "id")),
            json!({ "body": "Hello" }),
        )
        .await?;
    let act = app
        .post_json(&author, "/api/good-acts", json!({ "title": "Fed strays", "level": 1 }))
        .await?;

    let cases = [
        (
            format!("/api/admin/comments/{}/moderate", str_field(&comment, "id")),
            json!({ "action": "explode" }),
        ),
        (
            format!("/api/admin/good-acts/{}/verify", str_field(&act, "id")),
            json!({ "verdict": "maybe" }),
        ),
    ];
    for (path, body) in cases {
        let res = app.post(Some(&admin), &path).json(&body).send().await?;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST, "{path}");
    }

    let res = app
        .post(Some(&admin), "/api/admin/stories")
        .header(header::CONTENT_TYPE, "application/json")
        .body("{ not json")
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn held_job_lock_is_a_conflict() -> Result<()> {
    let app = TestApp::spawn().await?;

    let held = crate::jobs::try_acquire(
        &app.db,
        crate::jobs::DIGEST_JOB,
        chrono::Utc::now(),
        chrono::Duration::minutes(10),
    )
    .await?;
    assert!(held);

    let res = app.post(Some(CRON_SECRET), "/api/cron/digest").send().await?;
    assert_eq!(res.status(), StatusCode::CONFLICT);

    crate::jobs::release(&app.db, crate::jobs::DIGEST_JOB, "ok").await?;
    let res = app.post(Some(CRON_SECRET), "/api/cron/digest").send().await?;
    assert_eq!(res.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn flagging_a_flagged_comment_does_not_escalate_again() -> Result<()> {
    let app = TestApp::spawn().await?;
    let admin = app.admin().await?;
    let (_, author) = app.sign_up("author@aikya.test").await?;
    let story = app.published_story(&admin, json!({ "title": "Heated" })).await?;
    let comment = app
        .post_json(
            &author,
            &format!("/api/stories/{}/comments", str_field(&story, "id")),
            json!({ "body": "Strong opinions" }),
        )
        .await?;
    let flag = format!("/api/comments/{}/flag", str_field(&comment, "id"));

    let mut last = Value::Null;
    for i in 0..4 {
        let (_, flagger) = app.sign_up(&format!("flagger{i}@aikya.test")).await?;
        last = app.post_json(&flagger, &flag, json!({})).await?;
    }
    assert_eq!(last["flags_count"], json!(4));
    assert_eq!(last["status"], json!("flagged"));
    assert_eq!(last["escalated"], json!(false));
    Ok(())
}
