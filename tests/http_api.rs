use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt as _;
use serde_json::Value;
use tower::ServiceExt as _;

use booksmith::app::dispatcher::{InProcessStageDispatcher, StageDispatcher};
use booksmith::app::queue::StageQueue;
use booksmith::app::server::{AppState, build_router};
use booksmith::generator::{ContentGenerator, GeneratorError, NoopGenerator};
use booksmith::orchestrator::GenerationOrchestrator;
use booksmith::progress::ProgressReporter;
use booksmith::rate_limit::{InMemoryRateLimiter, Quota, RateLimitPolicy, RateLimiter};
use booksmith::store::{ChapterStore, EbookStore, MemoryStore};

/// Router with manual stage chaining so each request's effect is
/// observable in isolation.
fn test_router(policy: RateLimitPolicy) -> Router {
    router_with(policy, false)
}

fn router_with(policy: RateLimitPolicy, auto_advance: bool) -> Router {
    make_router(policy, auto_advance, Arc::new(NoopGenerator))
}

fn make_router(
    policy: RateLimitPolicy,
    auto_advance: bool,
    generator: Arc<dyn ContentGenerator>,
) -> Router {
    let store = Arc::new(MemoryStore::new());
    let ebooks: Arc<dyn EbookStore> = store.clone();
    let chapters: Arc<dyn ChapterStore> = store;
    let orchestrator = Arc::new(GenerationOrchestrator::new(
        Arc::clone(&ebooks),
        Arc::clone(&chapters),
        Arc::clone(&generator),
    ));
    let reporter = Arc::new(ProgressReporter::new(
        Arc::clone(&ebooks),
        Arc::clone(&chapters),
    ));
    let dispatcher: Arc<dyn StageDispatcher> = Arc::new(InProcessStageDispatcher::new(
        StageQueue::new(1),
        Arc::clone(&orchestrator),
        auto_advance,
    ));
    let limiter: Arc<dyn RateLimiter> = Arc::new(InMemoryRateLimiter::new());

    build_router(AppState {
        ebooks,
        chapters,
        orchestrator,
        reporter,
        dispatcher,
        limiter,
        policy,
        generator,
        auto_advance,
    })
}

/// Title generation fails; everything else behaves like `NoopGenerator`.
struct TitleOutageGenerator;

#[async_trait::async_trait]
impl ContentGenerator for TitleOutageGenerator {
    async fn generate_title(&self, _description: &str) -> Result<String, GeneratorError> {
        Err(GeneratorError::provider("title model offline"))
    }

    async fn generate_table_of_contents(
        &self,
        title: &str,
        description: &str,
        deadline: Duration,
    ) -> Result<Vec<String>, GeneratorError> {
        NoopGenerator
            .generate_table_of_contents(title, description, deadline)
            .await
    }

    async fn generate_chapter(
        &self,
        title: &str,
        description: &str,
        chapter_title: &str,
        previous_content: Option<&str>,
        deadline: Duration,
    ) -> Result<String, GeneratorError> {
        NoopGenerator
            .generate_chapter(title, description, chapter_title, previous_content, deadline)
            .await
    }

    async fn generate_cover_image(
        &self,
        title: &str,
        description: &str,
        aspect_ratio: &str,
        deadline: Duration,
    ) -> Result<String, GeneratorError> {
        NoopGenerator
            .generate_cover_image(title, description, aspect_ratio, deadline)
            .await
    }
}

fn generous_policy() -> RateLimitPolicy {
    let quota = Quota {
        limit: 1000,
        window: Duration::from_secs(3600),
    };
    RateLimitPolicy {
        create_ebook: quota,
        generate_toc: quota,
        generate_chapter: quota,
        generate_cover: quota,
        check_status: quota,
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value, axum::http::HeaderMap) {
    let response = router.clone().oneshot(request).await.expect("send request");
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::String(
            String::from_utf8_lossy(&bytes).to_string(),
        ))
    };
    (status, value, headers)
}

fn post_json(uri: &str, user: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("x-user-id", user)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("build request")
}

fn post_empty(uri: &str, user: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("x-user-id", user)
        .body(Body::empty())
        .expect("build request")
}

fn get_with_user(uri: &str, user: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .header("x-user-id", user)
        .body(Body::empty())
        .expect("build request")
}

async fn create_ebook(router: &Router, user: &str) -> String {
    let (status, body, _) = send(
        router,
        post_json(
            "/ebooks",
            user,
            serde_json::json!({ "description": "Explain X", "title": "X Explained" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "create failed: {body}");
    body["id"].as_str().expect("ebook id").to_string()
}

#[tokio::test]
async fn full_generation_flow_over_http() {
    let router = test_router(generous_policy());
    let ebook_id = create_ebook(&router, "u1").await;

    let (status, body, _) = send(&router, post_empty(&format!("/ebooks/{ebook_id}/toc"), "u1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "advanced");
    assert_eq!(body["status"], "generating_chapters");
    assert_eq!(body["progress"], 0);

    // NoopGenerator produces five chapters.
    let mut last = Value::Null;
    for number in 1..=5 {
        let (status, body, _) = send(
            &router,
            post_empty(&format!("/ebooks/{ebook_id}/chapters/{number}"), "u1"),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "chapter {number}: {body}");
        assert_eq!(body["outcome"], "advanced");
        last = body;
    }
    assert_eq!(last["status"], "generating_cover");
    assert_eq!(last["progress"], 100);

    let (status, body, _) =
        send(&router, post_empty(&format!("/ebooks/{ebook_id}/cover"), "u1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "completed");

    let (status, body, _) =
        send(&router, get_with_user(&format!("/ebooks/{ebook_id}/status"), "u1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "completed");
    assert_eq!(body["progress"], 100);
    assert_eq!(body["chapters"].as_array().map(Vec::len), Some(5));
    assert!(body["cover_image_url"].as_str().is_some());
}

#[tokio::test]
async fn auto_advance_completes_the_book_in_the_background() {
    let router = router_with(generous_policy(), true);
    let ebook_id = create_ebook(&router, "u1").await;

    let (status, body, _) = send(&router, post_empty(&format!("/ebooks/{ebook_id}/toc"), "u1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "advanced");

    let mut completed = false;
    for _ in 0..200 {
        let (status, body, _) = send(
            &router,
            get_with_user(&format!("/ebooks/{ebook_id}/status"), "u1"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        if body["status"] == "completed" {
            assert_eq!(body["progress"], 100);
            completed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(completed, "book never completed in the background");
}

#[tokio::test]
async fn out_of_order_chapter_is_rejected() {
    let router = test_router(generous_policy());
    let ebook_id = create_ebook(&router, "u1").await;
    send(&router, post_empty(&format!("/ebooks/{ebook_id}/toc"), "u1")).await;

    let (status, body, _) = send(
        &router,
        post_empty(&format!("/ebooks/{ebook_id}/chapters/3"), "u1"),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("chapter 3"));
}

#[tokio::test]
async fn missing_user_header_is_unauthorized() {
    let router = test_router(generous_policy());
    let request = Request::builder()
        .method("POST")
        .uri("/ebooks")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"description":"Explain X"}"#))
        .expect("build request");
    let (status, body, _) = send(&router, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].as_str().unwrap().contains("x-user-id"));
}

#[tokio::test]
async fn other_users_ebook_is_forbidden() {
    let router = test_router(generous_policy());
    let ebook_id = create_ebook(&router, "owner").await;

    let (status, _, _) = send(
        &router,
        get_with_user(&format!("/ebooks/{ebook_id}/status"), "intruder"),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _, _) = send(
        &router,
        post_empty(&format!("/ebooks/{ebook_id}/toc"), "intruder"),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn unknown_ebook_is_not_found() {
    let router = test_router(generous_policy());
    let (status, _, _) = send(&router, get_with_user("/ebooks/nope/status", "u1")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn create_quota_exhaustion_returns_429_with_headers() {
    let mut policy = generous_policy();
    policy.create_ebook = Quota {
        limit: 2,
        window: Duration::from_secs(3600),
    };
    let router = test_router(policy);

    create_ebook(&router, "u1").await;
    create_ebook(&router, "u1").await;

    let (status, body, headers) = send(
        &router,
        post_json(
            "/ebooks",
            "u1",
            serde_json::json!({ "description": "one too many" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert!(body["error"].as_str().unwrap().contains("rate limit"));
    assert_eq!(body["limit"], 2);
    assert_eq!(body["remaining"], 0);
    assert!(body["reset_at"].is_string());
    assert_eq!(headers.get("x-ratelimit-limit").unwrap(), "2");
    assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "0");
    assert!(headers.contains_key("x-ratelimit-reset"));

    // Another user's window is unaffected.
    create_ebook(&router, "u2").await;
}

#[tokio::test]
async fn quotas_are_tracked_per_action() {
    let mut policy = generous_policy();
    policy.generate_toc = Quota {
        limit: 1,
        window: Duration::from_secs(3600),
    };
    let router = test_router(policy);
    let ebook_id = create_ebook(&router, "u1").await;

    let (status, _, _) = send(&router, post_empty(&format!("/ebooks/{ebook_id}/toc"), "u1")).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _, _) = send(&router, post_empty(&format!("/ebooks/{ebook_id}/toc"), "u1")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);

    // The chapter quota is separate, so generation continues.
    let (status, _, _) = send(
        &router,
        post_empty(&format!("/ebooks/{ebook_id}/chapters/1"), "u1"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn create_without_description_is_rejected() {
    let router = test_router(generous_policy());
    let (status, body, _) = send(
        &router,
        post_json("/ebooks", "u1", serde_json::json!({ "description": "  " })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("description"));
}

#[tokio::test]
async fn untitled_create_persists_generated_title() {
    let router = test_router(generous_policy());
    let (status, body, _) = send(
        &router,
        post_json("/ebooks", "u1", serde_json::json!({ "description": "Explain X" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["title"], "A Guide to Explain X");
    let ebook_id = body["id"].as_str().expect("ebook id").to_string();

    let (status, body, _) =
        send(&router, get_with_user(&format!("/ebooks/{ebook_id}/status"), "u1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["title"], "A Guide to Explain X");
}

#[tokio::test]
async fn title_outage_falls_back_to_default_title() {
    let router = make_router(generous_policy(), false, Arc::new(TitleOutageGenerator));
    let (status, body, _) = send(
        &router,
        post_json("/ebooks", "u1", serde_json::json!({ "description": "Explain X" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["title"], "Untitled Ebook");
}

#[tokio::test]
async fn rate_limit_headers_present_on_success() {
    let router = test_router(generous_policy());
    let (status, _, headers) = send(
        &router,
        post_json(
            "/ebooks",
            "u1",
            serde_json::json!({ "description": "Explain X" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(headers.get("x-ratelimit-limit").unwrap(), "1000");
    assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "999");
}
