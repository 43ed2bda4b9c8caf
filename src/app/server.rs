use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use tower_http::trace::TraceLayer;

use crate::app::dispatcher::{InProcessStageDispatcher, StageDispatcher};
use crate::app::queue::StageQueue;
use crate::cli::ServeArgs;
use crate::error::PipelineError;
use crate::generator::ContentGenerator;
use crate::model::Ebook;
use crate::orchestrator::{GenerationOrchestrator, StageErrorKind, StageOutcome};
use crate::progress::ProgressReporter;
use crate::rate_limit::{Action, InMemoryRateLimiter, RateLimitDecision, RateLimitPolicy, RateLimiter};
use crate::store::{ChapterStore, EbookStore, LocalFsStore};

const USER_ID_HEADER: &str = "x-user-id";
const FALLBACK_TITLE: &str = "Untitled Ebook";

#[derive(Clone)]
pub struct AppState {
    pub ebooks: Arc<dyn EbookStore>,
    pub chapters: Arc<dyn ChapterStore>,
    pub orchestrator: Arc<GenerationOrchestrator>,
    pub reporter: Arc<ProgressReporter>,
    pub dispatcher: Arc<dyn StageDispatcher>,
    pub limiter: Arc<dyn RateLimiter>,
    pub policy: RateLimitPolicy,
    pub generator: Arc<dyn ContentGenerator>,
    /// When set, a stage completed by a request hands its follow-up task
    /// to the dispatcher; when unset, clients drive every stage.
    pub auto_advance: bool,
}

pub async fn run(args: ServeArgs) -> anyhow::Result<()> {
    let generator = args.engine.build_generator()?;
    let store = Arc::new(LocalFsStore::new(&args.data_dir));
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
        StageQueue::new(args.max_concurrency),
        Arc::clone(&orchestrator),
        args.auto_advance,
    ));
    let limiter: Arc<dyn RateLimiter> = Arc::new(InMemoryRateLimiter::new());

    let state = AppState {
        ebooks,
        chapters,
        orchestrator,
        reporter,
        dispatcher,
        limiter,
        policy: RateLimitPolicy::default(),
        generator,
        auto_advance: args.auto_advance,
    };
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(args.addr)
        .await
        .map_err(|err| anyhow::anyhow!("bind {}: {err}", args.addr))?;
    tracing::info!(addr = %args.addr, auto_advance = args.auto_advance, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(%err, "install ctrl-c handler");
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok\n" }))
        .route("/ebooks", post(create_ebook))
        .route("/ebooks/:ebook_id/toc", post(generate_toc))
        .route("/ebooks/:ebook_id/chapters/:number", post(generate_chapter))
        .route("/ebooks/:ebook_id/cover", post(generate_cover))
        .route("/ebooks/:ebook_id/status", get(ebook_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// HTTP-shaped error. Carries the rate limit decision on 429 so clients
/// see the window headers.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    decision: Option<RateLimitDecision>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            decision: None,
        }
    }

    fn unauthenticated() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            format!("{USER_ID_HEADER} header is required"),
        )
    }

    fn internal() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
    }

    fn rate_limited(decision: RateLimitDecision) -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            message: "rate limit exceeded".to_string(),
            decision: Some(decision),
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Validation(message) => Self::new(StatusCode::BAD_REQUEST, message),
            PipelineError::Unauthorized => {
                Self::new(StatusCode::FORBIDDEN, "caller does not own this resource")
            }
            PipelineError::NotFound(what) => {
                Self::new(StatusCode::NOT_FOUND, format!("{what} not found"))
            }
            PipelineError::RateLimited(decision) => Self::rate_limited(decision),
            PipelineError::Persistence(err) => {
                tracing::error!(err = ?err, "persistence failure");
                Self::internal()
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = serde_json::json!({ "error": self.message });
        if let Some(decision) = &self.decision {
            body["limit"] = decision.limit.into();
            body["remaining"] = decision.remaining.into();
            body["reset_at"] = serde_json::json!(decision.reset_at);
        }
        let mut response = (self.status, Json(body)).into_response();
        if let Some(decision) = &self.decision {
            apply_rate_limit_headers(response.headers_mut(), decision);
        }
        response
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateEbookRequest {
    #[serde(default)]
    pub title: Option<String>,
    pub description: String,
}

async fn create_ebook(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateEbookRequest>,
) -> Result<Response, ApiError> {
    let user_id = require_user(&headers)?;
    let decision = check_rate_limit(&state, Action::CreateEbook, &user_id).await?;

    let description = req.description.trim().to_string();
    if description.is_empty() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "description is required",
        ));
    }

    let title = match req.title.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()) {
        Some(title) => title,
        None => match state.generator.generate_title(&description).await {
            Ok(title) => title,
            Err(err) => {
                tracing::warn!(%err, "title generation failed, using fallback");
                FALLBACK_TITLE.to_string()
            }
        },
    };

    let ebook = Ebook::new(user_id, title, description);
    state
        .ebooks
        .create(&ebook)
        .await
        .map_err(|err| ApiError::from(PipelineError::Persistence(err)))?;

    tracing::info!(ebook_id = %ebook.id, user_id = %ebook.user_id, "ebook created");
    let mut response = (StatusCode::CREATED, Json(ebook)).into_response();
    apply_rate_limit_headers(response.headers_mut(), &decision);
    Ok(response)
}

async fn generate_toc(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(ebook_id): Path<String>,
) -> Result<Response, ApiError> {
    let user_id = require_user(&headers)?;
    let decision = check_rate_limit(&state, Action::GenerateToc, &user_id).await?;
    load_owned(&state, &ebook_id, &user_id).await?;

    let outcome = state.orchestrator.run_toc_stage(&ebook_id).await?;
    dispatch_next(&state, &outcome).await;
    Ok(outcome_response(outcome, &decision))
}

async fn generate_chapter(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((ebook_id, number)): Path<(String, u32)>,
) -> Result<Response, ApiError> {
    let user_id = require_user(&headers)?;
    let decision = check_rate_limit(&state, Action::GenerateChapter, &user_id).await?;
    load_owned(&state, &ebook_id, &user_id).await?;

    let outcome = state.orchestrator.run_chapter_stage(&ebook_id, number).await?;
    dispatch_next(&state, &outcome).await;
    Ok(outcome_response(outcome, &decision))
}

async fn generate_cover(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(ebook_id): Path<String>,
) -> Result<Response, ApiError> {
    let user_id = require_user(&headers)?;
    let decision = check_rate_limit(&state, Action::GenerateCover, &user_id).await?;
    load_owned(&state, &ebook_id, &user_id).await?;

    let outcome = state.orchestrator.run_cover_stage(&ebook_id).await?;
    dispatch_next(&state, &outcome).await;
    Ok(outcome_response(outcome, &decision))
}

async fn ebook_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(ebook_id): Path<String>,
) -> Result<Response, ApiError> {
    let user_id = require_user(&headers)?;
    let decision = check_rate_limit(&state, Action::CheckStatus, &user_id).await?;
    load_owned(&state, &ebook_id, &user_id).await?;

    let report = state.reporter.report(&ebook_id).await?;
    let mut response = (StatusCode::OK, Json(report)).into_response();
    apply_rate_limit_headers(response.headers_mut(), &decision);
    Ok(response)
}

fn require_user(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(ApiError::unauthenticated)
}

async fn check_rate_limit(
    state: &AppState,
    action: Action,
    user_id: &str,
) -> Result<RateLimitDecision, ApiError> {
    let quota = state.policy.quota(action);
    let decision = state
        .limiter
        .check(&action.identifier(user_id), quota.limit, quota.window)
        .await
        .map_err(|err| {
            tracing::error!(%err, "rate limiter failure");
            ApiError::internal()
        })?;
    if !decision.allowed {
        return Err(ApiError::rate_limited(decision));
    }
    Ok(decision)
}

async fn load_owned(state: &AppState, ebook_id: &str, user_id: &str) -> Result<Ebook, ApiError> {
    let ebook = state
        .ebooks
        .get(ebook_id)
        .await
        .map_err(|err| ApiError::from(PipelineError::Persistence(err)))?
        .ok_or_else(|| ApiError::from(PipelineError::NotFound("ebook")))?;
    if ebook.user_id != user_id {
        return Err(PipelineError::Unauthorized.into());
    }
    Ok(ebook)
}

async fn dispatch_next(state: &AppState, outcome: &StageOutcome) {
    if !state.auto_advance {
        return;
    }
    if let Some(next) = outcome.next_task() {
        if let Err(err) = state.dispatcher.dispatch(next.clone()).await {
            tracing::error!(task = ?next, %err, "dispatch of follow-up stage failed");
        }
    }
}

fn outcome_response(outcome: StageOutcome, decision: &RateLimitDecision) -> Response {
    let status = match outcome.error_kind() {
        Some(StageErrorKind::TimedOut) => StatusCode::REQUEST_TIMEOUT,
        Some(StageErrorKind::Provider) => StatusCode::BAD_GATEWAY,
        None => StatusCode::OK,
    };
    let mut response = (status, Json(outcome)).into_response();
    apply_rate_limit_headers(response.headers_mut(), decision);
    response
}

fn apply_rate_limit_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    let values = [
        ("x-ratelimit-limit", decision.limit.to_string()),
        ("x-ratelimit-remaining", decision.remaining.to_string()),
        ("x-ratelimit-reset", decision.reset_at.timestamp().to_string()),
    ];
    for (name, value) in values {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_header_is_required_and_trimmed() {
        let mut headers = HeaderMap::new();
        assert!(require_user(&headers).is_err());

        headers.insert(USER_ID_HEADER, HeaderValue::from_static("  "));
        assert!(require_user(&headers).is_err());

        headers.insert(USER_ID_HEADER, HeaderValue::from_static(" user-7 "));
        assert_eq!(require_user(&headers).unwrap(), "user-7");
    }

    #[test]
    fn rate_limit_headers_round_numbers() {
        let decision = RateLimitDecision {
            allowed: true,
            limit: 10,
            remaining: 9,
            reset_at: chrono::Utc::now(),
        };
        let mut headers = HeaderMap::new();
        apply_rate_limit_headers(&mut headers, &decision);
        assert_eq!(headers.get("x-ratelimit-limit").unwrap(), "10");
        assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "9");
        assert!(headers.contains_key("x-ratelimit-reset"));
    }
}
