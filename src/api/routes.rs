//! REST and callable endpoints.
//!
//! Callables live at `POST /callable/{name}`. Their bodies may be sent bare
//! or wrapped as `{"data": {...}}`.

use axum::body::Bytes;
use axum::extract::{FromRequest, Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::AppState;
use super::error::{ApiResult, CallableError};
use super::identity::{Caller, check_admin};
use super::ws::ws_chat_handler;
use crate::chat::Session;
use crate::forms::FormDefinition;
use crate::persona::prompt::STRICT_CONFIG_KEY;
use crate::persona::{GlobalStrictConfig, Persona};
use crate::users::persona_patch;

const DEFAULT_PAGE: usize = 50;
const MAX_PAGE: usize = 200;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/callable/upsertPersona", post(upsert_persona))
        .route("/callable/startUserAIChat", post(start_user_ai_chat))
        .route("/callable/startUserUserChat", post(start_user_user_chat))
        .route("/callable/upsertForm", post(upsert_form))
        .route("/callable/saveOnboardingStep", post(save_onboarding_step))
        .route("/callable/finalizeOnboarding", post(finalize_onboarding))
        .route("/api/chats", get(list_chats))
        .route("/api/chats/pinned", get(pinned_chat))
        .route(
            "/api/chats/{chat_id}/messages",
            get(list_messages).post(post_message),
        )
        .route("/api/onboarding/{form_id}", get(onboarding_status))
        .route("/admin/strict-config", post(publish_strict_config))
        .route("/admin/strict-config/invalidate", post(invalidate_strict_config))
        .route("/ws/chat/{chat_id}", get(ws_chat_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "lumi-backend"
    }))
}

// ── Callable bodies ─────────────────────────────────────────────────────

/// JSON body of a callable, unwrapped from an optional `data` envelope.
pub struct CallableBody<T>(pub T);

impl<S, T> FromRequest<S> for CallableBody<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = CallableError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = Bytes::from_request(req, state)
            .await
            .map_err(|e| CallableError::invalid(e.to_string()))?;
        parse_callable(&bytes).map(CallableBody)
    }
}

/// Decode raw callable bytes. An empty body reads as `{}`.
fn parse_callable<T: DeserializeOwned>(bytes: &[u8]) -> ApiResult<T> {
    let value: Value = if bytes.is_empty() {
        json!({})
    } else {
        serde_json::from_slice(bytes)
            .map_err(|e| CallableError::invalid(format!("Body is not JSON: {e}")))?
    };
    serde_json::from_value(unwrap_envelope(value)).map_err(|e| CallableError::invalid(e.to_string()))
}

fn unwrap_envelope(value: Value) -> Value {
    match value {
        Value::Object(mut map) if map.len() == 1 && map.get("data").is_some_and(Value::is_object) => {
            map.remove("data").unwrap_or_default()
        }
        other => other,
    }
}

fn required<'a>(value: &'a Option<String>, field: &str) -> ApiResult<&'a str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| CallableError::invalid(format!("{field} is required")))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatIdResponse {
    chat_id: String,
}

// ── Persona ─────────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpsertPersonaRequest {
    mbti: Option<String>,
    base_prompt: Option<String>,
    strict_prompt: Option<String>,
}

/// POST /callable/upsertPersona
async fn upsert_persona(
    State(state): State<AppState>,
    caller: Caller,
    CallableBody(req): CallableBody<UpsertPersonaRequest>,
) -> ApiResult<Json<Value>> {
    let mbti = required(&req.mbti, "mbti")?;
    let base_prompt = required(&req.base_prompt, "basePrompt")?;
    let mut persona = Persona::new(mbti, base_prompt);
    if let Some(strict) = req.strict_prompt {
        persona = persona.with_strict_prompt(strict);
    }

    state
        .db
        .merge_user_doc(&caller.uid, &persona_patch(&persona, Utc::now()))
        .await?;
    info!(uid = %caller.uid, mbti = %persona.mbti, "Persona updated");
    Ok(Json(json!({ "ok": true })))
}

// ── Chats ───────────────────────────────────────────────────────────────

/// POST /callable/startUserAIChat
async fn start_user_ai_chat(
    State(state): State<AppState>,
    caller: Caller,
) -> ApiResult<Json<ChatIdResponse>> {
    let resolved = state.resolver.start_user_ai_chat(&caller.uid).await?;
    Ok(Json(ChatIdResponse {
        chat_id: resolved.chat_id,
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartUserUserRequest {
    other_uid: Option<String>,
}

/// POST /callable/startUserUserChat
async fn start_user_user_chat(
    State(state): State<AppState>,
    caller: Caller,
    CallableBody(req): CallableBody<StartUserUserRequest>,
) -> ApiResult<Json<ChatIdResponse>> {
    let other = required(&req.other_uid, "otherUid")?;
    let resolved = state.resolver.start_user_user_chat(&caller.uid, other).await?;
    Ok(Json(ChatIdResponse {
        chat_id: resolved.chat_id,
    }))
}

#[derive(Deserialize)]
struct PageQuery {
    limit: Option<usize>,
}

impl PageQuery {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE)
    }
}

#[derive(Serialize)]
struct ChatSummary {
    #[serde(flatten)]
    session: Session,
    pinned: bool,
}

/// GET /api/chats
async fn list_chats(
    State(state): State<AppState>,
    caller: Caller,
    Query(page): Query<PageQuery>,
) -> ApiResult<Json<Vec<ChatSummary>>> {
    let sessions = state.chats.list_chats(&caller.uid, page.limit()).await?;
    Ok(Json(
        sessions
            .into_iter()
            .map(|session| ChatSummary {
                pinned: session.is_pinned_for(&caller.uid),
                session,
            })
            .collect(),
    ))
}

/// GET /api/chats/pinned
async fn pinned_chat(
    State(state): State<AppState>,
    caller: Caller,
) -> ApiResult<Json<ChatIdResponse>> {
    let resolved = state.resolver.pinned_chat(&caller.uid).await?;
    Ok(Json(ChatIdResponse {
        chat_id: resolved.chat_id,
    }))
}

/// GET /api/chats/{chat_id}/messages
async fn list_messages(
    State(state): State<AppState>,
    caller: Caller,
    Path(chat_id): Path<String>,
    Query(page): Query<PageQuery>,
) -> ApiResult<impl IntoResponse> {
    let messages = state
        .chats
        .list_messages(&caller.uid, &chat_id, page.limit())
        .await?;
    Ok(Json(messages))
}

#[derive(Deserialize)]
struct PostMessageRequest {
    text: Option<String>,
}

/// POST /api/chats/{chat_id}/messages
async fn post_message(
    State(state): State<AppState>,
    caller: Caller,
    Path(chat_id): Path<String>,
    CallableBody(req): CallableBody<PostMessageRequest>,
) -> ApiResult<impl IntoResponse> {
    let text = req.text.unwrap_or_default();
    let message = state
        .chats
        .post_user_message(&caller.uid, &chat_id, &text)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

// ── Onboarding ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpsertFormRequest {
    form_id: Option<String>,
    form: Option<Value>,
}

#[derive(Deserialize)]
struct DevBypassFlag {
    #[serde(default, rename = "__devBypass")]
    dev_bypass: bool,
}

/// POST /callable/upsertForm
///
/// Requires a caller unless dev bypass is both requested and enabled. The
/// body is only inspected for the bypass flag when no caller is present, and
/// an anonymous body that does not parse is unauthenticated.
async fn upsert_form(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let caller = state.identity.identify(&headers);
    if caller.is_none() {
        let bypass = state.allow_dev_bypass
            && parse_callable::<DevBypassFlag>(&body).is_ok_and(|flag| flag.dev_bypass);
        if !bypass {
            return Err(CallableError::Unauthenticated);
        }
    }

    let req: UpsertFormRequest = parse_callable(&body)?;
    let form_id = required(&req.form_id, "formId")?;
    let raw = req
        .form
        .ok_or_else(|| CallableError::invalid("form is required"))?;
    let form: FormDefinition = serde_json::from_value(raw)
        .map_err(|e| CallableError::invalid(format!("Invalid form: {e}")))?;

    state.onboarding.upsert_form(form_id, &form).await?;
    info!(form_id = %form_id, by = caller.as_deref().unwrap_or("dev-bypass"), "Form upserted");
    Ok(Json(json!({ "ok": true })))
}

fn empty_object() -> Value {
    json!({})
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaveStepRequest {
    form_id: Option<String>,
    step_id: Option<String>,
    #[serde(default = "empty_object")]
    answers: Value,
}

/// POST /callable/saveOnboardingStep
async fn save_onboarding_step(
    State(state): State<AppState>,
    caller: Caller,
    CallableBody(req): CallableBody<SaveStepRequest>,
) -> ApiResult<Json<Value>> {
    let form_id = required(&req.form_id, "formId")?;
    let step_id = required(&req.step_id, "stepId")?;
    let transition = state
        .onboarding
        .save_step(&caller.uid, form_id, step_id, &req.answers)
        .await?;
    Ok(Json(json!({
        "ok": true,
        "next": transition.next_step(),
        "finalize": transition.is_finalize(),
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FormIdRequest {
    form_id: Option<String>,
}

/// POST /callable/finalizeOnboarding
async fn finalize_onboarding(
    State(state): State<AppState>,
    caller: Caller,
    CallableBody(req): CallableBody<FormIdRequest>,
) -> ApiResult<Json<Value>> {
    let form_id = required(&req.form_id, "formId")?;
    let resolved = state.onboarding.finalize(&caller.uid, form_id).await?;
    Ok(Json(json!({ "ok": true, "chatId": resolved.chat_id })))
}

/// GET /api/onboarding/{form_id}
async fn onboarding_status(
    State(state): State<AppState>,
    caller: Caller,
    Path(form_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let view = state.onboarding.view(&caller.uid, &form_id).await?;
    Ok(Json(view))
}

// ── Admin ───────────────────────────────────────────────────────────────

/// POST /admin/strict-config
///
/// Store new global strict rules and drop the cached copy.
async fn publish_strict_config(
    State(state): State<AppState>,
    headers: HeaderMap,
    CallableBody(config): CallableBody<GlobalStrictConfig>,
) -> ApiResult<Json<Value>> {
    check_admin(&headers, state.admin_token.as_ref())?;
    if config.strict_prompt.trim().is_empty() || config.version == 0 {
        return Err(CallableError::invalid(
            "strictPrompt and a positive version are required",
        ));
    }
    let doc = json!({
        "strictPrompt": config.strict_prompt,
        "version": config.version,
    });
    state.db.put_config(STRICT_CONFIG_KEY, &doc).await?;
    state.prompts.invalidate().await;
    Ok(Json(json!({ "ok": true, "version": config.version })))
}

/// POST /admin/strict-config/invalidate
async fn invalidate_strict_config(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    check_admin(&headers, state.admin_token.as_ref())?;
    state.prompts.invalidate().await;
    Ok(Json(json!({ "ok": true })))
}
