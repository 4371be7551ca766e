use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Path, Request, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::error::{AppError, Result};
use crate::locator::Locator;
use crate::native::UiDevice;
use crate::session::{Session, Sessions, merge_capabilities};
use crate::toast::ToastBuffer;

/// W3C web element reference key.
pub const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";
const LEGACY_ELEMENT_KEY: &str = "ELEMENT";

pub struct ServerState {
    pub device: Arc<dyn UiDevice>,
    pub toasts: Arc<ToastBuffer>,
    pub sessions: Sessions,
}

type AppState = Arc<ServerState>;

impl ServerState {
    pub fn new(device: Arc<dyn UiDevice>, toasts: Arc<ToastBuffer>) -> Self {
        Self {
            device,
            toasts,
            sessions: Sessions::default(),
        }
    }
}

#[derive(Deserialize)]
struct FindRequest {
    using: String,
    value: String,
}

#[derive(Deserialize)]
struct ValueRequest {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    value: Option<Vec<String>>,
}

impl ValueRequest {
    fn into_text(self) -> Result<String> {
        match (self.text, self.value) {
            (Some(text), _) => Ok(text),
            (None, Some(chars)) => Ok(chars.concat()),
            (None, None) => Err(AppError::InvalidArgument(
                "either 'text' or 'value' is required".to_string(),
            )),
        }
    }
}

#[derive(Deserialize)]
struct SettingsRequest {
    settings: serde_json::Map<String, Value>,
}

/// JSON request body whose rejections use the W3C error envelope.
struct JsonBody<T>(T);

impl<S, T> FromRequest<S> for JsonBody<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> std::result::Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(body)) => Ok(JsonBody(body)),
            Err(rejection) => Err(bad_body(rejection)),
        }
    }
}

fn bad_body(rejection: JsonRejection) -> AppError {
    tracing::debug!(status = %rejection.status(), "rejected request body");
    AppError::InvalidArgument(rejection.body_text())
}

fn element_ref(id: &str) -> Value {
    json!({ ELEMENT_KEY: id, LEGACY_ELEMENT_KEY: id })
}

fn value(v: impl Into<Value>) -> Json<Value> {
    Json(json!({ "value": v.into() }))
}

/// Native calls block, so each command runs on the blocking pool.
async fn blocking<T: Send + 'static>(f: impl FnOnce() -> Result<T> + Send + 'static) -> Result<T> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AppError::new(format!("command did not complete: {e}")))?
}

async fn with_session<T: Send + 'static>(
    state: &AppState,
    session_id: &str,
    f: impl FnOnce(&Session) -> Result<T> + Send + 'static,
) -> Result<T> {
    let session = state.sessions.get(session_id)?;
    blocking(move || f(&session)).await
}

// --- Route handlers ---

async fn status(State(state): State<AppState>) -> Json<Value> {
    value(json!({
        "ready": true,
        "message": "UiAutomator server is ready to accept commands",
        "build": {
            "version": env!("CARGO_PKG_VERSION"),
            "adapterVersion": state.device.adapter_version(),
        },
    }))
}

async fn create_session(
    State(state): State<AppState>,
    JsonBody(body): JsonBody<Value>,
) -> Result<Json<Value>> {
    let capabilities = merge_capabilities(&body)?;
    let session = Session::new(capabilities, state.device.clone(), state.toasts.clone())?;
    let session = state.sessions.start(session);
    Ok(value(json!({
        "sessionId": session.id,
        "capabilities": session.capabilities,
    })))
}

async fn list_sessions(State(state): State<AppState>) -> Json<Value> {
    let sessions: Vec<Value> = state
        .sessions
        .current()
        .map(|s| json!({ "id": s.id, "capabilities": s.capabilities }))
        .into_iter()
        .collect();
    value(sessions)
}

async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>> {
    state.sessions.end(&session_id)?;
    Ok(value(Value::Null))
}

async fn find(
    state: &AppState,
    session_id: &str,
    context: Option<String>,
    req: FindRequest,
    multiple: bool,
) -> Result<Json<Value>> {
    let locator = Locator::from_strategy(&req.using, &req.value)?;
    let ids = with_session(state, session_id, move |s| {
        s.find(&locator, context.as_deref(), multiple)
    })
    .await?;
    if multiple {
        Ok(value(ids.iter().map(|id| element_ref(id)).collect::<Vec<_>>()))
    } else {
        let id = ids.first().ok_or_else(|| AppError::NoSuchElement("no element found".into()))?;
        Ok(value(element_ref(id)))
    }
}

async fn find_element(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    JsonBody(req): JsonBody<FindRequest>,
) -> Result<Json<Value>> {
    find(&state, &session_id, None, req, false).await
}

async fn find_elements(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    JsonBody(req): JsonBody<FindRequest>,
) -> Result<Json<Value>> {
    find(&state, &session_id, None, req, true).await
}

async fn find_child_element(
    State(state): State<AppState>,
    Path((session_id, element_id)): Path<(String, String)>,
    JsonBody(req): JsonBody<FindRequest>,
) -> Result<Json<Value>> {
    find(&state, &session_id, Some(element_id), req, false).await
}

async fn find_child_elements(
    State(state): State<AppState>,
    Path((session_id, element_id)): Path<(String, String)>,
    JsonBody(req): JsonBody<FindRequest>,
) -> Result<Json<Value>> {
    find(&state, &session_id, Some(element_id), req, true).await
}

async fn get_attribute(
    State(state): State<AppState>,
    Path((session_id, element_id, name)): Path<(String, String, String)>,
) -> Result<Json<Value>> {
    let attr = with_session(&state, &session_id, move |s| s.attribute(&element_id, &name)).await?;
    Ok(value(attr))
}

async fn get_text(
    State(state): State<AppState>,
    Path((session_id, element_id)): Path<(String, String)>,
) -> Result<Json<Value>> {
    let text = with_session(&state, &session_id, move |s| s.text(&element_id)).await?;
    Ok(value(text))
}

async fn get_name(
    State(state): State<AppState>,
    Path((session_id, element_id)): Path<(String, String)>,
) -> Result<Json<Value>> {
    let name = with_session(&state, &session_id, move |s| s.attribute(&element_id, "class")).await?;
    Ok(value(name))
}

async fn get_rect(
    State(state): State<AppState>,
    Path((session_id, element_id)): Path<(String, String)>,
) -> Result<Json<Value>> {
    let rect = with_session(&state, &session_id, move |s| s.rect(&element_id)).await?;
    Ok(value(json!({
        "x": rect.left,
        "y": rect.top,
        "width": rect.width(),
        "height": rect.height(),
    })))
}

async fn flag(state: &AppState, session_id: &str, element_id: String, name: &'static str) -> Result<Json<Value>> {
    let attr = with_session(state, session_id, move |s| s.attribute(&element_id, name)).await?;
    Ok(value(attr.as_deref() == Some("true")))
}

async fn is_displayed(
    State(state): State<AppState>,
    Path((session_id, element_id)): Path<(String, String)>,
) -> Result<Json<Value>> {
    flag(&state, &session_id, element_id, "displayed").await
}

async fn is_enabled(
    State(state): State<AppState>,
    Path((session_id, element_id)): Path<(String, String)>,
) -> Result<Json<Value>> {
    flag(&state, &session_id, element_id, "enabled").await
}

async fn is_selected(
    State(state): State<AppState>,
    Path((session_id, element_id)): Path<(String, String)>,
) -> Result<Json<Value>> {
    flag(&state, &session_id, element_id, "selected").await
}

async fn click(
    State(state): State<AppState>,
    Path((session_id, element_id)): Path<(String, String)>,
) -> Result<Json<Value>> {
    with_session(&state, &session_id, move |s| s.click(&element_id)).await?;
    Ok(value(Value::Null))
}

async fn set_value(
    State(state): State<AppState>,
    Path((session_id, element_id)): Path<(String, String)>,
    JsonBody(req): JsonBody<ValueRequest>,
) -> Result<Json<Value>> {
    let text = req.into_text()?;
    with_session(&state, &session_id, move |s| s.set_value(&element_id, &text)).await?;
    Ok(value(Value::Null))
}

async fn clear(
    State(state): State<AppState>,
    Path((session_id, element_id)): Path<(String, String)>,
) -> Result<Json<Value>> {
    with_session(&state, &session_id, move |s| s.clear(&element_id)).await?;
    Ok(value(Value::Null))
}

async fn source(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>> {
    let xml = with_session(&state, &session_id, |s| s.page_source()).await?;
    Ok(value(xml))
}

async fn get_settings(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>> {
    let settings = state.sessions.get(&session_id)?.settings();
    let settings = serde_json::to_value(settings).map_err(|e| AppError::new(e.to_string()))?;
    Ok(value(settings))
}

async fn update_settings(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    JsonBody(req): JsonBody<SettingsRequest>,
) -> Result<Json<Value>> {
    let settings = state.sessions.get(&session_id)?.update_settings(&req.settings)?;
    let settings = serde_json::to_value(settings).map_err(|e| AppError::new(e.to_string()))?;
    Ok(value(settings))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/session", post(create_session))
        .route("/sessions", get(list_sessions))
        .route("/session/{id}", delete(delete_session))
        .route("/session/{id}/element", post(find_element))
        .route("/session/{id}/elements", post(find_elements))
        .route("/session/{id}/element/{eid}/element", post(find_child_element))
        .route("/session/{id}/element/{eid}/elements", post(find_child_elements))
        .route("/session/{id}/element/{eid}/attribute/{name}", get(get_attribute))
        .route("/session/{id}/element/{eid}/text", get(get_text))
        .route("/session/{id}/element/{eid}/name", get(get_name))
        .route("/session/{id}/element/{eid}/rect", get(get_rect))
        .route("/session/{id}/element/{eid}/displayed", get(is_displayed))
        .route("/session/{id}/element/{eid}/enabled", get(is_enabled))
        .route("/session/{id}/element/{eid}/selected", get(is_selected))
        .route("/session/{id}/element/{eid}/click", post(click))
        .route("/session/{id}/element/{eid}/value", post(set_value))
        .route("/session/{id}/element/{eid}/clear", post(clear))
        .route("/session/{id}/source", get(source))
        .route(
            "/session/{id}/appium/settings",
            get(get_settings).post(update_settings),
        )
        .layer(
            tower_http::compression::CompressionLayer::new()
                .zstd(true)
                .no_br()
                .no_gzip()
                .no_deflate(),
        )
        .with_state(state)
}
