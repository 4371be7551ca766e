use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use jni::JNIEnv;
use jni::objects::{JObject, JString};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    InvalidSelector(String),
    #[error("{0}")]
    NoSuchElement(String),
    #[error("{0}")]
    StaleElementReference(String),
    #[error("{0}")]
    NotImplemented(String),
    #[error("{0}")]
    InvalidElementState(String),
    #[error("{0}")]
    InvalidArgument(String),
    #[error("{0}")]
    InvalidSessionId(String),
    #[error("{0}")]
    SessionNotCreated(String),
    #[error("{0}")]
    Unknown(String),
}

pub type Result<T, E = AppError> = std::result::Result<T, E>;

impl AppError {
    pub fn new(message: impl Into<String>) -> Self {
        Self::Unknown(message.into())
    }

    /// W3C WebDriver error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidSelector(_) => "invalid selector",
            Self::NoSuchElement(_) => "no such element",
            Self::StaleElementReference(_) => "stale element reference",
            Self::NotImplemented(_) => "unsupported operation",
            Self::InvalidElementState(_) => "invalid element state",
            Self::InvalidArgument(_) => "invalid argument",
            Self::InvalidSessionId(_) => "invalid session id",
            Self::SessionNotCreated(_) => "session not created",
            Self::Unknown(_) => "unknown error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidSelector(_) | Self::InvalidElementState(_) | Self::InvalidArgument(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::NoSuchElement(_) | Self::StaleElementReference(_) | Self::InvalidSessionId(_) => {
                StatusCode::NOT_FOUND
            }
            Self::NotImplemented(_) | Self::SessionNotCreated(_) | Self::Unknown(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = json!({
            "value": {
                "error": self.code(),
                "message": self.to_string(),
                "stacktrace": "",
            }
        });
        (self.status(), Json(body)).into_response()
    }
}

impl From<jni::errors::Error> for AppError {
    fn from(e: jni::errors::Error) -> Self {
        Self::new(format!("jni call failed: {e}"))
    }
}

/// Throwables followed down their cause chain at most this far.
const MAX_CAUSES: usize = 4;

/// `Throwable.toString()` of an exception and its causes.
fn describe_throwable(env: &mut JNIEnv, throwable: &JObject) -> jni::errors::Result<String> {
    let mut chain = Vec::new();
    let mut current = env.new_local_ref(throwable)?;
    while !current.is_null() && chain.len() < MAX_CAUSES {
        let text = env
            .call_method(&current, "toString", "()Ljava/lang/String;", &[])?
            .l()?;
        chain.push(String::from(env.get_string(&JString::from(text))?));
        current = env
            .call_method(&current, "getCause", "()Ljava/lang/Throwable;", &[])?
            .l()?;
    }
    Ok(chain.join("; caused by: "))
}

/// Takes and clears the pending Java exception, if any.
pub fn take_exception_message(env: &mut JNIEnv) -> Option<String> {
    if !env.exception_check().unwrap_or(false) {
        return None;
    }
    let throwable = env.exception_occurred().ok()?;
    env.exception_clear().ok();
    match describe_throwable(env, &throwable) {
        Ok(description) => Some(description),
        Err(e) => {
            env.exception_clear().ok();
            Some(format!("exception could not be described: {e}"))
        }
    }
}

pub fn jni_error(env: &mut JNIEnv, what: &str, e: jni::errors::Error) -> AppError {
    match take_exception_message(env) {
        Some(exc_msg) => AppError::new(format!("{what} failed: {exc_msg}")),
        None => AppError::new(format!("{what} failed: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifications_map_to_w3c_codes() {
        let cases = [
            (AppError::InvalidSelector("x".into()), "invalid selector", 400),
            (AppError::NoSuchElement("x".into()), "no such element", 404),
            (AppError::StaleElementReference("x".into()), "stale element reference", 404),
            (AppError::NotImplemented("x".into()), "unsupported operation", 500),
            (AppError::InvalidElementState("x".into()), "invalid element state", 400),
        ];
        for (err, code, status) in cases {
            assert_eq!(err.code(), code);
            assert_eq!(err.status().as_u16(), status);
        }
    }
}
