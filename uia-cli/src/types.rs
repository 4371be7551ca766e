use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Every response body is wrapped as `{"value": ...}`.
#[derive(Deserialize)]
pub struct Envelope<T> {
    pub value: T,
}

#[derive(Deserialize)]
pub struct ErrorValue {
    pub error: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Serialize)]
pub struct NewSessionRequest {
    pub capabilities: SessionCapabilities,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCapabilities {
    pub always_match: Map<String, Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSession {
    pub session_id: String,
}

#[derive(Deserialize)]
pub struct Status {
    pub ready: bool,
    #[serde(default)]
    pub message: String,
}

#[derive(Serialize)]
pub struct FindRequest {
    pub using: String,
    pub value: String,
}

#[derive(Deserialize)]
pub struct ElementRef {
    #[serde(rename = "element-6066-11e4-a52e-4f735466cecf")]
    pub id: String,
}

#[derive(Serialize)]
pub struct ValueRequest {
    pub text: String,
}

#[derive(Serialize)]
pub struct SettingsRequest {
    pub settings: Map<String, Value>,
}
