//! The one active automation session and everything scoped to it.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::attribute::{AttrValue, Attribute, AttributeFilter, Rect};
use crate::cache::{CachedElement, DEFAULT_CACHE_SIZE, DEFAULT_LOAD_FACTOR, ElementCache};
use crate::dumper::Dumper;
use crate::error::{AppError, Result};
use crate::finder::{Finder, SearchOptions};
use crate::locator::Locator;
use crate::native::{NodeAction, UiDevice};
use crate::snapshot::{self, DEFAULT_MAX_DEPTH, SnapshotOptions};
use crate::toast::ToastBuffer;

const VENDOR_PREFIX: &str = "appium:";
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 10_000;

fn default_cache_size() -> usize {
    DEFAULT_CACHE_SIZE
}

fn default_load_factor() -> u8 {
    DEFAULT_LOAD_FACTOR
}

fn default_max_depth() -> usize {
    DEFAULT_MAX_DEPTH
}

fn default_idle_timeout() -> u64 {
    DEFAULT_IDLE_TIMEOUT_MS
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    #[serde(default)]
    pub app_package: Option<String>,
    #[serde(default)]
    pub allow_invisible_elements: bool,
    #[serde(default = "default_cache_size")]
    pub elements_cache_size: usize,
    #[serde(default = "default_load_factor")]
    pub elements_cache_load_factor: u8,
    #[serde(default)]
    pub disable_id_locator_autocompletion: bool,
    #[serde(default)]
    pub normalize_tag_names: bool,
    #[serde(default)]
    pub simple_bounds_calculation: bool,
    #[serde(default = "default_max_depth")]
    pub snapshot_max_depth: usize,
    /// Milliseconds to wait for the UI to settle before a lookup; 0 skips it.
    #[serde(default = "default_idle_timeout")]
    pub wait_for_idle_timeout: u64,
}

impl Capabilities {
    pub fn from_map(merged: &Map<String, Value>) -> Result<Capabilities> {
        let caps: Capabilities = serde_json::from_value(Value::Object(merged.clone()))
            .map_err(|e| AppError::SessionNotCreated(format!("invalid capabilities: {e}")))?;
        if caps.elements_cache_size == 0 {
            return Err(AppError::SessionNotCreated(
                "elementsCacheSize must be at least 1".to_string(),
            ));
        }
        if !(1..=100).contains(&caps.elements_cache_load_factor) {
            return Err(AppError::SessionNotCreated(format!(
                "elementsCacheLoadFactor must be within 1..=100, got {}",
                caps.elements_cache_load_factor
            )));
        }
        if caps.snapshot_max_depth == 0 {
            return Err(AppError::SessionNotCreated(
                "snapshotMaxDepth must be at least 1".to_string(),
            ));
        }
        Ok(caps)
    }
}

fn as_object<'a>(value: &'a Value, what: &str) -> Result<&'a Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| AppError::SessionNotCreated(format!("'{what}' must be an object")))
}

/// Flattens a new-session body (`alwaysMatch` plus the first `firstMatch`
/// entry, or legacy `desiredCapabilities`) and drops the `appium:` prefix.
pub fn merge_capabilities(body: &Value) -> Result<Map<String, Value>> {
    let mut merged = Map::new();
    let put = |key: &str, value: &Value, merged: &mut Map<String, Value>| -> Result<()> {
        let key = key.strip_prefix(VENDOR_PREFIX).unwrap_or(key);
        if merged.insert(key.to_string(), value.clone()).is_some() {
            return Err(AppError::SessionNotCreated(format!(
                "capability '{key}' is given more than once"
            )));
        }
        Ok(())
    };

    if let Some(caps) = body.get("capabilities") {
        let caps = as_object(caps, "capabilities")?;
        if let Some(always) = caps.get("alwaysMatch") {
            for (k, v) in as_object(always, "alwaysMatch")? {
                put(k, v, &mut merged)?;
            }
        }
        let first = caps
            .get("firstMatch")
            .and_then(Value::as_array)
            .and_then(|entries| entries.first());
        if let Some(first) = first {
            for (k, v) in as_object(first, "firstMatch")? {
                put(k, v, &mut merged)?;
            }
        }
    } else if let Some(desired) = body.get("desiredCapabilities") {
        for (k, v) in as_object(desired, "desiredCapabilities")? {
            put(k, v, &mut merged)?;
        }
    } else {
        return Err(AppError::SessionNotCreated(
            "'capabilities' are mandatory for session creation".to_string(),
        ));
    }
    Ok(merged)
}

/// Knobs a client may flip while the session runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub disable_id_locator_autocompletion: bool,
    pub normalize_tag_names: bool,
    pub simple_bounds_calculation: bool,
    pub allow_invisible_elements: bool,
    pub snapshot_max_depth: usize,
    pub wait_for_idle_timeout: u64,
}

impl Settings {
    pub fn from_capabilities(caps: &Capabilities) -> Self {
        Self {
            disable_id_locator_autocompletion: caps.disable_id_locator_autocompletion,
            normalize_tag_names: caps.normalize_tag_names,
            simple_bounds_calculation: caps.simple_bounds_calculation,
            allow_invisible_elements: caps.allow_invisible_elements,
            snapshot_max_depth: caps.snapshot_max_depth,
            wait_for_idle_timeout: caps.wait_for_idle_timeout,
        }
    }

    /// Applies every change or none of them.
    pub fn update(&mut self, changes: &Map<String, Value>) -> Result<()> {
        let mut next = self.clone();
        for (key, value) in changes {
            let flag = || {
                value.as_bool().ok_or_else(|| {
                    AppError::InvalidArgument(format!("setting '{key}' expects a boolean, got {value}"))
                })
            };
            match key.as_str() {
                "disableIdLocatorAutocompletion" => next.disable_id_locator_autocompletion = flag()?,
                "normalizeTagNames" => next.normalize_tag_names = flag()?,
                "simpleBoundsCalculation" => next.simple_bounds_calculation = flag()?,
                "allowInvisibleElements" => next.allow_invisible_elements = flag()?,
                "snapshotMaxDepth" => {
                    next.snapshot_max_depth = value
                        .as_u64()
                        .filter(|&d| d > 0)
                        .map(|d| d as usize)
                        .ok_or_else(|| {
                            AppError::InvalidArgument(format!(
                                "setting '{key}' expects a positive integer, got {value}"
                            ))
                        })?;
                }
                "waitForIdleTimeout" => {
                    next.wait_for_idle_timeout = value.as_u64().ok_or_else(|| {
                        AppError::InvalidArgument(format!(
                            "setting '{key}' expects a non-negative integer, got {value}"
                        ))
                    })?;
                }
                other => {
                    return Err(AppError::InvalidArgument(format!("unknown setting '{other}'")));
                }
            }
        }
        tracing::info!(?changes, "settings updated");
        *self = next;
        Ok(())
    }
}

pub struct Session {
    pub id: String,
    /// Merged capabilities as the client sent them.
    pub capabilities: Map<String, Value>,
    caps: Capabilities,
    settings: Mutex<Settings>,
    pub cache: ElementCache,
    device: Arc<dyn UiDevice>,
    toasts: Arc<ToastBuffer>,
}

impl Session {
    pub fn new(
        capabilities: Map<String, Value>,
        device: Arc<dyn UiDevice>,
        toasts: Arc<ToastBuffer>,
    ) -> Result<Session> {
        let caps = Capabilities::from_map(&capabilities)?;
        Ok(Session {
            id: uuid::Uuid::new_v4().to_string(),
            settings: Mutex::new(Settings::from_capabilities(&caps)),
            cache: ElementCache::new(caps.elements_cache_size, caps.elements_cache_load_factor),
            capabilities,
            caps,
            device,
            toasts,
        })
    }

    pub fn settings(&self) -> Settings {
        self.settings.lock().clone()
    }

    pub fn update_settings(&self, changes: &Map<String, Value>) -> Result<Settings> {
        let mut settings = self.settings.lock();
        settings.update(changes)?;
        Ok(settings.clone())
    }

    /// Lookup inputs as of now. Settings may change between commands, so this
    /// is taken per command.
    pub fn search_options(&self) -> SearchOptions {
        let settings = self.settings();
        SearchOptions {
            app_package: self.caps.app_package.clone(),
            disable_id_autocompletion: settings.disable_id_locator_autocompletion,
            normalize_tag_names: settings.normalize_tag_names,
            snapshot: SnapshotOptions {
                filter: AttributeFilter::all(),
                allow_invisible: settings.allow_invisible_elements,
                simple_bounds: settings.simple_bounds_calculation,
                max_depth: settings.snapshot_max_depth,
                display: self.device.display(),
                toasts: self.toasts.recent(),
            },
        }
    }

    /// Finds elements and caches them. Returns their ids; a single lookup
    /// with no match is [`AppError::NoSuchElement`].
    pub fn find(&self, locator: &Locator, context_id: Option<&str>, multiple: bool) -> Result<Vec<String>> {
        self.settle();
        let options = self.search_options();
        let finder = Finder::new(self.device.as_ref(), &options);
        let scope = match context_id {
            Some(id) => Some(self.cache.get(id, &finder)?.node),
            None => None,
        };

        let found = if multiple {
            finder.resolve(locator, scope.as_ref(), true)?
        } else {
            vec![finder.find_one(locator, scope.as_ref())?]
        };
        Ok(found
            .into_iter()
            .map(|node| {
                self.cache.add(
                    node,
                    !multiple,
                    Some(locator.clone()),
                    context_id.map(str::to_string),
                )
            })
            .collect())
    }

    pub fn element(&self, id: &str) -> Result<CachedElement> {
        let options = self.search_options();
        self.cache.get(id, &Finder::new(self.device.as_ref(), &options))
    }

    /// Waits for the UI to go idle and drops stale platform-side node data.
    fn settle(&self) {
        let timeout = self.settings.lock().wait_for_idle_timeout;
        if timeout > 0 {
            self.device.wait_for_idle(Duration::from_millis(timeout));
        }
        self.device.refresh_accessibility_cache();
    }

    pub fn page_source(&self) -> Result<String> {
        self.settle();
        let options = self.search_options();
        Dumper::new(
            self.device.as_ref(),
            None,
            options.snapshot,
            options.normalize_tag_names,
        )
        .dump_to_xml()
    }

    /// Attribute value as page source would show it. Unknown names are an
    /// invalid argument; attributes the node does not have are `None`.
    pub fn attribute(&self, id: &str, name: &str) -> Result<Option<String>> {
        let attr = Attribute::from_name(name)
            .ok_or_else(|| AppError::InvalidArgument(format!("unknown attribute '{name}'")))?;
        let element = self.element(id)?;
        let options = self.search_options();
        Ok(snapshot::attribute_of(&element.node, attr, &options.snapshot).map(|v| v.to_string()))
    }

    pub fn text(&self, id: &str) -> Result<String> {
        Ok(self.attribute(id, Attribute::Text.name())?.unwrap_or_default())
    }

    pub fn rect(&self, id: &str) -> Result<Rect> {
        let element = self.element(id)?;
        let options = self.search_options();
        match snapshot::attribute_of(&element.node, Attribute::Bounds, &options.snapshot) {
            Some(AttrValue::Rect(rect)) => Ok(rect),
            _ => Ok(element.node.bounds_in_screen()),
        }
    }

    pub fn click(&self, id: &str) -> Result<()> {
        let element = self.element(id)?;
        if !element.node.perform_action(NodeAction::Click) {
            return Err(AppError::InvalidElementState(format!(
                "click on element '{id}' was not performed"
            )));
        }
        Ok(())
    }

    /// Replaces the element's text, cut to its max length if it has one.
    pub fn set_value(&self, id: &str, text: &str) -> Result<()> {
        let element = self.element(id)?;
        let text = match element.node.max_text_length() {
            Some(max) if text.chars().count() > max => {
                tracing::warn!(element = id, max, "text is longer than the field allows, truncating");
                text.chars().take(max).collect()
            }
            _ => text.to_string(),
        };
        if !element.node.set_text(&text) {
            return Err(AppError::InvalidElementState(format!(
                "cannot set the text of element '{id}'"
            )));
        }
        Ok(())
    }

    pub fn clear(&self, id: &str) -> Result<()> {
        let element = self.element(id)?;
        if !element.node.set_text("") {
            return Err(AppError::InvalidElementState(format!(
                "cannot clear element '{id}'"
            )));
        }
        Ok(())
    }

    fn teardown(&self) {
        self.cache.clear();
        tracing::info!(session = %self.id, "session ended");
    }
}

/// Holder for the single active session.
#[derive(Default)]
pub struct Sessions {
    current: Mutex<Option<Arc<Session>>>,
}

impl Sessions {
    /// Makes `session` the active one, ending any previous session.
    pub fn start(&self, session: Session) -> Arc<Session> {
        let session = Arc::new(session);
        if let Some(old) = self.current.lock().replace(session.clone()) {
            old.teardown();
        }
        tracing::info!(session = %session.id, "session created");
        session
    }

    pub fn get(&self, id: &str) -> Result<Arc<Session>> {
        match self.current.lock().as_ref() {
            Some(session) if session.id == id => Ok(session.clone()),
            _ => Err(AppError::InvalidSessionId(format!(
                "a session is either terminated or not started ({id})"
            ))),
        }
    }

    pub fn current(&self) -> Option<Arc<Session>> {
        self.current.lock().clone()
    }

    pub fn end(&self, id: &str) -> Result<()> {
        let mut current = self.current.lock();
        match current.take() {
            Some(session) if session.id == id => {
                session.teardown();
                Ok(())
            }
            other => {
                *current = other;
                Err(AppError::InvalidSessionId(format!("no active session with id {id}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::fake::{FakeDevice, FakeNode};

    fn device() -> Arc<FakeDevice> {
        FakeDevice::new(vec![
            FakeNode::builder("android.widget.FrameLayout")
                .child(
                    FakeNode::builder("android.widget.EditText")
                        .res_id("com.example:id/name")
                        .text("old")
                        .max_text_length(5)
                        .build(),
                )
                .child(
                    FakeNode::builder("android.widget.Button")
                        .res_id("com.example:id/go")
                        .text("Go")
                        .clickable(true)
                        .build(),
                )
                .build(),
        ])
    }

    fn session(caps: Value) -> Session {
        let merged = merge_capabilities(&json!({ "capabilities": { "alwaysMatch": caps } })).unwrap();
        Session::new(merged, device(), Arc::new(ToastBuffer::new())).unwrap()
    }

    #[test]
    fn capabilities_are_merged_and_unprefixed() {
        let body = json!({
            "capabilities": {
                "alwaysMatch": { "appium:appPackage": "com.example", "platformName": "Android" },
                "firstMatch": [{ "appium:elementsCacheSize": 5 }, { "appium:elementsCacheSize": 9 }]
            }
        });
        let merged = merge_capabilities(&body).unwrap();
        assert_eq!(merged["appPackage"], "com.example");
        assert_eq!(merged["elementsCacheSize"], 5);
        let caps = Capabilities::from_map(&merged).unwrap();
        assert_eq!(caps.app_package.as_deref(), Some("com.example"));
        assert_eq!(caps.elements_cache_size, 5);
        assert_eq!(caps.elements_cache_load_factor, DEFAULT_LOAD_FACTOR);
        assert_eq!(caps.snapshot_max_depth, DEFAULT_MAX_DEPTH);

        let legacy = merge_capabilities(&json!({ "desiredCapabilities": { "appPackage": "x" } })).unwrap();
        assert_eq!(legacy["appPackage"], "x");
    }

    #[test]
    fn bad_capabilities_do_not_create_a_session() {
        let dup = json!({
            "capabilities": {
                "alwaysMatch": { "appium:appPackage": "a" },
                "firstMatch": [{ "appPackage": "b" }]
            }
        });
        assert!(matches!(merge_capabilities(&dup), Err(AppError::SessionNotCreated(_))));
        assert!(matches!(merge_capabilities(&json!({})), Err(AppError::SessionNotCreated(_))));

        let merged = merge_capabilities(&json!({
            "capabilities": { "alwaysMatch": { "appium:elementsCacheLoadFactor": 0 } }
        }))
        .unwrap();
        assert!(matches!(Capabilities::from_map(&merged), Err(AppError::SessionNotCreated(_))));
    }

    #[test]
    fn settings_update_is_all_or_nothing() {
        let session = session(json!({}));
        let err = session
            .update_settings(json!({ "normalizeTagNames": true, "bogus": 1 }).as_object().unwrap())
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument(_)));
        assert!(!session.settings().normalize_tag_names);

        let updated = session
            .update_settings(json!({ "normalizeTagNames": true, "snapshotMaxDepth": 10 }).as_object().unwrap())
            .unwrap();
        assert!(updated.normalize_tag_names);
        assert_eq!(session.search_options().snapshot.max_depth, 10);
        assert_eq!(session.settings().wait_for_idle_timeout, DEFAULT_IDLE_TIMEOUT_MS);
        session
            .update_settings(json!({ "waitForIdleTimeout": 0 }).as_object().unwrap())
            .unwrap();
        assert_eq!(session.settings().wait_for_idle_timeout, 0);
        assert!(session
            .update_settings(json!({ "allowInvisibleElements": "yes" }).as_object().unwrap())
            .is_err());
    }

    #[test]
    fn find_caches_and_qualifies_ids() {
        let session = session(json!({ "appium:appPackage": "com.example" }));
        let ids = session.find(&Locator::Id("go".into()), None, false).unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(session.text(&ids[0]).unwrap(), "Go");
        assert_eq!(
            session.attribute(&ids[0], "resource-id").unwrap().as_deref(),
            Some("com.example:id/go")
        );
        assert_eq!(session.attribute(&ids[0], "clickable").unwrap().as_deref(), Some("true"));
        assert!(matches!(session.attribute(&ids[0], "nope"), Err(AppError::InvalidArgument(_))));

        let again = session.find(&Locator::Id("go".into()), None, true).unwrap();
        assert_eq!(again, ids);

        let missing = session.find(&Locator::Id("nothing".into()), None, false).unwrap_err();
        assert!(matches!(missing, AppError::NoSuchElement(_)));
        assert!(session.find(&Locator::Id("nothing".into()), None, true).unwrap().is_empty());
    }

    #[test]
    fn element_commands() {
        let session = session(json!({}));
        let field = session
            .find(&Locator::ClassName("android.widget.EditText".into()), None, false)
            .unwrap()
            .remove(0);
        session.set_value(&field, "abcdefgh").unwrap();
        assert_eq!(session.text(&field).unwrap(), "abcde");
        session.clear(&field).unwrap();
        assert_eq!(session.text(&field).unwrap(), "");
        session.click(&field).unwrap();

        let element = session.element(&field).unwrap();
        assert!(session.rect(&field).unwrap().width() > 0);
        assert_eq!(element.node.class_name().as_deref(), Some("android.widget.EditText"));
    }

    #[test]
    fn refused_actions_are_invalid_element_state() {
        let button = FakeNode::builder("android.widget.Button").text("Go").clickable(true).build();
        let device = FakeDevice::new(vec![
            FakeNode::builder("android.widget.FrameLayout").child(button.clone()).build(),
        ]);
        let merged = merge_capabilities(&json!({ "capabilities": {} })).unwrap();
        let session = Session::new(merged, device, Arc::new(ToastBuffer::new())).unwrap();
        let id = session
            .find(&Locator::ClassName("android.widget.Button".into()), None, false)
            .unwrap()
            .remove(0);

        session.click(&id).unwrap();
        assert_eq!(button.performed(), vec![NodeAction::Click]);
        button.fail_actions();
        assert!(matches!(session.click(&id), Err(AppError::InvalidElementState(_))));
        assert!(matches!(session.set_value(&id, "x"), Err(AppError::InvalidElementState(_))));
    }

    #[test]
    fn scoped_find_sees_the_screen_after_it_settles() {
        let form = || {
            FakeNode::builder("android.widget.LinearLayout")
                .res_id("com.example:id/form")
                .child(FakeNode::builder("android.widget.Button").text("Submit").build())
                .build()
        };
        let device = FakeDevice::new(vec![form()]);
        let merged = merge_capabilities(&json!({ "capabilities": {} })).unwrap();
        let session = Session::new(merged, device.clone(), Arc::new(ToastBuffer::new())).unwrap();
        let form_id = session
            .find(&Locator::Id("com.example:id/form".into()), None, false)
            .unwrap()
            .remove(0);

        // the form is redrawn while the UI is still busy
        device.change_when_idle(vec![form()]);
        let button = session
            .find(&Locator::ClassName("android.widget.Button".into()), Some(&form_id), false)
            .unwrap()
            .remove(0);
        assert_eq!(session.text(&button).unwrap(), "Submit");
        assert!(session.element(&form_id).unwrap().node.refresh());
    }

    #[test]
    fn page_source_reports_state_flags() {
        let device = FakeDevice::new(vec![
            FakeNode::builder("android.widget.LinearLayout")
                .package("com.example.login")
                .child(
                    FakeNode::builder("android.widget.CheckBox")
                        .text("Remember me")
                        .checked(true)
                        .build(),
                )
                .child(
                    FakeNode::builder("android.widget.EditText")
                        .res_id("com.example.login:id/pin")
                        .password(true)
                        .build(),
                )
                .build(),
        ]);
        let merged = merge_capabilities(&json!({ "capabilities": {} })).unwrap();
        let session = Session::new(merged, device, Arc::new(ToastBuffer::new())).unwrap();
        let source = session.page_source().unwrap();
        assert!(source.contains(r#"package="com.example.login""#));
        assert_eq!(source.matches(r#"checked="true""#).count(), 1);
        assert_eq!(source.matches(r#"password="true""#).count(), 1);

        let pin = session
            .find(&Locator::Id("com.example.login:id/pin".into()), None, false)
            .unwrap()
            .remove(0);
        assert_eq!(session.attribute(&pin, "password").unwrap().as_deref(), Some("true"));
        assert_eq!(session.attribute(&pin, "package").unwrap().as_deref(), Some("com.example"));
    }

    #[test]
    fn page_source_includes_recent_toasts() {
        let toasts = Arc::new(ToastBuffer::new());
        let merged = merge_capabilities(&json!({ "capabilities": {} })).unwrap();
        let session = Session::new(merged, device(), toasts.clone()).unwrap();
        toasts.push("Saved");
        let source = session.page_source().unwrap();
        assert!(source.contains(r#"<android.widget.Toast"#));
        assert!(source.contains(r#"text="Saved""#));
        assert!(source.contains(r#"<hierarchy rotation="0" width="1080" height="1920">"#));
    }

    #[test]
    fn only_one_session_is_active() {
        let sessions = Sessions::default();
        let first = sessions.start(session(json!({})));
        let id = first.id.clone();
        let ids = first.find(&Locator::ClassName("android.widget.Button".into()), None, true).unwrap();
        assert_eq!(ids.len(), 1);

        let second = sessions.start(session(json!({})));
        assert!(first.cache.is_empty());
        assert!(matches!(sessions.get(&id), Err(AppError::InvalidSessionId(_))));
        assert!(sessions.get(&second.id).is_ok());
        assert!(sessions.end(&id).is_err());
        sessions.end(&second.id).unwrap();
        assert!(sessions.current().is_none());
    }
}
