//! [`UiDevice`] and [`AxNode`] over JNI.
//!
//! Nodes are plain `android.view.accessibility.AccessibilityNodeInfo` objects
//! and only their public methods are called. Window roots, display metrics and
//! idling come from the instrumentation-side bridge object handed to
//! `nativeRun(bridge, port)`, which must provide:
//!
//! ```text
//! AccessibilityNodeInfo[] getWindowRoots()
//! int getDisplayRotation()
//! int getDisplayWidth()
//! int getDisplayHeight()
//! void clearAccessibilityCache()
//! boolean waitForIdle(long idleTimeoutMs, long globalTimeoutMs)
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use jni::objects::{GlobalRef, JObject, JObjectArray, JString, JValue, JValueOwned};
use jni::{JNIEnv, JavaVM};

use crate::attribute::Rect;
use crate::error::{Result, jni_error};
use crate::native::{AxNode, DisplayInfo, NodeAction, NodeHandle, NodeIdentity, UiDevice};

const ACTION_FOCUS: i32 = 0x0000_0001;
const ACTION_CLICK: i32 = 0x0000_0010;
const ACTION_LONG_CLICK: i32 = 0x0000_0020;
const ACTION_SET_TEXT: i32 = 0x0020_0000;
const SET_TEXT_ARGUMENT: &str = "ACTION_ARGUMENT_SET_TEXT_CHARSEQUENCE";

const CHAR_SEQUENCE: &str = "()Ljava/lang/CharSequence;";
const NODE_INFO: &str = "()Landroid/view/accessibility/AccessibilityNodeInfo;";

/// Runs `f` on this thread's JNI env inside a fresh local frame.
fn with_env<T>(vm: &JavaVM, f: impl FnOnce(&mut JNIEnv) -> Result<T>) -> Result<T> {
    let mut env = vm.attach_current_thread_permanently()?;
    env.with_local_frame(32, |env| f(env))
}

fn call<'local>(
    env: &mut JNIEnv<'local>,
    obj: &JObject,
    method: &str,
    sig: &str,
    args: &[JValue],
) -> Result<JValueOwned<'local>> {
    env.call_method(obj, method, sig, args)
        .map_err(|e| jni_error(env, method, e))
}

fn char_sequence(env: &mut JNIEnv, obj: &JObject, method: &str) -> Result<Option<String>> {
    let seq = call(env, obj, method, CHAR_SEQUENCE, &[])?.l()?;
    if seq.is_null() {
        return Ok(None);
    }
    let s: JString = call(env, &seq, "toString", "()Ljava/lang/String;", &[])?
        .l()?
        .into();
    Ok(Some(env.get_string(&s)?.into()))
}

fn read_rect(env: &mut JNIEnv, rect: &JObject) -> Result<Rect> {
    let mut side = |name: &str| -> Result<i32> { Ok(env.get_field(rect, name, "I")?.i()?) };
    Ok(Rect::new(side("left")?, side("top")?, side("right")?, side("bottom")?))
}

fn new_rect<'local>(env: &mut JNIEnv<'local>) -> Result<JObject<'local>> {
    Ok(env.new_object("android/graphics/Rect", "()V", &[])?)
}

pub struct JniNode {
    vm: Arc<JavaVM>,
    info: GlobalRef,
    identity: NodeIdentity,
}

impl fmt::Debug for JniNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JniNode")
            .field("identity", &self.identity)
            .finish()
    }
}

impl JniNode {
    /// Wraps a local `AccessibilityNodeInfo`. Null gives None.
    fn wrap(vm: &Arc<JavaVM>, env: &mut JNIEnv, obj: &JObject) -> Result<Option<NodeHandle>> {
        if obj.is_null() {
            return Ok(None);
        }
        // equals()/hashCode() of a node info are keyed on window and source node
        let window_id = call(env, obj, "getWindowId", "()I", &[])?.i()?;
        let node_id = call(env, obj, "hashCode", "()I", &[])?.i()?;
        let node = JniNode {
            vm: vm.clone(),
            info: env.new_global_ref(obj)?,
            identity: NodeIdentity {
                window_id,
                node_id: node_id as i64,
            },
        };
        Ok(Some(Arc::new(node)))
    }

    fn read<T: Default>(
        &self,
        what: &str,
        f: impl FnOnce(&mut JNIEnv, &JObject) -> Result<T>,
    ) -> T {
        match with_env(&self.vm, |env| f(env, self.info.as_obj())) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(node = ?self.identity, what, error = %e, "node read failed");
                T::default()
            }
        }
    }

    fn flag(&self, method: &str) -> bool {
        self.read(method, |env, obj| Ok(call(env, obj, method, "()Z", &[])?.z()?))
    }

    fn text_of(&self, method: &str) -> Option<String> {
        self.read(method, |env, obj| char_sequence(env, obj, method))
    }
}

impl AxNode for JniNode {
    fn identity(&self) -> NodeIdentity {
        self.identity
    }

    fn refresh(&self) -> bool {
        self.flag("refresh")
    }

    fn class_name(&self) -> Option<String> {
        self.text_of("getClassName")
    }

    fn package_name(&self) -> Option<String> {
        self.text_of("getPackageName")
    }

    fn text(&self) -> Option<String> {
        self.text_of("getText")
    }

    fn range_current(&self) -> Option<f32> {
        self.read("getRangeInfo", |env, obj| {
            let range = call(
                env,
                obj,
                "getRangeInfo",
                "()Landroid/view/accessibility/AccessibilityNodeInfo$RangeInfo;",
                &[],
            )?
            .l()?;
            if range.is_null() {
                return Ok(None);
            }
            Ok(Some(call(env, &range, "getCurrent", "()F", &[])?.f()?))
        })
    }

    fn content_description(&self) -> Option<String> {
        self.text_of("getContentDescription")
    }

    fn resource_id(&self) -> Option<String> {
        self.read("getViewIdResourceName", |env, obj| {
            let id = call(env, obj, "getViewIdResourceName", "()Ljava/lang/String;", &[])?.l()?;
            if id.is_null() {
                return Ok(None);
            }
            Ok(Some(env.get_string(&JString::from(id))?.into()))
        })
    }

    fn is_checkable(&self) -> bool {
        self.flag("isCheckable")
    }
    fn is_checked(&self) -> bool {
        self.flag("isChecked")
    }
    fn is_clickable(&self) -> bool {
        self.flag("isClickable")
    }
    fn is_enabled(&self) -> bool {
        self.flag("isEnabled")
    }
    fn is_focusable(&self) -> bool {
        self.flag("isFocusable")
    }
    fn is_focused(&self) -> bool {
        self.flag("isFocused")
    }
    fn is_long_clickable(&self) -> bool {
        self.flag("isLongClickable")
    }
    fn is_password(&self) -> bool {
        self.flag("isPassword")
    }
    fn is_scrollable(&self) -> bool {
        self.flag("isScrollable")
    }
    fn is_selected(&self) -> bool {
        self.flag("isSelected")
    }
    fn is_visible_to_user(&self) -> bool {
        self.flag("isVisibleToUser")
    }

    fn text_selection(&self) -> (i32, i32) {
        self.read("getTextSelection", |env, obj| {
            let start = call(env, obj, "getTextSelectionStart", "()I", &[])?.i()?;
            let end = call(env, obj, "getTextSelectionEnd", "()I", &[])?.i()?;
            Ok(Some((start, end)))
        })
        .unwrap_or((-1, -1))
    }

    fn bounds_in_screen(&self) -> Rect {
        self.read("getBoundsInScreen", |env, obj| {
            let rect = new_rect(env)?;
            call(env, obj, "getBoundsInScreen", "(Landroid/graphics/Rect;)V", &[JValue::Object(&rect)])?;
            read_rect(env, &rect)
        })
    }

    fn window_bounds(&self) -> Option<Rect> {
        self.read("getWindow", |env, obj| {
            let window = call(
                env,
                obj,
                "getWindow",
                "()Landroid/view/accessibility/AccessibilityWindowInfo;",
                &[],
            )?
            .l()?;
            if window.is_null() {
                return Ok(None);
            }
            let rect = new_rect(env)?;
            call(env, &window, "getBoundsInScreen", "(Landroid/graphics/Rect;)V", &[JValue::Object(&rect)])?;
            Ok(Some(read_rect(env, &rect)?))
        })
    }

    fn max_text_length(&self) -> Option<usize> {
        self.read("getMaxTextLength", |env, obj| {
            let max = call(env, obj, "getMaxTextLength", "()I", &[])?.i()?;
            Ok(usize::try_from(max).ok())
        })
    }

    fn child_count(&self) -> usize {
        self.read("getChildCount", |env, obj| {
            Ok(call(env, obj, "getChildCount", "()I", &[])?.i()?.max(0) as usize)
        })
    }

    fn child(&self, index: usize) -> Option<NodeHandle> {
        let vm = self.vm.clone();
        self.read("getChild", |env, obj| {
            let child = call(
                env,
                obj,
                "getChild",
                "(I)Landroid/view/accessibility/AccessibilityNodeInfo;",
                &[JValue::Int(index as i32)],
            )?
            .l()?;
            JniNode::wrap(&vm, env, &child)
        })
    }

    fn parent(&self) -> Option<NodeHandle> {
        let vm = self.vm.clone();
        self.read("getParent", |env, obj| {
            let parent = call(env, obj, "getParent", NODE_INFO, &[])?.l()?;
            JniNode::wrap(&vm, env, &parent)
        })
    }

    fn perform_action(&self, action: NodeAction) -> bool {
        let id = match action {
            NodeAction::Focus => ACTION_FOCUS,
            NodeAction::Click => ACTION_CLICK,
            NodeAction::LongClick => ACTION_LONG_CLICK,
        };
        self.read("performAction", |env, obj| {
            Ok(call(env, obj, "performAction", "(I)Z", &[JValue::Int(id)])?.z()?)
        })
    }

    fn set_text(&self, text: &str) -> bool {
        self.read("setText", |env, obj| {
            let args = env.new_object("android/os/Bundle", "()V", &[])?;
            let key = env.new_string(SET_TEXT_ARGUMENT)?;
            let value = env.new_string(text)?;
            call(
                env,
                &args,
                "putCharSequence",
                "(Ljava/lang/String;Ljava/lang/CharSequence;)V",
                &[JValue::Object(&key), JValue::Object(&value)],
            )?;
            Ok(call(
                env,
                obj,
                "performAction",
                "(ILandroid/os/Bundle;)Z",
                &[JValue::Int(ACTION_SET_TEXT), JValue::Object(&args)],
            )?
            .z()?)
        })
    }
}

pub struct JniDevice {
    vm: Arc<JavaVM>,
    bridge: GlobalRef,
}

impl JniDevice {
    pub fn new(env: &mut JNIEnv, bridge: &JObject) -> Result<Self> {
        Ok(Self {
            vm: Arc::new(env.get_java_vm()?),
            bridge: env.new_global_ref(bridge)?,
        })
    }

    fn int(&self, method: &str) -> Result<i32> {
        with_env(&self.vm, |env| Ok(call(env, self.bridge.as_obj(), method, "()I", &[])?.i()?))
    }

    fn roots(&self) -> Result<Vec<NodeHandle>> {
        with_env(&self.vm, |env| {
            let array: JObjectArray = call(
                env,
                self.bridge.as_obj(),
                "getWindowRoots",
                "()[Landroid/view/accessibility/AccessibilityNodeInfo;",
                &[],
            )?
            .l()?
            .into();
            if array.is_null() {
                return Ok(Vec::new());
            }
            let len = env.get_array_length(&array)?;
            let mut roots = Vec::with_capacity(len as usize);
            for i in 0..len {
                let obj = env.get_object_array_element(&array, i)?;
                match JniNode::wrap(&self.vm, env, &obj)? {
                    Some(node) => roots.push(node),
                    None => tracing::info!(window = i, "skipping window without a root node"),
                }
                env.delete_local_ref(obj)?;
            }
            Ok(roots)
        })
    }
}

impl UiDevice for JniDevice {
    fn window_roots(&self) -> Vec<NodeHandle> {
        self.roots().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "cannot read window roots");
            Vec::new()
        })
    }

    fn display(&self) -> DisplayInfo {
        let read = || -> Result<DisplayInfo> {
            Ok(DisplayInfo {
                rotation: self.int("getDisplayRotation")?,
                width: self.int("getDisplayWidth")?,
                height: self.int("getDisplayHeight")?,
            })
        };
        read().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "cannot read display metrics");
            DisplayInfo::default()
        })
    }

    fn refresh_accessibility_cache(&self) {
        let result = with_env(&self.vm, |env| {
            call(env, self.bridge.as_obj(), "clearAccessibilityCache", "()V", &[])?;
            Ok(())
        });
        if let Err(e) = result {
            tracing::debug!(error = %e, "accessibility cache refresh failed");
        }
    }

    fn wait_for_idle(&self, timeout: Duration) {
        let global = timeout.as_millis() as i64;
        let result = with_env(&self.vm, |env| {
            Ok(call(
                env,
                self.bridge.as_obj(),
                "waitForIdle",
                "(JJ)Z",
                &[JValue::Long(global.min(750)), JValue::Long(global)],
            )?
            .z()?)
        });
        match result {
            Ok(true) => {}
            Ok(false) => tracing::debug!(timeout_ms = global, "ui did not settle"),
            Err(e) => tracing::debug!(error = %e, "waitForIdle failed"),
        }
    }
}
