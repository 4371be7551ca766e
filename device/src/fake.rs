//! In-memory accessibility tree used by the unit tests.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::attribute::Rect;
use crate::native::{AxNode, DisplayInfo, NodeAction, NodeHandle, NodeIdentity, UiDevice};

static NEXT_NODE_ID: AtomicI64 = AtomicI64::new(1);

#[derive(Debug, Default, Clone)]
struct Props {
    class_name: Option<String>,
    package: Option<String>,
    text: Option<String>,
    range: Option<f32>,
    desc: Option<String>,
    res_id: Option<String>,
    checkable: bool,
    checked: bool,
    clickable: bool,
    enabled: bool,
    focusable: bool,
    focused: bool,
    long_clickable: bool,
    password: bool,
    scrollable: bool,
    selected: bool,
    visible: bool,
    selection: (i32, i32),
    bounds: Rect,
    max_text_length: Option<usize>,
}

#[derive(Debug)]
pub struct FakeNode {
    id: i64,
    props: Mutex<Props>,
    alive: AtomicBool,
    actions_succeed: AtomicBool,
    /// `None` slots stand for children the platform reports but cannot fetch.
    children: Mutex<Vec<Option<Arc<FakeNode>>>>,
    parent: Mutex<Weak<FakeNode>>,
    actions: Mutex<Vec<NodeAction>>,
}

pub struct FakeNodeBuilder {
    props: Props,
    children: Vec<Option<Arc<FakeNode>>>,
}

impl FakeNodeBuilder {
    pub fn text(mut self, text: &str) -> Self {
        self.props.text = Some(text.to_string());
        self
    }
    pub fn range(mut self, current: f32) -> Self {
        self.props.range = Some(current);
        self
    }
    pub fn desc(mut self, desc: &str) -> Self {
        self.props.desc = Some(desc.to_string());
        self
    }
    pub fn res_id(mut self, id: &str) -> Self {
        self.props.res_id = Some(id.to_string());
        self
    }
    pub fn package(mut self, package: &str) -> Self {
        self.props.package = Some(package.to_string());
        self
    }
    pub fn clickable(mut self, v: bool) -> Self {
        self.props.clickable = v;
        self
    }
    pub fn checked(mut self, v: bool) -> Self {
        self.props.checkable = true;
        self.props.checked = v;
        self
    }
    pub fn scrollable(mut self, v: bool) -> Self {
        self.props.scrollable = v;
        self
    }
    pub fn password(mut self, v: bool) -> Self {
        self.props.password = v;
        self
    }
    pub fn visible(mut self, v: bool) -> Self {
        self.props.visible = v;
        self
    }
    pub fn selection(mut self, start: i32, end: i32) -> Self {
        self.props.selection = (start, end);
        self
    }
    pub fn bounds(mut self, bounds: Rect) -> Self {
        self.props.bounds = bounds;
        self
    }
    pub fn max_text_length(mut self, len: usize) -> Self {
        self.props.max_text_length = Some(len);
        self
    }
    pub fn child(mut self, child: Arc<FakeNode>) -> Self {
        self.children.push(Some(child));
        self
    }
    pub fn null_child(mut self) -> Self {
        self.children.push(None);
        self
    }
    pub fn children(mut self, children: impl IntoIterator<Item = Arc<FakeNode>>) -> Self {
        self.children.extend(children.into_iter().map(Some));
        self
    }

    pub fn build(self) -> Arc<FakeNode> {
        let node = Arc::new(FakeNode {
            id: NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed),
            props: Mutex::new(self.props),
            alive: AtomicBool::new(true),
            actions_succeed: AtomicBool::new(true),
            children: Mutex::new(Vec::new()),
            parent: Mutex::new(Weak::new()),
            actions: Mutex::new(Vec::new()),
        });
        for child in self.children.iter().flatten() {
            *child.parent.lock() = Arc::downgrade(&node);
        }
        *node.children.lock() = self.children;
        node
    }
}

impl FakeNode {
    pub fn builder(class_name: &str) -> FakeNodeBuilder {
        FakeNodeBuilder {
            props: Props {
                class_name: (!class_name.is_empty()).then(|| class_name.to_string()),
                package: Some("com.example".to_string()),
                enabled: true,
                visible: true,
                selection: (-1, -1),
                bounds: Rect::new(0, 0, 100, 100),
                ..Props::default()
            },
            children: Vec::new(),
        }
    }

    pub fn bare() -> Arc<FakeNode> {
        let node = Self::builder("").build();
        node.props.lock().package = None;
        node
    }

    /// Straight line of `depth` nested nodes below a root, `depth + 1` nodes total.
    pub fn chain(depth: usize) -> Arc<FakeNode> {
        let mut node = Self::builder("android.view.View").build();
        for _ in 0..depth {
            node = Self::builder("android.view.ViewGroup").child(node).build();
        }
        node
    }

    pub fn invalidate(&self) {
        self.alive.store(false, Ordering::SeqCst);
        for child in self.children.lock().iter().flatten() {
            child.invalidate();
        }
    }

    pub fn fail_actions(&self) {
        self.actions_succeed.store(false, Ordering::SeqCst);
    }

    pub fn performed(&self) -> Vec<NodeAction> {
        self.actions.lock().clone()
    }
}

impl AxNode for FakeNode {
    fn identity(&self) -> NodeIdentity {
        NodeIdentity { window_id: 0, node_id: self.id }
    }
    fn refresh(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
    fn class_name(&self) -> Option<String> {
        self.props.lock().class_name.clone()
    }
    fn package_name(&self) -> Option<String> {
        self.props.lock().package.clone()
    }
    fn text(&self) -> Option<String> {
        self.props.lock().text.clone()
    }
    fn range_current(&self) -> Option<f32> {
        self.props.lock().range
    }
    fn content_description(&self) -> Option<String> {
        self.props.lock().desc.clone()
    }
    fn resource_id(&self) -> Option<String> {
        self.props.lock().res_id.clone()
    }
    fn is_checkable(&self) -> bool {
        self.props.lock().checkable
    }
    fn is_checked(&self) -> bool {
        self.props.lock().checked
    }
    fn is_clickable(&self) -> bool {
        self.props.lock().clickable
    }
    fn is_enabled(&self) -> bool {
        self.props.lock().enabled
    }
    fn is_focusable(&self) -> bool {
        self.props.lock().focusable
    }
    fn is_focused(&self) -> bool {
        self.props.lock().focused
    }
    fn is_long_clickable(&self) -> bool {
        self.props.lock().long_clickable
    }
    fn is_password(&self) -> bool {
        self.props.lock().password
    }
    fn is_scrollable(&self) -> bool {
        self.props.lock().scrollable
    }
    fn is_selected(&self) -> bool {
        self.props.lock().selected
    }
    fn is_visible_to_user(&self) -> bool {
        self.props.lock().visible
    }
    fn text_selection(&self) -> (i32, i32) {
        self.props.lock().selection
    }
    fn bounds_in_screen(&self) -> Rect {
        self.props.lock().bounds
    }
    fn window_bounds(&self) -> Option<Rect> {
        None
    }
    fn max_text_length(&self) -> Option<usize> {
        self.props.lock().max_text_length
    }
    fn child_count(&self) -> usize {
        // recycled nodes lose their subtree
        if !self.refresh() {
            return 0;
        }
        self.children.lock().len()
    }
    fn child(&self, index: usize) -> Option<NodeHandle> {
        self.children
            .lock()
            .get(index)
            .and_then(|c| c.clone())
            .map(|c| c as NodeHandle)
    }
    fn parent(&self) -> Option<NodeHandle> {
        self.parent.lock().upgrade().map(|p| p as NodeHandle)
    }
    fn perform_action(&self, action: NodeAction) -> bool {
        self.actions.lock().push(action);
        self.actions_succeed.load(Ordering::SeqCst)
    }
    fn set_text(&self, text: &str) -> bool {
        if !self.actions_succeed.load(Ordering::SeqCst) {
            return false;
        }
        self.props.lock().text = Some(text.to_string());
        true
    }
}

pub struct FakeDevice {
    roots: Mutex<Vec<Arc<FakeNode>>>,
    /// Screen that replaces the current one at the next idle wait.
    after_idle: Mutex<Option<Vec<Arc<FakeNode>>>>,
    display: DisplayInfo,
}

impl FakeDevice {
    pub fn new(roots: Vec<Arc<FakeNode>>) -> Arc<Self> {
        Arc::new(Self {
            roots: Mutex::new(roots),
            after_idle: Mutex::new(None),
            display: DisplayInfo {
                rotation: 0,
                width: 1080,
                height: 1920,
            },
        })
    }

    /// Swaps the whole screen, invalidating every node of the old one.
    pub fn replace_roots(&self, roots: Vec<Arc<FakeNode>>) {
        let mut current = self.roots.lock();
        for old in current.iter() {
            old.invalidate();
        }
        *current = roots;
    }

    /// Queues a screen change that lands when someone waits for idle.
    pub fn change_when_idle(&self, roots: Vec<Arc<FakeNode>>) {
        *self.after_idle.lock() = Some(roots);
    }
}

impl UiDevice for FakeDevice {
    fn window_roots(&self) -> Vec<NodeHandle> {
        self.roots
            .lock()
            .iter()
            .map(|r| r.clone() as NodeHandle)
            .collect()
    }

    fn display(&self) -> DisplayInfo {
        self.display
    }

    fn wait_for_idle(&self, _timeout: Duration) {
        let pending = self.after_idle.lock().take();
        if let Some(roots) = pending {
            self.replace_roots(roots);
        }
    }
}

/// Plain description of a tree, so proptest can generate and shrink screens.
#[derive(Debug, Clone)]
pub struct Shape {
    pub class_name: String,
    pub visible: bool,
    pub children: Vec<Shape>,
}

impl Shape {
    pub fn build(&self) -> Arc<FakeNode> {
        FakeNode::builder(&self.class_name)
            .visible(self.visible)
            .children(self.children.iter().map(Shape::build))
            .build()
    }

    pub fn count(&self) -> usize {
        1 + self.children.iter().map(Shape::count).sum::<usize>()
    }
}

pub fn arb_shape() -> impl proptest::strategy::Strategy<Value = Shape> {
    use proptest::prelude::*;

    let class = prop_oneof![
        Just("android.widget.TextView".to_string()),
        Just("android.widget.Button".to_string()),
        Just("android.widget.FrameLayout".to_string()),
        Just("Foo".to_string()),
    ];
    let leaf = (class.clone(), prop::bool::weighted(0.85)).prop_map(|(class_name, visible)| Shape {
        class_name,
        visible,
        children: Vec::new(),
    });
    leaf.prop_recursive(6, 48, 5, move |inner| {
        (class.clone(), prop::bool::weighted(0.85), prop::collection::vec(inner, 0..5)).prop_map(
            |(class_name, visible, children)| Shape {
                class_name,
                visible,
                children,
            },
        )
    })
}

/// A random shape hung below a chain of wrappers, each with an optional leaf
/// beside it, so trees run well past small depth bounds.
pub fn arb_deep_shape() -> impl proptest::strategy::Strategy<Value = Shape> {
    use proptest::prelude::*;

    (arb_shape(), prop::collection::vec(any::<bool>(), 5..40)).prop_map(|(bottom, levels)| {
        levels.into_iter().fold(bottom, |inner, with_leaf| {
            let mut children = vec![inner];
            if with_leaf {
                children.push(Shape {
                    class_name: "android.widget.TextView".to_string(),
                    visible: true,
                    children: Vec::new(),
                });
            }
            Shape {
                class_name: "android.widget.LinearLayout".to_string(),
                visible: true,
                children,
            }
        })
    })
}
