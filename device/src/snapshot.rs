use crate::attribute::{AttrValue, Attribute, AttributeBag, AttributeBagBuilder, AttributeFilter, Rect};
use crate::native::{self, AxNode, DisplayInfo, NodeHandle, WalkOptions};

pub const DEFAULT_MAX_DEPTH: usize = 70;
pub const DEFAULT_CLASS: &str = "android.view.View";
pub const ROOT_CLASS: &str = "hierarchy";
pub const TOAST_CLASS: &str = "android.widget.Toast";
pub const TOAST_PACKAGE: &str = "com.android.settings";

#[derive(Debug, Clone)]
pub struct SnapshotOptions {
    pub filter: AttributeFilter,
    pub allow_invisible: bool,
    pub simple_bounds: bool,
    pub max_depth: usize,
    pub display: DisplayInfo,
    pub toasts: Vec<String>,
}

impl Default for SnapshotOptions {
    fn default() -> Self {
        Self {
            filter: AttributeFilter::all(),
            allow_invisible: false,
            simple_bounds: false,
            max_depth: DEFAULT_MAX_DEPTH,
            display: DisplayInfo::default(),
            toasts: Vec::new(),
        }
    }
}

impl SnapshotOptions {
    /// Walk bounds matching what a snapshot with these options would contain.
    pub fn walk_options(&self) -> WalkOptions {
        WalkOptions {
            allow_invisible: self.allow_invisible,
            max_depth: self.max_depth,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotNode {
    /// Pre-order position, also the slot in [`Snapshot::nodes`].
    pub index: usize,
    pub depth: usize,
    pub attributes: AttributeBag,
    pub children: Vec<usize>,
    /// None for the synthetic hierarchy root and injected toasts.
    pub node: Option<NodeHandle>,
}

impl SnapshotNode {
    pub fn class_name(&self) -> &str {
        self.attributes.class_name()
    }
}

/// One immutable pass over the live tree. Lives for a single query.
#[derive(Debug, Clone)]
pub struct Snapshot {
    nodes: Vec<SnapshotNode>,
    scoped: bool,
    display: DisplayInfo,
}

impl Snapshot {
    /// Whole screen: a synthetic `hierarchy` root over every window root.
    pub fn of_windows(roots: &[NodeHandle], opts: &SnapshotOptions) -> Snapshot {
        let mut builder = Builder::new(opts);
        let mut root_bag = AttributeBagBuilder::default();
        root_bag.set(Attribute::Class, Some(AttrValue::Str(ROOT_CLASS.to_string())));
        builder.nodes.push(SnapshotNode {
            index: 0,
            depth: 0,
            attributes: root_bag.build(),
            children: Vec::new(),
            node: None,
        });

        let mut children = Vec::with_capacity(roots.len() + opts.toasts.len());
        for (i, root) in roots.iter().enumerate() {
            children.push(builder.visit(root, i, 1));
        }
        for toast in &opts.toasts {
            let position = children.len();
            children.push(builder.push_toast(toast, position));
        }
        builder.nodes[0].children = children;

        Snapshot {
            nodes: builder.nodes,
            scoped: false,
            display: opts.display,
        }
    }

    /// Only the subtree under `root`, which becomes depth 0.
    pub fn of_node(root: &NodeHandle, opts: &SnapshotOptions) -> Snapshot {
        let mut builder = Builder::new(opts);
        builder.visit(root, 0, 0);
        Snapshot {
            nodes: builder.nodes,
            scoped: true,
            display: opts.display,
        }
    }

    pub fn root(&self) -> &SnapshotNode {
        &self.nodes[0]
    }

    pub fn get(&self, index: usize) -> Option<&SnapshotNode> {
        self.nodes.get(index)
    }

    pub fn nodes(&self) -> &[SnapshotNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn is_scoped(&self) -> bool {
        self.scoped
    }

    pub fn display(&self) -> DisplayInfo {
        self.display
    }

    pub fn max_depth(&self) -> usize {
        self.nodes.iter().map(|n| n.depth).max().unwrap_or(0)
    }

    /// Index table: native handle of every node, by snapshot index.
    pub fn handles(&self) -> Vec<Option<NodeHandle>> {
        self.nodes.iter().map(|n| n.node.clone()).collect()
    }
}

/// One attribute of a live node, computed the same way a snapshot would.
pub fn attribute_of(node: &NodeHandle, attr: Attribute, opts: &SnapshotOptions) -> Option<AttrValue> {
    Builder::new(opts).value_of(node.as_ref(), attr, sibling_position(node))
}

fn sibling_position(node: &NodeHandle) -> usize {
    let Some(parent) = node.parent() else {
        return 0;
    };
    let identity = node.identity();
    (0..parent.child_count())
        .find(|&i| parent.child(i).is_some_and(|c| c.identity() == identity))
        .unwrap_or(0)
}

struct Builder<'a> {
    opts: &'a SnapshotOptions,
    display_rect: Rect,
    nodes: Vec<SnapshotNode>,
}

impl<'a> Builder<'a> {
    fn new(opts: &'a SnapshotOptions) -> Self {
        Self {
            opts,
            display_rect: Rect::new(0, 0, opts.display.width, opts.display.height),
            nodes: Vec::new(),
        }
    }

    fn visit(&mut self, node: &NodeHandle, position: usize, depth: usize) -> usize {
        let index = self.nodes.len();
        let attributes = self.collect(node.as_ref(), position);
        self.nodes.push(SnapshotNode {
            index,
            depth,
            attributes,
            children: Vec::new(),
            node: Some(node.clone()),
        });

        let count = node.child_count();
        if depth >= self.opts.max_depth {
            if count > 0 {
                tracing::warn!(
                    depth,
                    class = self.nodes[index].class_name(),
                    skipped = count,
                    "max depth reached, children not included"
                );
            }
            return index;
        }

        let mut children = Vec::with_capacity(count);
        for i in 0..count {
            let Some(child) = node.child(i) else {
                tracing::info!(
                    position = i,
                    parent = self.nodes[index].class_name(),
                    "skipping null child"
                );
                continue;
            };
            if !self.opts.allow_invisible && !child.is_visible_to_user() {
                continue;
            }
            children.push(self.visit(&child, i, depth + 1));
        }
        self.nodes[index].children = children;
        index
    }

    fn push_toast(&mut self, text: &str, position: usize) -> usize {
        let filter = &self.opts.filter;
        let mut bag = AttributeBagBuilder::default();
        let mut set = |attr: Attribute, value: AttrValue| {
            if filter.includes(attr) {
                bag.set(attr, Some(value));
            }
        };
        set(Attribute::Index, AttrValue::Int(position as i64));
        set(Attribute::Package, AttrValue::Str(TOAST_PACKAGE.to_string()));
        set(Attribute::Class, AttrValue::Str(TOAST_CLASS.to_string()));
        set(Attribute::Text, AttrValue::Str(text.to_string()));
        set(Attribute::Displayed, AttrValue::Bool(true));

        let index = self.nodes.len();
        self.nodes.push(SnapshotNode {
            index,
            depth: 1,
            attributes: bag.build(),
            children: Vec::new(),
            node: None,
        });
        index
    }

    fn collect(&self, node: &dyn AxNode, position: usize) -> AttributeBag {
        let mut bag = AttributeBagBuilder::default();
        for attr in Attribute::ALL {
            if attr == Attribute::Class || self.opts.filter.includes(attr) {
                bag.set(attr, self.value_of(node, attr, position));
            }
        }
        bag.build()
    }

    fn value_of(&self, node: &dyn AxNode, attr: Attribute, position: usize) -> Option<AttrValue> {
        use AttrValue::{Bool, Int, Str};

        let value = match attr {
            Attribute::Index => Int(position as i64),
            Attribute::Package => Str(node.package_name()?),
            Attribute::Class => Str(
                node.class_name()
                    .filter(|c| !c.is_empty())
                    .unwrap_or_else(|| DEFAULT_CLASS.to_string()),
            ),
            Attribute::Text => Str(native::text_or_range(node).unwrap_or_default()),
            Attribute::OriginalText => Str(node.text()?),
            Attribute::ContentDesc => Str(node.content_description()?),
            Attribute::ResourceId => Str(node.resource_id()?),
            Attribute::Checkable => Bool(node.is_checkable()),
            Attribute::Checked => Bool(node.is_checked()),
            Attribute::Clickable => Bool(node.is_clickable()),
            Attribute::Enabled => Bool(node.is_enabled()),
            Attribute::Focusable => Bool(node.is_focusable()),
            Attribute::Focused => Bool(node.is_focused()),
            Attribute::LongClickable => Bool(node.is_long_clickable()),
            Attribute::Password => Bool(node.is_password()),
            Attribute::Scrollable => Bool(node.is_scrollable()),
            Attribute::SelectionStart => Int(native::selection_range(node)?.0 as i64),
            Attribute::SelectionEnd => Int(native::selection_range(node)?.1 as i64),
            Attribute::Selected => Bool(node.is_selected()),
            Attribute::Bounds => AttrValue::Rect(if self.opts.simple_bounds {
                node.bounds_in_screen()
            } else {
                native::visible_bounds(node, &self.display_rect, self.opts.max_depth)
            }),
            Attribute::Displayed => Bool(node.is_visible_to_user()),
            Attribute::ContentSize => return None,
        };
        Some(value)
    }
}
