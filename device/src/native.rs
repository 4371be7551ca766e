use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::attribute::Rect;

/// Bumped whenever the adapter contract below changes shape.
pub const ADAPTER_VERSION: u32 = 1;

/// Equality key of a native node. Two handles with the same identity point at
/// the same on-screen view, even if they are different wrapper objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeIdentity {
    pub window_id: i32,
    pub node_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeAction {
    Focus,
    Click,
    LongClick,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DisplayInfo {
    pub rotation: i32,
    pub width: i32,
    pub height: i32,
}

/// One node of the platform accessibility tree. Handles are transient: any
/// accessor may start returning defaults once the UI changes underneath, and
/// `refresh` is the only reliable way to tell.
pub trait AxNode: Send + Sync + fmt::Debug {
    fn identity(&self) -> NodeIdentity;
    /// Re-syncs with the live view. False means the node is gone.
    fn refresh(&self) -> bool;

    fn class_name(&self) -> Option<String>;
    fn package_name(&self) -> Option<String>;
    fn text(&self) -> Option<String>;
    fn range_current(&self) -> Option<f32>;
    fn content_description(&self) -> Option<String>;
    fn resource_id(&self) -> Option<String>;

    fn is_checkable(&self) -> bool;
    fn is_checked(&self) -> bool;
    fn is_clickable(&self) -> bool;
    fn is_enabled(&self) -> bool;
    fn is_focusable(&self) -> bool;
    fn is_focused(&self) -> bool;
    fn is_long_clickable(&self) -> bool;
    fn is_password(&self) -> bool;
    fn is_scrollable(&self) -> bool;
    fn is_selected(&self) -> bool;
    fn is_visible_to_user(&self) -> bool;

    fn text_selection(&self) -> (i32, i32);
    fn bounds_in_screen(&self) -> Rect;
    fn window_bounds(&self) -> Option<Rect>;
    fn max_text_length(&self) -> Option<usize>;

    fn child_count(&self) -> usize;
    fn child(&self, index: usize) -> Option<NodeHandle>;
    fn parent(&self) -> Option<NodeHandle>;

    fn perform_action(&self, action: NodeAction) -> bool;
    fn set_text(&self, text: &str) -> bool;
}

pub type NodeHandle = Arc<dyn AxNode>;

/// The device side of the adapter: where trees come from.
pub trait UiDevice: Send + Sync {
    fn adapter_version(&self) -> u32 {
        ADAPTER_VERSION
    }
    fn window_roots(&self) -> Vec<NodeHandle>;
    fn display(&self) -> DisplayInfo;
    fn refresh_accessibility_cache(&self) {}
    fn wait_for_idle(&self, _timeout: Duration) {}
}

pub fn selection_range(node: &dyn AxNode) -> Option<(i32, i32)> {
    let (start, end) = node.text_selection();
    (start >= 0 && start != end).then_some((start, end))
}

pub fn text_or_range(node: &dyn AxNode) -> Option<String> {
    match node.range_current() {
        Some(current) => Some(platform_float(current)),
        None => node.text(),
    }
}

/// Renders a float the way the platform's `Float.toString` does: plain
/// decimal for magnitudes in `[1e-3, 1e7)`, `d.dddE±n` outside it, and
/// always at least one fractional digit.
fn platform_float(value: f32) -> String {
    if value.is_nan() {
        return "NaN".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    let with_fraction = |digits: &str| {
        if digits.contains('.') {
            digits.to_string()
        } else {
            format!("{digits}.0")
        }
    };
    if value == 0.0 || (1e-3..1e7).contains(&value.abs()) {
        return with_fraction(&value.to_string());
    }
    let sci = format!("{value:e}");
    match sci.split_once('e') {
        Some((mantissa, exponent)) => format!("{}E{exponent}", with_fraction(mantissa)),
        None => sci,
    }
}

/// Bounds clipped to the display, the owning window and the first scrollable
/// ancestor.
pub fn visible_bounds(node: &dyn AxNode, display: &Rect, max_depth: usize) -> Rect {
    visible_bounds_at(node, display, 0, max_depth)
}

fn visible_bounds_at(node: &dyn AxNode, display: &Rect, depth: usize, max_depth: usize) -> Rect {
    let mut ret = node.bounds_in_screen();
    ret.intersect(display);
    if let Some(window) = node.window_bounds() {
        ret.intersect(&window);
    }

    let mut current_depth = depth;
    let mut ancestor = node.parent();
    while let Some(a) = ancestor {
        current_depth += 1;
        if current_depth >= max_depth {
            break;
        }
        if a.is_scrollable() {
            let ancestor_rect = visible_bounds_at(a.as_ref(), display, current_depth, max_depth);
            ret.intersect(&ancestor_rect);
            break;
        }
        ancestor = a.parent();
    }
    ret
}

/// Which nodes a tree walk may reach. Depths count the same way snapshots do:
/// a scope root is depth 0, window roots are depth 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkOptions {
    pub allow_invisible: bool,
    pub max_depth: usize,
}

/// Pre-order walk of everything under `root` (not including it). The callback
/// gets each node with its position among its siblings and returns false to stop.
pub fn for_each_descendant(
    root: &NodeHandle,
    opts: WalkOptions,
    f: &mut dyn FnMut(&NodeHandle, usize) -> bool,
) -> bool {
    walk_below(root, 0, opts, f)
}

fn walk_below(
    node: &NodeHandle,
    depth: usize,
    opts: WalkOptions,
    f: &mut dyn FnMut(&NodeHandle, usize) -> bool,
) -> bool {
    let count = node.child_count();
    if depth >= opts.max_depth {
        if count > 0 {
            tracing::warn!(
                depth,
                class = %node.class_name().unwrap_or_default(),
                skipped = count,
                "max depth reached, children not included"
            );
        }
        return true;
    }
    for i in 0..count {
        let Some(child) = node.child(i) else {
            tracing::info!(position = i, parent = ?node.class_name(), "skipping null child");
            continue;
        };
        if !opts.allow_invisible && !child.is_visible_to_user() {
            continue;
        }
        if !f(&child, i) || !walk_below(&child, depth + 1, opts, f) {
            return false;
        }
    }
    true
}

/// Where a native query looks: a whole screen (window roots included) or the
/// descendants of one node.
#[derive(Debug, Clone)]
pub enum SearchSpace {
    Screen(Vec<NodeHandle>),
    Under(NodeHandle),
}

impl SearchSpace {
    pub fn new(device: &dyn UiDevice, scope: Option<&NodeHandle>) -> SearchSpace {
        match scope {
            Some(node) => SearchSpace::Under(node.clone()),
            None => SearchSpace::Screen(device.window_roots()),
        }
    }

    /// Same contract as [`for_each_descendant`].
    pub fn walk(&self, opts: WalkOptions, f: &mut dyn FnMut(&NodeHandle, usize) -> bool) -> bool {
        match self {
            SearchSpace::Screen(roots) => {
                for (position, root) in roots.iter().enumerate() {
                    if !f(root, position) || !walk_below(root, 1, opts, f) {
                        return false;
                    }
                }
                true
            }
            SearchSpace::Under(node) => for_each_descendant(node, opts, f),
        }
    }
}

/// Drops repeated identities, keeping the first occurrence.
pub fn dedup_by_identity(nodes: impl IntoIterator<Item = NodeHandle>) -> Vec<NodeHandle> {
    let mut seen = HashSet::new();
    nodes
        .into_iter()
        .filter(|n| seen.insert(n.identity()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeNode;

    #[test]
    fn selection_range_requires_non_empty_selection() {
        let node = FakeNode::builder("android.widget.EditText").selection(2, 2).build();
        assert_eq!(selection_range(node.as_ref()), None);
        let node = FakeNode::builder("android.widget.EditText").selection(1, 4).build();
        assert_eq!(selection_range(node.as_ref()), Some((1, 4)));
        let node = FakeNode::builder("android.widget.EditText").selection(-1, 3).build();
        assert_eq!(selection_range(node.as_ref()), None);
    }

    #[test]
    fn range_info_overrides_text() {
        let node = FakeNode::builder("android.widget.SeekBar").text("ignored").range(50.0).build();
        assert_eq!(text_or_range(node.as_ref()).as_deref(), Some("50.0"));
    }

    #[test]
    fn range_values_render_like_the_platform() {
        let cases = [
            (50.0, "50.0"),
            (0.5, "0.5"),
            (0.001, "0.001"),
            (1_000_000.0, "1000000.0"),
            (1e7, "1.0E7"),
            (1e10, "1.0E10"),
            (-2.5e-5, "-2.5E-5"),
            (0.0, "0.0"),
            (-0.0, "-0.0"),
            (f32::INFINITY, "Infinity"),
            (f32::NAN, "NaN"),
        ];
        for (value, expected) in cases {
            assert_eq!(platform_float(value), expected, "{value:?}");
        }
        let node = FakeNode::builder("android.widget.ProgressBar").range(1e10).build();
        assert_eq!(text_or_range(node.as_ref()).as_deref(), Some("1.0E10"));
    }

    #[test]
    fn bounds_are_clipped_by_scrollable_ancestor() {
        let item = FakeNode::builder("android.widget.TextView")
            .bounds(Rect::new(0, 900, 500, 1400))
            .build();
        let list = FakeNode::builder("android.widget.ListView")
            .scrollable(true)
            .bounds(Rect::new(0, 0, 1080, 1000))
            .child(item.clone())
            .build();
        let _root = FakeNode::builder("android.widget.FrameLayout")
            .bounds(Rect::new(0, 0, 1080, 1920))
            .child(list)
            .build();
        let display = Rect::new(0, 0, 1080, 1920);
        assert_eq!(
            visible_bounds(item.as_ref(), &display, 70),
            Rect::new(0, 900, 500, 1000)
        );
    }

    #[test]
    fn walk_skips_invisible_subtrees_and_reports_positions() {
        let root: NodeHandle = FakeNode::builder("android.widget.FrameLayout")
            .child(FakeNode::builder("a").build())
            .child(
                FakeNode::builder("hidden")
                    .visible(false)
                    .child(FakeNode::builder("under-hidden").build())
                    .build(),
            )
            .child(FakeNode::builder("c").child(FakeNode::builder("d").build()).build())
            .build();
        let visible_only = WalkOptions { allow_invisible: false, max_depth: 70 };
        let mut seen = Vec::new();
        for_each_descendant(&root, visible_only, &mut |node, position| {
            seen.push((node.class_name().unwrap_or_default(), position));
            true
        });
        assert_eq!(
            seen,
            vec![("a".to_string(), 0), ("c".to_string(), 2), ("d".to_string(), 0)]
        );

        let mut count = 0;
        let everything = WalkOptions { allow_invisible: true, max_depth: 70 };
        for_each_descendant(&root, everything, &mut |_, _| {
            count += 1;
            count < 2
        });
        assert_eq!(count, 2);
    }

    #[test]
    fn walk_stops_at_the_depth_bound() {
        let opts = WalkOptions { allow_invisible: false, max_depth: 10 };
        let visited = |space: &SearchSpace| {
            let mut seen = 0;
            space.walk(opts, &mut |_, _| {
                seen += 1;
                true
            });
            seen
        };
        // window roots sit one level deeper than a scope root
        let root: NodeHandle = FakeNode::chain(40);
        assert_eq!(visited(&SearchSpace::Under(root.clone())), 10);
        assert_eq!(visited(&SearchSpace::Screen(vec![root])), 10);
    }

    #[test]
    fn walk_skips_null_children() {
        let root: NodeHandle = FakeNode::builder("android.widget.FrameLayout")
            .child(FakeNode::builder("a").build())
            .null_child()
            .child(FakeNode::builder("c").build())
            .build();
        let opts = WalkOptions { allow_invisible: true, max_depth: 70 };
        let mut seen = Vec::new();
        for_each_descendant(&root, opts, &mut |node, position| {
            seen.push((node.class_name().unwrap_or_default(), position));
            true
        });
        assert_eq!(seen, vec![("a".to_string(), 0), ("c".to_string(), 2)]);
    }

    #[test]
    fn dedup_keeps_first_seen_order() {
        let a: NodeHandle = FakeNode::builder("a").build();
        let b: NodeHandle = FakeNode::builder("b").build();
        let out = dedup_by_identity([b.clone(), a.clone(), b.clone(), a]);
        let classes: Vec<_> = out.iter().filter_map(|n| n.class_name()).collect();
        assert_eq!(classes, vec!["b", "a"]);
    }
}
