use std::collections::BTreeSet;
use std::time::Instant;

use once_cell::sync::Lazy;
use parking_lot::{Mutex, MutexGuard};

use crate::attribute::{Attribute, AttributeFilter};
use crate::error::{AppError, Result};
use crate::native::{NodeHandle, UiDevice};
use crate::snapshot::{Snapshot, SnapshotOptions};
use crate::xml::{self, INDEX_ATTRIBUTE, XmlOptions};
use crate::xpath::{AttributeRefs, Document, XPath};

/// Snapshot index -> native node for the query in flight. One query at a time.
static INDEX_TABLE: Lazy<Mutex<Vec<Option<NodeHandle>>>> = Lazy::new(|| Mutex::new(Vec::new()));

struct IndexTableGuard {
    table: MutexGuard<'static, Vec<Option<NodeHandle>>>,
}

impl IndexTableGuard {
    fn acquire() -> Self {
        Self {
            table: INDEX_TABLE.lock(),
        }
    }
}

impl Drop for IndexTableGuard {
    fn drop(&mut self) {
        self.table.clear();
    }
}

pub struct Dumper<'a> {
    device: &'a dyn UiDevice,
    scope: Option<NodeHandle>,
    options: SnapshotOptions,
    normalize_tag_names: bool,
}

impl<'a> Dumper<'a> {
    pub fn new(
        device: &'a dyn UiDevice,
        scope: Option<NodeHandle>,
        options: SnapshotOptions,
        normalize_tag_names: bool,
    ) -> Self {
        Self {
            device,
            scope,
            options,
            normalize_tag_names,
        }
    }

    fn snapshot(&self, filter: AttributeFilter) -> Snapshot {
        let mut options = self.options.clone();
        options.filter = filter;
        options.display = self.device.display();
        match &self.scope {
            Some(root) => {
                options.toasts.clear();
                Snapshot::of_node(root, &options)
            }
            None => Snapshot::of_windows(&self.device.window_roots(), &options),
        }
    }

    /// Public page source: every exposable attribute, no index attribute.
    pub fn dump_to_xml(&self) -> Result<String> {
        let snapshot = self.snapshot(AttributeFilter::all());
        xml::to_xml(
            &snapshot,
            &XmlOptions {
                indexed: false,
                normalize_tag_names: self.normalize_tag_names,
            },
        )
    }

    pub fn find_nodes(&self, expression: &str, multiple: bool) -> Result<Vec<NodeHandle>> {
        let xpath = XPath::compile(expression).map_err(|e| AppError::InvalidSelector(e.to_string()))?;
        let started = Instant::now();

        let mut guard = IndexTableGuard::acquire();
        let snapshot = self.snapshot(filter_for(&xpath));
        *guard.table = snapshot.handles();

        // synthetic nodes have no native side, so "first" is decided after mapping
        let indices = select_indices(&snapshot, &xpath, true, self.normalize_tag_names)?;
        let mut found = Vec::with_capacity(indices.len());
        for index in indices {
            if let Some(Some(node)) = guard.table.get(index) {
                found.push(node.clone());
                if !multiple {
                    break;
                }
            }
        }

        tracing::debug!(
            xpath = expression,
            nodes = snapshot.len(),
            matches = found.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "xpath lookup"
        );
        Ok(found)
    }
}

/// Only the attributes the expression reads, plus class for tag names.
fn filter_for(xpath: &XPath) -> AttributeFilter {
    match xpath.referenced_attributes() {
        AttributeRefs::All => AttributeFilter::all(),
        AttributeRefs::Names(names) => {
            let attrs: BTreeSet<Attribute> = names
                .iter()
                .filter_map(|name| Attribute::from_name(name))
                .chain([Attribute::Class])
                .collect();
            AttributeFilter::only(attrs)
        }
    }
}

/// Snapshot indices matched by `xpath` over the indexed projection, in document order.
pub fn select_indices(
    snapshot: &Snapshot,
    xpath: &XPath,
    multiple: bool,
    normalize_tag_names: bool,
) -> Result<Vec<usize>> {
    let source = xml::to_xml(
        snapshot,
        &XmlOptions {
            indexed: true,
            normalize_tag_names,
        },
    )?;
    let doc = Document::parse(&source).map_err(|e| AppError::new(e.to_string()))?;
    let elements = xpath
        .select(&doc)
        .map_err(|e| AppError::InvalidSelector(e.to_string()))?;

    let mut out = Vec::new();
    for element in elements {
        let Some(index) = doc
            .attribute(element, INDEX_ATTRIBUTE)
            .and_then(|v| v.parse::<usize>().ok())
        else {
            continue;
        };
        if snapshot.get(index).is_none() {
            continue;
        }
        out.push(index);
        if !multiple {
            break;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use proptest::prelude::*;

    use super::*;
    use crate::attribute::AttrValue;
    use crate::fake::{FakeDevice, FakeNode, arb_deep_shape, arb_shape};
    use crate::native::SearchSpace;

    fn foo(text: &str) -> Arc<FakeNode> {
        FakeNode::builder("Foo").text(text).build()
    }

    fn device() -> Arc<FakeDevice> {
        let root = FakeNode::builder("android.widget.FrameLayout")
            .child(foo("A"))
            .child(
                FakeNode::builder("android.widget.LinearLayout")
                    .child(foo("B"))
                    .build(),
            )
            .child(foo("C"))
            .build();
        FakeDevice::new(vec![root])
    }

    fn texts(found: &[NodeHandle]) -> Vec<String> {
        found.iter().map(|n| n.text().unwrap_or_default()).collect()
    }

    #[test]
    fn first_of_parenthesised_set_in_single_mode() {
        let device = device();
        let dumper = Dumper::new(device.as_ref(), None, SnapshotOptions::default(), false);
        let found = dumper.find_nodes("(//Foo)[1]", false).unwrap();
        assert_eq!(texts(&found), vec!["A"]);

        let all = dumper.find_nodes("//Foo", true).unwrap();
        assert_eq!(texts(&all), vec!["A", "B", "C"]);
        let first = dumper.find_nodes("//Foo", false).unwrap();
        assert_eq!(texts(&first), vec!["A"]);
    }

    #[test]
    fn malformed_xpath_is_an_invalid_selector() {
        let device = device();
        let dumper = Dumper::new(device.as_ref(), None, SnapshotOptions::default(), false);
        let err = dumper.find_nodes("//Foo[", true).unwrap_err();
        assert!(matches!(err, AppError::InvalidSelector(_)));
    }

    #[test]
    fn synthetic_nodes_are_never_returned() {
        let device = device();
        let options = SnapshotOptions {
            toasts: vec!["Saved".into()],
            ..Default::default()
        };
        let dumper = Dumper::new(device.as_ref(), None, options, false);
        assert!(dumper.find_nodes("/hierarchy", true).unwrap().is_empty());
        assert!(dumper.find_nodes("//android.widget.Toast", true).unwrap().is_empty());
        assert!(dumper.dump_to_xml().unwrap().contains("android.widget.Toast"));
    }

    #[test]
    fn scoped_search_stays_in_subtree() {
        let device = device();
        let scope = device.window_roots()[0].child(1);
        let dumper = Dumper::new(device.as_ref(), scope, SnapshotOptions::default(), false);
        let found = dumper.find_nodes("//Foo", true).unwrap();
        assert_eq!(texts(&found), vec!["B"]);
    }

    #[test]
    fn index_table_is_cleared_after_each_query() {
        let device = device();
        let dumper = Dumper::new(device.as_ref(), None, SnapshotOptions::default(), false);
        dumper.find_nodes("//Foo", true).unwrap();
        assert!(INDEX_TABLE.lock().is_empty());
        let _ = dumper.find_nodes("count(//Foo)", true);
        assert!(INDEX_TABLE.lock().is_empty());
    }

    #[test]
    fn filter_collects_only_referenced_attributes() {
        let xpath = XPath::compile("//*[@text='A']").unwrap();
        let filter = filter_for(&xpath);
        assert!(filter.includes(Attribute::Text));
        assert!(filter.includes(Attribute::Class));
        assert!(!filter.includes(Attribute::Bounds));

        let device = device();
        let dumper = Dumper::new(device.as_ref(), None, SnapshotOptions::default(), false);
        let snapshot = dumper.snapshot(filter);
        let leaf = &snapshot.nodes()[2];
        assert_eq!(leaf.attributes.get(Attribute::Text), Some(&AttrValue::Str("A".into())));
        assert_eq!(leaf.attributes.get(Attribute::Bounds), None);
    }

    proptest! {
        #[test]
        fn star_round_trips_every_snapshot_node(shape in arb_shape()) {
            let root: NodeHandle = shape.build();
            let snapshot = Snapshot::of_windows(&[root], &SnapshotOptions::default());
            let xpath = XPath::compile("//*").unwrap();
            let selected = select_indices(&snapshot, &xpath, true, false).unwrap();
            let mut preorder = Vec::new();
            let mut stack = vec![0usize];
            while let Some(i) = stack.pop() {
                preorder.push(i);
                stack.extend(snapshot.nodes()[i].children.iter().rev());
            }
            prop_assert_eq!(selected, preorder);
        }

        #[test]
        fn xpath_and_native_walks_stop_at_the_same_depth(
            shape in arb_deep_shape(),
            max_depth in 3usize..16,
        ) {
            let root: NodeHandle = shape.build();
            let opts = SnapshotOptions { max_depth, ..Default::default() };
            let snapshot = Snapshot::of_windows(&[root.clone()], &opts);
            prop_assert!(snapshot.nodes().iter().all(|n| n.depth <= max_depth));

            let xpath = XPath::compile("//*").unwrap();
            let selected = select_indices(&snapshot, &xpath, true, false).unwrap();
            prop_assert_eq!(selected.len(), snapshot.len());

            let mut walked = 0;
            SearchSpace::Screen(vec![root]).walk(opts.walk_options(), &mut |_, _| {
                walked += 1;
                true
            });
            prop_assert_eq!(walked + 1, snapshot.len());
        }
    }
}
