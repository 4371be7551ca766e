use std::time::Instant;

use crate::dumper::Dumper;
use crate::error::{AppError, Result};
use crate::locator::{Locator, rewrite_id_locator};
use crate::native::{AxNode, NodeHandle, SearchSpace, UiDevice, dedup_by_identity};
use crate::selector::UiSelector;
use crate::snapshot::SnapshotOptions;

/// Instance lookups per selector statement before giving up on a tree that keeps growing.
const MAX_INSTANCE_LOOKUPS: usize = 10_000;

/// Session settings a lookup depends on, captured when the command starts.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub app_package: Option<String>,
    pub disable_id_autocompletion: bool,
    pub normalize_tag_names: bool,
    /// `allow_invisible` here also governs native queries.
    pub snapshot: SnapshotOptions,
}

pub struct Finder<'a> {
    device: &'a dyn UiDevice,
    options: &'a SearchOptions,
}

impl<'a> Finder<'a> {
    pub fn new(device: &'a dyn UiDevice, options: &'a SearchOptions) -> Self {
        Self { device, options }
    }

    /// Every node `locator` matches under `scope` (whole screen when None).
    /// Zero matches is an empty list, not an error.
    pub fn resolve(
        &self,
        locator: &Locator,
        scope: Option<&NodeHandle>,
        multiple: bool,
    ) -> Result<Vec<NodeHandle>> {
        let started = Instant::now();
        let found = match locator {
            Locator::Id(id) => {
                let id = rewrite_id_locator(
                    id,
                    self.options.app_package.as_deref(),
                    self.options.disable_id_autocompletion,
                );
                self.native_query(scope, multiple, |n| n.resource_id().as_deref() == Some(id.as_str()))
            }
            Locator::AccessibilityId(desc) => self.native_query(scope, multiple, |n| {
                n.content_description().as_deref() == Some(desc.as_str())
            }),
            Locator::ClassName(class) => self.native_query(scope, multiple, |n| {
                n.class_name().as_deref() == Some(class.as_str())
            }),
            Locator::XPath(expr) => Dumper::new(
                self.device,
                scope.cloned(),
                self.options.snapshot.clone(),
                self.options.normalize_tag_names,
            )
            .find_nodes(expr, multiple)?,
            Locator::UiAutomator(src) => self.resolve_selectors(src, scope, multiple)?,
        };
        tracing::debug!(
            %locator,
            scoped = scope.is_some(),
            matches = found.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "resolved locator"
        );
        Ok(found)
    }

    /// First match, or [`AppError::NoSuchElement`].
    pub fn find_one(&self, locator: &Locator, scope: Option<&NodeHandle>) -> Result<NodeHandle> {
        self.resolve(locator, scope, false)?
            .into_iter()
            .next()
            .ok_or_else(|| {
                AppError::NoSuchElement(format!(
                    "an element could not be located on the page using {locator}"
                ))
            })
    }

    fn native_query(
        &self,
        scope: Option<&NodeHandle>,
        multiple: bool,
        pred: impl Fn(&dyn AxNode) -> bool,
    ) -> Vec<NodeHandle> {
        let mut found = Vec::new();
        SearchSpace::new(self.device, scope).walk(self.options.snapshot.walk_options(), &mut |node, _| {
            if pred(node.as_ref()) {
                found.push(node.clone());
                return multiple;
            }
            true
        });
        found
    }

    fn resolve_selectors(
        &self,
        src: &str,
        scope: Option<&NodeHandle>,
        multiple: bool,
    ) -> Result<Vec<NodeHandle>> {
        let selectors = UiSelector::parse_all(src)?;
        let space = SearchSpace::new(self.device, scope);
        let mut found = Vec::new();
        for (i, selector) in selectors.iter().enumerate() {
            match self.enumerate(selector, &space, multiple) {
                Ok(nodes) => found.extend(nodes),
                Err(e) => {
                    tracing::warn!(selector = src, statement = i, error = %e, "selector statement failed");
                }
            }
            if !multiple && !found.is_empty() {
                break;
            }
        }
        let mut found = dedup_by_identity(found);
        if !multiple {
            found.truncate(1);
        }
        Ok(found)
    }

    /// Walks `instance(0)`, `instance(1)`, ... until a lookup comes back empty.
    /// A selector that already pins its instance gets exactly one lookup.
    fn enumerate(
        &self,
        selector: &UiSelector,
        space: &SearchSpace,
        multiple: bool,
    ) -> Result<Vec<NodeHandle>> {
        let opts = self.options.snapshot.walk_options();
        if selector.has_instance() {
            return match selector.find_first(space, opts) {
                Some(node) => Ok(vec![live(node)?]),
                None => Ok(Vec::new()),
            };
        }

        let mut found = Vec::new();
        for instance in 0..MAX_INSTANCE_LOOKUPS {
            let Some(node) = selector.with_instance(instance).find_first(space, opts) else {
                return Ok(found);
            };
            found.push(live(node)?);
            if !multiple {
                return Ok(found);
            }
        }
        Err(AppError::new(format!(
            "gave up after {MAX_INSTANCE_LOOKUPS} instances"
        )))
    }
}

fn live(node: NodeHandle) -> Result<NodeHandle> {
    if node.refresh() {
        Ok(node)
    } else {
        Err(AppError::StaleElementReference(
            "matched node disappeared during lookup".to_string(),
        ))
    }
}
