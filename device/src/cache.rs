//! Opaque element ids handed to clients, mapped back to native nodes.
//!
//! Native handles go stale whenever the UI changes. An element that was found
//! as the single match of a locator can be found again: `get` re-runs the
//! locator (inside its original search context) and swaps the fresh node in
//! under the same id. Anything else fails as a stale reference.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::error::{AppError, Result};
use crate::finder::Finder;
use crate::locator::Locator;
use crate::native::{NodeHandle, NodeIdentity};

pub const DEFAULT_CACHE_SIZE: usize = 500;
pub const DEFAULT_LOAD_FACTOR: u8 = 30;

#[derive(Debug, Clone)]
pub struct CachedElement {
    pub id: String,
    pub node: NodeHandle,
    /// Found by a single-element lookup, so the locator identifies it alone.
    pub single_match: bool,
    pub locator: Option<Locator>,
    /// Id of the element the lookup was scoped to.
    pub context_id: Option<String>,
}

#[derive(Debug)]
struct Inner {
    entries: HashMap<String, CachedElement>,
    /// Insertion order, oldest first.
    order: VecDeque<String>,
    by_identity: HashMap<NodeIdentity, String>,
    /// Ids folded into another entry after both came to name the same node.
    aliases: HashMap<String, String>,
}

impl Inner {
    fn canonical(&self, id: &str) -> String {
        self.aliases.get(id).cloned().unwrap_or_else(|| id.to_string())
    }

    fn forget(&mut self, id: &str) {
        if let Some(entry) = self.entries.remove(id) {
            let key = entry.node.identity();
            if self.by_identity.get(&key).map(String::as_str) == Some(id) {
                self.by_identity.remove(&key);
            }
        }
        self.aliases.retain(|_, target| target != id);
    }
}

#[derive(Debug)]
pub struct ElementCache {
    inner: Mutex<Inner>,
    capacity: usize,
    load_factor: u8,
}

impl ElementCache {
    pub fn new(capacity: usize, load_factor: u8) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
                by_identity: HashMap::new(),
                aliases: HashMap::new(),
            }),
            capacity: capacity.max(1),
            load_factor: load_factor.clamp(1, 100),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
        inner.by_identity.clear();
        inner.aliases.clear();
    }

    /// Entries dropped in one eviction pass.
    fn eviction_batch(&self) -> usize {
        (self.capacity * self.load_factor as usize).div_ceil(100).max(1)
    }

    /// Caches `node` and returns its id. A node that is already cached keeps
    /// its id; it takes over the new provenance if the old one could not be
    /// used to find it again.
    pub fn add(
        &self,
        node: NodeHandle,
        single_match: bool,
        locator: Option<Locator>,
        context_id: Option<String>,
    ) -> String {
        let mut inner = self.inner.lock();
        let identity = node.identity();

        if let Some(id) = inner.by_identity.get(&identity).cloned() {
            if let Some(entry) = inner.entries.get_mut(&id) {
                entry.node = node;
                let recoverable = entry.single_match && entry.locator.is_some();
                if !recoverable && single_match && locator.is_some() {
                    entry.single_match = true;
                    entry.locator = locator;
                    entry.context_id = context_id;
                }
                return id;
            }
        }

        if inner.entries.len() >= self.capacity {
            let batch = self.eviction_batch();
            let mut evicted = 0;
            while evicted < batch {
                let Some(old) = inner.order.pop_front() else {
                    break;
                };
                if inner.entries.contains_key(&old) {
                    inner.forget(&old);
                    evicted += 1;
                }
            }
            tracing::debug!(evicted, remaining = inner.entries.len(), "element cache eviction");
        }

        let id = uuid::Uuid::new_v4().to_string();
        inner.by_identity.insert(identity, id.clone());
        inner.order.push_back(id.clone());
        inner.entries.insert(
            id.clone(),
            CachedElement {
                id: id.clone(),
                node,
                single_match,
                locator,
                context_id,
            },
        );
        id
    }

    /// Cached element for `id`, restored through its locator if its node went
    /// stale.
    pub fn get(&self, id: &str, finder: &Finder<'_>) -> Result<CachedElement> {
        let mut inner = self.inner.lock();
        get_locked(&mut inner, id, finder)
    }
}

fn get_locked(inner: &mut Inner, id: &str, finder: &Finder<'_>) -> Result<CachedElement> {
    let id = inner.canonical(id);
    let id = id.as_str();
    let Some(entry) = inner.entries.get(id) else {
        return Err(AppError::NoSuchElement(format!(
            "no element with id '{id}' in this session"
        )));
    };
    if entry.node.refresh() {
        return Ok(entry.clone());
    }
    let entry = entry.clone();

    let locator = match &entry.locator {
        Some(locator) if entry.single_match => locator.clone(),
        _ => {
            return Err(AppError::StaleElementReference(format!(
                "the element '{id}' is no longer attached to the page and cannot be located again"
            )));
        }
    };
    let stale = |reason: &str| {
        AppError::StaleElementReference(format!(
            "the element located by {locator} no longer exists: {reason}"
        ))
    };

    let scope = match &entry.context_id {
        Some(context) => Some(
            get_locked(inner, context, finder)
                .map_err(|e| stale(&format!("its search context is gone ({e})")))?
                .node,
        ),
        None => None,
    };
    let node = match finder.resolve(&locator, scope.as_ref(), false) {
        Ok(found) => found.into_iter().next().ok_or_else(|| stale("no match"))?,
        Err(e) => return Err(stale(&e.to_string())),
    };

    // Another live id may already own the recovered node: fold this id into it.
    if let Some(owner) = inner.by_identity.get(&node.identity()).cloned() {
        if owner != id && inner.entries.contains_key(&owner) {
            for target in inner.aliases.values_mut() {
                if target == id {
                    *target = owner.clone();
                }
            }
            inner.forget(id);
            inner.order.retain(|o| o != id);
            inner.aliases.insert(id.to_string(), owner.clone());
            let Some(existing) = inner.entries.get_mut(&owner) else {
                return Err(stale("its replacement was evicted"));
            };
            existing.node = node;
            if !(existing.single_match && existing.locator.is_some()) {
                existing.single_match = true;
                existing.locator = Some(locator.clone());
                existing.context_id = entry.context_id.clone();
            }
            tracing::info!(element = id, into = %owner, %locator, "restored stale element as an existing one");
            return Ok(existing.clone());
        }
    }

    let old_identity = entry.node.identity();
    if inner.by_identity.get(&old_identity).map(String::as_str) == Some(id) {
        inner.by_identity.remove(&old_identity);
    }
    inner.by_identity.insert(node.identity(), id.to_string());
    let restored = CachedElement { node, ..entry };
    inner.entries.insert(id.to_string(), restored.clone());
    tracing::info!(element = id, %locator, "restored stale element");
    Ok(restored)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use proptest::prelude::*;

    use super::*;
    use crate::fake::{FakeDevice, FakeNode};
    use crate::finder::SearchOptions;

    fn screen(label: &str) -> Vec<Arc<FakeNode>> {
        vec![
            FakeNode::builder("android.widget.FrameLayout")
                .child(
                    FakeNode::builder("android.widget.ListView")
                        .res_id("com.example:id/list")
                        .child(FakeNode::builder("android.widget.Button").text(label).build())
                        .build(),
                )
                .child(
                    FakeNode::builder("android.widget.Button")
                        .res_id("com.example:id/ok")
                        .text(label)
                        .build(),
                )
                .build(),
        ]
    }

    fn find(device: &FakeDevice, locator: &Locator, scope: Option<&NodeHandle>) -> NodeHandle {
        let opts = SearchOptions::default();
        Finder::new(device, &opts).find_one(locator, scope).unwrap()
    }

    #[test]
    fn resurrection_keeps_the_id() {
        let device = FakeDevice::new(screen("before"));
        let opts = SearchOptions::default();
        let finder = Finder::new(device.as_ref(), &opts);
        let cache = ElementCache::new(DEFAULT_CACHE_SIZE, DEFAULT_LOAD_FACTOR);

        let locator = Locator::Id("com.example:id/ok".into());
        let node = find(&device, &locator, None);
        let old_identity = node.identity();
        let id = cache.add(node, true, Some(locator), None);

        device.replace_roots(screen("after"));
        let element = cache.get(&id, &finder).unwrap();
        assert_eq!(element.id, id);
        assert_ne!(element.node.identity(), old_identity);
        assert_eq!(element.node.text().as_deref(), Some("after"));
        assert_eq!(cache.len(), 1);

        // live now, no second lookup needed
        let again = cache.get(&id, &finder).unwrap();
        assert_eq!(again.node.identity(), element.node.identity());
    }

    #[test]
    fn resurrection_goes_through_the_search_context() {
        let device = FakeDevice::new(screen("before"));
        let opts = SearchOptions::default();
        let finder = Finder::new(device.as_ref(), &opts);
        let cache = ElementCache::new(10, 50);

        let list_locator = Locator::Id("com.example:id/list".into());
        let list = find(&device, &list_locator, None);
        let list_id = cache.add(list.clone(), true, Some(list_locator), None);

        let button_locator = Locator::ClassName("android.widget.Button".into());
        let button = find(&device, &button_locator, Some(&list));
        let button_id = cache.add(button, true, Some(button_locator), Some(list_id.clone()));

        device.replace_roots(screen("after"));
        let element = cache.get(&button_id, &finder).unwrap();
        assert_eq!(element.id, button_id);
        assert_eq!(element.context_id.as_deref(), Some(list_id.as_str()));
        assert_eq!(element.node.text().as_deref(), Some("after"));
        let parent = element.node.parent().unwrap();
        assert_eq!(parent.resource_id().as_deref(), Some("com.example:id/list"));
        assert!(cache.get(&list_id, &finder).unwrap().node.refresh());
    }

    #[test]
    fn resurrection_onto_a_cached_node_merges_ids() {
        let device = FakeDevice::new(screen("before"));
        let opts = SearchOptions::default();
        let finder = Finder::new(device.as_ref(), &opts);
        let cache = ElementCache::new(10, 50);
        let locator = Locator::Id("com.example:id/ok".into());

        let first = cache.add(find(&device, &locator, None), true, Some(locator.clone()), None);
        device.replace_roots(screen("after"));
        let current = find(&device, &locator, None);
        let second = cache.add(current.clone(), true, Some(locator.clone()), None);
        assert_ne!(first, second);

        let restored = cache.get(&first, &finder).unwrap();
        assert_eq!(restored.id, second);
        assert_eq!(restored.node.identity(), current.identity());
        assert_eq!(cache.get(&second, &finder).unwrap().node.identity(), current.identity());
        assert_eq!(cache.len(), 1);
        {
            let inner = cache.inner.lock();
            assert_eq!(inner.by_identity.len(), inner.entries.len());
            for (identity, id) in &inner.by_identity {
                assert_eq!(inner.entries[id].node.identity(), *identity);
            }
            assert_eq!(inner.order.iter().collect::<Vec<_>>(), vec![&second]);
        }
        assert_eq!(cache.add(current, false, None, None), second);
        assert_eq!(cache.get(&first, &finder).unwrap().id, second);
    }

    #[test]
    fn resurrection_fails_closed() {
        let device = FakeDevice::new(screen("before"));
        let opts = SearchOptions::default();
        let finder = Finder::new(device.as_ref(), &opts);
        let cache = ElementCache::new(10, 50);
        let locator = Locator::Id("com.example:id/ok".into());

        let ambiguous = cache.add(find(&device, &locator, None), false, Some(locator.clone()), None);
        let anonymous = cache.add(
            find(&device, &Locator::Id("com.example:id/list".into()), None),
            true,
            None,
            None,
        );
        device.replace_roots(screen("after"));

        for id in [&ambiguous, &anonymous] {
            assert!(matches!(
                cache.get(id, &finder),
                Err(AppError::StaleElementReference(_))
            ));
        }
        assert!(matches!(
            cache.get("no-such-id", &finder),
            Err(AppError::NoSuchElement(_))
        ));
    }

    #[test]
    fn resurrection_without_a_match_is_stale() {
        let device = FakeDevice::new(screen("before"));
        let opts = SearchOptions::default();
        let finder = Finder::new(device.as_ref(), &opts);
        let cache = ElementCache::new(10, 50);
        let locator = Locator::Id("com.example:id/ok".into());
        let id = cache.add(find(&device, &locator, None), true, Some(locator), None);

        device.replace_roots(vec![FakeNode::builder("android.widget.FrameLayout").build()]);
        let err = cache.get(&id, &finder).unwrap_err();
        assert!(matches!(err, AppError::StaleElementReference(_)));
        assert!(err.to_string().contains("com.example:id/ok"));
    }

    #[test]
    fn same_node_gets_the_same_id() {
        let device = FakeDevice::new(screen("x"));
        let opts = SearchOptions::default();
        let finder = Finder::new(device.as_ref(), &opts);
        let cache = ElementCache::new(10, 50);
        let locator = Locator::Id("com.example:id/ok".into());

        let first = cache.add(find(&device, &locator, None), false, None, None);
        let second = cache.add(find(&device, &locator, None), true, Some(locator), None);
        assert_eq!(first, second);
        assert_eq!(cache.len(), 1);

        // the second add made the element recoverable
        device.replace_roots(screen("y"));
        assert_eq!(cache.get(&first, &finder).unwrap().node.text().as_deref(), Some("y"));
    }

    #[test]
    fn eviction_drops_a_batch() {
        let cache = ElementCache::new(10, 30);
        let ids: Vec<_> = (0..10)
            .map(|_| cache.add(FakeNode::builder("a").build(), false, None, None))
            .collect();
        assert_eq!(cache.len(), 10);
        cache.add(FakeNode::builder("a").build(), false, None, None);
        assert_eq!(cache.len(), 8);

        let device = FakeDevice::new(Vec::new());
        let opts = SearchOptions::default();
        let finder = Finder::new(device.as_ref(), &opts);
        for id in &ids[..3] {
            assert!(matches!(cache.get(id, &finder), Err(AppError::NoSuchElement(_))));
        }
        assert!(cache.get(&ids[3], &finder).is_ok());
    }

    proptest! {
        #[test]
        fn size_never_exceeds_capacity(
            capacity in 1usize..20,
            load_factor in 1u8..=100,
            ops in prop::collection::vec(prop::option::weighted(0.8, any::<prop::sample::Index>()), 0..200),
        ) {
            let cache = ElementCache::new(capacity, load_factor);
            prop_assert_eq!(cache.capacity(), capacity);
            let mut nodes: Vec<NodeHandle> = Vec::new();
            let batch = (capacity * load_factor as usize).div_ceil(100).max(1);
            for op in ops {
                let node = match op {
                    Some(i) if !nodes.is_empty() => nodes[i.index(nodes.len())].clone(),
                    _ => {
                        let n: NodeHandle = FakeNode::builder("a").build();
                        nodes.push(n.clone());
                        n
                    }
                };
                let before = cache.len();
                let known = cache.inner.lock().by_identity.contains_key(&node.identity());
                cache.add(node, false, None, None);
                let after = cache.len();
                prop_assert!(after <= capacity);
                if !known && before == capacity {
                    prop_assert!(before + 1 - after >= batch.min(capacity));
                    prop_assert!(before + 1 - after >= capacity * load_factor as usize / 100);
                }
            }
        }
    }
}
