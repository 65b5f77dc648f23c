//! # TagTree - ownership index over tagged host nodes
//!
//! Every [`TagTreeNode`] wraps one host node and an optional tag. The root is untagged. A node
//! with tag `T` is indexed twice:
//!
//! - globally, in [`TagTree::get_all_by_tag`]`(T)`;
//! - in the owned registry of its parent, [`TagTreeNode::get_owned_by_tag`]`(T)`. The parent is
//!   the nearest ancestor whose tag is listed in `T`'s `owned_by`, or the root.
//!
//! Ownership edges live in a petgraph `StableDiGraph`, so removing a node can cascade to every
//! node whose ownership chain runs through it. All mutation goes through the single
//! [`TagTreeController`].
//!
//! Registry sets deliver once the scheduler has settled, so the net change of a flush reaches
//! their observers as one batch.

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    fmt,
    hash::{Hash, Hasher},
    rc::{Rc, Weak},
};

use indexmap::{IndexMap, IndexSet};
use petgraph::{
    stable_graph::{NodeIndex, StableDiGraph},
    visit::DfsPostOrder,
};

use crate::{
    config::TagOptions,
    error::{ParserTreeError, Result},
    liveset::{LiveSet, LiveSetController, Scheduler},
};

type Registry<N> = (LiveSet<TagTreeNode<N>>, LiveSetController<TagTreeNode<N>>);

struct TreeShared<N> {
    scheduler: Scheduler,
    tags: IndexMap<String, TagOptions>,
    graph: RefCell<StableDiGraph<TagTreeNode<N>, ()>>,
    by_tag: IndexMap<String, Registry<N>>,
    by_value: RefCell<HashMap<N, Vec<TagTreeNode<N>>>>,
    root: TagTreeNode<N>,
    ended: Cell<bool>,
}

struct NodeInner<N> {
    value: N,
    tag: Option<String>,
    parent: Option<Weak<NodeInner<N>>>,
    index: Cell<Option<NodeIndex>>,
    owned: RefCell<IndexMap<String, Registry<N>>>,
    tree: Weak<TreeShared<N>>,
}

/// A node of the ownership tree. Clones share identity; equality is identity.
pub struct TagTreeNode<N>(Rc<NodeInner<N>>);

impl<N> Clone for TagTreeNode<N> {
    fn clone(&self) -> Self {
        TagTreeNode(self.0.clone())
    }
}

impl<N> PartialEq for TagTreeNode<N> {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl<N> Eq for TagTreeNode<N> {}

impl<N> Hash for TagTreeNode<N> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Rc::as_ptr(&self.0) as *const ()).hash(state);
    }
}

impl<N: fmt::Debug> fmt::Debug for TagTreeNode<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TagTreeNode")
            .field("tag", &self.0.tag)
            .field("value", &self.0.value)
            .field("attached", &self.0.index.get().is_some())
            .finish()
    }
}

impl<N: Clone + Eq + Hash + 'static> TagTreeNode<N> {
    pub fn get_value(&self) -> &N {
        &self.0.value
    }

    pub fn get_tag(&self) -> Option<&str> {
        self.0.tag.as_deref()
    }

    /// The owning node. `None` for the root.
    pub fn get_parent(&self) -> Option<TagTreeNode<N>> {
        self.0
            .parent
            .as_ref()
            .and_then(Weak::upgrade)
            .map(TagTreeNode)
    }

    /// False once the node has been removed from its tree.
    pub fn is_attached(&self) -> bool {
        self.0.index.get().is_some()
    }

    /// True when `other` is attached and directly owned by this node.
    pub fn owns_node(&self, other: &TagTreeNode<N>) -> bool {
        other.is_attached()
            && other
                .0
                .parent
                .as_ref()
                .is_some_and(|p| std::ptr::eq(p.as_ptr(), Rc::as_ptr(&self.0)))
    }

    /// The nodes with `tag` directly owned by this node. The set is created on first request
    /// and stays identical for the node's lifetime.
    pub fn get_owned_by_tag(&self, tag: &str) -> Result<LiveSet<TagTreeNode<N>>> {
        let tree = self.0.tree.upgrade().ok_or(ParserTreeError::Ended)?;
        if !tree.tags.contains_key(tag) {
            return Err(ParserTreeError::UnknownTag(tag.to_string()));
        }
        Ok(self.registry(&tree, tag).0)
    }

    fn registry(&self, tree: &TreeShared<N>, tag: &str) -> Registry<N> {
        let mut owned = self.0.owned.borrow_mut();
        if let Some(registry) = owned.get(tag) {
            return registry.clone();
        }
        let (set, controller) = LiveSet::active(&tree.scheduler, IndexSet::new());
        let registry = (set.deliver_when_settled(), controller);
        if tree.ended.get() || !self.is_attached() {
            registry.1.end();
        }
        owned.insert(tag.to_string(), registry.clone());
        registry
    }

    fn end_registries(&self) {
        let registries: Vec<Registry<N>> = self.0.owned.borrow().values().cloned().collect();
        for (_, controller) in registries {
            controller.end();
        }
    }
}

/// Read side of the ownership tree. Cheap to clone.
pub struct TagTree<N> {
    shared: Rc<TreeShared<N>>,
}

impl<N> Clone for TagTree<N> {
    fn clone(&self) -> Self {
        TagTree {
            shared: self.shared.clone(),
        }
    }
}

impl<N: fmt::Debug> fmt::Debug for TagTree<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TagTree")
            .field("tags", &self.shared.tags.keys().collect::<Vec<_>>())
            .field("nodes", &self.shared.graph.borrow().node_count())
            .field("ended", &self.shared.ended.get())
            .finish()
    }
}

impl<N: Clone + Eq + Hash + 'static> TagTree<N> {
    pub fn new(
        scheduler: &Scheduler,
        root: N,
        tags: IndexMap<String, TagOptions>,
    ) -> (TagTree<N>, TagTreeController<N>) {
        let shared = Rc::new_cyclic(|weak: &Weak<TreeShared<N>>| {
            let root_node = TagTreeNode(Rc::new(NodeInner {
                value: root.clone(),
                tag: None,
                parent: None,
                index: Cell::new(None),
                owned: RefCell::new(IndexMap::new()),
                tree: weak.clone(),
            }));
            let mut graph = StableDiGraph::new();
            let index = graph.add_node(root_node.clone());
            root_node.0.index.set(Some(index));
            let by_tag = tags
                .keys()
                .map(|tag| {
                    let (set, controller) = LiveSet::active(scheduler, IndexSet::new());
                    (tag.clone(), (set.deliver_when_settled(), controller))
                })
                .collect();
            let mut by_value = HashMap::new();
            by_value.insert(root, vec![root_node.clone()]);
            TreeShared {
                scheduler: scheduler.clone(),
                tags,
                graph: RefCell::new(graph),
                by_tag,
                by_value: RefCell::new(by_value),
                root: root_node,
                ended: Cell::new(false),
            }
        });
        (
            TagTree {
                shared: shared.clone(),
            },
            TagTreeController { shared },
        )
    }

    pub fn root(&self) -> &TagTreeNode<N> {
        &self.shared.root
    }

    pub fn get_value(&self) -> &N {
        self.shared.root.get_value()
    }

    pub fn tags(&self) -> &IndexMap<String, TagOptions> {
        &self.shared.tags
    }

    pub fn is_ended(&self) -> bool {
        self.shared.ended.get()
    }

    pub fn get_all_by_tag(&self, tag: &str) -> Result<LiveSet<TagTreeNode<N>>> {
        self.shared
            .by_tag
            .get(tag)
            .map(|(set, _)| set.clone())
            .ok_or_else(|| ParserTreeError::UnknownTag(tag.to_string()))
    }

    /// Nodes with `tag` owned directly by the root.
    pub fn get_owned_by_tag(&self, tag: &str) -> Result<LiveSet<TagTreeNode<N>>> {
        self.shared.root.get_owned_by_tag(tag)
    }

    /// Every root registry, keyed by tag in declaration order.
    pub fn get_owned(&self) -> IndexMap<String, LiveSet<TagTreeNode<N>>> {
        self.shared
            .tags
            .keys()
            .map(|tag| {
                let (set, _) = self.shared.root.registry(&self.shared, tag);
                (tag.clone(), set)
            })
            .collect()
    }

    /// All attached nodes wrapping `value`, in registration order.
    pub fn get_nodes_for_value(&self, value: &N) -> Vec<TagTreeNode<N>> {
        self.shared
            .by_value
            .borrow()
            .get(value)
            .cloned()
            .unwrap_or_default()
    }

    pub fn node_count(&self) -> usize {
        self.shared.graph.borrow().node_count()
    }
}

/// Sole mutator of a [`TagTree`].
pub struct TagTreeController<N> {
    shared: Rc<TreeShared<N>>,
}

impl<N> Clone for TagTreeController<N> {
    fn clone(&self) -> Self {
        TagTreeController {
            shared: self.shared.clone(),
        }
    }
}

impl<N: Clone + Eq + Hash + fmt::Debug + 'static> TagTreeController<N> {
    pub fn tree(&self) -> TagTree<N> {
        TagTree {
            shared: self.shared.clone(),
        }
    }

    /// Register `value` with `tag` under `parent` and return the new node.
    pub fn add_tagged_value(
        &self,
        parent: &TagTreeNode<N>,
        tag: &str,
        value: N,
    ) -> Result<TagTreeNode<N>> {
        let shared = &self.shared;
        if shared.ended.get() {
            return Err(ParserTreeError::Ended);
        }
        let options = shared
            .tags
            .get(tag)
            .ok_or_else(|| ParserTreeError::UnknownTag(tag.to_string()))?;
        if !Weak::ptr_eq(&parent.0.tree, &Rc::downgrade(shared)) {
            return Err(ParserTreeError::Invariant(
                "parent node belongs to another tree".to_string(),
            ));
        }
        let parent_index = parent.0.index.get().ok_or_else(|| {
            ParserTreeError::Invariant(format!(
                "cannot add {tag} under a node that was removed from the tree"
            ))
        })?;
        if let Some(parent_tag) = parent.get_tag() {
            if !options.owned_by.iter().any(|t| t == parent_tag) {
                return Err(ParserTreeError::Invariant(format!(
                    "tag {tag} cannot be owned by tag {parent_tag}"
                )));
            }
        }

        let node = TagTreeNode(Rc::new(NodeInner {
            value: value.clone(),
            tag: Some(tag.to_string()),
            parent: Some(Rc::downgrade(&parent.0)),
            index: Cell::new(None),
            owned: RefCell::new(IndexMap::new()),
            tree: Rc::downgrade(shared),
        }));
        {
            let mut graph = shared.graph.borrow_mut();
            let index = graph.add_node(node.clone());
            graph.add_edge(parent_index, index, ());
            node.0.index.set(Some(index));
        }
        shared
            .by_value
            .borrow_mut()
            .entry(value)
            .or_default()
            .push(node.clone());
        if let Some((_, controller)) = shared.by_tag.get(tag) {
            controller.add(node.clone())?;
        }
        parent.registry(shared, tag).1.add(node.clone())?;
        tracing::trace!("[TagTree] added {tag} {:?}", node.get_value());
        Ok(node)
    }

    /// Remove `node` and every node owned through it. A no-op when `parent` no longer owns
    /// `node`, which happens when an ancestor's removal already took it out.
    pub fn remove_tagged_node(
        &self,
        parent: &TagTreeNode<N>,
        tag: &str,
        node: &TagTreeNode<N>,
    ) -> Result<()> {
        if !parent.owns_node(node) {
            return Ok(());
        }
        if node.get_tag() != Some(tag) {
            return Err(ParserTreeError::Invariant(format!(
                "node tagged {:?} removed as {tag}",
                node.get_tag()
            )));
        }
        let Some(start) = node.0.index.get() else {
            return Ok(());
        };
        let order: Vec<NodeIndex> = {
            let graph = self.shared.graph.borrow();
            let mut dfs = DfsPostOrder::new(&*graph, start);
            let mut order = Vec::new();
            while let Some(index) = dfs.next(&*graph) {
                order.push(index);
            }
            order
        };
        for index in order {
            let removed = self.shared.graph.borrow_mut().remove_node(index);
            if let Some(removed) = removed {
                self.detach(&removed)?;
            }
        }
        Ok(())
    }

    fn detach(&self, node: &TagTreeNode<N>) -> Result<()> {
        node.0.index.set(None);
        {
            let mut by_value = self.shared.by_value.borrow_mut();
            if let Some(nodes) = by_value.get_mut(node.get_value()) {
                nodes.retain(|n| n != node);
                if nodes.is_empty() {
                    by_value.remove(node.get_value());
                }
            }
        }
        if let Some(tag) = node.get_tag() {
            if let Some((_, controller)) = self.shared.by_tag.get(tag) {
                controller.remove(node.clone())?;
            }
            if let Some(parent) = node.get_parent() {
                let registry = parent.0.owned.borrow().get(tag).cloned();
                if let Some((_, controller)) = registry {
                    controller.remove(node.clone())?;
                }
            }
        }
        node.end_registries();
        tracing::trace!("[TagTree] removed {:?} {:?}", node.get_tag(), node.get_value());
        Ok(())
    }

    /// End every registry set. The tree accepts no further additions.
    pub fn end(&self) {
        if self.shared.ended.replace(true) {
            return;
        }
        for (_, controller) in self.shared.by_tag.values() {
            controller.end();
        }
        let nodes: Vec<TagTreeNode<N>> = {
            let graph = self.shared.graph.borrow();
            graph
                .node_indices()
                .filter_map(|i| graph.node_weight(i).cloned())
                .collect()
        };
        for node in nodes {
            node.end_registries();
        }
        tracing::debug!("[TagTree] ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn tags() -> IndexMap<String, TagOptions> {
        let mut tags = IndexMap::new();
        tags.insert("section".to_string(), TagOptions::default());
        tags.insert("comment".to_string(), TagOptions::owned_by(["comment", "section"]));
        tags.insert("link".to_string(), TagOptions::default());
        tags
    }

    fn values(set: &LiveSet<TagTreeNode<&'static str>>) -> Vec<&'static str> {
        set.values()
            .unwrap()
            .iter()
            .map(|n| *n.get_value())
            .collect()
    }

    #[test]
    fn nodes_are_indexed_globally_and_by_owner() {
        let scheduler = Scheduler::new();
        let (tree, ctrl) = TagTree::new(&scheduler, "root", tags());
        let section = ctrl.add_tagged_value(tree.root(), "section", "s").unwrap();
        let top = ctrl.add_tagged_value(&section, "comment", "c1").unwrap();
        let reply = ctrl.add_tagged_value(&top, "comment", "c2").unwrap();

        assert_eq!(values(&tree.get_all_by_tag("comment").unwrap()), vec!["c1", "c2"]);
        assert_eq!(values(&section.get_owned_by_tag("comment").unwrap()), vec!["c1"]);
        assert_eq!(values(&top.get_owned_by_tag("comment").unwrap()), vec!["c2"]);
        assert!(values(&tree.get_owned_by_tag("comment").unwrap()).is_empty());
        assert!(top.owns_node(&reply));
        assert!(!section.owns_node(&reply));
        assert_eq!(reply.get_parent(), Some(top.clone()));
        assert_eq!(tree.get_nodes_for_value(&"c2"), vec![reply]);
        assert_eq!(tree.get_nodes_for_value(&"root"), vec![tree.root().clone()]);
    }

    #[test]
    fn debug_output_shows_attachment() {
        let scheduler = Scheduler::new();
        let (tree, ctrl) = TagTree::new(&scheduler, "root", tags());
        let link = ctrl.add_tagged_value(tree.root(), "link", "a").unwrap();
        assert!(format!("{link:?}").contains("attached: true"));
        ctrl.remove_tagged_node(tree.root(), "link", &link).unwrap();
        assert!(format!("{link:?}").contains("attached: false"));
    }

    #[test]
    fn ownership_rules_are_enforced() {
        let scheduler = Scheduler::new();
        let (tree, ctrl) = TagTree::new(&scheduler, "root", tags());
        let link = ctrl.add_tagged_value(tree.root(), "link", "a").unwrap();
        assert!(matches!(
            ctrl.add_tagged_value(&link, "comment", "c"),
            Err(ParserTreeError::Invariant(_))
        ));
        assert_eq!(
            ctrl.add_tagged_value(tree.root(), "nope", "x").unwrap_err(),
            ParserTreeError::UnknownTag("nope".into())
        );
        assert_eq!(
            tree.get_all_by_tag("nope").unwrap_err(),
            ParserTreeError::UnknownTag("nope".into())
        );
    }

    #[test]
    fn removal_cascades_through_owned_nodes() {
        let scheduler = Scheduler::new();
        let (tree, ctrl) = TagTree::new(&scheduler, "root", tags());
        let section = ctrl.add_tagged_value(tree.root(), "section", "s").unwrap();
        let top = ctrl.add_tagged_value(&section, "comment", "c1").unwrap();
        let reply = ctrl.add_tagged_value(&top, "comment", "c2").unwrap();
        let other = ctrl.add_tagged_value(&section, "comment", "c3").unwrap();
        let link = ctrl.add_tagged_value(tree.root(), "link", "a").unwrap();
        let replies = top.get_owned_by_tag("comment").unwrap();

        ctrl.remove_tagged_node(&section, "comment", &top).unwrap();
        assert!(!top.is_attached());
        assert!(!reply.is_attached());
        assert!(other.is_attached() && link.is_attached());
        assert_eq!(values(&tree.get_all_by_tag("comment").unwrap()), vec!["c3"]);
        assert!(replies.is_ended());
        assert!(tree.get_nodes_for_value(&"c2").is_empty());

        // Already detached by the cascade.
        ctrl.remove_tagged_node(&top, "comment", &reply).unwrap();
        assert_eq!(tree.node_count(), 4);
    }

    #[test]
    fn end_finishes_every_registry() {
        let scheduler = Scheduler::new();
        let (tree, ctrl) = TagTree::new(&scheduler, "root", tags());
        let section = ctrl.add_tagged_value(tree.root(), "section", "s").unwrap();
        let owned = section.get_owned_by_tag("comment").unwrap();
        ctrl.end();
        assert!(tree.is_ended());
        assert!(owned.is_ended());
        assert!(tree.get_owned().values().all(LiveSet::is_ended));
        assert!(tree.get_all_by_tag("link").unwrap().is_ended());
        assert_eq!(
            ctrl.add_tagged_value(tree.root(), "link", "b").unwrap_err(),
            ParserTreeError::Ended
        );
    }
}
